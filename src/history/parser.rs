use bigdecimal::{BigDecimal, Zero};
use std::collections::HashSet;

use crate::models::{normalize_address, Counterparty, RecordType};

/// What one wallet can see of a transaction.
pub struct WalletView<'a> {
    pub wallet_addresses: &'a HashSet<String>,
    pub senders: &'a [Counterparty],
    pub recipients: &'a [Counterparty],
    /// Fallbacks from recorded outputs, used when a side is not supplied.
    pub recorded_received: BigDecimal,
    pub recorded_sent: BigDecimal,
    pub fee: Option<&'a BigDecimal>,
    pub is_base_currency: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParsedEntry {
    pub record_type: RecordType,
    pub amount: BigDecimal,
    pub change_addresses: Vec<String>,
    pub recipients: Vec<Counterparty>,
}

pub fn wallet_address_set<'a>(addresses: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
    addresses.into_iter().map(normalize_address).collect()
}

/// Sums amounts per address, keeping the order of first appearance.
pub fn merge_counterparties(
    entries: impl IntoIterator<Item = (String, BigDecimal)>,
) -> Vec<Counterparty> {
    let mut merged: Vec<Counterparty> = vec![];
    for (address, amount) in entries {
        match merged.iter_mut().find(|c| c.address == address) {
            Some(existing) => existing.amount += amount,
            None => merged.push(Counterparty::new(address, amount)),
        }
    }
    merged
}

fn owned_total(parties: &[Counterparty], wallet: &HashSet<String>) -> BigDecimal {
    parties
        .iter()
        .filter(|c| wallet.contains(&normalize_address(&c.address)))
        .fold(BigDecimal::zero(), |acc, c| acc + &c.amount)
}

pub fn parse(view: &WalletView<'_>) -> ParsedEntry {
    let received = if view.recipients.is_empty() {
        view.recorded_received.clone()
    } else {
        owned_total(view.recipients, view.wallet_addresses)
    };
    let sent = if view.senders.is_empty() {
        view.recorded_sent.clone()
    } else {
        owned_total(view.senders, view.wallet_addresses)
    };

    let net = received - sent;
    let record_type = if net < BigDecimal::zero() {
        RecordType::Outgoing
    } else {
        RecordType::Incoming
    };
    let amount = match (record_type, view.fee) {
        (RecordType::Outgoing, Some(fee)) if view.is_base_currency => net + fee,
        _ => net,
    };

    let sender_addresses: HashSet<String> = view
        .senders
        .iter()
        .map(|c| normalize_address(&c.address))
        .collect();
    let is_change = |address: &str| {
        let address = normalize_address(address);
        sender_addresses.contains(&address)
            || (record_type == RecordType::Outgoing && view.wallet_addresses.contains(&address))
    };

    let (change, recipients): (Vec<&Counterparty>, Vec<&Counterparty>) =
        view.recipients.iter().partition(|c| is_change(&c.address));

    ParsedEntry {
        record_type,
        amount,
        change_addresses: change.into_iter().map(|c| c.address.clone()).collect(),
        recipients: recipients.into_iter().cloned().collect(),
    }
}

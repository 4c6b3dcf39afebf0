//! Wallet History Builder: one history row per (wallet, txid), plus NFT custody.

pub mod parser;

use bigdecimal::{BigDecimal, Zero};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use wavesexchange_log::{debug, warn};

use self::parser::{parse, wallet_address_set, ParsedEntry, WalletView};
use crate::db::{
    get_or_create_token, NewWalletHistory, NewWalletNftToken, RecordRepo, RecordRepoOperations,
    Token, Transaction, Wallet, WalletHistory, WalletHistoryChangeset,
};
use crate::error::{Error, Result};
use crate::models::{Counterparty, RecordType, TokenIdentity, WalletType};

#[derive(Clone, Debug)]
pub struct HistoryRequest {
    pub txid: String,
    pub wallet_hash: String,
    pub fee: Option<BigDecimal>,
    pub senders: Vec<Counterparty>,
    pub recipients: Vec<Counterparty>,
}

impl HistoryRequest {
    pub fn new(txid: impl Into<String>, wallet_hash: impl Into<String>) -> Self {
        HistoryRequest {
            txid: txid.into(),
            wallet_hash: wallet_hash.into(),
            fee: None,
            senders: vec![],
            recipients: vec![],
        }
    }

    pub fn with_fee(mut self, fee: Option<BigDecimal>) -> Self {
        self.fee = fee;
        self
    }

    pub fn with_parties(
        mut self,
        senders: Vec<Counterparty>,
        recipients: Vec<Counterparty>,
    ) -> Self {
        self.senders = senders;
        self.recipients = recipients;
        self
    }
}

pub struct WalletHistoryBuilder<R> {
    repo: Arc<R>,
}

impl<R> WalletHistoryBuilder<R>
where
    R: RecordRepo + Send + Sync + 'static,
{
    pub fn new(repo: Arc<R>) -> Self {
        WalletHistoryBuilder { repo }
    }

    /// Upserts the wallet's view of `request.txid`. Safe to call once per output of the txid.
    pub async fn build_history_entry(&self, request: HistoryRequest) -> Result<WalletHistory> {
        self.repo
            .transaction(move |ops| build_entry(ops, &request))
            .await
    }
}

fn build_entry<O: RecordRepoOperations + ?Sized>(
    ops: &mut O,
    request: &HistoryRequest,
) -> Result<WalletHistory> {
    let wallet = ops
        .find_wallet_by_hash(&request.wallet_hash)?
        .ok_or_else(|| Error::UnknownWallet(request.wallet_hash.clone()))?;

    let addresses = ops.wallet_addresses(wallet.id)?;
    let address_ids: HashSet<i64> = addresses.iter().map(|a| a.id).collect();
    let owned = |t: &Transaction| address_ids.contains(&t.address_id);

    let received: Vec<Transaction> = ops
        .transactions_by_txid(&request.txid)?
        .into_iter()
        .filter(|t| owned(t))
        .collect();
    let sent: Vec<Transaction> = ops
        .transactions_spent_by(&request.txid)?
        .into_iter()
        .filter(|t| owned(t))
        .collect();

    let token = select_token(ops, &wallet, received.iter().chain(sent.iter()))?;
    let is_base_currency = token.identity().is_base_currency();

    let total = |records: &[Transaction]| {
        records
            .iter()
            .filter(|t| t.token_id == token.id)
            .fold(BigDecimal::zero(), |acc, t| acc + &t.amount)
    };

    let wallet_addresses = wallet_address_set(addresses.iter().map(|a| a.address.as_str()));
    let parsed = parse(&WalletView {
        wallet_addresses: &wallet_addresses,
        senders: &request.senders,
        recipients: &request.recipients,
        recorded_received: total(&received),
        recorded_sent: total(&sent),
        fee: request.fee.as_ref(),
        is_base_currency,
    });
    if !parsed.change_addresses.is_empty() {
        debug!(
            "{}: change to {:?} left out of recipients",
            request.txid, parsed.change_addresses
        );
    }

    let entry = upsert_entry(ops, &wallet, &token, request, &parsed)?;

    if token.is_nft() {
        update_custody(ops, &wallet, &token, &request.txid, parsed.record_type)?;
    }

    Ok(entry)
}

/// Token the wallet sees for this txid: an overlay token for `slp` wallets, the base
/// currency otherwise.
fn select_token<'a, O: RecordRepoOperations + ?Sized>(
    ops: &mut O,
    wallet: &Wallet,
    records: impl Iterator<Item = &'a Transaction>,
) -> Result<Token> {
    let wants_overlay = wallet.kind() == WalletType::TokenOverlay;
    let mut seen = HashSet::new();
    for record in records {
        if !seen.insert(record.token_id) {
            continue;
        }
        if let Some(token) = ops.get_token(record.token_id)? {
            if token.identity().is_base_currency() != wants_overlay {
                return Ok(token);
            }
        }
    }

    if wants_overlay {
        Err(Error::InvalidChainData(format!(
            "no token records of wallet {} in this transaction",
            wallet.wallet_hash
        )))
    } else {
        get_or_create_token(ops, &TokenIdentity::BaseCurrency).map(|(token, _)| token)
    }
}

fn upsert_entry<O: RecordRepoOperations + ?Sized>(
    ops: &mut O,
    wallet: &Wallet,
    token: &Token,
    request: &HistoryRequest,
    parsed: &ParsedEntry,
) -> Result<WalletHistory> {
    let senders = serde_json::to_value(&request.senders)?;
    let recipients = serde_json::to_value(&parsed.recipients)?;

    let existing = match ops.find_wallet_history(wallet.id, &request.txid)? {
        Some(existing) => existing,
        None => {
            let row = NewWalletHistory {
                wallet_id: wallet.id,
                txid: request.txid.clone(),
                record_type: parsed.record_type.as_str().to_owned(),
                amount: parsed.amount.clone(),
                token_id: token.id,
                tx_fee: request.fee.clone(),
                senders: senders.clone(),
                recipients: recipients.clone(),
                date_created: Utc::now(),
            };
            match ops.insert_wallet_history(&row)? {
                Some(created) => return Ok(created),
                None => ops
                    .find_wallet_history(wallet.id, &request.txid)?
                    .ok_or_else(|| {
                        Error::InvalidChainData(format!("history of {}", request.txid))
                    })?,
            }
        }
    };

    let changes = WalletHistoryChangeset {
        record_type: Some(parsed.record_type.as_str().to_owned()),
        amount: Some(parsed.amount.clone()),
        token_id: Some(token.id),
        tx_fee: request.fee.clone(),
        senders: (!request.senders.is_empty()).then(|| senders),
        recipients: (!request.recipients.is_empty()).then(|| recipients),
    };
    ops.update_wallet_history(existing.id, &changes)?;

    ops.find_wallet_history(wallet.id, &request.txid)?
        .ok_or_else(|| Error::InvalidChainData(format!("history of {}", request.txid)))
}

fn update_custody<O: RecordRepoOperations + ?Sized>(
    ops: &mut O,
    wallet: &Wallet,
    token: &Token,
    txid: &str,
    record_type: RecordType,
) -> Result<()> {
    match record_type {
        RecordType::Incoming => {
            if ops.find_custody(wallet.id, token.id, txid)?.is_some() {
                return Ok(());
            }
            if let Some(stale) = ops.open_custody(wallet.id, token.id)? {
                warn!(
                    "wallet {} still holds token {} from {}, closing it at {}",
                    wallet.wallet_hash, token.tokenid, stale.acquisition_txid, txid
                );
                ops.close_custody(stale.id, txid, Utc::now())?;
            }
            let row = NewWalletNftToken {
                wallet_id: wallet.id,
                token_id: token.id,
                acquisition_txid: txid.to_owned(),
                date_acquired: Utc::now(),
            };
            ops.insert_custody(&row)?;
        }
        RecordType::Outgoing => match ops.open_custody(wallet.id, token.id)? {
            Some(open) if open.acquisition_txid != txid => {
                ops.close_custody(open.id, txid, Utc::now())?;
            }
            Some(_) => {}
            None => debug!(
                "wallet {} has no open custody of token {}",
                wallet.wallet_hash, token.tokenid
            ),
        },
    }
    Ok(())
}

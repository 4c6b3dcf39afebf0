use bigdecimal::BigDecimal;
use serde::Serialize;

use crate::db::{Address, Token, Transaction, Wallet};
use crate::models::BASE_CURRENCY_TOKEN_NAME;

/// Everything a destination may need to describe one transaction record.
#[derive(Clone, Debug)]
pub struct TransactionEvent {
    pub transaction: Transaction,
    pub address: Address,
    pub token: Token,
    pub block: Option<i32>,
    pub wallet: Option<Wallet>,
}

impl TransactionEvent {
    pub fn token_label(&self) -> String {
        if self.token.tokenid.is_empty() {
            BASE_CURRENCY_TOKEN_NAME.to_string()
        } else {
            self.token.tokenid.clone()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PayloadV1 {
    pub amount: BigDecimal,
    pub address: String,
    pub source: String,
    pub token: String,
    pub txid: String,
    pub block: Option<i32>,
    pub spent_index: i32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PayloadV2 {
    pub token_name: String,
    pub token_id: String,
    pub token_symbol: String,
    pub amount: BigDecimal,
    pub address: String,
    pub source: String,
    pub txid: String,
    pub block: Option<i32>,
    pub index: i32,
    pub address_path: Option<String>,
    pub wallet_hash: Option<String>,
}

/// Notification body, shaped by the stored version of the receiving wallet.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum NotificationPayload {
    V1(PayloadV1),
    V2(PayloadV2),
}

impl NotificationPayload {
    pub fn for_event(event: &TransactionEvent) -> Self {
        let tx = &event.transaction;
        match event.wallet.as_ref().map(|w| w.version) {
            Some(version) if version >= 2 => NotificationPayload::V2(PayloadV2 {
                token_name: event.token.name.clone(),
                token_id: event.token_label(),
                token_symbol: event.token.ticker_or_name().to_string(),
                amount: tx.amount.clone(),
                address: event.address.address.clone(),
                source: tx.source.clone(),
                txid: tx.txid.clone(),
                block: event.block,
                index: tx.output_index,
                address_path: event.address.address_path.clone(),
                wallet_hash: event.wallet.as_ref().map(|w| w.wallet_hash.clone()),
            }),
            _ => NotificationPayload::V1(PayloadV1 {
                amount: tx.amount.clone(),
                address: event.address.address.clone(),
                source: tx.source.clone(),
                token: event.token_label(),
                txid: tx.txid.clone(),
                block: event.block,
                spent_index: tx.output_index,
            }),
        }
    }

    pub fn txid(&self) -> &str {
        match self {
            NotificationPayload::V1(p) => &p.txid,
            NotificationPayload::V2(p) => &p.txid,
        }
    }
}

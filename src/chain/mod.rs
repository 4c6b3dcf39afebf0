//! Chain Query Service: block listings, decoded transactions and UTXO sets from an
//! upstream indexer.

pub mod rest;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use std::time::Duration;

use crate::error::Error;
use crate::models::{Outpoint, TokenIdentity};

pub use self::rest::RestChainQuery;

#[derive(Clone, Debug)]
pub struct Config {
    pub rest_url: String,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

const SATOSHIS_PER_COIN: i64 = 100_000_000;

pub fn coins_from_satoshis(satoshis: i64) -> BigDecimal {
    BigDecimal::from(satoshis) / BigDecimal::from(SATOSHIS_PER_COIN)
}

#[derive(Clone, Debug, PartialEq)]
pub struct TxInput {
    pub address: Option<String>,
    /// Base-currency value in coins.
    pub value: BigDecimal,
    pub prevout: Outpoint,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TxOutput {
    pub address: Option<String>,
    /// Base-currency value in coins.
    pub value: BigDecimal,
    pub index: i32,
    /// Overlay token amount carried by this output, if any.
    pub token_amount: Option<BigDecimal>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferKind {
    Genesis,
    Mint,
    Send,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TokenTransfer {
    pub token: TokenIdentity,
    pub kind: TransferKind,
    pub valid: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChainTransaction {
    pub txid: String,
    pub block_height: Option<i32>,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub tx_fee: Option<BigDecimal>,
    pub valid: bool,
    /// Decoded overlay payload; `None` for plain base-currency transactions.
    pub token: Option<TokenTransfer>,
}

impl ChainTransaction {
    pub fn is_genesis(&self) -> bool {
        matches!(
            self.token,
            Some(TokenTransfer {
                kind: TransferKind::Genesis,
                ..
            })
        )
    }

    pub fn prevouts(&self) -> Vec<Outpoint> {
        self.inputs.iter().map(|i| i.prevout.clone()).collect()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UnspentOutput {
    pub txid: String,
    pub index: i32,
    pub amount: BigDecimal,
    pub token: TokenIdentity,
    pub block_height: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TokenMetadata {
    pub name: String,
    pub ticker: String,
    pub decimals: Option<i32>,
    pub token_type: Option<i32>,
    pub nft_group_id: Option<String>,
    pub image_url: Option<String>,
}

#[async_trait]
pub trait ChainQuery: Send + Sync {
    async fn list_block_transaction_ids(&self, block_number: i32) -> Result<Vec<String>, Error>;

    async fn get_transaction(
        &self,
        txid: &str,
        decode_overlay: bool,
    ) -> Result<ChainTransaction, Error>;

    async fn get_unspent_outputs(&self, address: &str) -> Result<Vec<UnspentOutput>, Error>;

    async fn get_latest_block_number(&self) -> Result<i32, Error>;

    async fn get_token_metadata(&self, tokenid: &str) -> Result<TokenMetadata, Error>;

    /// Relays a raw hex transaction, returning its txid.
    async fn broadcast(&self, raw_tx: &str) -> Result<String, Error>;
}

/// Validates the hex encoding before handing the raw transaction upstream.
pub async fn broadcast<C: ChainQuery + ?Sized>(
    chain: &C,
    raw_tx_hex: &str,
) -> Result<String, Error> {
    let raw_tx_hex = raw_tx_hex.trim();
    hex::decode(raw_tx_hex)?;
    chain.broadcast(raw_tx_hex).await
}

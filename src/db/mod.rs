//! Record Store: persisted entities and the repository seam the pipeline is written against.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::{AsChangeset, Insertable, Queryable};

use crate::error::Result;
use crate::models::{Outpoint, TokenIdentity, TokenType, WalletType, BASE_CURRENCY_TOKEN_NAME};
use crate::schema::{
    addresses, block_heights, tokens, transactions, wallet_histories, wallet_nft_tokens,
};

pub mod pool;
pub mod repo;

pub use self::repo::PostgresRecordRepo;

#[derive(Clone, Debug, PartialEq, Queryable)]
pub struct BlockHeight {
    pub id: i64,
    pub number: i32,
    pub processed: bool,
    pub transactions_count: i32,
    pub requires_full_scan: bool,
    pub genesis: Vec<String>,
    pub problematic: Vec<String>,
    pub created_datetime: DateTime<Utc>,
    pub updated_datetime: Option<DateTime<Utc>>,
}

impl BlockHeight {
    /// Every txid this block already accounts for, one way or another.
    pub fn classified(&self) -> impl Iterator<Item = &String> {
        self.genesis.iter().chain(self.problematic.iter())
    }
}

#[derive(Clone, Debug, Insertable)]
#[diesel(table_name = block_heights)]
pub struct NewBlockHeight {
    pub number: i32,
    pub requires_full_scan: bool,
    pub genesis: Vec<String>,
    pub problematic: Vec<String>,
    pub created_datetime: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Queryable)]
pub struct Token {
    pub id: i64,
    pub tokenid: String,
    pub name: String,
    pub token_ticker: String,
    pub token_type: Option<i32>,
    pub decimals: Option<i32>,
    pub nft_token_group_id: Option<i64>,
    pub original_image_url: Option<String>,
    pub thumbnail_image_url: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub date_updated: Option<DateTime<Utc>>,
}

impl Token {
    pub fn identity(&self) -> TokenIdentity {
        if self.tokenid.is_empty() {
            TokenIdentity::BaseCurrency
        } else {
            TokenIdentity::Overlay(self.tokenid.clone())
        }
    }

    pub fn kind(&self) -> Option<TokenType> {
        self.token_type.and_then(TokenType::from_code)
    }

    pub fn is_nft(&self) -> bool {
        self.kind() == Some(TokenType::Nft)
    }

    pub fn ticker_or_name(&self) -> &str {
        if self.token_ticker.is_empty() {
            &self.name
        } else {
            &self.token_ticker
        }
    }
}

#[derive(Clone, Debug, Insertable)]
#[diesel(table_name = tokens)]
pub struct NewToken {
    pub tokenid: String,
    pub name: String,
    pub token_ticker: String,
}

impl NewToken {
    pub fn for_identity(identity: &TokenIdentity) -> Self {
        match identity {
            TokenIdentity::BaseCurrency => NewToken {
                tokenid: String::new(),
                name: BASE_CURRENCY_TOKEN_NAME.to_string(),
                token_ticker: BASE_CURRENCY_TOKEN_NAME.to_uppercase(),
            },
            TokenIdentity::Overlay(id) => NewToken {
                tokenid: id.clone(),
                name: String::new(),
                token_ticker: String::new(),
            },
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, AsChangeset)]
#[diesel(table_name = tokens)]
pub struct TokenMetadataUpdate {
    pub name: Option<String>,
    pub token_ticker: Option<String>,
    pub token_type: Option<i32>,
    pub decimals: Option<i32>,
    pub nft_token_group_id: Option<i64>,
    pub original_image_url: Option<String>,
    pub thumbnail_image_url: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub date_updated: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Queryable)]
pub struct Wallet {
    pub id: i64,
    pub wallet_hash: String,
    pub wallet_type: String,
    pub version: i32,
}

impl Wallet {
    pub fn kind(&self) -> WalletType {
        WalletType::from_db(&self.wallet_type)
    }
}

#[derive(Clone, Debug, PartialEq, Queryable)]
pub struct Address {
    pub id: i64,
    pub address: String,
    pub wallet_id: Option<i64>,
    pub address_path: Option<String>,
}

#[derive(Clone, Debug, Insertable)]
#[diesel(table_name = addresses)]
pub struct NewAddress {
    pub address: String,
}

#[derive(Clone, Debug, PartialEq, Queryable)]
pub struct Recipient {
    pub id: i64,
    pub web_url: String,
    pub telegram_id: String,
    pub slack_channel_id: String,
    pub valid: bool,
}

#[derive(Clone, Debug, PartialEq, Queryable)]
pub struct Subscription {
    pub id: i64,
    pub address_id: i64,
    pub recipient_id: Option<i64>,
    pub websocket: bool,
    pub date_created: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Queryable)]
pub struct Transaction {
    pub id: i64,
    pub txid: String,
    pub address_id: i64,
    pub token_id: i64,
    pub amount: BigDecimal,
    pub output_index: i32,
    pub source: String,
    pub blockheight_id: Option<i64>,
    pub spent: bool,
    pub spending_txid: Option<String>,
    pub acknowledged: bool,
    pub queued: bool,
    pub date_created: DateTime<Utc>,
}

impl Transaction {
    pub fn key(&self) -> TransactionKey {
        TransactionKey {
            txid: self.txid.clone(),
            address_id: self.address_id,
            token_id: self.token_id,
            amount: self.amount.clone(),
            output_index: self.output_index,
        }
    }
}

/// Dedup key shared by every ingestion source.
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionKey {
    pub txid: String,
    pub address_id: i64,
    pub token_id: i64,
    pub amount: BigDecimal,
    pub output_index: i32,
}

#[derive(Clone, Debug, Insertable)]
#[diesel(table_name = transactions)]
pub struct NewTransaction {
    pub txid: String,
    pub address_id: i64,
    pub token_id: i64,
    pub amount: BigDecimal,
    pub output_index: i32,
    pub source: String,
    pub blockheight_id: Option<i64>,
    pub spent: bool,
    pub acknowledged: bool,
    pub queued: bool,
    pub date_created: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Queryable)]
pub struct WalletHistory {
    pub id: i64,
    pub wallet_id: i64,
    pub txid: String,
    pub record_type: String,
    pub amount: BigDecimal,
    pub token_id: i64,
    pub tx_fee: Option<BigDecimal>,
    pub senders: serde_json::Value,
    pub recipients: serde_json::Value,
    pub date_created: DateTime<Utc>,
}

#[derive(Clone, Debug, Insertable)]
#[diesel(table_name = wallet_histories)]
pub struct NewWalletHistory {
    pub wallet_id: i64,
    pub txid: String,
    pub record_type: String,
    pub amount: BigDecimal,
    pub token_id: i64,
    pub tx_fee: Option<BigDecimal>,
    pub senders: serde_json::Value,
    pub recipients: serde_json::Value,
    pub date_created: DateTime<Utc>,
}

/// `None` fields are left untouched.
#[derive(Clone, Debug, Default, AsChangeset)]
#[diesel(table_name = wallet_histories)]
pub struct WalletHistoryChangeset {
    pub record_type: Option<String>,
    pub amount: Option<BigDecimal>,
    pub token_id: Option<i64>,
    pub tx_fee: Option<BigDecimal>,
    pub senders: Option<serde_json::Value>,
    pub recipients: Option<serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Queryable)]
pub struct WalletNftToken {
    pub id: i64,
    pub wallet_id: i64,
    pub token_id: i64,
    pub acquisition_txid: String,
    pub date_acquired: DateTime<Utc>,
    pub dispensation_txid: Option<String>,
    pub date_dispensed: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Insertable)]
#[diesel(table_name = wallet_nft_tokens)]
pub struct NewWalletNftToken {
    pub wallet_id: i64,
    pub token_id: i64,
    pub acquisition_txid: String,
    pub date_acquired: DateTime<Utc>,
}

#[async_trait]
pub trait RecordRepo {
    type Operations: RecordRepoOperations;

    /// Execute some operations on a pooled connection without creating a database transaction.
    async fn execute<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Self::Operations) -> Result<R> + Send + 'static,
        R: Send + 'static;

    /// Execute some operations within a database transaction.
    async fn transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Self::Operations) -> Result<R> + Send + 'static,
        R: Send + 'static;
}

/// Row-level operations. Inserts return `None` when a concurrent writer won the unique key.
pub trait RecordRepoOperations {
    fn find_token_by_tokenid(&mut self, tokenid: &str) -> Result<Option<Token>>;

    fn find_token_by_name(&mut self, name: &str) -> Result<Option<Token>>;

    fn get_token(&mut self, id: i64) -> Result<Option<Token>>;

    fn tokens(&mut self) -> Result<Vec<Token>>;

    fn insert_token(&mut self, token: &NewToken) -> Result<Option<Token>>;

    fn update_token_metadata(&mut self, id: i64, update: &TokenMetadataUpdate) -> Result<()>;

    fn find_wallet_by_hash(&mut self, wallet_hash: &str) -> Result<Option<Wallet>>;

    fn get_wallet(&mut self, id: i64) -> Result<Option<Wallet>>;

    fn find_address(&mut self, address: &str) -> Result<Option<Address>>;

    fn get_address(&mut self, id: i64) -> Result<Option<Address>>;

    fn find_addresses(&mut self, addresses: &[String]) -> Result<Vec<Address>>;

    fn wallet_addresses(&mut self, wallet_id: i64) -> Result<Vec<Address>>;

    fn insert_address(&mut self, address: &NewAddress) -> Result<Option<Address>>;

    /// Addresses owned by a wallet or carrying at least one subscription.
    fn watched_addresses(&mut self) -> Result<Vec<String>>;

    fn subscriptions_for_address(&mut self, address_id: i64) -> Result<Vec<Subscription>>;

    fn get_recipient(&mut self, id: i64) -> Result<Option<Recipient>>;

    fn invalidate_recipient(&mut self, id: i64) -> Result<()>;

    fn find_transaction(&mut self, key: &TransactionKey) -> Result<Option<Transaction>>;

    fn get_transaction(&mut self, id: i64) -> Result<Option<Transaction>>;

    fn transactions_by_txid(&mut self, txid: &str) -> Result<Vec<Transaction>>;

    fn transactions_for_addresses(&mut self, address_ids: &[i64]) -> Result<Vec<Transaction>>;

    /// Recorded outputs consumed by `spending_txid`.
    fn transactions_spent_by(&mut self, spending_txid: &str) -> Result<Vec<Transaction>>;

    /// Subset of `txids` that has at least one recorded output.
    fn recorded_txids(&mut self, txids: &[String]) -> Result<Vec<String>>;

    fn insert_transaction(&mut self, transaction: &NewTransaction) -> Result<Option<Transaction>>;

    fn update_transaction_source(&mut self, id: i64, source: &str) -> Result<()>;

    /// Sets `acknowledged` and clears `queued`; never resets `acknowledged`.
    fn acknowledge_transaction(&mut self, id: i64) -> Result<()>;

    fn link_txid_to_block(&mut self, txid: &str, block_id: i64) -> Result<usize>;

    /// Flags the recorded outputs behind `outpoints` as consumed by `spending_txid`.
    fn mark_outputs_spent(
        &mut self,
        outpoints: &[Outpoint],
        spending_txid: &str,
    ) -> Result<Vec<Transaction>>;

    /// `unspent_ids` become unspent; every other unspent record of the address becomes spent.
    /// Returns the number of records flipped to spent.
    fn apply_unspent_set(&mut self, address_id: i64, unspent_ids: &[i64]) -> Result<usize>;

    fn find_block(&mut self, number: i32) -> Result<Option<BlockHeight>>;

    fn get_block(&mut self, id: i64) -> Result<Option<BlockHeight>>;

    fn insert_block(&mut self, block: &NewBlockHeight) -> Result<Option<BlockHeight>>;

    fn require_full_scan(&mut self, id: i64) -> Result<()>;

    fn set_block_transactions_count(&mut self, id: i64, count: i32) -> Result<()>;

    fn set_block_classification(
        &mut self,
        id: i64,
        genesis: &[String],
        problematic: &[String],
    ) -> Result<()>;

    fn mark_block_processed(&mut self, id: i64, transactions_count: i32) -> Result<()>;

    /// Numbers of blocks with `processed = false and requires_full_scan = true`, ascending.
    fn blocks_requiring_scan(&mut self) -> Result<Vec<i32>>;

    /// Highest block created since `since` that still has problematic txids.
    fn latest_block_with_problematic(
        &mut self,
        since: DateTime<Utc>,
    ) -> Result<Option<BlockHeight>>;

    fn unprocessed_scanned_blocks(&mut self) -> Result<Vec<BlockHeight>>;

    fn txids_in_block(&mut self, block_id: i64) -> Result<Vec<String>>;

    /// Drops blocks numbered `<= number`; their transactions lose the block link.
    fn delete_blocks_up_to(&mut self, number: i32) -> Result<usize>;

    fn find_wallet_history(&mut self, wallet_id: i64, txid: &str) -> Result<Option<WalletHistory>>;

    fn insert_wallet_history(&mut self, row: &NewWalletHistory) -> Result<Option<WalletHistory>>;

    fn update_wallet_history(&mut self, id: i64, changes: &WalletHistoryChangeset) -> Result<()>;

    fn find_custody(
        &mut self,
        wallet_id: i64,
        token_id: i64,
        acquisition_txid: &str,
    ) -> Result<Option<WalletNftToken>>;

    fn open_custody(&mut self, wallet_id: i64, token_id: i64) -> Result<Option<WalletNftToken>>;

    fn insert_custody(&mut self, row: &NewWalletNftToken) -> Result<Option<WalletNftToken>>;

    fn close_custody(
        &mut self,
        id: i64,
        dispensation_txid: &str,
        date_dispensed: DateTime<Utc>,
    ) -> Result<()>;
}

pub fn get_or_create_token<O: RecordRepoOperations + ?Sized>(
    ops: &mut O,
    identity: &TokenIdentity,
) -> Result<(Token, bool)> {
    let find = |ops: &mut O| match identity {
        TokenIdentity::BaseCurrency => ops.find_token_by_name(BASE_CURRENCY_TOKEN_NAME),
        TokenIdentity::Overlay(id) => ops.find_token_by_tokenid(id),
    };
    if let Some(token) = find(ops)? {
        return Ok((token, false));
    }
    match ops.insert_token(&NewToken::for_identity(identity))? {
        Some(token) => Ok((token, true)),
        None => find(ops)?
            .map(|token| (token, false))
            .ok_or_else(|| crate::error::Error::InvalidTokenIdentity(identity.to_string())),
    }
}

pub fn get_or_create_address<O: RecordRepoOperations + ?Sized>(
    ops: &mut O,
    address: &str,
) -> Result<Address> {
    if let Some(existing) = ops.find_address(address)? {
        return Ok(existing);
    }
    let new_address = NewAddress {
        address: address.to_owned(),
    };
    match ops.insert_address(&new_address)? {
        Some(created) => Ok(created),
        None => ops
            .find_address(address)?
            .ok_or_else(|| crate::error::Error::InvalidChainData(address.to_owned())),
    }
}

pub fn get_or_create_block<O: RecordRepoOperations + ?Sized>(
    ops: &mut O,
    number: i32,
) -> Result<(BlockHeight, bool)> {
    if let Some(block) = ops.find_block(number)? {
        return Ok((block, false));
    }
    let new_block = NewBlockHeight {
        number,
        requires_full_scan: false,
        genesis: vec![],
        problematic: vec![],
        created_datetime: Utc::now(),
    };
    match ops.insert_block(&new_block)? {
        Some(block) => Ok((block, true)),
        None => ops
            .find_block(number)?
            .map(|block| (block, false))
            .ok_or_else(|| crate::error::Error::InvalidChainData(format!("block {}", number))),
    }
}

/// An address is watched when a wallet owns it or somebody subscribed to it.
pub fn is_watched<O: RecordRepoOperations + ?Sized>(
    ops: &mut O,
    address: &Address,
) -> Result<bool> {
    if address.wallet_id.is_some() {
        return Ok(true);
    }
    Ok(!ops.subscriptions_for_address(address.id)?.is_empty())
}

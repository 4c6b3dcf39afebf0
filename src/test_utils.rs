//! In-memory stand-ins for the stores and upstream services, shared by unit tests.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::chain::{ChainQuery, ChainTransaction, TokenMetadata, UnspentOutput};
use crate::coordination::{ActiveClaim, Classification, CoordinationRepo};
use crate::db::{
    get_or_create_address, get_or_create_block, get_or_create_token, Address, BlockHeight,
    NewAddress, NewBlockHeight, NewToken, NewTransaction, NewWalletHistory, NewWalletNftToken,
    RecordRepo, RecordRepoOperations, Recipient, Subscription, Token, TokenMetadataUpdate,
    Transaction, TransactionKey, Wallet, WalletHistory, WalletHistoryChangeset, WalletNftToken,
};
use crate::error::{Error, Result};
use crate::models::{Outpoint, TokenIdentity, TokenType};
use crate::notifications::destinations::DeliveryOutcome;
use crate::notifications::webhook::WebhookResponse;
use crate::notifications::{ChatSender, RoomPublisher, WebhookClient};

#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    last_id: i64,
    tokens: Vec<Token>,
    wallets: Vec<Wallet>,
    addresses: Vec<Address>,
    recipients: Vec<Recipient>,
    subscriptions: Vec<Subscription>,
    transactions: Vec<Transaction>,
    blocks: Vec<BlockHeight>,
    histories: Vec<WalletHistory>,
    custody: Vec<WalletNftToken>,
    transient_failures: u32,
    insert_conflicts: u32,
}

impl MemoryStore {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn transaction_mut(&mut self, id: i64) -> Option<&mut Transaction> {
        self.transactions.iter_mut().find(|t| t.id == id)
    }

    fn block_mut(&mut self, id: i64) -> Option<&mut BlockHeight> {
        self.blocks.iter_mut().find(|b| b.id == id)
    }
}

/// Record store kept in process memory.
///
/// `transaction` runs against a scratch copy that replaces the store only on success,
/// and the whole store is locked for the duration of a call.
#[derive(Clone, Default)]
pub struct MemoryRecordRepo {
    store: Arc<Mutex<MemoryStore>>,
}

impl MemoryRecordRepo {
    pub fn store(&self) -> MutexGuard<'_, MemoryStore> {
        self.store.lock().unwrap()
    }

    fn run<F, R>(&self, f: F, atomic: bool) -> Result<R>
    where
        F: FnOnce(&mut MemoryStore) -> Result<R>,
    {
        let mut store = self.store();
        if store.transient_failures > 0 {
            store.transient_failures -= 1;
            return Err(Error::DbError(DieselError::DatabaseError(
                DatabaseErrorKind::SerializationFailure,
                Box::new("could not serialize access".to_string()),
            )));
        }
        if !atomic {
            return f(&mut *store);
        }
        let mut scratch = store.clone();
        let result = f(&mut scratch)?;
        *store = scratch;
        Ok(result)
    }

    pub fn fail_next_transactions_with_transient_error(&self, count: u32) {
        self.store().transient_failures = count;
    }

    /// The next transaction insert behaves as if another writer won the unique key.
    pub fn fail_next_transaction_insert_with_conflict(&self) {
        self.store().insert_conflicts = 1;
    }

    fn add_recipient(&self, web_url: &str, telegram_id: &str) -> i64 {
        let mut store = self.store();
        let id = store.next_id();
        store.recipients.push(Recipient {
            id,
            web_url: web_url.to_owned(),
            telegram_id: telegram_id.to_owned(),
            slack_channel_id: String::new(),
            valid: true,
        });
        id
    }

    fn add_subscription(&self, address: &str, recipient_id: Option<i64>, websocket: bool) -> i64 {
        let mut store = self.store();
        let address = get_or_create_address(&mut *store, address).unwrap();
        let id = store.next_id();
        store.subscriptions.push(Subscription {
            id,
            address_id: address.id,
            recipient_id,
            websocket,
            date_created: Utc::now(),
        });
        id
    }

    /// Subscription without any delivery target.
    pub fn subscribe(&self, address: &str) -> i64 {
        self.add_subscription(address, None, false)
    }

    /// Returns the recipient id.
    pub fn subscribe_webhook(&self, address: &str, url: &str) -> i64 {
        let recipient_id = self.add_recipient(url, "");
        self.add_subscription(address, Some(recipient_id), false);
        recipient_id
    }

    pub fn subscribe_all(
        &self,
        address: &str,
        url: &str,
        telegram_id: &str,
        websocket: bool,
    ) -> i64 {
        let recipient_id = self.add_recipient(url, telegram_id);
        self.add_subscription(address, Some(recipient_id), websocket);
        recipient_id
    }

    pub fn add_wallet(
        &self,
        hash: &str,
        wallet_type: &str,
        version: i32,
        addresses: &[&str],
    ) -> Wallet {
        let mut store = self.store();
        let id = store.next_id();
        let wallet = Wallet {
            id,
            wallet_hash: hash.to_owned(),
            wallet_type: wallet_type.to_owned(),
            version,
        };
        store.wallets.push(wallet.clone());
        for address in addresses {
            let row = get_or_create_address(&mut *store, address).unwrap();
            if let Some(row) = store.addresses.iter_mut().find(|a| a.id == row.id) {
                row.wallet_id = Some(id);
            }
        }
        wallet
    }

    /// Writes a record directly, bypassing admission.
    pub fn insert_record(
        &self,
        address: &str,
        token: &TokenIdentity,
        txid: &str,
        amount: &str,
        spent: bool,
    ) -> Transaction {
        let mut store = self.store();
        let address = get_or_create_address(&mut *store, address).unwrap();
        let (token, _) = get_or_create_token(&mut *store, token).unwrap();
        store
            .insert_transaction(&NewTransaction {
                txid: txid.to_owned(),
                address_id: address.id,
                token_id: token.id,
                amount: BigDecimal::from_str(amount).unwrap(),
                output_index: 0,
                source: "test".to_owned(),
                blockheight_id: None,
                spent,
                acknowledged: false,
                queued: false,
                date_created: Utc::now(),
            })
            .unwrap()
            .unwrap()
    }

    pub fn record(&self, id: i64) -> Option<Transaction> {
        self.store().transactions.iter().find(|t| t.id == id).cloned()
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.store().transactions.clone()
    }

    pub fn set_spent(&self, id: i64, spent: bool) {
        if let Some(record) = self.store().transaction_mut(id) {
            record.spent = spent;
        }
    }

    pub fn token(&self, tokenid: &str) -> Option<Token> {
        self.store().tokens.iter().find(|t| t.tokenid == tokenid).cloned()
    }

    pub fn tokens(&self) -> Vec<Token> {
        self.store().tokens.clone()
    }

    pub fn set_token_type(&self, tokenid: &str, token_type: TokenType) {
        let mut store = self.store();
        if let Some(token) = store.tokens.iter_mut().find(|t| t.tokenid == tokenid) {
            token.token_type = Some(token_type.code());
        }
    }

    pub fn address(&self, address: &str) -> Option<Address> {
        self.store().addresses.iter().find(|a| a.address == address).cloned()
    }

    pub fn recipient(&self, id: i64) -> Option<Recipient> {
        self.store().recipients.iter().find(|r| r.id == id).cloned()
    }

    pub fn block(&self, number: i32) -> BlockHeight {
        get_or_create_block(&mut *self.store(), number).unwrap().0
    }

    pub fn block_requiring_scan(&self, number: i32) -> BlockHeight {
        let mut store = self.store();
        let (block, _) = get_or_create_block(&mut *store, number).unwrap();
        store.require_full_scan(block.id).unwrap();
        store.get_block(block.id).unwrap().unwrap()
    }

    pub fn find_block_by_number(&self, number: i32) -> Option<BlockHeight> {
        self.store().blocks.iter().find(|b| b.number == number).cloned()
    }

    pub fn get_block_row(&self, id: i64) -> Option<BlockHeight> {
        self.store().blocks.iter().find(|b| b.id == id).cloned()
    }

    pub fn set_classification(&self, block_id: i64, genesis: &[&str], problematic: &[&str]) {
        let owned = |txids: &[&str]| txids.iter().map(|t| t.to_string()).collect::<Vec<_>>();
        self.store()
            .set_block_classification(block_id, &owned(genesis), &owned(problematic))
            .unwrap();
    }

    pub fn set_transactions_count(&self, block_id: i64, count: i32) {
        self.store()
            .set_block_transactions_count(block_id, count)
            .unwrap();
    }

    pub fn wallet_histories(&self) -> Vec<WalletHistory> {
        self.store().histories.clone()
    }

    pub fn custody_rows(&self) -> Vec<WalletNftToken> {
        self.store().custody.clone()
    }
}

#[async_trait]
impl RecordRepo for MemoryRecordRepo {
    type Operations = MemoryStore;

    async fn execute<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut MemoryStore) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.run(f, false)
    }

    async fn transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut MemoryStore) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.run(f, true)
    }
}

impl RecordRepoOperations for MemoryStore {
    fn find_token_by_tokenid(&mut self, tokenid: &str) -> Result<Option<Token>> {
        Ok(self.tokens.iter().find(|t| t.tokenid == tokenid).cloned())
    }

    fn find_token_by_name(&mut self, name: &str) -> Result<Option<Token>> {
        Ok(self
            .tokens
            .iter()
            .find(|t| t.name == name && t.tokenid.is_empty())
            .cloned())
    }

    fn get_token(&mut self, id: i64) -> Result<Option<Token>> {
        Ok(self.tokens.iter().find(|t| t.id == id).cloned())
    }

    fn tokens(&mut self) -> Result<Vec<Token>> {
        Ok(self.tokens.clone())
    }

    fn insert_token(&mut self, token: &NewToken) -> Result<Option<Token>> {
        let taken = self.tokens.iter().any(|t| {
            t.tokenid == token.tokenid && (!token.tokenid.is_empty() || t.name == token.name)
        });
        if taken {
            return Ok(None);
        }
        let row = Token {
            id: self.next_id(),
            tokenid: token.tokenid.clone(),
            name: token.name.clone(),
            token_ticker: token.token_ticker.clone(),
            token_type: None,
            decimals: None,
            nft_token_group_id: None,
            original_image_url: None,
            thumbnail_image_url: None,
            metadata: None,
            date_updated: None,
        };
        self.tokens.push(row.clone());
        Ok(Some(row))
    }

    fn update_token_metadata(&mut self, id: i64, update: &TokenMetadataUpdate) -> Result<()> {
        if let Some(token) = self.tokens.iter_mut().find(|t| t.id == id) {
            let update = update.clone();
            if let Some(name) = update.name {
                token.name = name;
            }
            if let Some(ticker) = update.token_ticker {
                token.token_ticker = ticker;
            }
            token.token_type = update.token_type.or(token.token_type);
            token.decimals = update.decimals.or(token.decimals);
            token.nft_token_group_id = update.nft_token_group_id.or(token.nft_token_group_id);
            token.original_image_url =
                update.original_image_url.or(token.original_image_url.take());
            token.thumbnail_image_url =
                update.thumbnail_image_url.or(token.thumbnail_image_url.take());
            token.metadata = update.metadata.or(token.metadata.take());
            token.date_updated = update.date_updated.or(token.date_updated);
        }
        Ok(())
    }

    fn find_wallet_by_hash(&mut self, wallet_hash: &str) -> Result<Option<Wallet>> {
        Ok(self.wallets.iter().find(|w| w.wallet_hash == wallet_hash).cloned())
    }

    fn get_wallet(&mut self, id: i64) -> Result<Option<Wallet>> {
        Ok(self.wallets.iter().find(|w| w.id == id).cloned())
    }

    fn find_address(&mut self, address: &str) -> Result<Option<Address>> {
        Ok(self.addresses.iter().find(|a| a.address == address).cloned())
    }

    fn get_address(&mut self, id: i64) -> Result<Option<Address>> {
        Ok(self.addresses.iter().find(|a| a.id == id).cloned())
    }

    fn find_addresses(&mut self, addresses: &[String]) -> Result<Vec<Address>> {
        Ok(self
            .addresses
            .iter()
            .filter(|a| addresses.contains(&a.address))
            .cloned()
            .collect())
    }

    fn wallet_addresses(&mut self, wallet_id: i64) -> Result<Vec<Address>> {
        Ok(self
            .addresses
            .iter()
            .filter(|a| a.wallet_id == Some(wallet_id))
            .cloned()
            .collect())
    }

    fn insert_address(&mut self, address: &NewAddress) -> Result<Option<Address>> {
        if self.addresses.iter().any(|a| a.address == address.address) {
            return Ok(None);
        }
        let row = Address {
            id: self.next_id(),
            address: address.address.clone(),
            wallet_id: None,
            address_path: None,
        };
        self.addresses.push(row.clone());
        Ok(Some(row))
    }

    fn watched_addresses(&mut self) -> Result<Vec<String>> {
        let subscriptions = &self.subscriptions;
        Ok(self
            .addresses
            .iter()
            .filter(|a| {
                a.wallet_id.is_some() || subscriptions.iter().any(|s| s.address_id == a.id)
            })
            .map(|a| a.address.clone())
            .collect())
    }

    fn subscriptions_for_address(&mut self, address_id: i64) -> Result<Vec<Subscription>> {
        Ok(self
            .subscriptions
            .iter()
            .filter(|s| s.address_id == address_id)
            .cloned()
            .collect())
    }

    fn get_recipient(&mut self, id: i64) -> Result<Option<Recipient>> {
        Ok(self.recipients.iter().find(|r| r.id == id).cloned())
    }

    fn invalidate_recipient(&mut self, id: i64) -> Result<()> {
        if let Some(recipient) = self.recipients.iter_mut().find(|r| r.id == id) {
            recipient.valid = false;
        }
        Ok(())
    }

    fn find_transaction(&mut self, key: &TransactionKey) -> Result<Option<Transaction>> {
        Ok(self.transactions.iter().find(|t| t.key() == *key).cloned())
    }

    fn get_transaction(&mut self, id: i64) -> Result<Option<Transaction>> {
        Ok(self.transactions.iter().find(|t| t.id == id).cloned())
    }

    fn transactions_by_txid(&mut self, txid: &str) -> Result<Vec<Transaction>> {
        let mut found: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|t| t.txid == txid)
            .cloned()
            .collect();
        found.sort_by_key(|t| t.output_index);
        Ok(found)
    }

    fn transactions_for_addresses(&mut self, address_ids: &[i64]) -> Result<Vec<Transaction>> {
        Ok(self
            .transactions
            .iter()
            .filter(|t| address_ids.contains(&t.address_id))
            .cloned()
            .collect())
    }

    fn transactions_spent_by(&mut self, spending_txid: &str) -> Result<Vec<Transaction>> {
        Ok(self
            .transactions
            .iter()
            .filter(|t| t.spending_txid.as_deref() == Some(spending_txid))
            .cloned()
            .collect())
    }

    fn recorded_txids(&mut self, txids: &[String]) -> Result<Vec<String>> {
        let mut found = vec![];
        for txid in txids {
            if !found.contains(txid) && self.transactions.iter().any(|t| &t.txid == txid) {
                found.push(txid.clone());
            }
        }
        Ok(found)
    }

    fn insert_transaction(&mut self, transaction: &NewTransaction) -> Result<Option<Transaction>> {
        if self.insert_conflicts > 0 {
            self.insert_conflicts -= 1;
            return Ok(None);
        }
        let key = TransactionKey {
            txid: transaction.txid.clone(),
            address_id: transaction.address_id,
            token_id: transaction.token_id,
            amount: transaction.amount.clone(),
            output_index: transaction.output_index,
        };
        if self.transactions.iter().any(|t| t.key() == key) {
            return Ok(None);
        }
        let row = Transaction {
            id: self.next_id(),
            txid: transaction.txid.clone(),
            address_id: transaction.address_id,
            token_id: transaction.token_id,
            amount: transaction.amount.clone(),
            output_index: transaction.output_index,
            source: transaction.source.clone(),
            blockheight_id: transaction.blockheight_id,
            spent: transaction.spent,
            spending_txid: None,
            acknowledged: transaction.acknowledged,
            queued: transaction.queued,
            date_created: transaction.date_created,
        };
        self.transactions.push(row.clone());
        Ok(Some(row))
    }

    fn update_transaction_source(&mut self, id: i64, source: &str) -> Result<()> {
        if let Some(record) = self.transaction_mut(id) {
            record.source = source.to_owned();
        }
        Ok(())
    }

    fn acknowledge_transaction(&mut self, id: i64) -> Result<()> {
        if let Some(record) = self.transaction_mut(id) {
            record.acknowledged = true;
            record.queued = false;
        }
        Ok(())
    }

    fn link_txid_to_block(&mut self, txid: &str, block_id: i64) -> Result<usize> {
        let mut linked = 0;
        for record in self.transactions.iter_mut().filter(|t| t.txid == txid) {
            record.blockheight_id = Some(block_id);
            linked += 1;
        }
        Ok(linked)
    }

    fn mark_outputs_spent(
        &mut self,
        outpoints: &[Outpoint],
        spending_txid: &str,
    ) -> Result<Vec<Transaction>> {
        let mut updated = vec![];
        for outpoint in outpoints {
            for record in self
                .transactions
                .iter_mut()
                .filter(|t| t.txid == outpoint.txid && t.output_index == outpoint.index)
            {
                record.spent = true;
                record.spending_txid = Some(spending_txid.to_owned());
                updated.push(record.clone());
            }
        }
        Ok(updated)
    }

    fn apply_unspent_set(&mut self, address_id: i64, unspent_ids: &[i64]) -> Result<usize> {
        let mut flipped = 0;
        for record in self.transactions.iter_mut().filter(|t| t.address_id == address_id) {
            if unspent_ids.contains(&record.id) {
                record.spent = false;
                record.spending_txid = None;
            } else if !record.spent {
                record.spent = true;
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    fn find_block(&mut self, number: i32) -> Result<Option<BlockHeight>> {
        Ok(self.blocks.iter().find(|b| b.number == number).cloned())
    }

    fn get_block(&mut self, id: i64) -> Result<Option<BlockHeight>> {
        Ok(self.blocks.iter().find(|b| b.id == id).cloned())
    }

    fn insert_block(&mut self, block: &NewBlockHeight) -> Result<Option<BlockHeight>> {
        if self.blocks.iter().any(|b| b.number == block.number) {
            return Ok(None);
        }
        let row = BlockHeight {
            id: self.next_id(),
            number: block.number,
            processed: false,
            transactions_count: 0,
            requires_full_scan: block.requires_full_scan,
            genesis: block.genesis.clone(),
            problematic: block.problematic.clone(),
            created_datetime: block.created_datetime,
            updated_datetime: None,
        };
        self.blocks.push(row.clone());
        Ok(Some(row))
    }

    fn require_full_scan(&mut self, id: i64) -> Result<()> {
        if let Some(block) = self.block_mut(id) {
            block.requires_full_scan = true;
            block.updated_datetime = Some(Utc::now());
        }
        Ok(())
    }

    fn set_block_transactions_count(&mut self, id: i64, count: i32) -> Result<()> {
        if let Some(block) = self.block_mut(id) {
            block.transactions_count = count;
        }
        Ok(())
    }

    fn set_block_classification(
        &mut self,
        id: i64,
        genesis: &[String],
        problematic: &[String],
    ) -> Result<()> {
        if let Some(block) = self.block_mut(id) {
            block.genesis = genesis.to_vec();
            block.problematic = problematic.to_vec();
            block.updated_datetime = Some(Utc::now());
        }
        Ok(())
    }

    fn mark_block_processed(&mut self, id: i64, transactions_count: i32) -> Result<()> {
        if let Some(block) = self.block_mut(id) {
            block.processed = true;
            block.transactions_count = transactions_count;
            block.updated_datetime = Some(Utc::now());
        }
        Ok(())
    }

    fn blocks_requiring_scan(&mut self) -> Result<Vec<i32>> {
        let mut numbers: Vec<i32> = self
            .blocks
            .iter()
            .filter(|b| !b.processed && b.requires_full_scan)
            .map(|b| b.number)
            .collect();
        numbers.sort_unstable();
        Ok(numbers)
    }

    fn latest_block_with_problematic(
        &mut self,
        since: DateTime<Utc>,
    ) -> Result<Option<BlockHeight>> {
        Ok(self
            .blocks
            .iter()
            .filter(|b| b.created_datetime >= since && !b.problematic.is_empty())
            .max_by_key(|b| b.number)
            .cloned())
    }

    fn unprocessed_scanned_blocks(&mut self) -> Result<Vec<BlockHeight>> {
        let mut blocks: Vec<BlockHeight> = self
            .blocks
            .iter()
            .filter(|b| !b.processed && b.transactions_count > 0)
            .cloned()
            .collect();
        blocks.sort_by_key(|b| b.number);
        Ok(blocks)
    }

    fn txids_in_block(&mut self, block_id: i64) -> Result<Vec<String>> {
        let mut txids: Vec<String> = vec![];
        for record in self.transactions.iter().filter(|t| t.blockheight_id == Some(block_id)) {
            if !txids.contains(&record.txid) {
                txids.push(record.txid.clone());
            }
        }
        Ok(txids)
    }

    fn delete_blocks_up_to(&mut self, number: i32) -> Result<usize> {
        let ids: HashSet<i64> = self
            .blocks
            .iter()
            .filter(|b| b.number <= number)
            .map(|b| b.id)
            .collect();
        for record in self.transactions.iter_mut() {
            if record.blockheight_id.map_or(false, |id| ids.contains(&id)) {
                record.blockheight_id = None;
            }
        }
        self.blocks.retain(|b| !ids.contains(&b.id));
        Ok(ids.len())
    }

    fn find_wallet_history(&mut self, wallet_id: i64, txid: &str) -> Result<Option<WalletHistory>> {
        Ok(self
            .histories
            .iter()
            .find(|h| h.wallet_id == wallet_id && h.txid == txid)
            .cloned())
    }

    fn insert_wallet_history(&mut self, row: &NewWalletHistory) -> Result<Option<WalletHistory>> {
        if self
            .histories
            .iter()
            .any(|h| h.wallet_id == row.wallet_id && h.txid == row.txid)
        {
            return Ok(None);
        }
        let history = WalletHistory {
            id: self.next_id(),
            wallet_id: row.wallet_id,
            txid: row.txid.clone(),
            record_type: row.record_type.clone(),
            amount: row.amount.clone(),
            token_id: row.token_id,
            tx_fee: row.tx_fee.clone(),
            senders: row.senders.clone(),
            recipients: row.recipients.clone(),
            date_created: row.date_created,
        };
        self.histories.push(history.clone());
        Ok(Some(history))
    }

    fn update_wallet_history(&mut self, id: i64, changes: &WalletHistoryChangeset) -> Result<()> {
        if let Some(history) = self.histories.iter_mut().find(|h| h.id == id) {
            let changes = changes.clone();
            if let Some(record_type) = changes.record_type {
                history.record_type = record_type;
            }
            if let Some(amount) = changes.amount {
                history.amount = amount;
            }
            if let Some(token_id) = changes.token_id {
                history.token_id = token_id;
            }
            if changes.tx_fee.is_some() {
                history.tx_fee = changes.tx_fee;
            }
            if let Some(senders) = changes.senders {
                history.senders = senders;
            }
            if let Some(recipients) = changes.recipients {
                history.recipients = recipients;
            }
        }
        Ok(())
    }

    fn find_custody(
        &mut self,
        wallet_id: i64,
        token_id: i64,
        acquisition_txid: &str,
    ) -> Result<Option<WalletNftToken>> {
        Ok(self
            .custody
            .iter()
            .find(|c| {
                c.wallet_id == wallet_id
                    && c.token_id == token_id
                    && c.acquisition_txid == acquisition_txid
            })
            .cloned())
    }

    fn open_custody(&mut self, wallet_id: i64, token_id: i64) -> Result<Option<WalletNftToken>> {
        Ok(self
            .custody
            .iter()
            .filter(|c| {
                c.wallet_id == wallet_id && c.token_id == token_id && c.date_dispensed.is_none()
            })
            .max_by_key(|c| c.date_acquired)
            .cloned())
    }

    fn insert_custody(&mut self, row: &NewWalletNftToken) -> Result<Option<WalletNftToken>> {
        if self.find_custody(row.wallet_id, row.token_id, &row.acquisition_txid)?.is_some() {
            return Ok(None);
        }
        let custody = WalletNftToken {
            id: self.next_id(),
            wallet_id: row.wallet_id,
            token_id: row.token_id,
            acquisition_txid: row.acquisition_txid.clone(),
            date_acquired: row.date_acquired,
            dispensation_txid: None,
            date_dispensed: None,
        };
        self.custody.push(custody.clone());
        Ok(Some(custody))
    }

    fn close_custody(
        &mut self,
        id: i64,
        dispensation_txid: &str,
        date_dispensed: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(custody) = self.custody.iter_mut().find(|c| c.id == id) {
            custody.dispensation_txid = Some(dispensation_txid.to_owned());
            custody.date_dispensed = Some(date_dispensed);
        }
        Ok(())
    }
}

#[derive(Default)]
struct CoordinationState {
    ready: bool,
    active: Option<ActiveClaim>,
    pending: BTreeSet<i32>,
    completions: HashMap<i32, u64>,
    completion_failures: u32,
    guards: HashSet<i32>,
    finalized: HashMap<i32, u32>,
    classification: HashMap<i32, Classification>,
    flags: HashSet<String>,
    chain_failures: u64,
}

/// Coordination store kept in process memory; finalize guards never expire on their own.
#[derive(Default)]
pub struct MemoryCoordination {
    state: Mutex<CoordinationState>,
}

impl MemoryCoordination {
    fn state(&self) -> MutexGuard<'_, CoordinationState> {
        self.state.lock().unwrap()
    }

    pub fn is_ready(&self) -> bool {
        self.state().ready
    }

    pub fn active(&self) -> Option<i32> {
        self.state().active.map(|claim| claim.number)
    }

    /// Moves the claim time of the active block into the past.
    pub fn backdate_claim(&self, by: Duration) {
        if let Some(claim) = self.state().active.as_mut() {
            claim.since = claim.since - chrono::Duration::from_std(by).unwrap();
        }
    }

    /// The next `n` unit completion signals fail as if the connection dropped.
    pub fn fail_next_unit_completions(&self, n: u32) {
        self.state().completion_failures = n;
    }

    pub fn units_done(&self, number: i32) -> u64 {
        self.state().completions.get(&number).copied().unwrap_or(0)
    }

    /// How many callers won the finalize guard of the block.
    pub fn finalize_count(&self, number: i32) -> u32 {
        self.state().finalized.get(&number).copied().unwrap_or(0)
    }

    pub fn chain_failures(&self) -> u64 {
        self.state().chain_failures
    }

    pub fn flag_held(&self, name: &str) -> bool {
        self.state().flags.contains(name)
    }
}

#[async_trait]
impl CoordinationRepo for MemoryCoordination {
    async fn set_ready(&self) -> Result<(), Error> {
        self.state().ready = true;
        Ok(())
    }

    async fn claim_ready(&self) -> Result<bool, Error> {
        let mut state = self.state();
        let was_ready = state.ready;
        state.ready = false;
        Ok(was_ready)
    }

    async fn active_block(&self) -> Result<Option<i32>, Error> {
        Ok(self.active())
    }

    async fn active_claim(&self) -> Result<Option<ActiveClaim>, Error> {
        Ok(self.state().active)
    }

    async fn set_active_block(&self, number: i32) -> Result<(), Error> {
        self.state().active = Some(ActiveClaim {
            number,
            since: Utc::now(),
        });
        Ok(())
    }

    async fn clear_active_block(&self) -> Result<(), Error> {
        self.state().active = None;
        Ok(())
    }

    async fn push_pending(&self, numbers: &[i32]) -> Result<(), Error> {
        self.state().pending.extend(numbers.iter().copied());
        Ok(())
    }

    async fn pop_pending(&self) -> Result<Option<i32>, Error> {
        let mut state = self.state();
        let lowest = state.pending.iter().next().copied();
        if let Some(number) = lowest {
            state.pending.remove(&number);
        }
        Ok(lowest)
    }

    async fn pending_count(&self) -> Result<u64, Error> {
        Ok(self.state().pending.len() as u64)
    }

    async fn record_unit_completion(&self, number: i32) -> Result<u64, Error> {
        let mut state = self.state();
        if state.completion_failures > 0 {
            state.completion_failures -= 1;
            return Err(Error::RedisError(crate::redis::RedisError::from((
                crate::redis::ErrorKind::IoError,
                "connection reset",
            ))));
        }
        let done = state.completions.entry(number).or_insert(0);
        *done += 1;
        Ok(*done)
    }

    async fn try_mark_finalized(&self, number: i32, _ttl: Duration) -> Result<bool, Error> {
        let mut state = self.state();
        if !state.guards.insert(number) {
            return Ok(false);
        }
        *state.finalized.entry(number).or_insert(0) += 1;
        Ok(true)
    }

    async fn add_genesis(&self, number: i32, txid: &str) -> Result<(), Error> {
        let mut state = self.state();
        let entry = state.classification.entry(number).or_default();
        if !entry.genesis.iter().any(|t| t == txid) {
            entry.genesis.push(txid.to_owned());
        }
        Ok(())
    }

    async fn add_problematic(&self, number: i32, txid: &str) -> Result<(), Error> {
        let mut state = self.state();
        let entry = state.classification.entry(number).or_default();
        if !entry.problematic.iter().any(|t| t == txid) {
            entry.problematic.push(txid.to_owned());
        }
        Ok(())
    }

    async fn take_classification(&self, number: i32) -> Result<Classification, Error> {
        let mut state = self.state();
        state.completions.remove(&number);
        Ok(state.classification.remove(&number).unwrap_or_default())
    }

    async fn reset_block(&self, number: i32) -> Result<(), Error> {
        let mut state = self.state();
        state.completions.remove(&number);
        state.classification.remove(&number);
        state.guards.remove(&number);
        Ok(())
    }

    async fn acquire_run_flag(&self, name: &str, _ttl: Duration) -> Result<bool, Error> {
        Ok(self.state().flags.insert(name.to_owned()))
    }

    async fn release_run_flag(&self, name: &str) -> Result<(), Error> {
        self.state().flags.remove(name);
        Ok(())
    }

    async fn record_chain_failure(&self) -> Result<u64, Error> {
        let mut state = self.state();
        state.chain_failures += 1;
        Ok(state.chain_failures)
    }

    async fn reset_chain_failures(&self) -> Result<(), Error> {
        self.state().chain_failures = 0;
        Ok(())
    }
}

#[derive(Default)]
struct ChainState {
    blocks: HashMap<i32, Vec<String>>,
    transactions: HashMap<String, ChainTransaction>,
    failing: HashSet<String>,
    unspent: HashMap<String, Vec<UnspentOutput>>,
    metadata: HashMap<String, TokenMetadata>,
    latest: Option<i32>,
    broadcasts: Vec<String>,
}

/// Scripted upstream indexer. Anything not scripted is reported as a query failure.
#[derive(Default)]
pub struct MockChain {
    state: Mutex<ChainState>,
}

impl MockChain {
    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap()
    }

    pub fn set_block(&self, number: i32, txids: &[&str]) {
        let txids = txids.iter().map(|t| t.to_string()).collect();
        self.state().blocks.insert(number, txids);
    }

    pub fn set_transaction(&self, tx: ChainTransaction) {
        self.state().transactions.insert(tx.txid.clone(), tx);
    }

    pub fn fail_transaction(&self, txid: &str) {
        self.state().failing.insert(txid.to_owned());
    }

    pub fn set_latest(&self, number: i32) {
        self.state().latest = Some(number);
    }

    pub fn set_unspent(&self, address: &str, utxos: Vec<UnspentOutput>) {
        self.state().unspent.insert(address.to_owned(), utxos);
    }

    pub fn set_token_metadata(&self, tokenid: &str, metadata: TokenMetadata) {
        self.state().metadata.insert(tokenid.to_owned(), metadata);
    }

    pub fn broadcasts(&self) -> Vec<String> {
        self.state().broadcasts.clone()
    }
}

#[async_trait]
impl ChainQuery for MockChain {
    async fn list_block_transaction_ids(&self, block_number: i32) -> Result<Vec<String>, Error> {
        self.state()
            .blocks
            .get(&block_number)
            .cloned()
            .ok_or_else(|| Error::ChainQueryError(format!("block {} unavailable", block_number)))
    }

    async fn get_transaction(
        &self,
        txid: &str,
        _decode_overlay: bool,
    ) -> Result<ChainTransaction, Error> {
        let state = self.state();
        if state.failing.contains(txid) {
            return Err(Error::ChainQueryError(format!("tx {} failed to decode", txid)));
        }
        state
            .transactions
            .get(txid)
            .cloned()
            .ok_or_else(|| Error::ChainQueryError(format!("tx {} unavailable", txid)))
    }

    async fn get_unspent_outputs(&self, address: &str) -> Result<Vec<UnspentOutput>, Error> {
        Ok(self.state().unspent.get(address).cloned().unwrap_or_default())
    }

    async fn get_latest_block_number(&self) -> Result<i32, Error> {
        self.state()
            .latest
            .ok_or_else(|| Error::ChainQueryError("no tip".into()))
    }

    async fn get_token_metadata(&self, tokenid: &str) -> Result<TokenMetadata, Error> {
        self.state()
            .metadata
            .get(tokenid)
            .cloned()
            .ok_or_else(|| Error::ChainQueryError(format!("token {} unavailable", tokenid)))
    }

    async fn broadcast(&self, raw_tx: &str) -> Result<String, Error> {
        let mut state = self.state();
        state.broadcasts.push(raw_tx.to_owned());
        Ok(format!("{:064x}", state.broadcasts.len()))
    }
}

/// Webhook endpoints answering with scripted responses; the last response repeats.
#[derive(Default)]
pub struct MockWebhook {
    responses: Mutex<HashMap<String, Vec<(u16, Value)>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl MockWebhook {
    pub fn respond(&self, url: &str, responses: Vec<(u16, Value)>) {
        self.responses.lock().unwrap().insert(url.to_owned(), responses);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl WebhookClient for MockWebhook {
    async fn post_json(&self, url: &str, _body: &Value) -> Result<WebhookResponse, Error> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(url.to_owned()).or_insert(0);
            *count += 1;
            *count
        };
        let responses = self.responses.lock().unwrap();
        match responses.get(url) {
            Some(scripted) if !scripted.is_empty() => {
                let (status, body) = scripted[(call - 1).min(scripted.len() - 1)].clone();
                Ok(WebhookResponse { status, body })
            }
            _ => Err(Error::DeliveryError(format!("connection refused: {}", url))),
        }
    }
}

#[derive(Default)]
pub struct MockPublisher {
    rooms: Mutex<Vec<String>>,
}

impl MockPublisher {
    pub fn rooms(&self) -> Vec<String> {
        self.rooms.lock().unwrap().clone()
    }
}

#[async_trait]
impl RoomPublisher for MockPublisher {
    async fn publish(&self, room: &str, _message: &str) -> Result<(), Error> {
        self.rooms.lock().unwrap().push(room.to_owned());
        Ok(())
    }
}

pub struct MockChat {
    platform: &'static str,
    sent: Mutex<Vec<(String, String)>>,
}

impl MockChat {
    pub fn new(platform: &'static str) -> Self {
        MockChat {
            platform,
            sent: Mutex::new(vec![]),
        }
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatSender for MockChat {
    fn platform(&self) -> &'static str {
        self.platform
    }

    async fn send(&self, chat_id: &str, text: &str) -> DeliveryOutcome {
        self.sent
            .lock()
            .unwrap()
            .push((chat_id.to_owned(), text.to_owned()));
        DeliveryOutcome::Delivered
    }
}

pub mod fixtures {
    use super::*;
    use crate::chain::{TokenTransfer, TransferKind, TxOutput};
    use crate::history::WalletHistoryBuilder;
    use crate::models::BASE_CURRENCY_TOKEN_NAME;
    use crate::notifications::{Dispatcher, TransactionEvent};
    use crate::pipeline::Pipeline;
    use crate::reconciler::{EnrichmentQueue, Observation, Reconciler};

    fn coins(amount: &str) -> BigDecimal {
        BigDecimal::from_str(amount).unwrap()
    }

    /// Base-currency receipt of 1 coin, not yet in a block.
    pub fn event(address: &str, txid: &str, index: i32) -> TransactionEvent {
        TransactionEvent {
            transaction: Transaction {
                id: 1,
                txid: txid.to_owned(),
                address_id: 1,
                token_id: 1,
                amount: BigDecimal::from(1),
                output_index: index,
                source: "test".to_owned(),
                blockheight_id: None,
                spent: false,
                spending_txid: None,
                acknowledged: false,
                queued: false,
                date_created: Utc::now(),
            },
            address: Address {
                id: 1,
                address: address.to_owned(),
                wallet_id: None,
                address_path: None,
            },
            token: Token {
                id: 1,
                tokenid: String::new(),
                name: BASE_CURRENCY_TOKEN_NAME.to_owned(),
                token_ticker: BASE_CURRENCY_TOKEN_NAME.to_uppercase(),
                token_type: None,
                decimals: None,
                nft_token_group_id: None,
                original_image_url: None,
                thumbnail_image_url: None,
                metadata: None,
                date_updated: None,
            },
            block: None,
            wallet: None,
        }
    }

    pub fn wallet(id: i64, hash: &str, version: i32) -> Wallet {
        Wallet {
            id,
            wallet_hash: hash.to_owned(),
            wallet_type: "bch".to_owned(),
            version,
        }
    }

    /// Plain payment with a single output at index 0.
    pub fn payment(txid: &str, address: &str, amount: &str) -> ChainTransaction {
        ChainTransaction {
            txid: txid.to_owned(),
            block_height: None,
            inputs: vec![],
            outputs: vec![TxOutput {
                address: Some(address.to_owned()),
                value: coins(amount),
                index: 0,
                token_amount: None,
            }],
            tx_fee: None,
            valid: true,
            token: None,
        }
    }

    /// Token genesis minting 1000 units to `address` at output 1.
    pub fn genesis(txid: &str, address: &str, tokenid: &str) -> ChainTransaction {
        ChainTransaction {
            txid: txid.to_owned(),
            block_height: None,
            inputs: vec![],
            outputs: vec![
                TxOutput {
                    address: None,
                    value: BigDecimal::from(0),
                    index: 0,
                    token_amount: None,
                },
                TxOutput {
                    address: Some(address.to_owned()),
                    value: coins("0.00000546"),
                    index: 1,
                    token_amount: Some(BigDecimal::from(1000)),
                },
            ],
            tx_fee: None,
            valid: true,
            token: Some(TokenTransfer {
                token: TokenIdentity::Overlay(tokenid.to_owned()),
                kind: TransferKind::Genesis,
                valid: true,
            }),
        }
    }

    /// Full pipeline over `repo` with a silent notification side.
    pub fn pipeline(repo: &MemoryRecordRepo) -> Arc<Pipeline<MemoryRecordRepo, MockChain>> {
        let repo = Arc::new(repo.clone());
        let reconciler = Reconciler::new(
            repo.clone(),
            Arc::new(MockChain::default()),
            EnrichmentQueue::disabled(),
        );
        let dispatcher = Dispatcher::new(
            repo.clone(),
            Arc::new(MockWebhook::default()),
            Arc::new(MockPublisher::default()),
            0,
            Duration::ZERO,
        );
        Arc::new(Pipeline::new(
            Arc::new(reconciler),
            Arc::new(WalletHistoryBuilder::new(repo)),
            Arc::new(dispatcher),
        ))
    }

    pub async fn record_in_block(
        repo: &MemoryRecordRepo,
        address: &str,
        txid: &str,
        block_id: i64,
    ) -> anyhow::Result<i64> {
        let reconciler = Reconciler::new(
            Arc::new(repo.clone()),
            Arc::new(MockChain::default()),
            EnrichmentQueue::disabled(),
        );
        let outcome = reconciler
            .reconcile(
                Observation::new(
                    TokenIdentity::BaseCurrency,
                    address,
                    txid,
                    BigDecimal::from(1),
                    "test",
                )
                .in_block(Some(block_id)),
            )
            .await?;
        outcome
            .transaction_id()
            .ok_or_else(|| anyhow::anyhow!("{} was not recorded", txid))
    }
}

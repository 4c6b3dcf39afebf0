use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::dsl::{not, sql};
use diesel::prelude::*;
use diesel::sql_types::Bool;
use wavesexchange_log::timer;

use super::pool::{PgPoolWithStats, PooledPgConnection};
use super::{
    Address, BlockHeight, NewAddress, NewBlockHeight, NewToken, NewTransaction, NewWalletHistory,
    NewWalletNftToken, RecordRepo, RecordRepoOperations, Recipient, Subscription, Token,
    TokenMetadataUpdate, Transaction, TransactionKey, Wallet, WalletHistory,
    WalletHistoryChangeset, WalletNftToken,
};
use crate::error::Result;
use crate::models::Outpoint;
use crate::schema::{
    addresses, block_heights, recipients, subscriptions, tokens, transactions, wallet_histories,
    wallet_nft_tokens, wallets,
};
use crate::utils::chunks::ToChunks;

// Bound on bind parameters per `IN (...)` list.
const ID_CHUNK_SIZE: usize = 10_000;

/// Record store backed by Postgres.
///
/// Can be cloned freely, no need to wrap in `Arc`.
#[derive(Clone)]
pub struct PostgresRecordRepo {
    pool: PgPoolWithStats,
}

impl PostgresRecordRepo {
    pub fn new(pool: PgPoolWithStats) -> Self {
        Self { pool }
    }

    async fn get_conn(&self) -> Result<PooledPgConnection> {
        let conn = self.pool.get().await?;
        Ok(conn)
    }
}

#[async_trait]
impl RecordRepo for PostgresRecordRepo {
    type Operations = PgConnection;

    async fn execute<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut PgConnection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.get_conn().await?;
        conn.interact(|conn| f(conn)).await?
    }

    async fn transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut PgConnection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.get_conn().await?;
        conn.interact(|conn| conn.transaction(|conn| f(conn)))
            .await?
    }
}

impl RecordRepoOperations for PgConnection {
    fn find_token_by_tokenid(&mut self, tokenid: &str) -> Result<Option<Token>> {
        timer!("find_token_by_tokenid()", verbose);

        Ok(tokens::table
            .filter(tokens::tokenid.eq(tokenid))
            .first(self)
            .optional()?)
    }

    fn find_token_by_name(&mut self, name: &str) -> Result<Option<Token>> {
        timer!("find_token_by_name()", verbose);

        Ok(tokens::table
            .filter(tokens::name.eq(name))
            .filter(tokens::tokenid.eq(""))
            .first(self)
            .optional()?)
    }

    fn get_token(&mut self, id: i64) -> Result<Option<Token>> {
        Ok(tokens::table.find(id).first(self).optional()?)
    }

    fn tokens(&mut self) -> Result<Vec<Token>> {
        timer!("tokens()", verbose);

        Ok(tokens::table.order(tokens::id.asc()).load(self)?)
    }

    fn insert_token(&mut self, token: &NewToken) -> Result<Option<Token>> {
        timer!("insert_token()", verbose);

        Ok(diesel::insert_into(tokens::table)
            .values(token)
            .on_conflict_do_nothing()
            .get_result(self)
            .optional()?)
    }

    fn update_token_metadata(&mut self, id: i64, update: &TokenMetadataUpdate) -> Result<()> {
        timer!("update_token_metadata()", verbose);

        diesel::update(tokens::table.find(id))
            .set(update)
            .execute(self)?;

        Ok(())
    }

    fn find_wallet_by_hash(&mut self, wallet_hash: &str) -> Result<Option<Wallet>> {
        Ok(wallets::table
            .filter(wallets::wallet_hash.eq(wallet_hash))
            .first(self)
            .optional()?)
    }

    fn get_wallet(&mut self, id: i64) -> Result<Option<Wallet>> {
        Ok(wallets::table.find(id).first(self).optional()?)
    }

    fn find_address(&mut self, address: &str) -> Result<Option<Address>> {
        Ok(addresses::table
            .filter(addresses::address.eq(address))
            .first(self)
            .optional()?)
    }

    fn get_address(&mut self, id: i64) -> Result<Option<Address>> {
        Ok(addresses::table.find(id).first(self).optional()?)
    }

    fn find_addresses(&mut self, values: &[String]) -> Result<Vec<Address>> {
        timer!("find_addresses()", verbose);

        let mut found = vec![];
        for chunk in values.iter().chunks_from_iter(ID_CHUNK_SIZE) {
            let rows: Vec<Address> = addresses::table
                .filter(addresses::address.eq_any(chunk))
                .load(self)?;
            found.extend(rows);
        }
        Ok(found)
    }

    fn wallet_addresses(&mut self, wallet_id: i64) -> Result<Vec<Address>> {
        timer!("wallet_addresses()", verbose);

        Ok(addresses::table
            .filter(addresses::wallet_id.eq(wallet_id))
            .load(self)?)
    }

    fn insert_address(&mut self, address: &NewAddress) -> Result<Option<Address>> {
        Ok(diesel::insert_into(addresses::table)
            .values(address)
            .on_conflict_do_nothing()
            .get_result(self)
            .optional()?)
    }

    fn watched_addresses(&mut self) -> Result<Vec<String>> {
        timer!("watched_addresses()", verbose);

        Ok(addresses::table
            .filter(addresses::wallet_id.is_not_null().or(
                addresses::id.eq_any(subscriptions::table.select(subscriptions::address_id)),
            ))
            .select(addresses::address)
            .order(addresses::id.asc())
            .load(self)?)
    }

    fn subscriptions_for_address(&mut self, address_id: i64) -> Result<Vec<Subscription>> {
        timer!("subscriptions_for_address()", verbose);

        Ok(subscriptions::table
            .filter(subscriptions::address_id.eq(address_id))
            .order(subscriptions::id.asc())
            .load(self)?)
    }

    fn get_recipient(&mut self, id: i64) -> Result<Option<Recipient>> {
        Ok(recipients::table.find(id).first(self).optional()?)
    }

    fn invalidate_recipient(&mut self, id: i64) -> Result<()> {
        timer!("invalidate_recipient()", verbose);

        diesel::update(recipients::table.find(id))
            .set(recipients::valid.eq(false))
            .execute(self)?;

        Ok(())
    }

    fn find_transaction(&mut self, key: &TransactionKey) -> Result<Option<Transaction>> {
        timer!("find_transaction()", verbose);

        Ok(transactions::table
            .filter(transactions::txid.eq(&key.txid))
            .filter(transactions::address_id.eq(key.address_id))
            .filter(transactions::token_id.eq(key.token_id))
            .filter(transactions::amount.eq(&key.amount))
            .filter(transactions::output_index.eq(key.output_index))
            .first(self)
            .optional()?)
    }

    fn get_transaction(&mut self, id: i64) -> Result<Option<Transaction>> {
        Ok(transactions::table.find(id).first(self).optional()?)
    }

    fn transactions_by_txid(&mut self, txid: &str) -> Result<Vec<Transaction>> {
        timer!("transactions_by_txid()", verbose);

        Ok(transactions::table
            .filter(transactions::txid.eq(txid))
            .order(transactions::output_index.asc())
            .load(self)?)
    }

    fn transactions_for_addresses(&mut self, address_ids: &[i64]) -> Result<Vec<Transaction>> {
        timer!("transactions_for_addresses()", verbose);

        let mut found = vec![];
        for chunk in address_ids.iter().chunks_from_iter(ID_CHUNK_SIZE) {
            let rows: Vec<Transaction> = transactions::table
                .filter(transactions::address_id.eq_any(chunk))
                .load(self)?;
            found.extend(rows);
        }
        Ok(found)
    }

    fn transactions_spent_by(&mut self, spending_txid: &str) -> Result<Vec<Transaction>> {
        timer!("transactions_spent_by()", verbose);

        Ok(transactions::table
            .filter(transactions::spending_txid.eq(spending_txid))
            .order(transactions::id.asc())
            .load(self)?)
    }

    fn recorded_txids(&mut self, txids: &[String]) -> Result<Vec<String>> {
        timer!("recorded_txids()", verbose);

        let mut found = vec![];
        for chunk in txids.iter().chunks_from_iter(ID_CHUNK_SIZE) {
            let rows: Vec<String> = transactions::table
                .select(transactions::txid)
                .filter(transactions::txid.eq_any(chunk))
                .distinct()
                .load(self)?;
            found.extend(rows);
        }
        Ok(found)
    }

    fn insert_transaction(&mut self, transaction: &NewTransaction) -> Result<Option<Transaction>> {
        timer!("insert_transaction()", verbose);

        Ok(diesel::insert_into(transactions::table)
            .values(transaction)
            .on_conflict_do_nothing()
            .get_result(self)
            .optional()?)
    }

    fn update_transaction_source(&mut self, id: i64, source: &str) -> Result<()> {
        diesel::update(transactions::table.find(id))
            .set(transactions::source.eq(source))
            .execute(self)?;

        Ok(())
    }

    fn acknowledge_transaction(&mut self, id: i64) -> Result<()> {
        timer!("acknowledge_transaction()", verbose);

        diesel::update(transactions::table.find(id))
            .set((
                transactions::acknowledged.eq(true),
                transactions::queued.eq(false),
            ))
            .execute(self)?;

        Ok(())
    }

    fn link_txid_to_block(&mut self, txid: &str, block_id: i64) -> Result<usize> {
        timer!("link_txid_to_block()", verbose);

        Ok(diesel::update(transactions::table)
            .filter(transactions::txid.eq(txid))
            .set(transactions::blockheight_id.eq(block_id))
            .execute(self)?)
    }

    fn mark_outputs_spent(
        &mut self,
        outpoints: &[Outpoint],
        spending_txid: &str,
    ) -> Result<Vec<Transaction>> {
        timer!("mark_outputs_spent()", verbose);

        let mut updated = vec![];
        for outpoint in outpoints {
            let rows: Vec<Transaction> = diesel::update(transactions::table)
                .filter(transactions::txid.eq(&outpoint.txid))
                .filter(transactions::output_index.eq(outpoint.index))
                .set((
                    transactions::spent.eq(true),
                    transactions::spending_txid.eq(spending_txid),
                ))
                .get_results(self)?;
            updated.extend(rows);
        }
        Ok(updated)
    }

    fn apply_unspent_set(&mut self, address_id: i64, unspent_ids: &[i64]) -> Result<usize> {
        timer!("apply_unspent_set()", verbose);

        diesel::update(transactions::table)
            .filter(transactions::address_id.eq(address_id))
            .filter(transactions::id.eq_any(unspent_ids))
            .set((
                transactions::spent.eq(false),
                transactions::spending_txid.eq(None::<String>),
            ))
            .execute(self)?;

        Ok(diesel::update(transactions::table)
            .filter(transactions::address_id.eq(address_id))
            .filter(transactions::spent.eq(false))
            .filter(not(transactions::id.eq_any(unspent_ids)))
            .set(transactions::spent.eq(true))
            .execute(self)?)
    }

    fn find_block(&mut self, number: i32) -> Result<Option<BlockHeight>> {
        Ok(block_heights::table
            .filter(block_heights::number.eq(number))
            .first(self)
            .optional()?)
    }

    fn get_block(&mut self, id: i64) -> Result<Option<BlockHeight>> {
        Ok(block_heights::table.find(id).first(self).optional()?)
    }

    fn insert_block(&mut self, block: &NewBlockHeight) -> Result<Option<BlockHeight>> {
        timer!("insert_block()", verbose);

        Ok(diesel::insert_into(block_heights::table)
            .values(block)
            .on_conflict_do_nothing()
            .get_result(self)
            .optional()?)
    }

    fn require_full_scan(&mut self, id: i64) -> Result<()> {
        diesel::update(block_heights::table.find(id))
            .set((
                block_heights::requires_full_scan.eq(true),
                block_heights::updated_datetime.eq(Utc::now()),
            ))
            .execute(self)?;

        Ok(())
    }

    fn set_block_transactions_count(&mut self, id: i64, count: i32) -> Result<()> {
        diesel::update(block_heights::table.find(id))
            .set(block_heights::transactions_count.eq(count))
            .execute(self)?;

        Ok(())
    }

    fn set_block_classification(
        &mut self,
        id: i64,
        genesis: &[String],
        problematic: &[String],
    ) -> Result<()> {
        timer!("set_block_classification()", verbose);

        diesel::update(block_heights::table.find(id))
            .set((
                block_heights::genesis.eq(genesis.to_vec()),
                block_heights::problematic.eq(problematic.to_vec()),
                block_heights::updated_datetime.eq(Utc::now()),
            ))
            .execute(self)?;

        Ok(())
    }

    fn mark_block_processed(&mut self, id: i64, transactions_count: i32) -> Result<()> {
        timer!("mark_block_processed()", verbose);

        diesel::update(block_heights::table.find(id))
            .set((
                block_heights::processed.eq(true),
                block_heights::transactions_count.eq(transactions_count),
                block_heights::updated_datetime.eq(Utc::now()),
            ))
            .execute(self)?;

        Ok(())
    }

    fn blocks_requiring_scan(&mut self) -> Result<Vec<i32>> {
        timer!("blocks_requiring_scan()", verbose);

        Ok(block_heights::table
            .select(block_heights::number)
            .filter(block_heights::processed.eq(false))
            .filter(block_heights::requires_full_scan.eq(true))
            .order(block_heights::number.asc())
            .load(self)?)
    }

    fn latest_block_with_problematic(
        &mut self,
        since: DateTime<Utc>,
    ) -> Result<Option<BlockHeight>> {
        timer!("latest_block_with_problematic()", verbose);

        Ok(block_heights::table
            .filter(block_heights::created_datetime.ge(since))
            .filter(sql::<Bool>("cardinality(problematic) > 0"))
            .order(block_heights::number.desc())
            .first(self)
            .optional()?)
    }

    fn unprocessed_scanned_blocks(&mut self) -> Result<Vec<BlockHeight>> {
        timer!("unprocessed_scanned_blocks()", verbose);

        Ok(block_heights::table
            .filter(block_heights::processed.eq(false))
            .filter(block_heights::transactions_count.gt(0))
            .order(block_heights::number.asc())
            .load(self)?)
    }

    fn txids_in_block(&mut self, block_id: i64) -> Result<Vec<String>> {
        Ok(transactions::table
            .select(transactions::txid)
            .filter(transactions::blockheight_id.eq(block_id))
            .distinct()
            .load(self)?)
    }

    fn delete_blocks_up_to(&mut self, number: i32) -> Result<usize> {
        timer!("delete_blocks_up_to()", verbose);

        let ids: Vec<i64> = block_heights::table
            .select(block_heights::id)
            .filter(block_heights::number.le(number))
            .load(self)?;
        if ids.is_empty() {
            return Ok(0);
        }

        diesel::update(transactions::table)
            .filter(transactions::blockheight_id.eq_any(&ids))
            .set(transactions::blockheight_id.eq(None::<i64>))
            .execute(self)?;

        Ok(diesel::delete(block_heights::table)
            .filter(block_heights::id.eq_any(&ids))
            .execute(self)?)
    }

    fn find_wallet_history(&mut self, wallet_id: i64, txid: &str) -> Result<Option<WalletHistory>> {
        Ok(wallet_histories::table
            .filter(wallet_histories::wallet_id.eq(wallet_id))
            .filter(wallet_histories::txid.eq(txid))
            .first(self)
            .optional()?)
    }

    fn insert_wallet_history(&mut self, row: &NewWalletHistory) -> Result<Option<WalletHistory>> {
        timer!("insert_wallet_history()", verbose);

        Ok(diesel::insert_into(wallet_histories::table)
            .values(row)
            .on_conflict_do_nothing()
            .get_result(self)
            .optional()?)
    }

    fn update_wallet_history(&mut self, id: i64, changes: &WalletHistoryChangeset) -> Result<()> {
        timer!("update_wallet_history()", verbose);

        diesel::update(wallet_histories::table.find(id))
            .set(changes)
            .execute(self)?;

        Ok(())
    }

    fn find_custody(
        &mut self,
        wallet_id: i64,
        token_id: i64,
        acquisition_txid: &str,
    ) -> Result<Option<WalletNftToken>> {
        Ok(wallet_nft_tokens::table
            .filter(wallet_nft_tokens::wallet_id.eq(wallet_id))
            .filter(wallet_nft_tokens::token_id.eq(token_id))
            .filter(wallet_nft_tokens::acquisition_txid.eq(acquisition_txid))
            .first(self)
            .optional()?)
    }

    fn open_custody(&mut self, wallet_id: i64, token_id: i64) -> Result<Option<WalletNftToken>> {
        Ok(wallet_nft_tokens::table
            .filter(wallet_nft_tokens::wallet_id.eq(wallet_id))
            .filter(wallet_nft_tokens::token_id.eq(token_id))
            .filter(wallet_nft_tokens::date_dispensed.is_null())
            .order(wallet_nft_tokens::date_acquired.desc())
            .first(self)
            .optional()?)
    }

    fn insert_custody(&mut self, row: &NewWalletNftToken) -> Result<Option<WalletNftToken>> {
        timer!("insert_custody()", verbose);

        Ok(diesel::insert_into(wallet_nft_tokens::table)
            .values(row)
            .on_conflict_do_nothing()
            .get_result(self)
            .optional()?)
    }

    fn close_custody(
        &mut self,
        id: i64,
        dispensation_txid: &str,
        date_dispensed: DateTime<Utc>,
    ) -> Result<()> {
        timer!("close_custody()", verbose);

        diesel::update(wallet_nft_tokens::table.find(id))
            .set((
                wallet_nft_tokens::dispensation_txid.eq(dispensation_txid),
                wallet_nft_tokens::date_dispensed.eq(date_dispensed),
            ))
            .execute(self)?;

        Ok(())
    }
}

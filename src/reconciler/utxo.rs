use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use wavesexchange_log::{debug, error, info, warn};

use super::{Observation, ReconcileOutcome, Reconciler};
use crate::chain::{ChainQuery, UnspentOutput};
use crate::db::{
    get_or_create_block, get_or_create_token, RecordRepo, RecordRepoOperations, TransactionKey,
};
use crate::error::Result;

pub const UTXO_SCAN_SOURCE: &str = "utxo-scan";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UtxoReconciliation {
    pub unspent: usize,
    pub marked_spent: usize,
}

impl<R, C> Reconciler<R, C>
where
    R: RecordRepo + Send + Sync + 'static,
    C: ChainQuery + 'static,
{
    /// Makes the stored spent flags of `address` agree with the upstream unspent set.
    pub async fn reconcile_utxo_set(&self, address: &str) -> Result<UtxoReconciliation> {
        self.reconcile_utxo_set_inner(address, false).await
    }

    /// Same as [`Self::reconcile_utxo_set`], but the history found is pre-acknowledged.
    pub async fn backfill_subscription(&self, address: &str) -> Result<UtxoReconciliation> {
        self.reconcile_utxo_set_inner(address, true).await
    }

    async fn reconcile_utxo_set_inner(
        &self,
        address: &str,
        is_new_subscription: bool,
    ) -> Result<UtxoReconciliation> {
        let utxos = self.chain.get_unspent_outputs(address).await?;

        let mut unspent_ids = Vec::with_capacity(utxos.len());
        for utxo in utxos {
            let block_id = match utxo.block_height {
                Some(height) => Some(
                    self.repo
                        .transaction(move |ops| get_or_create_block(ops, height))
                        .await?
                        .0
                        .id,
                ),
                None => None,
            };

            let observation = Observation::new(
                utxo.token.clone(),
                address,
                utxo.txid.clone(),
                utxo.amount.clone(),
                UTXO_SCAN_SOURCE,
            )
            .in_block(block_id)
            .at_index(utxo.index)
            .for_new_subscription(is_new_subscription);

            match self.reconcile(observation).await? {
                ReconcileOutcome::Recorded { transaction_id, .. } => {
                    unspent_ids.push(transaction_id)
                }
                ReconcileOutcome::NoOp => {
                    if let Some(id) = self.find_recorded(address, &utxo).await? {
                        unspent_ids.push(id);
                    }
                }
            }
        }

        let address = address.to_owned();
        let unspent = unspent_ids.len();
        let marked_spent = self
            .repo
            .transaction(move |ops| match ops.find_address(&address)? {
                Some(row) => ops.apply_unspent_set(row.id, &unspent_ids),
                None => Ok(0),
            })
            .await?;

        debug!(
            "utxo set reconciled: {} unspent, {} marked spent",
            unspent, marked_spent
        );

        Ok(UtxoReconciliation {
            unspent,
            marked_spent,
        })
    }

    /// One UTXO-set pass over every watched address. Returns how many addresses
    /// were reconciled; a failing address does not stop the pass.
    pub async fn reconcile_watched_addresses(&self) -> Result<usize> {
        let addresses = self.repo.execute(|ops| ops.watched_addresses()).await?;
        let mut reconciled = 0;
        for address in &addresses {
            match self.reconcile_utxo_set(address).await {
                Ok(_) => reconciled += 1,
                Err(err) => warn!("utxo reconciliation of {} failed: {}", address, err),
            }
        }
        info!(
            "utxo reconciliation pass: {} of {} addresses",
            reconciled,
            addresses.len()
        );
        Ok(reconciled)
    }

    pub async fn run_utxo_loop(self: Arc<Self>, delay: Duration) -> Result<()> {
        info!("utxo reconciliation started");
        loop {
            if let Err(err) = self.reconcile_watched_addresses().await {
                error!("utxo reconciliation pass failed: {}", err);
            }
            sleep(delay).await;
        }
    }

    /// Record a concurrent writer produced for this UTXO, if any.
    async fn find_recorded(&self, address: &str, utxo: &UnspentOutput) -> Result<Option<i64>> {
        let address = address.to_owned();
        let utxo = utxo.clone();
        self.repo
            .execute(move |ops| {
                let address = match ops.find_address(&address)? {
                    Some(address) => address,
                    None => return Ok(None),
                };
                let (token, _) = get_or_create_token(ops, &utxo.token)?;
                let key = TransactionKey {
                    txid: utxo.txid.clone(),
                    address_id: address.id,
                    token_id: token.id,
                    amount: utxo.amount.clone(),
                    output_index: utxo.index,
                };
                let found = ops.find_transaction(&key)?;
                if found.is_none() {
                    warn!("utxo {}:{} could not be recorded", utxo.txid, utxo.index);
                }
                Ok(found.map(|t| t.id))
            })
            .await
    }
}

use itertools::Itertools;
use std::collections::HashSet;
use std::sync::Arc;
use wavesexchange_log::{debug, info, warn};

use super::{transition, BlockScanCoordinator, ScanState, BLOCK_SCAN_SOURCE};
use crate::chain::ChainQuery;
use crate::coordination::CoordinationRepo;
use crate::db::{RecordRepo, RecordRepoOperations};
use crate::error::{Error, Result};
use crate::metrics::{BLOCKS_FINALIZED, PROBLEMATIC_TRANSACTIONS};

/// One txid of a block being scanned.
#[derive(Clone, Debug)]
pub struct ScanUnit {
    pub txid: String,
    pub block_number: i32,
    pub block_id: i64,
    pub sequence: usize,
    pub total: usize,
}

impl<R, Q, K> BlockScanCoordinator<R, Q, K>
where
    R: RecordRepo + Send + Sync + 'static,
    Q: ChainQuery + 'static,
    K: CoordinationRepo + Send + Sync + 'static,
{
    /// Classifies one txid, then reports completion; the last unit finalizes the block.
    pub(super) async fn run_unit(&self, unit: ScanUnit, listing: Arc<Vec<String>>) -> Result<()> {
        let number = unit.block_number;
        if let Err(err) = self.process_unit(&unit).await {
            warn!(
                "{} ({}/{} of block {}) is problematic: {}",
                unit.txid,
                unit.sequence + 1,
                unit.total,
                number,
                err
            );
            PROBLEMATIC_TRANSACTIONS.inc();
            if let Err(err) = self.coordination.add_problematic(number, &unit.txid).await {
                warn!("could not queue {} as problematic: {}", unit.txid, err);
            }
        }

        let what = format!("completion of {} in block {}", unit.txid, number);
        let done = self
            .with_store_retries(&what, || self.coordination.record_unit_completion(number))
            .await?;
        debug!("block {}: {}/{} units done", number, done, unit.total);
        if done >= unit.total as u64 {
            self.finalize(number, unit.block_id, listing).await?;
        }
        Ok(())
    }

    async fn process_unit(&self, unit: &ScanUnit) -> Result<()> {
        let tx = self.chain.get_transaction(&unit.txid, true).await?;
        if tx.is_genesis() {
            self.coordination.add_genesis(unit.block_number, &unit.txid).await?;
        }
        self.handler
            .handle(&tx, BLOCK_SCAN_SOURCE, Some(unit.block_id))
            .await
    }

    /// SCANNING -> FINALIZING -> IDLE. Runs at most once per block.
    ///
    /// When the classification cannot be stored even after retries, the block goes
    /// back to the backlog with its progress reset and the claim is released.
    pub(super) async fn finalize(
        &self,
        number: i32,
        block_id: i64,
        listing: Arc<Vec<String>>,
    ) -> Result<()> {
        if !self
            .coordination
            .try_mark_finalized(number, self.config.finalize_guard_ttl)
            .await?
        {
            debug!("block {} is already finalized", number);
            return Ok(());
        }
        transition(number, ScanState::Scanning, ScanState::Finalizing);

        let (genesis, problematic) = match self
            .store_classification(number, block_id, listing)
            .await
        {
            Ok(counts) => counts,
            Err(err) => {
                warn!("block {} could not be finalized: {}", number, err);
                self.coordination.reset_block(number).await?;
                self.release(number, ScanState::Finalizing).await?;
                return Err(err);
            }
        };

        BLOCKS_FINALIZED.inc();
        let what = format!("release of block {}", number);
        self.with_store_retries(&what, || self.coordination.clear_active_block()).await?;
        self.with_store_retries(&what, || self.coordination.set_ready()).await?;
        info!(
            "block {} processed: {} genesis, {} problematic",
            number, genesis, problematic
        );
        transition(number, ScanState::Finalizing, ScanState::Idle);
        Ok(())
    }

    async fn store_classification(
        &self,
        number: i32,
        block_id: i64,
        listing: Arc<Vec<String>>,
    ) -> Result<(usize, usize)> {
        let what = format!("finalize of block {}", number);
        let classification = self
            .with_store_retries(&what, || self.coordination.take_classification(number))
            .await?;

        self.with_store_retries(&what, || {
            let classification = classification.clone();
            let listing = listing.clone();
            self.repo.transaction(move |ops| {
                let block = ops.get_block(block_id)?.ok_or(Error::UnknownBlock(block_id))?;

                let mut genesis = block.genesis.clone();
                merge_unique(&mut genesis, classification.genesis);
                let mut problematic = block.problematic.clone();
                merge_unique(
                    &mut problematic,
                    classification
                        .problematic
                        .into_iter()
                        .filter(|txid| !genesis.contains(txid))
                        .collect(),
                );

                let recorded: HashSet<String> =
                    ops.recorded_txids(&listing)?.into_iter().collect();
                let unaccounted: Vec<String> = listing
                    .iter()
                    .filter(|txid| {
                        !recorded.contains(*txid)
                            && !genesis.contains(*txid)
                            && !problematic.contains(*txid)
                    })
                    .cloned()
                    .collect();
                merge_unique(&mut problematic, unaccounted);

                ops.set_block_classification(block_id, &genesis, &problematic)?;
                ops.mark_block_processed(block_id, listing.len() as i32)?;
                Ok((genesis.len(), problematic.len()))
            })
        })
        .await
    }
}

fn merge_unique(target: &mut Vec<String>, items: Vec<String>) {
    let merged = target.drain(..).chain(items).unique().collect();
    *target = merged;
}

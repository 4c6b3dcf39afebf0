use chrono::Utc;
use std::collections::HashSet;
use wavesexchange_log::{debug, info, warn};

use super::{BlockScanCoordinator, ScanState, PROBLEMATIC_SWEEP_SOURCE};
use crate::chain::ChainQuery;
use crate::coordination::CoordinationRepo;
use crate::db::{get_or_create_block, BlockHeight, RecordRepo, RecordRepoOperations};
use crate::error::{Error, Result};
use crate::metrics::PENDING_BLOCKS;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SweepOutcome {
    /// No block within the window has problematic txids.
    Idle,
    Retired(String),
    Kept(String),
}

impl<R, Q, K> BlockScanCoordinator<R, Q, K>
where
    R: RecordRepo + Send + Sync + 'static,
    Q: ChainQuery + 'static,
    K: CoordinationRepo + Send + Sync + 'static,
{
    /// Queues the chain tip for a full scan when it is new or still empty, then drops
    /// blocks older than `max_block_away`.
    pub async fn poll_latest_block(&self) -> Result<Option<i32>> {
        let latest = match self.chain.get_latest_block_number().await {
            Ok(latest) => {
                self.coordination.reset_chain_failures().await?;
                latest
            }
            Err(err) => {
                let failures = self.coordination.record_chain_failure().await?;
                warn!("latest block query failed ({} in a row): {}", failures, err);
                return Err(err);
            }
        };

        let max_block_away = self.config.max_block_away;
        let (queued, retired) = self
            .repo
            .transaction(move |ops| {
                let (block, created) = get_or_create_block(ops, latest)?;
                let needs_scan = created || (block.transactions_count == 0 && !block.processed);
                if needs_scan {
                    ops.require_full_scan(block.id)?;
                }
                let retired = if max_block_away > 0 {
                    ops.delete_blocks_up_to(latest - max_block_away)?
                } else {
                    0
                };
                Ok((needs_scan, retired))
            })
            .await?;

        if queued {
            self.coordination.push_pending(&[latest]).await?;
            info!("block {} queued for scanning", latest);
        }
        if retired > 0 {
            debug!("{} blocks older than {} removed", retired, latest - max_block_away);
        }
        PENDING_BLOCKS.set(self.coordination.pending_count().await? as i64);

        Ok(queued.then(|| latest))
    }

    /// Retries the first problematic txid of the newest block inside the recency window.
    pub async fn sweep_problematic(&self) -> Result<SweepOutcome> {
        let window = chrono::Duration::seconds(self.config.problematic_window.as_secs() as i64);
        let since = Utc::now() - window;
        let block = match self
            .repo
            .execute(move |ops| ops.latest_block_with_problematic(since))
            .await?
        {
            Some(block) => block,
            None => return Ok(SweepOutcome::Idle),
        };
        let txid = match block.problematic.first() {
            Some(txid) => txid.clone(),
            None => return Ok(SweepOutcome::Idle),
        };

        let lookup = vec![txid.clone()];
        let already_recorded = !self
            .repo
            .execute(move |ops| ops.recorded_txids(&lookup))
            .await?
            .is_empty();

        let (retire, is_genesis) = if already_recorded {
            (true, false)
        } else {
            match self.chain.get_transaction(&txid, true).await {
                Ok(tx) => match self
                    .handler
                    .handle(&tx, PROBLEMATIC_SWEEP_SOURCE, Some(block.id))
                    .await
                {
                    Ok(()) => (true, tx.is_genesis()),
                    Err(err) => {
                        warn!("problematic {} still fails: {}", txid, err);
                        (false, false)
                    }
                },
                Err(err) => {
                    warn!("problematic {} still cannot be fetched: {}", txid, err);
                    (false, false)
                }
            }
        };

        if !retire {
            return Ok(SweepOutcome::Kept(txid));
        }

        let block_id = block.id;
        let retired = txid.clone();
        self.repo
            .transaction(move |ops| {
                let block = ops.get_block(block_id)?.ok_or(Error::UnknownBlock(block_id))?;
                let problematic: Vec<String> =
                    block.problematic.iter().filter(|p| **p != retired).cloned().collect();
                let mut genesis = block.genesis.clone();
                if is_genesis && !genesis.contains(&retired) {
                    genesis.push(retired);
                }
                ops.set_block_classification(block_id, &genesis, &problematic)
            })
            .await?;
        info!("problematic {} of block {} resolved", txid, block.number);
        Ok(SweepOutcome::Retired(txid))
    }

    /// Releases a claim held longer than `stale_claim_ttl`, e.g. after a unit task died
    /// before reporting completion. The block is rescanned from scratch.
    pub async fn recover_stale_claim(&self) -> Result<Option<i32>> {
        let claim = match self.coordination.active_claim().await? {
            Some(claim) => claim,
            None => return Ok(None),
        };
        match (Utc::now() - claim.since).to_std() {
            Ok(age) if age >= self.config.stale_claim_ttl => {}
            _ => return Ok(None),
        }

        warn!(
            "block {} has been claimed since {}, putting it back to the backlog",
            claim.number, claim.since
        );
        self.coordination.reset_block(claim.number).await?;
        self.release(claim.number, ScanState::Scanning).await?;
        Ok(Some(claim.number))
    }

    /// Compares unprocessed, already-counted blocks with their upstream listing and
    /// queues whatever is missing as problematic. Returns the numbers of reviewed blocks.
    pub async fn review_drift(&self) -> Result<Vec<i32>> {
        let active = self.coordination.active_block().await?;
        let blocks = self
            .repo
            .execute(|ops| ops.unprocessed_scanned_blocks())
            .await?;

        let mut reviewed = vec![];
        for block in blocks.into_iter().filter(|b| Some(b.number) != active) {
            let number = block.number;
            match self.review_block(block).await {
                Ok(()) => reviewed.push(number),
                Err(err) => warn!("drift review of block {} failed: {}", number, err),
            }
        }
        Ok(reviewed)
    }

    async fn review_block(&self, block: BlockHeight) -> Result<()> {
        let block_id = block.id;
        let recorded: HashSet<String> = self
            .repo
            .execute(move |ops| ops.txids_in_block(block_id))
            .await?
            .into_iter()
            .collect();

        let accounted = recorded.len() + block.genesis.len() + block.problematic.len();
        let count = block.transactions_count;
        if accounted >= count as usize {
            debug!("block {} has no drift", block.number);
            return self
                .repo
                .execute(move |ops| ops.mark_block_processed(block_id, count))
                .await;
        }

        let listing = self.chain.list_block_transaction_ids(block.number).await?;
        let missing: Vec<String> = listing
            .into_iter()
            .filter(|txid| {
                !recorded.contains(txid)
                    && !block.genesis.contains(txid)
                    && !block.problematic.contains(txid)
            })
            .collect();
        info!("block {} drifted: {} txids missing", block.number, missing.len());

        self.repo
            .transaction(move |ops| {
                let current = ops.get_block(block_id)?.ok_or(Error::UnknownBlock(block_id))?;
                let mut problematic = current.problematic;
                for txid in missing {
                    if !problematic.contains(&txid) {
                        problematic.push(txid);
                    }
                }
                ops.set_block_classification(block_id, &current.genesis, &problematic)?;
                ops.mark_block_processed(block_id, count)
            })
            .await
    }
}

//! Block Scan Coordinator.
//!
//! At most one block is scanned at a time. The ready flag in the Coordination Store
//! is the claim token: `IDLE -> CLAIMED` consumes it atomically, `FINALIZING -> IDLE`
//! restores it. Each txid of the claimed block is an independent tokio task; the
//! last one to report completion runs finalize, guarded so it happens once.

mod sweeps;
mod unit;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use wavesexchange_log::{debug, error, info, warn};

use crate::chain::ChainQuery;
use crate::coordination::CoordinationRepo;
use crate::db::{BlockHeight, RecordRepo, RecordRepoOperations};
use crate::error::{Error, Result};
use crate::pipeline::TransactionHandler;
use crate::utils::retry::with_backoff;

pub use self::sweeps::SweepOutcome;
pub use self::unit::ScanUnit;

pub const BLOCK_SCAN_SOURCE: &str = "block-scan";
pub const PROBLEMATIC_SWEEP_SOURCE: &str = "problematic-sweep";

#[derive(Clone, Debug)]
pub struct Config {
    pub polling_delay: Duration,
    pub claim_delay: Duration,
    pub max_block_away: i32,
    pub problematic_window: Duration,
    pub sweep_delay: Duration,
    pub review_delay: Duration,
    pub finalize_guard_ttl: Duration,
    /// A claim older than this without a finalize is handed back to the backlog.
    pub stale_claim_ttl: Duration,
    pub store_retry_attempts: u32,
    pub store_retry_delay: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Claimed,
    Scanning,
    Finalizing,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScanState::Idle => "IDLE",
            ScanState::Claimed => "CLAIMED",
            ScanState::Scanning => "SCANNING",
            ScanState::Finalizing => "FINALIZING",
        };
        f.write_str(s)
    }
}

fn transition(number: i32, from: ScanState, to: ScanState) {
    info!("block {}: {} -> {}", number, from, to);
}

pub struct BlockScanCoordinator<R, Q, K> {
    config: Config,
    repo: Arc<R>,
    chain: Arc<Q>,
    coordination: Arc<K>,
    handler: Arc<dyn TransactionHandler>,
}

impl<R, Q, K> Clone for BlockScanCoordinator<R, Q, K> {
    fn clone(&self) -> Self {
        BlockScanCoordinator {
            config: self.config.clone(),
            repo: self.repo.clone(),
            chain: self.chain.clone(),
            coordination: self.coordination.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<R, Q, K> BlockScanCoordinator<R, Q, K>
where
    R: RecordRepo + Send + Sync + 'static,
    Q: ChainQuery + 'static,
    K: CoordinationRepo + Send + Sync + 'static,
{
    pub fn new(
        config: Config,
        repo: Arc<R>,
        chain: Arc<Q>,
        coordination: Arc<K>,
        handler: Arc<dyn TransactionHandler>,
    ) -> Self {
        BlockScanCoordinator {
            config,
            repo,
            chain,
            coordination,
            handler,
        }
    }

    /// Startup recovery: a block left active by a previous run goes back to the backlog.
    pub async fn init(&self) -> Result<()> {
        if let Some(stale) = self.coordination.active_block().await? {
            warn!("block {} was left active, putting it back to the backlog", stale);
            self.coordination.reset_block(stale).await?;
            self.coordination.push_pending(&[stale]).await?;
            self.coordination.clear_active_block().await?;
        }
        self.coordination.set_ready().await?;
        info!("block scan coordinator is {}", ScanState::Idle);
        Ok(())
    }

    /// IDLE -> CLAIMED. `None` when another worker holds the claim or nothing is pending.
    pub async fn claim_next(&self) -> Result<Option<BlockHeight>> {
        if !self.coordination.claim_ready().await? {
            return Ok(None);
        }

        match self.next_pending_block().await {
            Ok(Some(block)) => {
                if let Err(err) = self.coordination.set_active_block(block.number).await {
                    self.coordination.push_pending(&[block.number]).await?;
                    self.coordination.set_ready().await?;
                    return Err(err);
                }
                transition(block.number, ScanState::Idle, ScanState::Claimed);
                Ok(Some(block))
            }
            Ok(None) => {
                self.coordination.set_ready().await?;
                Ok(None)
            }
            Err(err) => {
                self.coordination.set_ready().await?;
                Err(err)
            }
        }
    }

    async fn next_pending_block(&self) -> Result<Option<BlockHeight>> {
        let number = match self.coordination.pop_pending().await? {
            Some(number) => number,
            None => {
                let backlog = self.repo.execute(|ops| ops.blocks_requiring_scan()).await?;
                if backlog.is_empty() {
                    return Ok(None);
                }
                debug!("refilling pending backlog with {} blocks", backlog.len());
                self.coordination.push_pending(&backlog).await?;
                match self.coordination.pop_pending().await? {
                    Some(number) => number,
                    None => return Ok(None),
                }
            }
        };

        let block = self.repo.execute(move |ops| ops.find_block(number)).await?;
        if block.is_none() {
            debug!("pending block {} no longer exists, discarding", number);
        }
        Ok(block)
    }

    /// CLAIMED -> SCANNING. Returns the spawned units; the caller may detach them.
    pub async fn scan(&self, block: BlockHeight) -> Result<Vec<JoinHandle<()>>> {
        let number = block.number;
        let listing = match self.prepare_scan(&block).await {
            Ok(listing) => Arc::new(listing),
            Err(err) => {
                warn!("block {} cannot be scanned, releasing the claim: {}", number, err);
                self.release(number, ScanState::Claimed).await?;
                return Err(err);
            }
        };
        transition(number, ScanState::Claimed, ScanState::Scanning);

        let block_id = block.id;
        let total = listing.len();
        if total == 0 {
            self.finalize(number, block_id, listing).await?;
            return Ok(vec![]);
        }

        let handles = listing
            .iter()
            .enumerate()
            .map(|(sequence, txid)| {
                let unit = ScanUnit {
                    txid: txid.clone(),
                    block_number: number,
                    block_id,
                    sequence,
                    total,
                };
                let this = self.clone();
                let listing = listing.clone();
                tokio::spawn(async move {
                    if let Err(err) = this.run_unit(unit, listing).await {
                        error!("scan unit of block {} failed: {}", number, err);
                    }
                })
            })
            .collect();
        Ok(handles)
    }

    /// Lists the block and drops progress left over from an earlier scan of it.
    async fn prepare_scan(&self, block: &BlockHeight) -> Result<Vec<String>> {
        let number = block.number;
        let txids = self.chain.list_block_transaction_ids(number).await?;
        let count = i32::try_from(txids.len())
            .map_err(|_| Error::InvalidChainData(format!("block {} size", number)))?;

        self.coordination.reset_block(number).await?;
        let block_id = block.id;
        self.repo
            .execute(move |ops| ops.set_block_transactions_count(block_id, count))
            .await?;
        Ok(txids)
    }

    /// Hands the block back to the backlog and restores the ready flag.
    async fn release(&self, number: i32, from: ScanState) -> Result<()> {
        let what = format!("release of block {}", number);
        let pending = [number];
        self.with_store_retries(&what, || self.coordination.clear_active_block()).await?;
        self.with_store_retries(&what, || self.coordination.push_pending(&pending)).await?;
        self.with_store_retries(&what, || self.coordination.set_ready()).await?;
        transition(number, from, ScanState::Idle);
        Ok(())
    }

    async fn with_store_retries<T, F, Fut>(&self, what: &str, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        with_backoff(
            what,
            self.config.store_retry_attempts,
            self.config.store_retry_delay,
            f,
        )
        .await
    }

    pub async fn run_claim_loop(self) -> Result<()> {
        info!("block scan claim loop started");
        loop {
            match self.claim_next().await {
                Ok(Some(block)) => {
                    let number = block.number;
                    if let Err(err) = self.scan(block).await {
                        error!("scan of block {} failed: {}", number, err);
                    }
                }
                Ok(None) => {}
                Err(err) => error!("block claim failed: {}", err),
            }
            sleep(self.config.claim_delay).await;
        }
    }

    pub async fn run_polling_loop(self) -> Result<()> {
        info!("latest block polling started");
        loop {
            if let Err(err) = self.poll_latest_block().await {
                error!("latest block polling failed: {}", err);
            }
            sleep(self.config.polling_delay).await;
        }
    }

    pub async fn run_sweep_loop(self) -> Result<()> {
        info!("problematic transactions sweep started");
        loop {
            match self.sweep_problematic().await {
                Ok(outcome) => debug!("problematic sweep: {:?}", outcome),
                Err(err) => error!("problematic sweep failed: {}", err),
            }
            sleep(self.config.sweep_delay).await;
        }
    }

    pub async fn run_review_loop(self) -> Result<()> {
        info!("block drift review started");
        loop {
            if let Err(err) = self.recover_stale_claim().await {
                error!("stale claim recovery failed: {}", err);
            }
            if let Err(err) = self.review_drift().await {
                error!("block drift review failed: {}", err);
            }
            sleep(self.config.review_delay).await;
        }
    }
}

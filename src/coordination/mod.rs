//! Coordination Store: the small set of cross-task flags and counters.

pub mod repo;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::Error;

pub use self::repo::RedisCoordinationRepo;

/// Per-block fan-out bookkeeping collected while its units run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Classification {
    pub genesis: Vec<String>,
    pub problematic: Vec<String>,
}

/// The block currently being scanned and when it was claimed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActiveClaim {
    pub number: i32,
    pub since: DateTime<Utc>,
}

#[async_trait]
pub trait CoordinationRepo {
    /// Sets the ready flag. Used on startup and by FINALIZING -> IDLE.
    async fn set_ready(&self) -> Result<(), Error>;

    /// Atomically clears the ready flag; only the caller that observed it set gets `true`.
    async fn claim_ready(&self) -> Result<bool, Error>;

    async fn active_block(&self) -> Result<Option<i32>, Error>;

    async fn active_claim(&self) -> Result<Option<ActiveClaim>, Error>;

    /// Marks the block active, stamping the claim time.
    async fn set_active_block(&self, number: i32) -> Result<(), Error>;

    async fn clear_active_block(&self) -> Result<(), Error>;

    async fn push_pending(&self, numbers: &[i32]) -> Result<(), Error>;

    /// Removes and returns the lowest pending block number.
    async fn pop_pending(&self) -> Result<Option<i32>, Error>;

    async fn pending_count(&self) -> Result<u64, Error>;

    /// Counts one finished unit for the block and returns the running total.
    async fn record_unit_completion(&self, number: i32) -> Result<u64, Error>;

    /// `true` exactly once per block until the guard expires.
    async fn try_mark_finalized(&self, number: i32, ttl: Duration) -> Result<bool, Error>;

    async fn add_genesis(&self, number: i32, txid: &str) -> Result<(), Error>;

    async fn add_problematic(&self, number: i32, txid: &str) -> Result<(), Error>;

    /// Drains accumulated classification and the unit counter of the block.
    async fn take_classification(&self, number: i32) -> Result<Classification, Error>;

    /// Forgets all scan progress of the block, finalize guard included.
    async fn reset_block(&self, number: i32) -> Result<(), Error>;

    /// `SET NX EX` style run flag; `false` when somebody else holds it.
    async fn acquire_run_flag(&self, name: &str, ttl: Duration) -> Result<bool, Error>;

    async fn release_run_flag(&self, name: &str) -> Result<(), Error>;

    async fn record_chain_failure(&self) -> Result<u64, Error>;

    async fn reset_chain_failures(&self) -> Result<(), Error>;
}

//! Transaction Reconciler: the single idempotent entry point that turns one observed
//! output into a canonical Transaction record.
//!
//! Every ingestion source (block scan, live feed, UTXO scan) funnels through
//! [`Reconciler::reconcile`]. The dedup key `(txid, address, token, amount, output_index)`
//! makes re-submission safe, so transient failures re-run the whole call.

pub mod enrichment;
pub mod utxo;

use bigdecimal::BigDecimal;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use wavesexchange_log::{debug, warn};

use crate::chain::ChainQuery;
use crate::db::{
    get_or_create_address, get_or_create_token, is_watched, NewTransaction, RecordRepo,
    RecordRepoOperations, TransactionKey,
};
use crate::error::Result;
use crate::metrics::TRANSACTIONS_RECONCILED;
use crate::models::{Outpoint, TokenIdentity};
use crate::utils::retry::with_backoff;

pub use self::enrichment::{enrichment_channel, EnrichmentQueue, TokenEnricher};
pub use self::utxo::UtxoReconciliation;

#[derive(Clone, Debug)]
pub struct Config {
    /// Pause between UTXO-set passes over the watched addresses.
    pub utxo_scan_delay: Duration,
}

const RESUBMIT_ATTEMPTS: u32 = 3;
const RESUBMIT_DELAY: Duration = Duration::from_millis(500);

/// One output of one transaction, as reported by some upstream source.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub token: TokenIdentity,
    pub address: String,
    pub txid: String,
    pub amount: BigDecimal,
    pub source: String,
    pub block_id: Option<i64>,
    pub output_index: i32,
    pub is_new_subscription: bool,
    pub spending_prevouts: Vec<Outpoint>,
}

impl Observation {
    pub fn new(
        token: TokenIdentity,
        address: impl Into<String>,
        txid: impl Into<String>,
        amount: BigDecimal,
        source: impl Into<String>,
    ) -> Self {
        Observation {
            token,
            address: address.into(),
            txid: txid.into(),
            amount,
            source: source.into(),
            block_id: None,
            output_index: 0,
            is_new_subscription: false,
            spending_prevouts: vec![],
        }
    }

    pub fn in_block(mut self, block_id: Option<i64>) -> Self {
        self.block_id = block_id;
        self
    }

    pub fn at_index(mut self, output_index: i32) -> Self {
        self.output_index = output_index;
        self
    }

    pub fn spending(mut self, prevouts: Vec<Outpoint>) -> Self {
        self.spending_prevouts = prevouts;
        self
    }

    pub fn for_new_subscription(mut self, is_new_subscription: bool) -> Self {
        self.is_new_subscription = is_new_subscription;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Recorded { transaction_id: i64, created: bool },
    NoOp,
}

impl ReconcileOutcome {
    pub fn transaction_id(&self) -> Option<i64> {
        match self {
            ReconcileOutcome::Recorded { transaction_id, .. } => Some(*transaction_id),
            ReconcileOutcome::NoOp => None,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, ReconcileOutcome::Recorded { created: true, .. })
    }
}

pub struct Reconciler<R, C> {
    repo: Arc<R>,
    chain: Arc<C>,
    enrichment: EnrichmentQueue,
}

impl<R, C> Reconciler<R, C>
where
    R: RecordRepo + Send + Sync + 'static,
    C: ChainQuery + 'static,
{
    pub fn new(repo: Arc<R>, chain: Arc<C>, enrichment: EnrichmentQueue) -> Self {
        Reconciler {
            repo,
            chain,
            enrichment,
        }
    }

    pub async fn reconcile(&self, observation: Observation) -> Result<ReconcileOutcome> {
        let what = format!("reconcile {}:{}", observation.txid, observation.output_index);
        let res = with_backoff(&what, RESUBMIT_ATTEMPTS, RESUBMIT_DELAY, || {
            self.reconcile_once(observation.clone())
        })
        .await;

        let outcome = match res {
            Ok(outcome) => outcome,
            Err(err) if err.is_unique_violation() => {
                warn!(
                    "{} lost a concurrent upsert, treating as no-op: {}",
                    what, err
                );
                ReconcileOutcome::NoOp
            }
            Err(err) => return Err(err),
        };

        TRANSACTIONS_RECONCILED
            .with_label_values(&[match outcome {
                ReconcileOutcome::Recorded { created: true, .. } => "created",
                ReconcileOutcome::Recorded { created: false, .. } => "existing",
                ReconcileOutcome::NoOp => "noop",
            }])
            .inc();

        Ok(outcome)
    }

    async fn reconcile_once(&self, observation: Observation) -> Result<ReconcileOutcome> {
        let (outcome, new_token) = self
            .repo
            .transaction(move |ops| upsert_observation(ops, &observation))
            .await?;

        if let Some(tokenid) = new_token {
            self.enrichment.schedule(tokenid).await;
        }

        Ok(outcome)
    }

    pub fn repo(&self) -> &Arc<R> {
        &self.repo
    }

    pub fn chain(&self) -> &Arc<C> {
        &self.chain
    }
}

/// Returns the outcome and, when an overlay token was first seen, its id for enrichment.
fn upsert_observation<O: RecordRepoOperations + ?Sized>(
    ops: &mut O,
    observation: &Observation,
) -> Result<(ReconcileOutcome, Option<String>)> {
    let watched = match ops.find_address(&observation.address)? {
        Some(address) => is_watched(ops, &address)?,
        None => false,
    };
    let admitted = watched || spends_recorded_output(ops, &observation.spending_prevouts)?;
    if !admitted {
        debug!(
            "skipping {}:{} for unwatched {}",
            observation.txid, observation.output_index, observation.address
        );
        return Ok((ReconcileOutcome::NoOp, None));
    }

    let address = get_or_create_address(ops, &observation.address)?;
    let (token, token_created) = get_or_create_token(ops, &observation.token)?;
    let new_token = if token_created && !observation.token.is_base_currency() {
        Some(token.tokenid.clone())
    } else {
        None
    };

    let key = TransactionKey {
        txid: observation.txid.clone(),
        address_id: address.id,
        token_id: token.id,
        amount: observation.amount.clone(),
        output_index: observation.output_index,
    };

    let outcome = match ops.find_transaction(&key)? {
        Some(existing) => {
            if existing.source != observation.source {
                ops.update_transaction_source(existing.id, &observation.source)?;
            }
            ReconcileOutcome::Recorded {
                transaction_id: existing.id,
                created: false,
            }
        }
        None => {
            let new_transaction = NewTransaction {
                txid: key.txid.clone(),
                address_id: key.address_id,
                token_id: key.token_id,
                amount: key.amount.clone(),
                output_index: key.output_index,
                source: observation.source.clone(),
                blockheight_id: observation.block_id,
                spent: false,
                acknowledged: observation.is_new_subscription,
                queued: false,
                date_created: Utc::now(),
            };
            match ops.insert_transaction(&new_transaction)? {
                Some(created) => ReconcileOutcome::Recorded {
                    transaction_id: created.id,
                    created: true,
                },
                None => {
                    warn!(
                        "concurrent writer already recorded {}:{}",
                        key.txid, key.output_index
                    );
                    return Ok((ReconcileOutcome::NoOp, new_token));
                }
            }
        }
    };

    if let Some(block_id) = observation.block_id {
        ops.link_txid_to_block(&observation.txid, block_id)?;
    }

    if !observation.spending_prevouts.is_empty() {
        ops.mark_outputs_spent(&observation.spending_prevouts, &observation.txid)?;
    }

    Ok((outcome, new_token))
}

fn spends_recorded_output<O: RecordRepoOperations + ?Sized>(
    ops: &mut O,
    prevouts: &[Outpoint],
) -> Result<bool> {
    if prevouts.is_empty() {
        return Ok(false);
    }
    let txids: Vec<String> = prevouts.iter().map(|p| p.txid.clone()).collect();
    Ok(!ops.recorded_txids(&txids)?.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MemoryRecordRepo, MockChain};
    use std::str::FromStr;

    fn reconciler(repo: &MemoryRecordRepo) -> Reconciler<MemoryRecordRepo, MockChain> {
        Reconciler::new(
            Arc::new(repo.clone()),
            Arc::new(MockChain::default()),
            EnrichmentQueue::disabled(),
        )
    }

    fn bch(value: &str) -> BigDecimal {
        BigDecimal::from_str(value).unwrap()
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() -> anyhow::Result<()> {
        let repo = MemoryRecordRepo::default();
        repo.subscribe("A");
        let reconciler = reconciler(&repo);
        let observation =
            Observation::new(TokenIdentity::BaseCurrency, "A", "t1", bch("1.0"), "s1");

        let first = reconciler.reconcile(observation.clone()).await?;
        let second = reconciler.reconcile(observation).await?;

        assert!(first.is_created());
        assert_eq!(
            second,
            ReconcileOutcome::Recorded {
                transaction_id: first.transaction_id().unwrap(),
                created: false
            }
        );
        assert_eq!(repo.transactions().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn unwatched_addresses_are_not_persisted() -> anyhow::Result<()> {
        let repo = MemoryRecordRepo::default();
        let reconciler = reconciler(&repo);

        let outcome = reconciler
            .reconcile(Observation::new(
                TokenIdentity::BaseCurrency,
                "stranger",
                "t1",
                bch("3"),
                "s1",
            ))
            .await?;

        assert_eq!(outcome, ReconcileOutcome::NoOp);
        assert!(repo.transactions().is_empty());
        assert!(repo.address("stranger").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn spending_a_recorded_output_flips_it_to_spent() -> anyhow::Result<()> {
        let repo = MemoryRecordRepo::default();
        repo.subscribe("A");
        let reconciler = reconciler(&repo);

        let t1 = reconciler
            .reconcile(
                Observation::new(TokenIdentity::BaseCurrency, "A", "t1", bch("1.0"), "s1")
                    .at_index(0),
            )
            .await?;
        let record = repo.record(t1.transaction_id().unwrap()).unwrap();
        assert!(!record.spent);

        // the destination is unwatched, the prevout admits it
        let t2 = reconciler
            .reconcile(
                Observation::new(TokenIdentity::BaseCurrency, "B", "t2", bch("0.9"), "s1")
                    .spending(vec![Outpoint::new("t1", 0)]),
            )
            .await?;
        assert!(t2.is_created());

        let record = repo.record(t1.transaction_id().unwrap()).unwrap();
        assert!(record.spent);
        assert_eq!(record.spending_txid.as_deref(), Some("t2"));
        Ok(())
    }

    #[tokio::test]
    async fn provenance_is_last_write_wins() -> anyhow::Result<()> {
        let repo = MemoryRecordRepo::default();
        repo.subscribe("A");
        let reconciler = reconciler(&repo);
        let observation = Observation::new(TokenIdentity::BaseCurrency, "A", "t1", bch("2"), "s1");

        let first = reconciler.reconcile(observation.clone()).await?;
        let mut again = observation;
        again.source = "s2".into();
        reconciler.reconcile(again).await?;

        let record = repo.record(first.transaction_id().unwrap()).unwrap();
        assert_eq!(record.source, "s2");
        assert_eq!(record.txid, "t1");
        Ok(())
    }

    #[tokio::test]
    async fn block_link_is_stamped_on_every_output_of_the_txid() -> anyhow::Result<()> {
        let repo = MemoryRecordRepo::default();
        repo.subscribe("A");
        repo.subscribe("C");
        let block_id = repo.block(700_000).id;
        let reconciler = reconciler(&repo);

        reconciler
            .reconcile(
                Observation::new(TokenIdentity::BaseCurrency, "A", "t1", bch("1"), "s1")
                    .at_index(0),
            )
            .await?;
        reconciler
            .reconcile(
                Observation::new(TokenIdentity::BaseCurrency, "C", "t1", bch("2"), "s1")
                    .at_index(1)
                    .in_block(Some(block_id)),
            )
            .await?;

        let linked: Vec<_> = repo
            .transactions()
            .into_iter()
            .map(|t| t.blockheight_id)
            .collect();
        assert_eq!(linked, vec![Some(block_id), Some(block_id)]);
        Ok(())
    }

    #[tokio::test]
    async fn new_subscription_backfill_is_pre_acknowledged() -> anyhow::Result<()> {
        let repo = MemoryRecordRepo::default();
        repo.subscribe("A");
        let reconciler = reconciler(&repo);

        let outcome = reconciler
            .reconcile(
                Observation::new(TokenIdentity::BaseCurrency, "A", "t0", bch("5"), "utxo-scan")
                    .for_new_subscription(true),
            )
            .await?;

        assert!(repo.record(outcome.transaction_id().unwrap()).unwrap().acknowledged);
        Ok(())
    }

    #[tokio::test]
    async fn first_sight_of_an_overlay_token_schedules_enrichment() -> anyhow::Result<()> {
        let repo = MemoryRecordRepo::default();
        repo.subscribe("A");
        let chain = Arc::new(MockChain::default());
        let (queue, mut enricher) = enrichment_channel(Arc::new(repo.clone()), chain, 10);
        let reconciler =
            Reconciler::new(Arc::new(repo.clone()), Arc::new(MockChain::default()), queue);
        let token = TokenIdentity::Overlay("cd".repeat(32));

        for index in 0..2 {
            reconciler
                .reconcile(
                    Observation::new(token.clone(), "A", "t1", bch("10"), "s1").at_index(index),
                )
                .await?;
        }

        assert_eq!(enricher.try_next(), Some("cd".repeat(32)));
        assert_eq!(enricher.try_next(), None);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_identical_calls_store_one_record() -> anyhow::Result<()> {
        let repo = MemoryRecordRepo::default();
        repo.subscribe("A");
        let reconciler = Arc::new(reconciler(&repo));
        let observation = Observation::new(TokenIdentity::BaseCurrency, "A", "t1", bch("1"), "s1");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reconciler = reconciler.clone();
                let observation = observation.clone();
                tokio::spawn(async move { reconciler.reconcile(observation).await })
            })
            .collect();

        let mut created = 0;
        for handle in handles {
            if handle.await??.is_created() {
                created += 1;
            }
        }

        assert_eq!(created, 1);
        assert_eq!(repo.transactions().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn lost_insert_race_is_a_no_op() -> anyhow::Result<()> {
        let repo = MemoryRecordRepo::default();
        repo.subscribe("A");
        repo.fail_next_transaction_insert_with_conflict();
        let reconciler = reconciler(&repo);

        let outcome = reconciler
            .reconcile(Observation::new(TokenIdentity::BaseCurrency, "A", "t1", bch("1"), "s1"))
            .await?;

        assert_eq!(outcome, ReconcileOutcome::NoOp);
        Ok(())
    }

    #[tokio::test]
    async fn transient_storage_errors_resubmit_the_whole_call() -> anyhow::Result<()> {
        let repo = MemoryRecordRepo::default();
        repo.subscribe("A");
        repo.fail_next_transactions_with_transient_error(2);
        let reconciler = reconciler(&repo);

        let outcome = reconciler
            .reconcile(Observation::new(TokenIdentity::BaseCurrency, "A", "t1", bch("1"), "s1"))
            .await?;

        assert!(outcome.is_created());
        assert_eq!(repo.transactions().len(), 1);
        Ok(())
    }
}

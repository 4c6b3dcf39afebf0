//! Per-transaction pipeline shared by every ingestion source: reconcile outputs,
//! settle the txid into wallet histories, then dispatch notifications.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use wavesexchange_log::{debug, warn};

use crate::chain::{ChainQuery, ChainTransaction};
use crate::db::{RecordRepo, RecordRepoOperations, Wallet};
use crate::error::Result;
use crate::history::parser::merge_counterparties;
use crate::history::{HistoryRequest, WalletHistoryBuilder};
use crate::models::{Counterparty, TokenIdentity, WalletType};
use crate::notifications::{DispatchReport, Dispatcher};
use crate::reconciler::{Observation, Reconciler};

#[async_trait]
pub trait TransactionHandler: Send + Sync {
    async fn handle(
        &self,
        tx: &ChainTransaction,
        source: &str,
        block_id: Option<i64>,
    ) -> Result<()>;
}

pub struct Settlement {
    pub created: Vec<i64>,
    pub wallets_updated: usize,
    pub deliveries: Vec<JoinHandle<Result<DispatchReport>>>,
}

pub struct Pipeline<R, C> {
    reconciler: Arc<Reconciler<R, C>>,
    history: Arc<WalletHistoryBuilder<R>>,
    dispatcher: Arc<Dispatcher<R>>,
}

impl<R, C> Pipeline<R, C>
where
    R: RecordRepo + Send + Sync + 'static,
    C: ChainQuery + 'static,
{
    pub fn new(
        reconciler: Arc<Reconciler<R, C>>,
        history: Arc<WalletHistoryBuilder<R>>,
        dispatcher: Arc<Dispatcher<R>>,
    ) -> Self {
        Pipeline {
            reconciler,
            history,
            dispatcher,
        }
    }

    pub async fn process(
        &self,
        tx: &ChainTransaction,
        source: &str,
        block_id: Option<i64>,
    ) -> Result<Settlement> {
        let prevouts = tx.prevouts();
        let overlay_token = match &tx.token {
            Some(transfer) if transfer.valid && tx.valid => Some(transfer.token.clone()),
            _ => None,
        };

        let mut created = vec![];
        for output in &tx.outputs {
            let address = match &output.address {
                Some(address) => address,
                None => continue,
            };
            let (token, amount) = match (&overlay_token, &output.token_amount) {
                (Some(token), Some(amount)) => (token.clone(), amount.clone()),
                _ => (TokenIdentity::BaseCurrency, output.value.clone()),
            };
            let observation =
                Observation::new(token, address.as_str(), tx.txid.as_str(), amount, source)
                    .in_block(block_id)
                    .at_index(output.index)
                    .spending(prevouts.clone());
            let outcome = self.reconciler.reconcile(observation).await?;
            if outcome.is_created() {
                created.extend(outcome.transaction_id());
            }
        }

        self.settle(tx, created).await
    }

    /// Marks inputs spent, refreshes the history of every touched wallet and
    /// dispatches the freshly created records.
    pub async fn settle(&self, tx: &ChainTransaction, created: Vec<i64>) -> Result<Settlement> {
        let txid = tx.txid.clone();
        let prevouts = tx.prevouts();
        let wallets = self
            .reconciler
            .repo()
            .transaction(move |ops| {
                let spent = ops.mark_outputs_spent(&prevouts, &txid)?;
                let outputs = ops.transactions_by_txid(&txid)?;
                let mut wallets: Vec<Wallet> = vec![];
                for record in spent.iter().chain(outputs.iter()) {
                    let owner = ops
                        .get_address(record.address_id)?
                        .and_then(|a| a.wallet_id);
                    let wallet_id = match owner {
                        Some(wallet_id) => wallet_id,
                        None => continue,
                    };
                    if wallets.iter().any(|w| w.id == wallet_id) {
                        continue;
                    }
                    match ops.get_wallet(wallet_id)? {
                        Some(wallet) => wallets.push(wallet),
                        None => warn!(
                            "address {} points to missing wallet {}",
                            record.address_id, wallet_id
                        ),
                    }
                }
                Ok(wallets)
            })
            .await?;

        let mut wallets_updated = 0;
        for wallet in &wallets {
            let (senders, recipients) = counterparties(tx, wallet.kind());
            let request = HistoryRequest::new(tx.txid.as_str(), wallet.wallet_hash.as_str())
                .with_fee(tx.tx_fee.clone())
                .with_parties(senders, recipients);
            match self.history.build_history_entry(request).await {
                Ok(_) => wallets_updated += 1,
                Err(err) => warn!(
                    "history of {} for wallet {} skipped: {}",
                    tx.txid, wallet.wallet_hash, err
                ),
            }
        }

        let deliveries = created
            .iter()
            .map(|&id| {
                let dispatcher = self.dispatcher.clone();
                tokio::spawn(async move { dispatcher.dispatch(id).await })
            })
            .collect();

        debug!(
            "{} settled: {} created, {} wallets updated",
            tx.txid,
            created.len(),
            wallets_updated
        );

        Ok(Settlement {
            created,
            wallets_updated,
            deliveries,
        })
    }
}

/// Base-currency wallets see coin values on both sides; token wallets see token
/// outputs only and fall back to recorded spends for the sending side.
fn counterparties(
    tx: &ChainTransaction,
    kind: WalletType,
) -> (Vec<Counterparty>, Vec<Counterparty>) {
    match kind {
        WalletType::BaseCurrency => {
            let senders = merge_counterparties(
                tx.inputs
                    .iter()
                    .filter_map(|i| i.address.clone().map(|a| (a, i.value.clone()))),
            );
            let recipients = merge_counterparties(
                tx.outputs
                    .iter()
                    .filter_map(|o| o.address.clone().map(|a| (a, o.value.clone()))),
            );
            (senders, recipients)
        }
        WalletType::TokenOverlay => {
            let recipients = merge_counterparties(tx.outputs.iter().filter_map(|o| {
                match (&o.address, &o.token_amount) {
                    (Some(address), Some(amount)) => Some((address.clone(), amount.clone())),
                    _ => None,
                }
            }));
            (vec![], recipients)
        }
    }
}

#[async_trait]
impl<R, C> TransactionHandler for Pipeline<R, C>
where
    R: RecordRepo + Send + Sync + 'static,
    C: ChainQuery + 'static,
{
    async fn handle(
        &self,
        tx: &ChainTransaction,
        source: &str,
        block_id: Option<i64>,
    ) -> Result<()> {
        // deliveries run detached
        self.process(tx, source, block_id).await.map(|_| ())
    }
}

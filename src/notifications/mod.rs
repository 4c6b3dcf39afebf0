//! Notification Dispatcher: delivers a transaction event to every interested destination.
//!
//! Each subscription of the transaction's address yields zero or more destinations
//! (webhook, chat ids, socket rooms). Destinations are delivered independently, each
//! with its own bounded retry loop, so one bad destination never blocks another.

pub mod chat;
pub mod destinations;
pub mod payload;
pub mod socket;
pub mod webhook;

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use wavesexchange_log::{debug, error, info, warn};

use crate::db::{RecordRepo, RecordRepoOperations, Recipient, Subscription};
use crate::error::{Error, Result};
use crate::metrics::NOTIFICATIONS;

pub use self::chat::{ChatDestination, ChatSender, SlackSender, TelegramSender};
pub use self::destinations::{DeliveryOutcome, Destination};
pub use self::payload::{NotificationPayload, TransactionEvent};
pub use self::socket::{RedisRoomPublisher, RoomPublisher, SocketDestination};
pub use self::webhook::{ReqwestWebhookClient, WebhookClient, WebhookDestination};

#[derive(Clone, Debug)]
pub struct Config {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub request_timeout: Duration,
    pub telegram_bot_token: Option<String>,
    pub telegram_api_url: String,
    pub slack_bot_token: Option<String>,
    pub slack_api_url: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub invalidated: usize,
    pub exhausted: usize,
}

enum Final {
    Delivered,
    Permanent,
    Exhausted,
}

pub struct Dispatcher<R> {
    repo: Arc<R>,
    webhook_client: Arc<dyn WebhookClient>,
    telegram: Option<Arc<dyn ChatSender>>,
    slack: Option<Arc<dyn ChatSender>>,
    publisher: Arc<dyn RoomPublisher>,
    max_retries: u32,
    retry_delay: Duration,
}

impl<R> Dispatcher<R>
where
    R: RecordRepo + Send + Sync + 'static,
{
    pub fn new(
        repo: Arc<R>,
        webhook_client: Arc<dyn WebhookClient>,
        publisher: Arc<dyn RoomPublisher>,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Self {
        Dispatcher {
            repo,
            webhook_client,
            telegram: None,
            slack: None,
            publisher,
            max_retries,
            retry_delay,
        }
    }

    pub fn with_telegram(mut self, sender: Arc<dyn ChatSender>) -> Self {
        self.telegram = Some(sender);
        self
    }

    pub fn with_slack(mut self, sender: Arc<dyn ChatSender>) -> Self {
        self.slack = Some(sender);
        self
    }

    pub async fn dispatch(&self, transaction_id: i64) -> Result<DispatchReport> {
        let loaded = self
            .repo
            .execute(move |ops| load_event(ops, transaction_id))
            .await?;
        let (event, targets) = match loaded {
            Some(loaded) => loaded,
            None => return Err(Error::UnknownTransaction(transaction_id)),
        };

        if event.transaction.acknowledged {
            debug!("transaction {} already acknowledged", transaction_id);
            return Ok(DispatchReport::default());
        }

        let destinations = self.destinations(&targets);
        if destinations.is_empty() {
            debug!("no destinations for transaction {}", transaction_id);
            return Ok(DispatchReport::default());
        }

        let payload = NotificationPayload::for_event(&event);
        let results = join_all(destinations.iter().map(|destination| {
            self.deliver_with_retries(destination.as_ref(), &event, &payload)
        }))
        .await;

        let mut report = DispatchReport::default();
        for (destination, result) in destinations.iter().zip(results) {
            match result {
                Final::Delivered => {
                    report.delivered += 1;
                    if destination.acknowledges() {
                        self.repo
                            .execute(move |ops| ops.acknowledge_transaction(transaction_id))
                            .await?;
                    }
                }
                Final::Permanent => {
                    report.invalidated += 1;
                    if let Some(recipient_id) = destination.invalidates() {
                        warn!("recipient {} invalidated", recipient_id);
                        self.repo
                            .execute(move |ops| ops.invalidate_recipient(recipient_id))
                            .await?;
                    }
                }
                Final::Exhausted => report.exhausted += 1,
            }
        }

        info!(
            "transaction {} dispatched: {} delivered, {} invalidated, {} exhausted",
            transaction_id, report.delivered, report.invalidated, report.exhausted
        );
        Ok(report)
    }

    fn destinations(
        &self,
        targets: &[(Subscription, Option<Recipient>)],
    ) -> Vec<Box<dyn Destination>> {
        let mut destinations: Vec<Box<dyn Destination>> = vec![];
        let mut socket_added = false;
        for (subscription, recipient) in targets {
            if subscription.websocket && !socket_added {
                destinations.push(Box::new(SocketDestination::new(self.publisher.clone())));
                socket_added = true;
            }
            let recipient = match recipient {
                Some(recipient) => recipient,
                None => continue,
            };
            if recipient.valid && !recipient.web_url.is_empty() {
                destinations.push(Box::new(WebhookDestination::new(
                    self.webhook_client.clone(),
                    recipient.id,
                    recipient.web_url.clone(),
                )));
            }
            if let (Some(sender), false) = (&self.telegram, recipient.telegram_id.is_empty()) {
                destinations.push(Box::new(ChatDestination::new(
                    sender.clone(),
                    recipient.telegram_id.clone(),
                )));
            }
            if let (Some(sender), false) = (&self.slack, recipient.slack_channel_id.is_empty()) {
                destinations.push(Box::new(ChatDestination::new(
                    sender.clone(),
                    recipient.slack_channel_id.clone(),
                )));
            }
        }
        destinations
    }

    async fn deliver_with_retries(
        &self,
        destination: &dyn Destination,
        event: &TransactionEvent,
        payload: &NotificationPayload,
    ) -> Final {
        let kind = destination.kind();
        let mut retries = 0;
        loop {
            match destination.deliver(event, payload).await {
                DeliveryOutcome::Delivered => {
                    NOTIFICATIONS.with_label_values(&[kind, "delivered"]).inc();
                    return Final::Delivered;
                }
                DeliveryOutcome::PermanentFailure(reason) => {
                    NOTIFICATIONS.with_label_values(&[kind, "invalidated"]).inc();
                    warn!("{} delivery of {} failed permanently: {}", kind, payload.txid(), reason);
                    return Final::Permanent;
                }
                DeliveryOutcome::TransientFailure(reason) if retries < self.max_retries => {
                    retries += 1;
                    debug!(
                        "{} delivery of {} failed ({}), retry #{} in {:?}",
                        kind, payload.txid(), reason, retries, self.retry_delay
                    );
                    sleep(self.retry_delay).await;
                }
                DeliveryOutcome::TransientFailure(reason) => {
                    NOTIFICATIONS.with_label_values(&[kind, "exhausted"]).inc();
                    error!(
                        "{} delivery of {} gave up after {} retries: {}",
                        kind, payload.txid(), retries, reason
                    );
                    return Final::Exhausted;
                }
            }
        }
    }
}

type LoadedEvent = (TransactionEvent, Vec<(Subscription, Option<Recipient>)>);

fn load_event<O: RecordRepoOperations + ?Sized>(
    ops: &mut O,
    transaction_id: i64,
) -> Result<Option<LoadedEvent>> {
    let transaction = match ops.get_transaction(transaction_id)? {
        Some(transaction) => transaction,
        None => return Ok(None),
    };
    let address = ops
        .get_address(transaction.address_id)?
        .ok_or_else(|| Error::InvalidChainData(format!("address {}", transaction.address_id)))?;
    let token = ops
        .get_token(transaction.token_id)?
        .ok_or_else(|| Error::InvalidChainData(format!("token {}", transaction.token_id)))?;
    let block = match transaction.blockheight_id {
        Some(block_id) => ops.get_block(block_id)?.map(|b| b.number),
        None => None,
    };
    let wallet = match address.wallet_id {
        Some(wallet_id) => ops.get_wallet(wallet_id)?,
        None => None,
    };

    let mut targets = vec![];
    for subscription in ops.subscriptions_for_address(address.id)? {
        let recipient = match subscription.recipient_id {
            Some(recipient_id) => ops.get_recipient(recipient_id)?,
            None => None,
        };
        targets.push((subscription, recipient));
    }

    Ok(Some((
        TransactionEvent {
            transaction,
            address,
            token,
            block,
            wallet,
        },
        targets,
    )))
}

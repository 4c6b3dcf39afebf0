#[macro_use]
extern crate diesel;

mod api;
mod chain;
mod config;
mod coordination;
mod db;
mod error;
mod history;
mod metrics;
mod models;
mod notifications;
mod pipeline;
mod reconciler;
mod redis;
mod scanner;
mod schema;
mod stream;
mod utils;

#[cfg(test)]
mod test_utils;

use std::sync::Arc;
use wavesexchange_log::{error, info};

use crate::chain::RestChainQuery;
use crate::coordination::RedisCoordinationRepo;
use crate::db::PostgresRecordRepo;
use crate::error::Error;
use crate::history::WalletHistoryBuilder;
use crate::notifications::{
    ChatSender, Dispatcher, RedisRoomPublisher, ReqwestWebhookClient, SlackSender, TelegramSender,
};
use crate::pipeline::{Pipeline, TransactionHandler};
use crate::reconciler::{enrichment_channel, Reconciler};
use crate::scanner::BlockScanCoordinator;
use crate::stream::LiveFeed;

const ENRICHMENT_QUEUE_SIZE: usize = 100;

fn main() -> Result<(), Error> {
    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(tokio_main());
    rt.shutdown_timeout(std::time::Duration::from_millis(1));
    result
}

async fn tokio_main() -> Result<(), Error> {
    metrics::register_metrics();

    let redis_config = config::load_redis()?;
    let postgres_config = config::load_postgres()?;
    let chain_config = config::load_chain()?;
    let scanner_config = config::load_scanner()?;
    let reconciler_config = config::load_reconciler()?;
    let notifications_config = config::load_notifications()?;
    let live_feed_config = config::load_live_feed()?;
    let server_config = config::load_api()?;

    let redis_pool = redis::new_redis_pool(redis_config.connection_url()).await?;
    let redis_pool = redis::RedisPoolWithStats::new(redis_pool);

    let db_pool = db::pool::new(&postgres_config)?;
    let repo = Arc::new(PostgresRecordRepo::new(db::pool::PgPoolWithStats::new(db_pool)));

    let chain = Arc::new(RestChainQuery::new(&chain_config)?);
    let coordination = Arc::new(RedisCoordinationRepo::new(redis_pool.clone()));

    // Token enrichment
    let (enrichment_queue, enricher) =
        enrichment_channel(repo.clone(), chain.clone(), ENRICHMENT_QUEUE_SIZE);
    let enricher_handle = tokio::spawn(async move {
        info!("starting token enricher");
        if let Err(error) = enricher.run().await {
            error!("token enricher returned an error: {:?}", error);
        }
    });

    // Notifications
    let webhook_client = Arc::new(ReqwestWebhookClient::new(
        notifications_config.request_timeout,
    )?);
    let publisher = Arc::new(RedisRoomPublisher::new(redis_pool));
    let mut dispatcher = Dispatcher::new(
        repo.clone(),
        webhook_client,
        publisher,
        notifications_config.max_retries,
        notifications_config.retry_delay,
    );
    if let Some(token) = notifications_config.telegram_bot_token {
        info!("telegram notifications enabled");
        let sender: Arc<dyn ChatSender> = Arc::new(TelegramSender::new(
            &notifications_config.telegram_api_url,
            token,
            notifications_config.request_timeout,
        )?);
        dispatcher = dispatcher.with_telegram(sender);
    }
    if let Some(token) = notifications_config.slack_bot_token {
        info!("slack notifications enabled");
        let sender: Arc<dyn ChatSender> = Arc::new(SlackSender::new(
            &notifications_config.slack_api_url,
            token,
            notifications_config.request_timeout,
        )?);
        dispatcher = dispatcher.with_slack(sender);
    }

    let reconciler = Arc::new(Reconciler::new(repo.clone(), chain.clone(), enrichment_queue));
    let pipeline: Arc<dyn TransactionHandler> = Arc::new(Pipeline::new(
        reconciler.clone(),
        Arc::new(WalletHistoryBuilder::new(repo.clone())),
        Arc::new(dispatcher),
    ));

    // Block scan
    let coordinator = BlockScanCoordinator::new(
        scanner_config,
        repo.clone(),
        chain.clone(),
        coordination.clone(),
        pipeline.clone(),
    );
    coordinator.init().await?;

    let claim_handle = tokio::spawn(coordinator.clone().run_claim_loop());
    let polling_handle = tokio::spawn(coordinator.clone().run_polling_loop());
    let sweep_handle = tokio::spawn(coordinator.clone().run_sweep_loop());
    let review_handle = tokio::spawn(coordinator.run_review_loop());

    // UTXO-set reconciliation
    let utxo_handle =
        tokio::spawn(reconciler.clone().run_utxo_loop(reconciler_config.utxo_scan_delay));

    // Live feed
    let live_feed = live_feed_config
        .map(|config| LiveFeed::new(config, coordination, pipeline))
        .transpose()?;
    let live_feed_handle = tokio::spawn(async move {
        match live_feed {
            Some(feed) => {
                info!("starting live feed");
                feed.run().await
            }
            None => {
                info!("live feed is not configured");
                futures::future::pending().await
            }
        }
    });

    let api_handle = tokio::spawn(async move {
        api::start(server_config.port, repo, reconciler, chain).await
    });

    tokio::select! {
        result = claim_handle => {
            result??;
        }
        result = polling_handle => {
            result??;
        }
        result = sweep_handle => {
            result??;
        }
        result = review_handle => {
            result??;
        }
        result = utxo_handle => {
            result??;
        }
        result = live_feed_handle => {
            result??;
        }
        _ = enricher_handle => {}
        result = api_handle => {
            result?;
        }
    }

    Ok(())
}

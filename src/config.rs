use crate::error::Error;
use crate::{api, chain, notifications, reconciler, scanner, stream};
use serde::Deserialize;
use std::time::Duration;

fn default_redis_port() -> u16 {
    6379
}

fn default_pg_port() -> u16 {
    5432
}

fn default_pg_pool_size() -> u32 {
    4
}

fn default_api_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_chain_max_attempts() -> u32 {
    3
}

fn default_chain_retry_delay() -> u64 {
    2
}

fn default_polling_delay() -> u64 {
    5
}

fn default_claim_delay() -> u64 {
    1
}

fn default_max_block_away() -> i32 {
    20
}

fn default_problematic_window() -> u64 {
    2 * 60 * 60
}

fn default_sweep_delay() -> u64 {
    30
}

fn default_review_delay() -> u64 {
    60
}

fn default_finalize_guard_ttl() -> u64 {
    24 * 60 * 60
}

fn default_stale_claim_ttl() -> u64 {
    30 * 60
}

fn default_store_retry_attempts() -> u32 {
    3
}

fn default_store_retry_delay() -> u64 {
    500
}

fn default_utxo_scan_delay() -> u64 {
    60 * 60
}

fn default_notification_retries() -> u32 {
    3
}

fn default_notification_retry_delay() -> u64 {
    180
}

fn default_telegram_api_url() -> String {
    "https://api.telegram.org".to_string()
}

fn default_slack_api_url() -> String {
    "https://slack.com/api".to_string()
}

fn default_live_feed_source() -> String {
    "bitsocket".to_string()
}

fn default_live_feed_max_run() -> u64 {
    500
}

fn default_live_feed_restart_delay() -> u64 {
    10
}

#[derive(Deserialize)]
pub struct RedisConfig {
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl RedisConfig {
    pub fn connection_url(&self) -> String {
        format!(
            "redis://{}:{}@{}:{}/",
            self.username, self.password, self.host, self.port
        )
    }
}

#[derive(Deserialize, Clone)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_pg_pool_size")]
    pub pool_size: u32,
}

#[derive(Deserialize)]
struct FlatApiConfig {
    #[serde(default = "default_api_port")]
    pub port: u16,
}

#[derive(Deserialize)]
struct FlatChainConfig {
    pub rest_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_chain_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_chain_retry_delay")]
    pub retry_delay_secs: u64,
}

#[derive(Deserialize)]
struct FlatScannerConfig {
    #[serde(default = "default_polling_delay")]
    pub polling_delay_secs: u64,
    #[serde(default = "default_claim_delay")]
    pub claim_delay_secs: u64,
    #[serde(default = "default_max_block_away")]
    pub max_block_away: i32,
    #[serde(default = "default_problematic_window")]
    pub problematic_window_secs: u64,
    #[serde(default = "default_sweep_delay")]
    pub sweep_delay_secs: u64,
    #[serde(default = "default_review_delay")]
    pub review_delay_secs: u64,
    #[serde(default = "default_finalize_guard_ttl")]
    pub finalize_guard_ttl_secs: u64,
    #[serde(default = "default_stale_claim_ttl")]
    pub stale_claim_ttl_secs: u64,
    #[serde(default = "default_store_retry_attempts")]
    pub store_retry_attempts: u32,
    #[serde(default = "default_store_retry_delay")]
    pub store_retry_delay_ms: u64,
}

#[derive(Deserialize)]
struct FlatReconcilerConfig {
    #[serde(default = "default_utxo_scan_delay")]
    pub utxo_scan_delay_secs: u64,
}

#[derive(Deserialize)]
struct FlatNotificationsConfig {
    #[serde(default = "default_notification_retries")]
    pub max_retries: u32,
    #[serde(default = "default_notification_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    pub telegram_bot_token: Option<String>,
    #[serde(default = "default_telegram_api_url")]
    pub telegram_api_url: String,
    pub slack_bot_token: Option<String>,
    #[serde(default = "default_slack_api_url")]
    pub slack_api_url: String,
}

#[derive(Deserialize)]
struct FlatLiveFeedConfig {
    pub url: Option<String>,
    #[serde(default = "default_live_feed_source")]
    pub source: String,
    #[serde(default = "default_live_feed_max_run")]
    pub max_run_secs: u64,
    #[serde(default = "default_live_feed_restart_delay")]
    pub restart_delay_secs: u64,
}

pub fn load_redis() -> Result<RedisConfig, Error> {
    envy::prefixed("REDIS__")
        .from_env::<RedisConfig>()
        .map_err(Error::from)
}

pub fn load_postgres() -> Result<PostgresConfig, Error> {
    envy::prefixed("POSTGRES__")
        .from_env::<PostgresConfig>()
        .map_err(Error::from)
}

pub fn load_api() -> Result<api::Config, Error> {
    let flat_config = envy::prefixed("API__").from_env::<FlatApiConfig>()?;

    Ok(api::Config {
        port: flat_config.port,
    })
}

pub fn load_chain() -> Result<chain::Config, Error> {
    let flat_config = envy::prefixed("CHAIN__").from_env::<FlatChainConfig>()?;

    Ok(chain::Config {
        rest_url: flat_config.rest_url,
        request_timeout: Duration::from_secs(flat_config.request_timeout_secs),
        max_attempts: flat_config.max_attempts.max(1),
        retry_delay: Duration::from_secs(flat_config.retry_delay_secs),
    })
}

pub fn load_scanner() -> Result<scanner::Config, Error> {
    let flat_config = envy::prefixed("SCANNER__").from_env::<FlatScannerConfig>()?;

    Ok(scanner::Config {
        polling_delay: Duration::from_secs(flat_config.polling_delay_secs),
        claim_delay: Duration::from_secs(flat_config.claim_delay_secs),
        max_block_away: flat_config.max_block_away,
        problematic_window: Duration::from_secs(flat_config.problematic_window_secs),
        sweep_delay: Duration::from_secs(flat_config.sweep_delay_secs),
        review_delay: Duration::from_secs(flat_config.review_delay_secs),
        finalize_guard_ttl: Duration::from_secs(flat_config.finalize_guard_ttl_secs),
        stale_claim_ttl: Duration::from_secs(flat_config.stale_claim_ttl_secs),
        store_retry_attempts: flat_config.store_retry_attempts.max(1),
        store_retry_delay: Duration::from_millis(flat_config.store_retry_delay_ms),
    })
}

pub fn load_reconciler() -> Result<reconciler::Config, Error> {
    let flat_config = envy::prefixed("RECONCILER__").from_env::<FlatReconcilerConfig>()?;

    Ok(reconciler::Config {
        utxo_scan_delay: Duration::from_secs(flat_config.utxo_scan_delay_secs),
    })
}

pub fn load_notifications() -> Result<notifications::Config, Error> {
    let flat_config =
        envy::prefixed("NOTIFICATIONS__").from_env::<FlatNotificationsConfig>()?;

    Ok(notifications::Config {
        max_retries: flat_config.max_retries,
        retry_delay: Duration::from_secs(flat_config.retry_delay_secs),
        request_timeout: Duration::from_secs(flat_config.request_timeout_secs),
        telegram_bot_token: flat_config.telegram_bot_token.filter(|t| !t.is_empty()),
        telegram_api_url: flat_config.telegram_api_url,
        slack_bot_token: flat_config.slack_bot_token.filter(|t| !t.is_empty()),
        slack_api_url: flat_config.slack_api_url,
    })
}

pub fn load_live_feed() -> Result<Option<stream::Config>, Error> {
    let flat_config = envy::prefixed("LIVE_FEED__").from_env::<FlatLiveFeedConfig>()?;

    Ok(flat_config
        .url
        .filter(|url| !url.is_empty())
        .map(|url| stream::Config {
            url,
            source: flat_config.source,
            max_run: Duration::from_secs(flat_config.max_run_secs),
            restart_delay: Duration::from_secs(flat_config.restart_delay_secs),
        }))
}

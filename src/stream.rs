//! Live-feed ingestion from a bitsocket-style server-sent event stream.

use bigdecimal::{BigDecimal, Zero};
use futures::{Stream, StreamExt};
use reqwest::{Client, ClientBuilder};
use serde::Deserialize;
use std::convert::TryFrom;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use wavesexchange_log::{debug, error, info, warn};

use crate::chain::{
    coins_from_satoshis, ChainTransaction, TokenTransfer, TransferKind, TxInput, TxOutput,
};
use crate::coordination::CoordinationRepo;
use crate::error::{Error, Result};
use crate::models::{Outpoint, TokenIdentity, BASE_CURRENCY_ADDRESS_PREFIX};
use crate::pipeline::TransactionHandler;

const RUN_FLAG_MARGIN: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct Config {
    pub url: String,
    pub source: String,
    pub max_run: Duration,
    pub restart_delay: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedRun {
    AlreadyRunning,
    Ended { handled: usize },
    TimedOut,
}

#[derive(Deserialize)]
struct FeedMessage {
    #[serde(default)]
    data: Vec<FeedTx>,
}

#[derive(Deserialize)]
struct FeedTx {
    tx: FeedTxHash,
    #[serde(rename = "in", default)]
    inputs: Vec<FeedInput>,
    #[serde(rename = "out", default)]
    outputs: Vec<FeedOutput>,
    blk: Option<FeedBlock>,
    slp: Option<FeedSlp>,
}

#[derive(Deserialize)]
struct FeedTxHash {
    h: String,
}

#[derive(Deserialize)]
struct FeedBlock {
    i: i32,
}

#[derive(Deserialize)]
struct FeedInput {
    e: FeedInputEdge,
}

#[derive(Deserialize)]
struct FeedInputEdge {
    h: String,
    i: i32,
}

#[derive(Deserialize)]
struct FeedOutput {
    e: Option<FeedOutputEdge>,
}

#[derive(Deserialize)]
struct FeedOutputEdge {
    v: i64,
    i: i32,
    a: Option<String>,
}

#[derive(Deserialize)]
struct FeedSlp {
    #[serde(default)]
    valid: bool,
    detail: Option<FeedSlpDetail>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedSlpDetail {
    transaction_type: String,
    token_id_hex: String,
    #[serde(default)]
    outputs: Vec<FeedSlpOutput>,
}

#[derive(Deserialize)]
struct FeedSlpOutput {
    amount: String,
}

fn cash_address(raw: &str) -> String {
    if raw.contains(':') {
        raw.to_owned()
    } else {
        format!("{}{}", BASE_CURRENCY_ADDRESS_PREFIX, raw)
    }
}

fn to_chain_transaction(event: FeedTx) -> Result<ChainTransaction> {
    let inputs = event
        .inputs
        .into_iter()
        // input edges carry no value, so wallet history falls back to recorded spends
        .map(|input| TxInput {
            address: None,
            value: BigDecimal::zero(),
            prevout: Outpoint::new(input.e.h, input.e.i),
        })
        .collect();

    let mut outputs: Vec<TxOutput> = event
        .outputs
        .into_iter()
        .filter_map(|output| output.e)
        .map(|e| TxOutput {
            address: e.a.as_deref().map(cash_address),
            value: coins_from_satoshis(e.v),
            index: e.i,
            token_amount: None,
        })
        .collect();

    let token = match event.slp.and_then(|slp| slp.detail.map(|detail| (detail, slp.valid))) {
        Some((detail, valid)) => {
            let kind = match detail.transaction_type.to_ascii_uppercase().as_str() {
                "GENESIS" => TransferKind::Genesis,
                "MINT" => TransferKind::Mint,
                _ => TransferKind::Send,
            };
            // overlay outputs start right after the OP_RETURN at index 0
            for (position, slp_output) in detail.outputs.iter().enumerate() {
                let index = position as i32 + 1;
                if let Some(out) = outputs.iter_mut().find(|o| o.index == index) {
                    out.token_amount = Some(
                        slp_output
                            .amount
                            .parse()
                            .map_err(|_| Error::InvalidAmount(slp_output.amount.clone()))?,
                    );
                }
            }
            Some(TokenTransfer {
                token: TokenIdentity::try_from(detail.token_id_hex.as_str())?,
                kind,
                valid,
            })
        }
        None => None,
    };

    Ok(ChainTransaction {
        txid: event.tx.h,
        block_height: event.blk.map(|b| b.i),
        inputs,
        outputs,
        tx_fee: None,
        valid: token.as_ref().map_or(true, |t| t.valid),
        token,
    })
}

/// Splits a byte stream into `data:` payloads, tolerating chunk boundaries anywhere.
#[derive(Default)]
struct EventBuffer {
    pending: Vec<u8>,
}

impl EventBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut payloads = vec![];
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(payload) = line.trim().strip_prefix("data:") {
                let payload = payload.trim();
                if !payload.is_empty() {
                    payloads.push(payload.to_owned());
                }
            }
        }
        payloads
    }
}

fn parse_payload(payload: &str) -> Vec<ChainTransaction> {
    let message: FeedMessage = match serde_json::from_str(payload) {
        Ok(message) => message,
        Err(err) => {
            debug!("skipping malformed feed message: {}", err);
            return vec![];
        }
    };
    message
        .data
        .into_iter()
        .filter_map(|event| match to_chain_transaction(event) {
            Ok(tx) => Some(tx),
            Err(err) => {
                debug!("skipping undecodable feed event: {}", err);
                None
            }
        })
        .collect()
}

pub struct LiveFeed<K> {
    config: Config,
    client: Client,
    coordination: Arc<K>,
    handler: Arc<dyn TransactionHandler>,
}

impl<K> LiveFeed<K>
where
    K: CoordinationRepo + Send + Sync + 'static,
{
    pub fn new(
        config: Config,
        coordination: Arc<K>,
        handler: Arc<dyn TransactionHandler>,
    ) -> Result<Self> {
        let client = ClientBuilder::new()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(LiveFeed {
            config,
            client,
            coordination,
            handler,
        })
    }

    fn run_flag(&self) -> String {
        format!("LIVE-FEED:{}", self.config.source)
    }

    /// One bounded run: holds the run flag for its whole duration and always releases it.
    pub async fn run_once(&self) -> Result<FeedRun> {
        self.run_guarded(async {
            let response = self
                .client
                .get(&self.config.url)
                .send()
                .await?
                .error_for_status()?;
            self.consume(response.bytes_stream()).await
        })
        .await
    }

    async fn run_guarded<F>(&self, feed: F) -> Result<FeedRun>
    where
        F: Future<Output = Result<usize>>,
    {
        let flag = self.run_flag();
        let ttl = self.config.max_run + RUN_FLAG_MARGIN;
        if !self.coordination.acquire_run_flag(&flag, ttl).await? {
            debug!("{} is already running", flag);
            return Ok(FeedRun::AlreadyRunning);
        }
        info!("{} started", flag);

        let result = timeout(self.config.max_run, feed).await;
        let released = self.coordination.release_run_flag(&flag).await;

        let run = match result {
            Ok(Ok(handled)) => FeedRun::Ended { handled },
            Ok(Err(err)) => {
                if let Err(release_err) = released {
                    error!("{} flag release failed: {}", flag, release_err);
                }
                return Err(err);
            }
            Err(_) => FeedRun::TimedOut,
        };
        released?;
        info!("{} finished: {:?}", flag, run);
        Ok(run)
    }

    async fn consume<S, B, E>(&self, stream: S) -> Result<usize>
    where
        S: Stream<Item = std::result::Result<B, E>>,
        B: AsRef<[u8]>,
        Error: From<E>,
    {
        futures::pin_mut!(stream);
        let mut buffer = EventBuffer::default();
        let mut handled = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for payload in buffer.push(chunk.as_ref()) {
                for tx in parse_payload(&payload) {
                    match self.handler.handle(&tx, &self.config.source, None).await {
                        Ok(()) => handled += 1,
                        Err(err) => warn!("live feed tx {} failed: {}", tx.txid, err),
                    }
                }
            }
        }
        Ok(handled)
    }

    pub async fn run(self) -> Result<()> {
        loop {
            if let Err(err) = self.run_once().await {
                error!("live feed {} failed: {}", self.config.source, err);
            }
            sleep(self.config.restart_delay).await;
        }
    }
}

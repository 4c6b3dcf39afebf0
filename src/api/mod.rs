pub mod filters;

use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::{header::CONTENT_TYPE, Response, StatusCode};
use warp::{Filter, Rejection, Reply};
use wavesexchange_log::{info, warn};

use self::filters::{filter_tokens, TokenQuery, TokenView};
use crate::chain::{self, ChainQuery};
use crate::db::{is_watched, RecordRepo, RecordRepoOperations};
use crate::error::Error;
use crate::metrics::REGISTRY;
use crate::reconciler::Reconciler;

const MAX_BODY_SIZE: u64 = 2 * 1024 * 1024;

pub struct Config {
    pub port: u16,
}

#[derive(Deserialize)]
struct BroadcastRequest {
    transaction: String,
}

pub fn routes<R, C>(
    repo: Arc<R>,
    reconciler: Arc<Reconciler<R, C>>,
    chain: Arc<C>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone
where
    R: RecordRepo + Send + Sync + 'static,
    C: ChainQuery + 'static,
{
    let metrics = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .map(metrics_handler);

    let tokens = warp::path("tokens")
        .and(warp::path::end())
        .and(warp::get())
        .and(
            warp::query::raw()
                .or(warp::any().map(String::new))
                .unify(),
        )
        .and(with_arc(repo.clone()))
        .and_then(tokens_handler);

    let backfill = warp::path!("subscriptions" / String / "backfill")
        .and(warp::post())
        .and(with_arc(repo))
        .and(with_arc(reconciler))
        .and_then(backfill_handler);

    let broadcast = warp::path("broadcast")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_SIZE))
        .and(warp::body::json())
        .and(with_arc(chain))
        .and_then(broadcast_handler);

    metrics.or(tokens).or(backfill).or(broadcast)
}

fn with_arc<T: Send + Sync + ?Sized>(
    value: Arc<T>,
) -> impl Filter<Extract = (Arc<T>,), Error = Infallible> + Clone {
    warp::any().map(move || value.clone())
}

pub async fn start<R, C>(
    port: u16,
    repo: Arc<R>,
    reconciler: Arc<Reconciler<R, C>>,
    chain: Arc<C>,
) where
    R: RecordRepo + Send + Sync + 'static,
    C: ChainQuery + 'static,
{
    info!("Starting web server at 0.0.0.0:{}", port);
    warp::serve(routes(repo, reconciler, chain))
        .run(([0, 0, 0, 0], port))
        .await;
}

fn error_reply(status: StatusCode, message: String) -> warp::reply::Response {
    warp::reply::with_status(warp::reply::json(&json!({ "error": message })), status)
        .into_response()
}

fn metrics_handler() -> Response<Vec<u8>> {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&REGISTRY.gather(), &mut buffer) {
        Ok(()) => {
            let mut response = Response::new(buffer);
            if let Ok(content_type) = encoder.format_type().parse() {
                response.headers_mut().insert(CONTENT_TYPE, content_type);
            }
            response
        }
        Err(err) => {
            warn!("metrics encoding failed: {}", err);
            let mut response = Response::new(vec![]);
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

async fn tokens_handler<R>(
    raw_query: String,
    repo: Arc<R>,
) -> Result<warp::reply::Response, Infallible>
where
    R: RecordRepo + Send + Sync + 'static,
{
    let query = TokenQuery::parse(&raw_query);
    match repo.execute(move |ops| filter_tokens(ops, &query)).await {
        Ok(tokens) => {
            let views: Vec<TokenView> = tokens.into_iter().map(TokenView::from).collect();
            Ok(warp::reply::json(&views).into_response())
        }
        Err(err) => {
            warn!("token listing failed: {}", err);
            let empty = warp::reply::json(&Vec::<TokenView>::new());
            Ok(warp::reply::with_status(empty, StatusCode::INTERNAL_SERVER_ERROR).into_response())
        }
    }
}

/// UTXO-set backfill of a freshly subscribed address; the history found is not notified.
async fn backfill_handler<R, C>(
    address: String,
    repo: Arc<R>,
    reconciler: Arc<Reconciler<R, C>>,
) -> Result<warp::reply::Response, Infallible>
where
    R: RecordRepo + Send + Sync + 'static,
    C: ChainQuery + 'static,
{
    let lookup = address.clone();
    let watched = repo
        .execute(move |ops| match ops.find_address(&lookup)? {
            Some(row) => is_watched(ops, &row),
            None => Ok(false),
        })
        .await;
    match watched {
        Ok(true) => {}
        Ok(false) => {
            return Ok(error_reply(
                StatusCode::NOT_FOUND,
                format!("{} is not watched", address),
            ))
        }
        Err(err) => {
            warn!("backfill lookup of {} failed: {}", address, err);
            return Ok(error_reply(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()));
        }
    }

    match reconciler.backfill_subscription(&address).await {
        Ok(summary) => Ok(warp::reply::json(&summary).into_response()),
        Err(err) => {
            warn!("backfill of {} failed: {}", address, err);
            Ok(error_reply(StatusCode::BAD_GATEWAY, err.to_string()))
        }
    }
}

async fn broadcast_handler<C>(
    request: BroadcastRequest,
    chain: Arc<C>,
) -> Result<warp::reply::Response, Infallible>
where
    C: ChainQuery + 'static,
{
    match chain::broadcast(chain.as_ref(), &request.transaction).await {
        Ok(txid) => Ok(warp::reply::json(&json!({ "txid": txid })).into_response()),
        Err(err @ Error::HexError(_)) => {
            Ok(error_reply(StatusCode::BAD_REQUEST, err.to_string()))
        }
        Err(err) => {
            warn!("broadcast failed: {}", err);
            Ok(error_reply(StatusCode::BAD_GATEWAY, err.to_string()))
        }
    }
}

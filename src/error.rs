use diesel::result::DatabaseErrorKind;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[allow(clippy::enum_variant_names)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("ConfigLoadError: {0}")]
    ConfigLoadError(#[from] envy::Error),
    #[error("IoError: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JoinError: {0}")]
    JoinError(#[from] tokio::task::JoinError),
    #[error("PgPoolCreateError: {0}")]
    PgPoolCreateError(#[from] crate::db::pool::PgPoolCreateError),
    #[error("PgPoolRuntimeError: {0}")]
    PgPoolRuntimeError(#[from] crate::db::pool::PgPoolRuntimeError),
    #[error("PgPoolSyncCallError: {0}")]
    PgPoolSyncCallError(#[from] crate::db::pool::PgPoolSyncCallError),
    #[error("DbError: {0}")]
    DbError(#[from] diesel::result::Error),
    #[error("RedisError: {0}")]
    RedisError(#[from] crate::redis::RedisError),
    #[error("RedisPoolCreateError: {0}")]
    RedisPoolCreateError(#[from] crate::redis::RedisPoolCreateError),
    #[error("RedisPoolInitError: {0} - {1}")]
    RedisPoolInitError(&'static str, crate::redis::RedisPoolError),
    #[error("RedisPoolRuntimeError: {0}")]
    RedisPoolRuntimeError(#[from] crate::redis::RedisPoolError),
    #[error("SerdeJsonError: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("SendError: {0}")]
    SendError(String),
    #[error("ReqwestError: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("UrlParseError: {0}")]
    UrlParseError(#[from] url::ParseError),
    #[error("HexError: {0}")]
    HexError(#[from] hex::FromHexError),
    #[error("ChainQueryError: {0}")]
    ChainQueryError(String),
    #[error("InvalidChainData: {0}")]
    InvalidChainData(String),
    #[error("InvalidTokenIdentity: {0}")]
    InvalidTokenIdentity(String),
    #[error("InvalidAmount: {0}")]
    InvalidAmount(String),
    #[error("UnknownWallet: {0}")]
    UnknownWallet(String),
    #[error("UnknownTransaction: {0}")]
    UnknownTransaction(i64),
    #[error("UnknownBlock: {0}")]
    UnknownBlock(i64),
    #[error("DeliveryError: {0}")]
    DeliveryError(String),
}

impl Error {
    /// Another writer already produced the row this call tried to insert.
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            Error::DbError(diesel::result::Error::DatabaseError(
                DatabaseErrorKind::UniqueViolation,
                _
            ))
        )
    }

    /// Failures worth re-submitting the same operation for.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::DbError(diesel::result::Error::DatabaseError(kind, _)) => matches!(
                kind,
                DatabaseErrorKind::SerializationFailure | DatabaseErrorKind::ClosedConnection
            ),
            Error::PgPoolRuntimeError(_)
            | Error::PgPoolSyncCallError(_)
            | Error::RedisPoolRuntimeError(_)
            | Error::ChainQueryError(_) => true,
            Error::RedisError(err) => {
                err.is_io_error() || err.is_timeout() || err.is_connection_dropped()
            }
            Error::ReqwestError(err) => err.is_timeout() || err.is_connect(),
            _ => false,
        }
    }
}

//! Re-exports `redis` crate so that it can be uniformly used throughout the application

pub use deadpool_redis::redis::*;
pub use deadpool_redis::Connection as RedisPoolConnection;
pub use deadpool_redis::CreatePoolError as RedisPoolCreateError;
pub use deadpool_redis::Pool as RedisPool;
pub use deadpool_redis::PoolError as RedisPoolError;

use deadpool_redis::{Config, Runtime};

use crate::error::Error;
use crate::metrics::REDIS_CONNECTIONS_AVAILABLE;

pub async fn new_redis_pool(redis_connection_url: String) -> Result<RedisPool, Error> {
    let cfg = Config::from_url(redis_connection_url);
    let pool = cfg.create_pool(Some(Runtime::Tokio1))?;
    let test_conn = pool.get().await.map_err(|err| {
        Error::RedisPoolInitError("failed to create initial pooled connection on startup", err)
    })?;
    drop(test_conn); // Not needed, just verify that Redis server is responding
    Ok(pool)
}

#[derive(Clone)]
pub struct RedisPoolWithStats {
    pool: RedisPool,
}

impl RedisPoolWithStats {
    pub fn new(pool: RedisPool) -> Self {
        RedisPoolWithStats { pool }
    }

    pub async fn get(&self) -> Result<RedisPoolConnection, RedisPoolError> {
        let res = self.pool.get().await;
        REDIS_CONNECTIONS_AVAILABLE.set(self.pool.status().available as i64);
        res
    }
}

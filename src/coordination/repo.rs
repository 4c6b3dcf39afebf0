use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;
use wavesexchange_log::timer;

use super::{ActiveClaim, Classification, CoordinationRepo};
use crate::error::Error;
use crate::redis::{cmd, RedisPoolWithStats};

const KEY_PREFIX: &str = "watchtower";

fn key(name: &str) -> String {
    format!("{}:{}", KEY_PREFIX, name)
}

fn block_key(name: &str, number: i32) -> String {
    format!("{}:{}:{}", KEY_PREFIX, name, number)
}

pub struct RedisCoordinationRepo {
    pool: RedisPoolWithStats,
}

impl RedisCoordinationRepo {
    pub fn new(pool: RedisPoolWithStats) -> Self {
        RedisCoordinationRepo { pool }
    }
}

#[async_trait]
impl CoordinationRepo for RedisCoordinationRepo {
    async fn set_ready(&self) -> Result<(), Error> {
        let mut con = self.pool.get().await?;
        cmd("SET")
            .arg(key("READY"))
            .arg(1)
            .query_async::<_, ()>(&mut con)
            .await?;
        Ok(())
    }

    async fn claim_ready(&self) -> Result<bool, Error> {
        timer!("claim_ready()", verbose);

        let mut con = self.pool.get().await?;
        let deleted: i64 = cmd("DEL").arg(key("READY")).query_async(&mut con).await?;
        Ok(deleted == 1)
    }

    async fn active_block(&self) -> Result<Option<i32>, Error> {
        let mut con = self.pool.get().await?;
        let number: Option<i32> = cmd("GET")
            .arg(key("ACTIVE-BLOCK"))
            .query_async(&mut con)
            .await?;
        Ok(number)
    }

    async fn active_claim(&self) -> Result<Option<ActiveClaim>, Error> {
        let mut con = self.pool.get().await?;
        let (number, since): (Option<i32>, Option<i64>) = cmd("MGET")
            .arg(key("ACTIVE-BLOCK"))
            .arg(key("ACTIVE-SINCE"))
            .query_async(&mut con)
            .await?;
        Ok(number.map(|number| ActiveClaim {
            number,
            // a claim without a stamp is treated as infinitely old
            since: since
                .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        }))
    }

    async fn set_active_block(&self, number: i32) -> Result<(), Error> {
        let mut con = self.pool.get().await?;
        cmd("MSET")
            .arg(key("ACTIVE-BLOCK"))
            .arg(number)
            .arg(key("ACTIVE-SINCE"))
            .arg(Utc::now().timestamp())
            .query_async::<_, ()>(&mut con)
            .await?;
        Ok(())
    }

    async fn clear_active_block(&self) -> Result<(), Error> {
        let mut con = self.pool.get().await?;
        cmd("DEL")
            .arg(key("ACTIVE-BLOCK"))
            .arg(key("ACTIVE-SINCE"))
            .query_async::<_, ()>(&mut con)
            .await?;
        Ok(())
    }

    async fn push_pending(&self, numbers: &[i32]) -> Result<(), Error> {
        if numbers.is_empty() {
            return Ok(());
        }
        let mut con = self.pool.get().await?;
        let mut zadd = cmd("ZADD");
        zadd.arg(key("PENDING-BLOCKS"));
        for number in numbers {
            zadd.arg(*number).arg(*number);
        }
        zadd.query_async::<_, ()>(&mut con).await?;
        Ok(())
    }

    async fn pop_pending(&self) -> Result<Option<i32>, Error> {
        timer!("pop_pending()", verbose);

        let mut con = self.pool.get().await?;
        let popped: Vec<String> = cmd("ZPOPMIN")
            .arg(key("PENDING-BLOCKS"))
            .query_async(&mut con)
            .await?;
        match popped.first() {
            Some(member) => member
                .parse()
                .map(Some)
                .map_err(|_| Error::InvalidChainData(format!("pending block {}", member))),
            None => Ok(None),
        }
    }

    async fn pending_count(&self) -> Result<u64, Error> {
        let mut con = self.pool.get().await?;
        let count: u64 = cmd("ZCARD")
            .arg(key("PENDING-BLOCKS"))
            .query_async(&mut con)
            .await?;
        Ok(count)
    }

    async fn record_unit_completion(&self, number: i32) -> Result<u64, Error> {
        let mut con = self.pool.get().await?;
        let done: u64 = cmd("INCR")
            .arg(block_key("UNITS-DONE", number))
            .query_async(&mut con)
            .await?;
        Ok(done)
    }

    async fn try_mark_finalized(&self, number: i32, ttl: Duration) -> Result<bool, Error> {
        let mut con = self.pool.get().await?;
        let set: Option<String> = cmd("SET")
            .arg(block_key("FINALIZED", number))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut con)
            .await?;
        Ok(set.is_some())
    }

    async fn add_genesis(&self, number: i32, txid: &str) -> Result<(), Error> {
        let mut con = self.pool.get().await?;
        cmd("SADD")
            .arg(block_key("GENESIS", number))
            .arg(txid)
            .query_async::<_, ()>(&mut con)
            .await?;
        Ok(())
    }

    async fn add_problematic(&self, number: i32, txid: &str) -> Result<(), Error> {
        let mut con = self.pool.get().await?;
        cmd("SADD")
            .arg(block_key("PROBLEMATIC", number))
            .arg(txid)
            .query_async::<_, ()>(&mut con)
            .await?;
        Ok(())
    }

    async fn take_classification(&self, number: i32) -> Result<Classification, Error> {
        timer!("take_classification()", verbose);

        let mut con = self.pool.get().await?;
        let genesis_key = block_key("GENESIS", number);
        let problematic_key = block_key("PROBLEMATIC", number);
        let mut genesis: Vec<String> = cmd("SMEMBERS")
            .arg(&genesis_key)
            .query_async(&mut con)
            .await?;
        let mut problematic: Vec<String> = cmd("SMEMBERS")
            .arg(&problematic_key)
            .query_async(&mut con)
            .await?;
        cmd("DEL")
            .arg(&genesis_key)
            .arg(&problematic_key)
            .arg(block_key("UNITS-DONE", number))
            .query_async::<_, ()>(&mut con)
            .await?;
        genesis.sort();
        problematic.sort();
        Ok(Classification {
            genesis,
            problematic,
        })
    }

    async fn reset_block(&self, number: i32) -> Result<(), Error> {
        let mut con = self.pool.get().await?;
        cmd("DEL")
            .arg(block_key("GENESIS", number))
            .arg(block_key("PROBLEMATIC", number))
            .arg(block_key("UNITS-DONE", number))
            .arg(block_key("FINALIZED", number))
            .query_async::<_, ()>(&mut con)
            .await?;
        Ok(())
    }

    async fn acquire_run_flag(&self, name: &str, ttl: Duration) -> Result<bool, Error> {
        let mut con = self.pool.get().await?;
        let set: Option<String> = cmd("SET")
            .arg(key(name))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut con)
            .await?;
        Ok(set.is_some())
    }

    async fn release_run_flag(&self, name: &str) -> Result<(), Error> {
        let mut con = self.pool.get().await?;
        cmd("DEL")
            .arg(key(name))
            .query_async::<_, ()>(&mut con)
            .await?;
        Ok(())
    }

    async fn record_chain_failure(&self) -> Result<u64, Error> {
        let mut con = self.pool.get().await?;
        let failures: u64 = cmd("INCR")
            .arg(key("CHAIN-QUERY-FAILURES"))
            .query_async(&mut con)
            .await?;
        Ok(failures)
    }

    async fn reset_chain_failures(&self) -> Result<(), Error> {
        let mut con = self.pool.get().await?;
        cmd("DEL")
            .arg(key("CHAIN-QUERY-FAILURES"))
            .query_async::<_, ()>(&mut con)
            .await?;
        Ok(())
    }
}

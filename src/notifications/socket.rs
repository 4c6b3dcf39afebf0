use async_trait::async_trait;
use std::sync::Arc;

use super::destinations::{DeliveryOutcome, Destination};
use super::payload::{NotificationPayload, TransactionEvent};
use crate::error::Error;
use crate::models::normalize_address;
use crate::redis::{cmd, RedisPoolWithStats};

const ROOM_CHANNEL_PREFIX: &str = "watchtower:room:";

#[async_trait]
pub trait RoomPublisher: Send + Sync {
    async fn publish(&self, room: &str, message: &str) -> Result<(), Error>;
}

pub struct RedisRoomPublisher {
    pool: RedisPoolWithStats,
}

impl RedisRoomPublisher {
    pub fn new(pool: RedisPoolWithStats) -> Self {
        RedisRoomPublisher { pool }
    }
}

#[async_trait]
impl RoomPublisher for RedisRoomPublisher {
    async fn publish(&self, room: &str, message: &str) -> Result<(), Error> {
        let mut con = self.pool.get().await?;
        cmd("PUBLISH")
            .arg(format!("{}{}", ROOM_CHANNEL_PREFIX, room))
            .arg(message)
            .query_async::<_, ()>(&mut con)
            .await?;
        Ok(())
    }
}

/// The address room, plus an address+token room for overlay tokens.
pub fn rooms(address: &str, tokenid: &str) -> Vec<String> {
    let address_room = normalize_address(address);
    if tokenid.is_empty() {
        vec![address_room]
    } else {
        let token_room = format!("{}_{}", address_room, tokenid.to_ascii_lowercase());
        vec![address_room, token_room]
    }
}

pub struct SocketDestination {
    publisher: Arc<dyn RoomPublisher>,
}

impl SocketDestination {
    pub fn new(publisher: Arc<dyn RoomPublisher>) -> Self {
        SocketDestination { publisher }
    }
}

#[async_trait]
impl Destination for SocketDestination {
    fn kind(&self) -> &'static str {
        "socket"
    }

    async fn deliver(
        &self,
        event: &TransactionEvent,
        payload: &NotificationPayload,
    ) -> DeliveryOutcome {
        let message = match serde_json::to_string(payload) {
            Ok(message) => message,
            Err(err) => return DeliveryOutcome::PermanentFailure(err.to_string()),
        };
        for room in rooms(&event.address.address, &event.token.tokenid) {
            if let Err(err) = self.publisher.publish(&room, &message).await {
                return DeliveryOutcome::TransientFailure(err.to_string());
            }
        }
        DeliveryOutcome::Delivered
    }
}

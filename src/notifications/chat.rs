use async_trait::async_trait;
use reqwest::{Client, ClientBuilder, StatusCode};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wavesexchange_log::debug;

use super::destinations::{DeliveryOutcome, Destination};
use super::payload::{NotificationPayload, TransactionEvent};
use crate::error::Error;

#[async_trait]
pub trait ChatSender: Send + Sync {
    fn platform(&self) -> &'static str;

    async fn send(&self, chat_id: &str, text: &str) -> DeliveryOutcome;
}

fn classify_status(status: StatusCode) -> DeliveryOutcome {
    if status.is_success() {
        DeliveryOutcome::Delivered
    } else if matches!(
        status,
        StatusCode::BAD_REQUEST | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
    ) {
        DeliveryOutcome::PermanentFailure(format!("chat api responded {}", status))
    } else {
        DeliveryOutcome::TransientFailure(format!("chat api responded {}", status))
    }
}

fn http_client(timeout: Duration) -> Result<Client, Error> {
    Ok(ClientBuilder::new()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()?)
}

pub struct TelegramSender {
    http_client: Client,
    api_url: String,
    bot_token: String,
}

impl TelegramSender {
    pub fn new(api_url: &str, bot_token: String, timeout: Duration) -> Result<Self, Error> {
        Ok(Self {
            http_client: http_client(timeout)?,
            api_url: api_url.trim_end_matches('/').to_owned(),
            bot_token,
        })
    }
}

#[async_trait]
impl ChatSender for TelegramSender {
    fn platform(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, chat_id: &str, text: &str) -> DeliveryOutcome {
        let url = format!("{}/bot{}/sendMessage", self.api_url, self.bot_token);
        let body = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        debug!("sending telegram message to {}", chat_id);
        match self.http_client.post(url).json(&body).send().await {
            Ok(res) => classify_status(res.status()),
            Err(err) => DeliveryOutcome::TransientFailure(err.to_string()),
        }
    }
}

pub struct SlackSender {
    http_client: Client,
    api_url: String,
    bot_token: String,
}

impl SlackSender {
    pub fn new(api_url: &str, bot_token: String, timeout: Duration) -> Result<Self, Error> {
        Ok(Self {
            http_client: http_client(timeout)?,
            api_url: api_url.trim_end_matches('/').to_owned(),
            bot_token,
        })
    }
}

#[async_trait]
impl ChatSender for SlackSender {
    fn platform(&self) -> &'static str {
        "slack"
    }

    async fn send(&self, channel: &str, text: &str) -> DeliveryOutcome {
        let url = format!("{}/chat.postMessage", self.api_url);
        let body = json!({ "channel": channel, "text": text });
        debug!("sending slack message to {}", channel);
        match self
            .http_client
            .post(url)
            .bearer_auth(&self.bot_token)
            .json(&body)
            .send()
            .await
        {
            Ok(res) => classify_status(res.status()),
            Err(err) => DeliveryOutcome::TransientFailure(err.to_string()),
        }
    }
}

pub fn compose_message(event: &TransactionEvent) -> String {
    let mut text = format!(
        "{} {} received at {}\n{}",
        event.transaction.amount,
        event.token.ticker_or_name(),
        event.address.address,
        event.transaction.txid
    );
    if let Some(block) = event.block {
        text.push_str(&format!("\nblock {}", block));
    }
    text
}

pub struct ChatDestination {
    sender: Arc<dyn ChatSender>,
    chat_id: String,
}

impl ChatDestination {
    pub fn new(sender: Arc<dyn ChatSender>, chat_id: String) -> Self {
        ChatDestination { sender, chat_id }
    }
}

#[async_trait]
impl Destination for ChatDestination {
    fn kind(&self) -> &'static str {
        self.sender.platform()
    }

    async fn deliver(
        &self,
        event: &TransactionEvent,
        _payload: &NotificationPayload,
    ) -> DeliveryOutcome {
        self.sender.send(&self.chat_id, &compose_message(event)).await
    }
}

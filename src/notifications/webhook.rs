use async_trait::async_trait;
use reqwest::{Client, ClientBuilder};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use wavesexchange_log::debug;

use super::destinations::{DeliveryOutcome, Destination};
use super::payload::{NotificationPayload, TransactionEvent};
use crate::error::Error;

/// Statuses after which a webhook is considered gone.
const PERMANENT_STATUSES: [u16; 3] = [404, 502, 522];

#[derive(Clone, Debug, PartialEq)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: Value,
}

#[async_trait]
pub trait WebhookClient: Send + Sync {
    async fn post_json(&self, url: &str, body: &Value) -> Result<WebhookResponse, Error>;
}

pub struct ReqwestWebhookClient {
    http_client: Client,
}

impl ReqwestWebhookClient {
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        Ok(Self {
            http_client: ClientBuilder::new()
                .timeout(timeout)
                .connect_timeout(timeout)
                .build()?,
        })
    }
}

#[async_trait]
impl WebhookClient for ReqwestWebhookClient {
    async fn post_json(&self, url: &str, body: &Value) -> Result<WebhookResponse, Error> {
        let res = self.http_client.post(url).json(body).send().await?;
        let status = res.status().as_u16();
        let text = res.text().await?;
        debug!("webhook url = {}, status = {}", url, status);
        Ok(WebhookResponse {
            status,
            // Non-JSON bodies simply carry no success flag.
            body: serde_json::from_str(&text).unwrap_or(Value::Null),
        })
    }
}

pub fn classify(response: &WebhookResponse) -> DeliveryOutcome {
    if response.status == 200 {
        if response.body.get("success").and_then(Value::as_bool) == Some(true) {
            DeliveryOutcome::Delivered
        } else {
            DeliveryOutcome::TransientFailure("200 without a success flag".into())
        }
    } else if PERMANENT_STATUSES.contains(&response.status) {
        DeliveryOutcome::PermanentFailure(format!("webhook responded {}", response.status))
    } else {
        DeliveryOutcome::TransientFailure(format!("webhook responded {}", response.status))
    }
}

pub struct WebhookDestination {
    client: Arc<dyn WebhookClient>,
    recipient_id: i64,
    url: String,
}

impl WebhookDestination {
    pub fn new(client: Arc<dyn WebhookClient>, recipient_id: i64, url: String) -> Self {
        WebhookDestination {
            client,
            recipient_id,
            url,
        }
    }
}

#[async_trait]
impl Destination for WebhookDestination {
    fn kind(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(
        &self,
        _event: &TransactionEvent,
        payload: &NotificationPayload,
    ) -> DeliveryOutcome {
        let body = match serde_json::to_value(payload) {
            Ok(body) => body,
            Err(err) => return DeliveryOutcome::PermanentFailure(err.to_string()),
        };
        match self.client.post_json(&self.url, &body).await {
            Ok(response) => classify(&response),
            Err(err) => DeliveryOutcome::TransientFailure(err.to_string()),
        }
    }

    fn acknowledges(&self) -> bool {
        true
    }

    fn invalidates(&self) -> Option<i64> {
        Some(self.recipient_id)
    }
}

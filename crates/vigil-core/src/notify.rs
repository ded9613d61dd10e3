//! Review-outcome notifications for message owners.
//!
//! Events fan out on an in-process broadcast channel (the gateway streams them to clients) and, when a
//! webhook URL is configured, are also POSTed there without blocking the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::shared::ReviewAction;

const CHANNEL_CAPACITY: usize = 100;
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub chat_id: String,
    /// Owner of the reviewed message; the only non-admin recipient.
    pub user_id: String,
    pub action: ReviewAction,
    pub response_label: String,
    #[serde(default)]
    pub admin_response: Option<String>,
    #[serde(default)]
    pub message_id: Option<Uuid>,
    pub anomaly_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(
        chat_id: impl Into<String>,
        user_id: impl Into<String>,
        action: ReviewAction,
        anomaly_id: Uuid,
    ) -> Self {
        Self {
            chat_id: chat_id.into(),
            user_id: user_id.into(),
            action,
            response_label: action.response_label().to_string(),
            admin_response: None,
            message_id: None,
            anomaly_id,
            timestamp: Utc::now(),
        }
    }
}

/// Delivery is best-effort: failures are logged, never surfaced to the review that triggered them.
pub trait NotificationDispatcher: Send + Sync {
    fn dispatch(&self, event: NotificationEvent);
}

pub struct Notifier {
    tx: broadcast::Sender<NotificationEvent>,
    webhook_url: Option<String>,
    webhook_client: Option<reqwest::Client>,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let webhook_url = webhook_url.filter(|s| !s.trim().is_empty());
        let webhook_client = webhook_url
            .as_ref()
            .and_then(|_| reqwest::Client::builder().timeout(WEBHOOK_TIMEOUT).build().ok());
        if webhook_url.is_some() && webhook_client.is_none() {
            warn!(target: "vigil::notify", "Webhook URL set but HTTP client failed to build; webhook disabled");
        }
        Self { tx, webhook_url, webhook_client }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.tx.subscribe()
    }

    fn send_webhook(&self, event: &NotificationEvent) {
        let (Some(url), Some(client)) = (self.webhook_url.clone(), self.webhook_client.clone()) else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(target: "vigil::notify", anomaly_id = %event.anomaly_id, "No async runtime; webhook skipped");
            return;
        };
        let payload = event.clone();
        handle.spawn(async move {
            match client.post(&url).json(&payload).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(target: "vigil::notify", anomaly_id = %payload.anomaly_id, "Webhook notification sent");
                }
                Ok(resp) => {
                    warn!(target: "vigil::notify", status = %resp.status(), "Webhook returned non-success");
                }
                Err(e) => {
                    error!(target: "vigil::notify", "Webhook POST failed: {}", e);
                }
            }
        });
    }
}

impl NotificationDispatcher for Notifier {
    fn dispatch(&self, event: NotificationEvent) {
        self.send_webhook(&event);
        let receivers = self.tx.receiver_count();
        // Err only means nobody is listening.
        let _ = self.tx.send(event.clone());
        info!(
            target: "vigil::notify",
            chat_id = %event.chat_id,
            user_id = %event.user_id,
            action = event.action.as_str(),
            receivers,
            "Review notification dispatched"
        );
    }
}

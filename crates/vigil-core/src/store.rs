//! Persistence for messages, anomaly records and feedback telemetry.
//!
//! Records are JSON-encoded into sled trees. Status transitions go through compare-and-swap so two writers
//! racing on the same record cannot both win.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

use crate::shared::{AnomalyLog, AnomalyStatus, AnomalyType, DetectionLayer, Message, ReviewAction, Severity};

const MESSAGES_TREE: &str = "messages";
const CHAT_INDEX_TREE: &str = "chat_index";
const ANOMALIES_TREE: &str = "anomalies";
const FEEDBACK_TREE: &str = "feedback";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),
    #[error("record encoding error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("message {0} not found")]
    MissingMessage(Uuid),
}

/// Filter for anomaly listings. Empty filter matches everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnomalyFilter {
    #[serde(default)]
    pub status: Option<AnomalyStatus>,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub anomaly_type: Option<AnomalyType>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl AnomalyFilter {
    pub fn pending() -> Self {
        Self { status: Some(AnomalyStatus::Pending), ..Self::default() }
    }

    fn matches(&self, log: &AnomalyLog) -> bool {
        self.status.map_or(true, |s| log.status == s)
            && self.severity.map_or(true, |s| log.severity == s)
            && self.anomaly_type.map_or(true, |t| log.anomaly_type == t)
            && self.user_id.as_deref().map_or(true, |u| log.user_id == u)
    }
}

/// Telemetry written once per applied review outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub anomaly_id: Uuid,
    pub message_id: Uuid,
    pub action: ReviewAction,
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub layer: DetectionLayer,
    pub reviewer: String,
    #[serde(default)]
    pub notes: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Storage contract the core needs: plain puts for new records, compare-and-swap for mutations,
/// and creation-ordered retrieval.
pub trait ModerationStore: Send + Sync {
    fn put_message(&self, message: &Message) -> Result<(), StoreError>;

    fn message(&self, id: Uuid) -> Result<Option<Message>, StoreError>;

    /// Messages of one chat, oldest first.
    fn chat_messages(&self, chat_id: &str) -> Result<Vec<Message>, StoreError>;

    /// Replaces `current` with `next` only if the stored record still equals `current`.
    fn swap_message(&self, current: &Message, next: &Message) -> Result<bool, StoreError>;

    fn put_anomaly(&self, log: &AnomalyLog) -> Result<(), StoreError>;

    fn anomaly(&self, id: Uuid) -> Result<Option<AnomalyLog>, StoreError>;

    /// Replaces `current` with `next` only if the stored record still equals `current`.
    fn swap_anomaly(&self, current: &AnomalyLog, next: &AnomalyLog) -> Result<bool, StoreError>;

    /// Matching anomalies, newest first.
    fn anomalies(&self, filter: &AnomalyFilter) -> Result<Vec<AnomalyLog>, StoreError>;

    fn record_feedback(&self, record: &FeedbackRecord) -> Result<(), StoreError>;

    /// Most recent feedback records, newest first.
    fn feedback(&self, limit: usize) -> Result<Vec<FeedbackRecord>, StoreError>;
}

fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(value)?)
}

fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Sortable key: zero-padded creation time in nanoseconds, then the id.
fn time_key(at: &DateTime<Utc>, id: Uuid) -> String {
    let nanos = at.timestamp_nanos_opt().unwrap_or_else(|| at.timestamp_micros().saturating_mul(1_000));
    format!("{:020}_{}", nanos.max(0), id)
}

/// Index prefix for one chat. The length header keeps `a` from prefix-matching `a/b`.
fn chat_prefix(chat_id: &str) -> String {
    format!("{:08x}:{}/", chat_id.len(), chat_id)
}

fn chat_index_key(chat_id: &str, at: &DateTime<Utc>, id: Uuid) -> String {
    format!("{}{}", chat_prefix(chat_id), time_key(at, id))
}

pub struct SledModerationStore {
    db: sled::Db,
    messages: sled::Tree,
    chat_index: sled::Tree,
    anomalies: sled::Tree,
    feedback: sled::Tree,
}

impl SledModerationStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Throw-away database removed on drop.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let store = Self {
            messages: db.open_tree(MESSAGES_TREE)?,
            chat_index: db.open_tree(CHAT_INDEX_TREE)?,
            anomalies: db.open_tree(ANOMALIES_TREE)?,
            feedback: db.open_tree(FEEDBACK_TREE)?,
            db,
        };
        tracing::info!(target: "vigil::store", messages = store.messages.len(), anomalies = store.anomalies.len(), "Moderation store opened");
        Ok(store)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn swap<T: Serialize + DeserializeOwned + PartialEq>(
        tree: &sled::Tree,
        id: Uuid,
        current: &T,
        next: &T,
    ) -> Result<bool, StoreError> {
        let key = id.as_bytes();
        let Some(stored) = tree.get(key)? else {
            return Ok(false);
        };
        let decoded: T = from_bytes(&stored)?;
        if decoded != *current {
            return Ok(false);
        }
        let swapped = tree.compare_and_swap(key, Some(stored), Some(to_bytes(next)?))?;
        Ok(swapped.is_ok())
    }
}

impl ModerationStore for SledModerationStore {
    fn put_message(&self, message: &Message) -> Result<(), StoreError> {
        let prev = self.messages.insert(message.id.as_bytes(), to_bytes(message)?)?;
        if prev.is_none() {
            self.chat_index.insert(
                chat_index_key(&message.chat_id, &message.created_at, message.id).as_bytes(),
                message.id.as_bytes(),
            )?;
        }
        tracing::debug!(
            target: "vigil::store",
            message_id = %message.id,
            chat_id = %message.chat_id,
            action = if prev.is_some() { "UPDATE" } else { "INSERT" },
            "Message stored"
        );
        Ok(())
    }

    fn message(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        self.messages.get(id.as_bytes())?.map(|b| from_bytes(&b)).transpose()
    }

    fn chat_messages(&self, chat_id: &str) -> Result<Vec<Message>, StoreError> {
        let prefix = chat_prefix(chat_id);
        let mut out = Vec::new();
        for entry in self.chat_index.scan_prefix(prefix.as_bytes()) {
            let (_, id_bytes) = entry?;
            if let Some(bytes) = self.messages.get(&id_bytes)? {
                out.push(from_bytes::<Message>(&bytes)?);
            }
        }
        Ok(out)
    }

    fn swap_message(&self, current: &Message, next: &Message) -> Result<bool, StoreError> {
        Self::swap(&self.messages, current.id, current, next)
    }

    fn put_anomaly(&self, log: &AnomalyLog) -> Result<(), StoreError> {
        self.anomalies.insert(log.id.as_bytes(), to_bytes(log)?)?;
        tracing::debug!(target: "vigil::store", anomaly_id = %log.id, message_id = %log.message_id, "Anomaly stored");
        Ok(())
    }

    fn anomaly(&self, id: Uuid) -> Result<Option<AnomalyLog>, StoreError> {
        self.anomalies.get(id.as_bytes())?.map(|b| from_bytes(&b)).transpose()
    }

    fn swap_anomaly(&self, current: &AnomalyLog, next: &AnomalyLog) -> Result<bool, StoreError> {
        Self::swap(&self.anomalies, current.id, current, next)
    }

    fn anomalies(&self, filter: &AnomalyFilter) -> Result<Vec<AnomalyLog>, StoreError> {
        let mut out = Vec::new();
        for entry in self.anomalies.iter() {
            let (_, bytes) = entry?;
            let log: AnomalyLog = from_bytes(&bytes)?;
            if filter.matches(&log) {
                out.push(log);
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn record_feedback(&self, record: &FeedbackRecord) -> Result<(), StoreError> {
        let key = time_key(&record.recorded_at, record.anomaly_id);
        self.feedback.insert(key.as_bytes(), to_bytes(record)?)?;
        Ok(())
    }

    fn feedback(&self, limit: usize) -> Result<Vec<FeedbackRecord>, StoreError> {
        self.feedback
            .iter()
            .rev()
            .take(limit)
            .map(|entry| {
                let (_, bytes) = entry?;
                from_bytes(&bytes)
            })
            .collect()
    }
}

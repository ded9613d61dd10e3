//! Anomaly lifecycle: opens review cases for escalated messages and applies human decisions.
//!
//! Resolution is a two-step protocol:
//! 1. Decide: compare-and-swap the anomaly from `pending` to its terminal status with the reviewer record.
//!    Exactly one reviewer can win this step.
//! 2. Apply: rewrite the message for the outcome, then flip `feedback_applied`. Whoever flips the flag
//!    records telemetry and notifies the owner. Both writes are idempotent, so a crash between them is
//!    repaired by [`AnomalyLifecycle::recover_unapplied`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::detection::{DetectionReport, SemanticReview, Verdict};
use crate::notify::{NotificationDispatcher, NotificationEvent};
use crate::shared::{
    AnomalyLog, AnomalyStatus, AnomalyType, DetectionLayer, Finding, Identity, Message, ReviewAction, ReviewRecord,
    Severity,
};
use crate::store::{AnomalyFilter, FeedbackRecord, ModerationStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("admin role required")]
    Forbidden,
    #[error("record {0} not found")]
    NotFound(Uuid),
    #[error("anomaly already resolved as {status}")]
    AlreadyResolved { status: AnomalyStatus },
    #[error("a correction requires a non-empty admin response")]
    MissingAdminResponse,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRequest {
    pub action: ReviewAction,
    #[serde(default)]
    pub admin_response: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl ReviewRequest {
    pub fn approve() -> Self {
        Self { action: ReviewAction::Approve, admin_response: None, notes: None }
    }

    pub fn block() -> Self {
        Self { action: ReviewAction::Block, admin_response: None, notes: None }
    }

    pub fn correct(admin_response: impl Into<String>) -> Self {
        Self { action: ReviewAction::Correct, admin_response: Some(admin_response.into()), notes: None }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub status: AnomalyStatus,
    pub anomaly_id: Uuid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationStats {
    pub total: usize,
    pub by_status: BTreeMap<AnomalyStatus, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_type: BTreeMap<AnomalyType, usize>,
    pub by_layer: BTreeMap<DetectionLayer, usize>,
    /// Resolved but the outcome has not reached the message yet.
    pub unapplied: usize,
}

pub struct AnomalyLifecycle {
    store: Arc<dyn ModerationStore>,
    dispatcher: Arc<dyn NotificationDispatcher>,
}

impl AnomalyLifecycle {
    pub fn new(store: Arc<dyn ModerationStore>, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    pub fn store(&self) -> &Arc<dyn ModerationStore> {
        &self.store
    }

    /// Withholds `message`, persists it, and opens one pending anomaly for the detection event.
    /// The message is written first so a log never points at a missing message.
    pub fn open_case(
        &self,
        message: &mut Message,
        report: &DetectionReport,
        semantic: Option<&SemanticReview>,
    ) -> Result<AnomalyLog, StoreError> {
        let mut details = report.findings.clone();
        if let Some(review) = semantic {
            details.extend(review.findings());
        }
        let primary = details.iter().reduce(|best, f| if f.severity() > best.severity() { f } else { best });
        let anomaly_type = primary.map(Finding::anomaly_type).unwrap_or(AnomalyType::PolicyViolation);
        let mut severity = primary.map(Finding::severity).unwrap_or(Severity::Medium);
        if let Some(review) = semantic {
            severity = severity.max(review.analysis.risk_level);
        }

        message.safety_score = Some(report.safety_score);
        message.is_pending_review = true;
        message.is_blocked = true;
        message.is_warning = false;
        if let Some(review) = semantic {
            message.accuracy_score = Some(review.accuracy_score);
            message.semantic_analysis = Some(review.analysis.clone());
        }
        self.store.put_message(message)?;

        let log = AnomalyLog {
            id: Uuid::new_v4(),
            user_id: message.user_id.clone(),
            chat_id: message.chat_id.clone(),
            message_id: message.id,
            anomaly_type,
            severity,
            layer: if semantic.is_some() { DetectionLayer::Semantic } else { DetectionLayer::Deterministic },
            detection_details: details,
            safety_score: report.safety_score,
            accuracy_score: semantic.map(|r| r.accuracy_score),
            user_emotion: report.emotion,
            emotion_intensity: report.intensity,
            status: AnomalyStatus::Pending,
            review: None,
            admin_response: None,
            feedback_applied: false,
            created_at: Utc::now(),
        };
        self.store.put_anomaly(&log)?;
        info!(
            target: "vigil::review",
            anomaly_id = %log.id,
            message_id = %log.message_id,
            chat_id = %log.chat_id,
            anomaly_type = ?log.anomaly_type,
            severity = ?log.severity,
            layer = ?log.layer,
            blocked = report.verdict == Verdict::Block,
            "Anomaly case opened"
        );
        Ok(log)
    }

    /// Records an admin decision on a pending anomaly and applies it to the message.
    pub fn resolve(
        &self,
        reviewer: &Identity,
        anomaly_id: Uuid,
        request: ReviewRequest,
    ) -> Result<Resolution, ReviewError> {
        if !reviewer.is_admin() {
            warn!(target: "vigil::review", anomaly_id = %anomaly_id, reviewer = %reviewer.user_id, "Non-admin review rejected");
            return Err(ReviewError::Forbidden);
        }
        let admin_response = match request.action {
            ReviewAction::Correct => {
                let text = request.admin_response.as_deref().map(str::trim).unwrap_or_default();
                if text.is_empty() {
                    return Err(ReviewError::MissingAdminResponse);
                }
                Some(text.to_string())
            }
            _ => None,
        };

        let decided = loop {
            let current = self.store.anomaly(anomaly_id)?.ok_or(ReviewError::NotFound(anomaly_id))?;
            if current.status.is_terminal() {
                info!(target: "vigil::review", anomaly_id = %anomaly_id, status = %current.status, "Review rejected: already resolved");
                return Err(ReviewError::AlreadyResolved { status: current.status });
            }
            let mut next = current.clone();
            next.status = request.action.target_status();
            next.review = Some(ReviewRecord {
                reviewer: reviewer.user_id.clone(),
                reviewed_at: Utc::now(),
                notes: request.notes.clone(),
            });
            next.admin_response = admin_response.clone();
            if self.store.swap_anomaly(&current, &next)? {
                break next;
            }
        };
        info!(
            target: "vigil::review",
            anomaly_id = %anomaly_id,
            action = request.action.as_str(),
            reviewer = %reviewer.user_id,
            "Anomaly resolved"
        );

        self.apply_feedback(&decided)?;
        Ok(Resolution { status: decided.status, anomaly_id })
    }

    /// Re-applies decisions whose second step never completed. Safe to run at any time.
    pub fn recover_unapplied(&self) -> Result<usize, ReviewError> {
        let mut applied = 0;
        for log in self.store.anomalies(&AnomalyFilter::default())? {
            if log.status.is_terminal() && !log.feedback_applied && self.apply_feedback(&log)? {
                applied += 1;
            }
        }
        if applied > 0 {
            info!(target: "vigil::review", applied, "Recovered unapplied review outcomes");
        }
        Ok(applied)
    }

    /// Marks the message's review notification as read. Owner or admin only.
    pub fn acknowledge_notification(&self, caller: &Identity, message_id: Uuid) -> Result<Message, ReviewError> {
        let message = self.store.message(message_id)?.ok_or(ReviewError::NotFound(message_id))?;
        if message.user_id != caller.user_id && !caller.is_admin() {
            return Err(ReviewError::Forbidden);
        }
        Ok(self.update_message(message_id, |m| {
            if m.notification_read {
                return false;
            }
            m.notification_read = true;
            true
        })?)
    }

    pub fn get(&self, anomaly_id: Uuid) -> Result<Option<AnomalyLog>, ReviewError> {
        Ok(self.store.anomaly(anomaly_id)?)
    }

    /// Review queue, newest first.
    pub fn pending(&self, limit: usize) -> Result<Vec<AnomalyLog>, ReviewError> {
        let filter = AnomalyFilter { limit: Some(limit), ..AnomalyFilter::pending() };
        Ok(self.store.anomalies(&filter)?)
    }

    pub fn list(&self, filter: &AnomalyFilter) -> Result<Vec<AnomalyLog>, ReviewError> {
        Ok(self.store.anomalies(filter)?)
    }

    pub fn stats(&self) -> Result<ModerationStats, ReviewError> {
        let mut stats = ModerationStats::default();
        for log in self.store.anomalies(&AnomalyFilter::default())? {
            stats.total += 1;
            *stats.by_status.entry(log.status).or_default() += 1;
            *stats.by_severity.entry(log.severity).or_default() += 1;
            *stats.by_type.entry(log.anomaly_type).or_default() += 1;
            *stats.by_layer.entry(log.layer).or_default() += 1;
            if log.status.is_terminal() && !log.feedback_applied {
                stats.unapplied += 1;
            }
        }
        Ok(stats)
    }

    /// Second step of resolution. Returns true only for the caller that marked the feedback applied.
    fn apply_feedback(&self, decided: &AnomalyLog) -> Result<bool, StoreError> {
        let Some(action) = ReviewAction::from_status(decided.status) else {
            return Ok(false);
        };
        let reviewer = decided.review.as_ref().map(|r| r.reviewer.clone()).unwrap_or_default();
        let message = self.update_message(decided.message_id, |m| apply_outcome(m, action, decided, &reviewer))?;

        loop {
            let Some(current) = self.store.anomaly(decided.id)? else {
                return Ok(false);
            };
            if current.feedback_applied {
                return Ok(false);
            }
            let mut next = current.clone();
            next.feedback_applied = true;
            if self.store.swap_anomaly(&current, &next)? {
                break;
            }
        }

        let notes = decided.review.as_ref().and_then(|r| r.notes.clone());
        self.store.record_feedback(&FeedbackRecord {
            anomaly_id: decided.id,
            message_id: decided.message_id,
            action,
            anomaly_type: decided.anomaly_type,
            severity: decided.severity,
            layer: decided.layer,
            reviewer: reviewer.clone(),
            notes,
            recorded_at: Utc::now(),
        })?;
        info!(
            target: "vigil::feedback",
            anomaly_id = %decided.id,
            message_id = %decided.message_id,
            action = action.as_str(),
            anomaly_type = ?decided.anomaly_type,
            layer = ?decided.layer,
            reviewer = %reviewer,
            "Review feedback applied"
        );

        let mut event = NotificationEvent::new(&message.chat_id, &message.user_id, action, decided.id);
        event.message_id = Some(message.id);
        event.admin_response = decided.admin_response.clone();
        self.dispatcher.dispatch(event);
        Ok(true)
    }

    /// Compare-and-swap loop over one message. `change` returns false when there is nothing to write.
    fn update_message<F>(&self, message_id: Uuid, mut change: F) -> Result<Message, StoreError>
    where
        F: FnMut(&mut Message) -> bool,
    {
        loop {
            let current = self.store.message(message_id)?.ok_or(StoreError::MissingMessage(message_id))?;
            let mut next = current.clone();
            if !change(&mut next) {
                return Ok(current);
            }
            if self.store.swap_message(&current, &next)? {
                return Ok(next);
            }
        }
    }
}

/// Message effect of a decision. Idempotent: replaying an applied outcome changes nothing.
fn apply_outcome(m: &mut Message, action: ReviewAction, log: &AnomalyLog, reviewer: &str) -> bool {
    let before = m.clone();
    match action {
        ReviewAction::Approve => {
            m.is_blocked = false;
            m.is_warning = false;
            m.is_pending_review = false;
        }
        ReviewAction::Block => {
            m.is_pending_review = false;
            m.is_blocked = true;
        }
        ReviewAction::Correct => {
            if m.correction_anomaly_id == Some(log.id) {
                return false;
            }
            let Some(response) = log.admin_response.clone() else {
                return false;
            };
            // An earlier correction already holds the pre-correction text.
            if m.original_content.is_none() {
                m.original_content = Some(m.content.clone());
            }
            m.content = response;
            m.is_admin_corrected = true;
            m.corrected_by = Some(reviewer.to_string());
            m.corrected_at = log.review.as_ref().map(|r| r.reviewed_at).or_else(|| Some(Utc::now()));
            m.correction_anomaly_id = Some(log.id);
            m.is_blocked = false;
            m.is_warning = false;
            m.is_pending_review = false;
            m.has_notification = true;
            m.notification_read = false;
        }
    }
    *m != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::{Emotion, Intensity, PiiKind, Role};

    fn pending_log(message: &Message) -> AnomalyLog {
        AnomalyLog {
            id: Uuid::new_v4(),
            user_id: message.user_id.clone(),
            chat_id: message.chat_id.clone(),
            message_id: message.id,
            anomaly_type: AnomalyType::PiiLeak,
            severity: Severity::High,
            layer: DetectionLayer::Deterministic,
            detection_details: vec![Finding::PiiLeak { pii: PiiKind::Ssn, excerpt: "***-**-6789".into() }],
            safety_score: 55,
            accuracy_score: None,
            user_emotion: Emotion::Neutral,
            emotion_intensity: Intensity::Low,
            status: AnomalyStatus::Corrected,
            review: Some(ReviewRecord { reviewer: "admin-1".into(), reviewed_at: Utc::now(), notes: None }),
            admin_response: Some("Safer answer.".into()),
            feedback_applied: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn correction_replay_is_a_no_op() {
        let mut m = Message::new("c", "u", Role::Assistant, "risky text");
        m.is_blocked = true;
        m.is_pending_review = true;
        let log = pending_log(&m);
        assert!(apply_outcome(&mut m, ReviewAction::Correct, &log, "admin-1"));
        let snapshot = m.clone();
        assert!(!apply_outcome(&mut m, ReviewAction::Correct, &log, "admin-1"));
        assert_eq!(m, snapshot);
        assert_eq!(m.original_content.as_deref(), Some("risky text"));
    }

    #[test]
    fn later_correction_keeps_first_original() {
        let mut m = Message::new("c", "u", Role::Assistant, "first draft");
        let first = pending_log(&m);
        apply_outcome(&mut m, ReviewAction::Correct, &first, "admin-1");
        let mut second = pending_log(&m);
        second.admin_response = Some("Even safer.".into());
        assert!(apply_outcome(&mut m, ReviewAction::Correct, &second, "admin-2"));
        assert_eq!(m.content, "Even safer.");
        assert_eq!(m.original_content.as_deref(), Some("first draft"));
        assert_eq!(m.corrected_by.as_deref(), Some("admin-2"));
    }

    #[test]
    fn block_keeps_content_and_blocked_flag() {
        let mut m = Message::new("c", "u", Role::Assistant, "text");
        m.is_blocked = true;
        m.is_pending_review = true;
        let log = pending_log(&m);
        apply_outcome(&mut m, ReviewAction::Block, &log, "admin-1");
        assert!(m.is_blocked);
        assert!(!m.is_pending_review);
        assert_eq!(m.content, "text");
    }
}

//! Moderation pipeline: runs messages through detection and hands escalated ones to the lifecycle.

use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::detection::{DetectionContext, DetectionReport, DeterministicDetector, SemanticDetector, SemanticReview, Verdict};
use crate::generation::GenerationClient;
use crate::lifecycle::AnomalyLifecycle;
use crate::provider::ChatMessage;
use crate::shared::{AnomalyLog, Attachment, Identity, Message, Role};
use crate::store::StoreError;

const STORE_FAILURE_MESSAGE: &str = "The response could not be saved. Please try again.";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationOutcome {
    pub message: Message,
    pub report: DetectionReport,
    pub anomaly: Option<AnomalyLog>,
}

impl ModerationOutcome {
    pub fn verdict(&self) -> Verdict {
        self.report.verdict
    }
}

#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// Only emitted for replies that passed moderation.
    Fragment(String),
    /// Terminal. The persisted, moderated assistant message.
    Completed(ModerationOutcome),
    /// Terminal. `reason` is safe to show the end user.
    Failed { reason: String },
}

pub type TurnStream = Pin<Box<dyn Stream<Item = TurnEvent> + Send>>;

pub struct ModerationPipeline {
    detector: DeterministicDetector,
    semantic: Option<SemanticDetector>,
    lifecycle: Arc<AnomalyLifecycle>,
    generation: GenerationClient,
}

impl ModerationPipeline {
    pub fn new(
        detector: DeterministicDetector,
        semantic: Option<SemanticDetector>,
        lifecycle: Arc<AnomalyLifecycle>,
        generation: GenerationClient,
    ) -> Self {
        Self { detector, semantic, lifecycle, generation }
    }

    pub fn lifecycle(&self) -> &Arc<AnomalyLifecycle> {
        &self.lifecycle
    }

    pub fn generation(&self) -> &GenerationClient {
        &self.generation
    }

    /// Layer-1 scan. A scan failure blocks the message instead of passing it.
    pub fn scan(&self, text: &str, ctx: &DetectionContext) -> DetectionReport {
        match self.detector.detect(text, ctx) {
            Ok(report) => report,
            Err(e) => {
                error!(target: "vigil::detect", error = %e, role = ctx.role.as_str(), "Deterministic scan failed; failing closed");
                DetectionReport::fail_closed(&e)
            }
        }
    }

    /// Screens and stores a user message. Semantic review is not run: it judges replies, not queries.
    pub fn screen_user_message(
        &self,
        identity: &Identity,
        chat_id: &str,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> Result<ModerationOutcome, StoreError> {
        let report = self.scan(content, &DetectionContext::user());
        let message = Message::new(chat_id, &identity.user_id, Role::User, content).with_attachments(attachments);
        self.settle(message, report, None)
    }

    /// Screens and stores an assistant reply to `query`. Held replies get an advisory semantic review first.
    pub async fn moderate_reply(
        &self,
        identity: &Identity,
        chat_id: &str,
        query: &str,
        reply: &str,
    ) -> Result<ModerationOutcome, StoreError> {
        let report = self.scan(reply, &DetectionContext::assistant());
        let review = match (&self.semantic, report.verdict) {
            (Some(semantic), Verdict::Hold) => match semantic.review(query, reply).await {
                Ok(review) => Some(review),
                Err(e) => {
                    warn!(target: "vigil::semantic", error = %e, chat_id, "Semantic review failed; case stays pending without accuracy score");
                    None
                }
            },
            _ => None,
        };
        let message = Message::new(chat_id, &identity.user_id, Role::Assistant, reply);
        self.settle(message, report, review)
    }

    fn settle(
        &self,
        mut message: Message,
        report: DetectionReport,
        review: Option<SemanticReview>,
    ) -> Result<ModerationOutcome, StoreError> {
        message.safety_score = Some(report.safety_score);
        let anomaly = match report.verdict {
            Verdict::Allow => {
                self.lifecycle.store().put_message(&message)?;
                None
            }
            Verdict::Warn => {
                message.is_warning = true;
                self.lifecycle.store().put_message(&message)?;
                None
            }
            Verdict::Hold | Verdict::Block => Some(self.lifecycle.open_case(&mut message, &report, review.as_ref())?),
        };
        info!(
            target: "vigil::detect",
            message_id = %message.id,
            chat_id = %message.chat_id,
            role = message.role.as_str(),
            verdict = ?report.verdict,
            safety_score = report.safety_score,
            findings = report.findings.len(),
            "Message moderated"
        );
        Ok(ModerationOutcome { message, report, anomaly })
    }

    /// Conversation context for the next turn: the caller's visible messages in this chat, oldest first.
    pub fn history(&self, identity: &Identity, chat_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(self
            .lifecycle
            .store()
            .chat_messages(chat_id)?
            .iter()
            .filter(|m| m.user_id == identity.user_id && m.is_visible())
            .map(ChatMessage::from)
            .collect())
    }

    /// Generates, then moderates, one assistant turn. Fragments are held back until the complete reply
    /// has been scanned and are released only if it is visible; the stream always ends with exactly one
    /// `Completed` or `Failed`.
    pub fn respond(
        self: &Arc<Self>,
        identity: Identity,
        chat_id: String,
        history: Vec<ChatMessage>,
        system_prompt: String,
    ) -> TurnStream {
        let this = Arc::clone(self);
        Box::pin(async_stream::stream! {
            let query = history
                .iter()
                .rev()
                .find(|m| m.role == Role::User.as_str())
                .map(|m| m.content.clone())
                .unwrap_or_default();
            let mut fragments = this.generation.generate_stream(&history, &system_prompt);
            let mut held = Vec::new();
            while let Some(item) = fragments.next().await {
                match item {
                    Ok(fragment) => held.push(fragment),
                    Err(e) => {
                        warn!(target: "vigil::generation", chat_id = %chat_id, error = %e, "Turn generation failed");
                        yield TurnEvent::Failed { reason: e.user_message().to_string() };
                        return;
                    }
                }
            }
            let reply = held.concat();
            match this.moderate_reply(&identity, &chat_id, &query, &reply).await {
                Ok(outcome) => {
                    if outcome.message.is_visible() {
                        for fragment in held {
                            yield TurnEvent::Fragment(fragment);
                        }
                    } else {
                        info!(
                            target: "vigil::detect",
                            chat_id = %chat_id,
                            message_id = %outcome.message.id,
                            fragments = held.len(),
                            "Reply withheld; fragments not released"
                        );
                    }
                    yield TurnEvent::Completed(outcome);
                }
                Err(e) => {
                    error!(target: "vigil::store", chat_id = %chat_id, error = %e, "Failed to persist moderated reply");
                    yield TurnEvent::Failed { reason: STORE_FAILURE_MESSAGE.to_string() };
                }
            }
        })
    }
}

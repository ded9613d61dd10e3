//! Chat endpoints: post a message and stream the moderated reply, list history, generate a title.
//!
//! SSE events on `POST /api/v1/chats/:chat_id/messages`:
//! - `moderation`: the moderated user message, then the moderated assistant reply
//! - `token`: one reply fragment, sent only once the whole reply has passed moderation
//! - `error`: `{ "error": ... }` with a user-facing reason
//! - `done`: end of turn

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::time::Duration;
use vigil_core::{Attachment, Identity, Message, ModerationOutcome, ModerationStore, TurnEvent, Verdict};

use super::message_view;
use crate::error::ApiError;
use crate::identity::Caller;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct PostMessage {
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Deserialize)]
pub struct TitleRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModerationView {
    message: Message,
    verdict: Verdict,
    anomaly_id: Option<uuid::Uuid>,
}

fn moderation_event(outcome: ModerationOutcome, caller: &Identity) -> Event {
    let view = ModerationView {
        verdict: outcome.report.verdict,
        anomaly_id: outcome.anomaly.as_ref().map(|a| a.id),
        message: message_view(outcome.message, caller),
    };
    Event::default()
        .event("moderation")
        .json_data(&view)
        .unwrap_or_else(|e| error_event(&e.to_string()))
}

fn error_event(reason: &str) -> Event {
    Event::default().event("error").data(serde_json::json!({ "error": reason }).to_string())
}

/// POST /api/v1/chats/:chat_id/messages
pub async fn post_message(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(chat_id): Path<String>,
    Json(body): Json<PostMessage>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static>, ApiError> {
    if body.content.trim().is_empty() {
        return Err(ApiError::BadRequest("content must not be empty".into()));
    }
    let pipeline = state.runtime.pipeline.clone();
    let screened = pipeline.screen_user_message(&caller, &chat_id, &body.content, body.attachments)?;
    let proceed = matches!(screened.report.verdict, Verdict::Allow | Verdict::Warn);
    let history = if proceed { pipeline.history(&caller, &chat_id)? } else { Vec::new() };
    let system_prompt = state.runtime.config.system_prompt.clone();

    let stream = async_stream::stream! {
        yield Ok(moderation_event(screened, &caller));
        if proceed {
            let mut turn = pipeline.respond(caller.clone(), chat_id.clone(), history, system_prompt);
            while let Some(event) = turn.next().await {
                match event {
                    TurnEvent::Fragment(fragment) => yield Ok(Event::default().event("token").data(fragment)),
                    TurnEvent::Completed(outcome) => yield Ok(moderation_event(outcome, &caller)),
                    TurnEvent::Failed { reason } => yield Ok(error_event(&reason)),
                }
            }
        }
        yield Ok(Event::default().event("done").data("[DONE]"));
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keepalive")))
}

/// GET /api/v1/chats/:chat_id/messages
pub async fn list_messages(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(chat_id): Path<String>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let messages = state.runtime.lifecycle.store().chat_messages(&chat_id)?;
    let visible = messages
        .into_iter()
        .filter(|m| caller.is_admin() || m.user_id == caller.user_id)
        .map(|m| message_view(m, &caller))
        .collect();
    Ok(Json(visible))
}

/// POST /api/v1/chats/:chat_id/title
pub async fn generate_title(
    State(state): State<AppState>,
    Caller(_caller): Caller,
    Path(chat_id): Path<String>,
    Json(body): Json<TitleRequest>,
) -> Json<serde_json::Value> {
    let title = state.runtime.pipeline.generation().generate_title(&body.message).await;
    tracing::debug!(target: "vigil::gateway", chat_id = %chat_id, "Chat title generated");
    Json(serde_json::json!({ "title": title }))
}

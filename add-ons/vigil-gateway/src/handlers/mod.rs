//! Route handlers. Thin: parse, check identity, forward to the core.

pub mod admin;
pub mod chat;
pub mod notifications;

use axum::Json;
use vigil_core::{Identity, Message};

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "service": "vigil-gateway" }))
}

/// What `caller` may see of `message`. Withheld content and pre-correction text are admin-only.
pub fn message_view(mut message: Message, caller: &Identity) -> Message {
    if caller.is_admin() {
        return message;
    }
    if !message.is_visible() {
        message.content.clear();
    }
    message.original_content = None;
    message
}

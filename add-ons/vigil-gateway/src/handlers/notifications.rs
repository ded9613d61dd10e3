use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::identity::Caller;
use crate::AppState;

/// GET /api/v1/notifications/stream: review outcomes as they happen. Admins see every event,
/// users only events for their own messages.
pub async fn notification_stream(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
    let mut rx = state.runtime.notifier.subscribe();
    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if !caller.is_admin() && event.user_id != caller.user_id {
                        continue;
                    }
                    match Event::default().event("notification").json_data(&event) {
                        Ok(ev) => yield Ok(ev),
                        Err(e) => tracing::warn!(target: "vigil::gateway", error = %e, "Notification encode failed"),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(target: "vigil::gateway", dropped = n, user_id = %caller.user_id, "Notification subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keepalive"))
}

//! Admin triage endpoints and the owner's notification acknowledgement.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;
use vigil_core::{
    AnomalyFilter, AnomalyLog, FindingSummary, Identity, Message, ModerationStats, Resolution, ReviewError,
    ReviewRequest,
};

use crate::error::ApiError;
use crate::identity::Caller;
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyView {
    #[serde(flatten)]
    pub log: AnomalyLog,
    pub details: Vec<FindingSummary>,
}

fn require_admin(caller: &Identity) -> Result<(), ApiError> {
    if caller.is_admin() {
        Ok(())
    } else {
        Err(ReviewError::Forbidden.into())
    }
}

/// GET /api/v1/admin/anomalies?status=&severity=&anomaly_type=&user_id=&limit=
pub async fn list_anomalies(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Query(filter): Query<AnomalyFilter>,
) -> Result<Json<Vec<AnomalyView>>, ApiError> {
    require_admin(&caller)?;
    let logs = state.runtime.lifecycle.list(&filter)?;
    Ok(Json(
        logs.into_iter()
            .map(|log| AnomalyView { details: log.detail_summaries(), log })
            .collect(),
    ))
}

/// GET /api/v1/admin/anomalies/stats
pub async fn anomaly_stats(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> Result<Json<ModerationStats>, ApiError> {
    require_admin(&caller)?;
    Ok(Json(state.runtime.lifecycle.stats()?))
}

/// POST /api/v1/admin/anomalies/:id/resolve
pub async fn resolve_anomaly(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<Uuid>,
    Json(request): Json<ReviewRequest>,
) -> Result<Json<Resolution>, ApiError> {
    Ok(Json(state.runtime.lifecycle.resolve(&caller, id, request)?))
}

/// POST /api/v1/messages/:id/notification/read
pub async fn acknowledge_notification(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<Message>, ApiError> {
    let message = state.runtime.lifecycle.acknowledge_notification(&caller, id)?;
    Ok(Json(super::message_view(message, &caller)))
}

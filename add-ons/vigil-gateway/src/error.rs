//! HTTP mapping for core errors. Bodies are always `{ "error": "<message>" }`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use vigil_core::{ReviewError, StoreError};

#[derive(Debug)]
pub enum ApiError {
    /// No caller identity headers.
    Unauthenticated,
    BadRequest(String),
    Review(ReviewError),
    Store(StoreError),
}

impl From<ReviewError> for ApiError {
    fn from(e: ReviewError) -> Self {
        ApiError::Review(e)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Review(e) => match e {
                ReviewError::Forbidden => StatusCode::FORBIDDEN,
                ReviewError::NotFound(_) => StatusCode::NOT_FOUND,
                ReviewError::AlreadyResolved { .. } => StatusCode::CONFLICT,
                ReviewError::MissingAdminResponse => StatusCode::UNPROCESSABLE_ENTITY,
                ReviewError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Unauthenticated => "missing X-Vigil-User header".to_string(),
            ApiError::BadRequest(m) => m.clone(),
            ApiError::Review(e) => e.to_string(),
            ApiError::Store(e) => e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(target: "vigil::gateway", error = %self.message(), "Request failed");
        }
        (status, Json(serde_json::json!({ "error": self.message() }))).into_response()
    }
}

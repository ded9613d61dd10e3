//! Axum gateway for the Vigil moderation core: chat turns over SSE, admin triage, and review notifications.
//! Identity comes from headers set by the auth proxy; all moderation decisions live in vigil-core.

mod error;
mod handlers;
mod identity;

use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vigil_core::{VigilConfig, VigilRuntime};

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<VigilRuntime>,
}

fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/api/v1/chats/:chat_id/messages",
            get(handlers::chat::list_messages).post(handlers::chat::post_message),
        )
        .route("/api/v1/chats/:chat_id/title", post(handlers::chat::generate_title))
        .route("/api/v1/admin/anomalies", get(handlers::admin::list_anomalies))
        .route("/api/v1/admin/anomalies/stats", get(handlers::admin::anomaly_stats))
        .route("/api/v1/admin/anomalies/:id/resolve", post(handlers::admin::resolve_anomaly))
        .route(
            "/api/v1/messages/:id/notification/read",
            post(handlers::admin::acknowledge_notification),
        )
        .route("/api/v1/notifications/stream", get(handlers::notifications::notification_stream))
        .layer(cors)
        .with_state(state)
}

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[vigil-gateway] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match VigilConfig::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[vigil-gateway] configuration error: {}", e);
            std::process::exit(1);
        }
    };
    let bind_addr = config.gateway.bind_addr.clone();

    let runtime = match VigilRuntime::from_config(config) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            eprintln!("[vigil-gateway] startup failed: {}", e);
            std::process::exit(1);
        }
    };
    match runtime.lifecycle.recover_unapplied() {
        Ok(0) => {}
        Ok(n) => tracing::info!(target: "vigil::gateway", recovered = n, "Applied pending review outcomes from a previous run"),
        Err(e) => tracing::error!(target: "vigil::gateway", error = %e, "Review recovery sweep failed"),
    }

    let app = build_app(AppState { runtime });
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("[vigil-gateway] cannot bind {}: {}", bind_addr, e);
            std::process::exit(1);
        }
    };
    tracing::info!(target: "vigil::gateway", addr = %bind_addr, "Vigil gateway listening");
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(target: "vigil::gateway", error = %e, "Server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use futures_util::stream;
    use tower::ServiceExt;
    use vigil_core::{
        ApiKey, ChatRequest, ClientFactory, Identity, ModerationStore, ProviderClient, ProviderError, ProviderStream,
        SledModerationStore,
    };

    struct EchoClient;

    #[axum::async_trait]
    impl ProviderClient for EchoClient {
        async fn stream_chat(&self, _request: &ChatRequest) -> Result<ProviderStream, ProviderError> {
            Ok(Box::pin(stream::iter(vec![Ok("Hi ".to_string()), Ok("there".to_string())])))
        }

        async fn complete(&self, _request: &ChatRequest) -> Result<String, ProviderError> {
            Ok("Test Title".to_string())
        }
    }

    struct EchoFactory;

    impl ClientFactory for EchoFactory {
        fn build(&self, _key: &ApiKey) -> Result<Arc<dyn ProviderClient>, ProviderError> {
            Ok(Arc::new(EchoClient))
        }
    }

    fn test_state() -> AppState {
        let mut config = VigilConfig::load_from(std::path::Path::new("does-not-exist/vigil.toml")).unwrap();
        config.provider.api_keys = vec!["test-key".to_string()];
        let store: Arc<dyn ModerationStore> = Arc::new(SledModerationStore::temporary().unwrap());
        let runtime = VigilRuntime::assemble(config, store, Arc::new(EchoFactory)).unwrap();
        AppState { runtime: Arc::new(runtime) }
    }

    fn request(method: &str, uri: &str, role: Option<(&str, &str)>, body: Option<serde_json::Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some((user, role)) = role {
            builder = builder.header("X-Vigil-User", user).header("X-Vigil-Role", role);
        }
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn body_json(res: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn open_ssn_case(state: &AppState) -> uuid::Uuid {
        let outcome = state
            .runtime
            .pipeline
            .screen_user_message(&Identity::user("alice"), "chat-1", "My SSN is 123-45-6789", Vec::new())
            .unwrap();
        outcome.anomaly.unwrap().id
    }

    #[tokio::test]
    async fn health_ok() {
        let app = build_app(test_state());
        let res = app.oneshot(request("GET", "/health", None, None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_json(res).await["status"], "ok");
    }

    #[tokio::test]
    async fn resolve_requires_identity_and_admin() {
        let state = test_state();
        let id = open_ssn_case(&state);
        let uri = format!("/api/v1/admin/anomalies/{}/resolve", id);
        let body = serde_json::json!({ "action": "approve" });

        let res = build_app(state.clone()).oneshot(request("POST", &uri, None, Some(body.clone()))).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = build_app(state)
            .oneshot(request("POST", &uri, Some(("alice", "user")), Some(body)))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(res).await["error"], "admin role required");
    }

    #[tokio::test]
    async fn resolve_then_conflict() {
        let state = test_state();
        let id = open_ssn_case(&state);
        let uri = format!("/api/v1/admin/anomalies/{}/resolve", id);
        let admin = Some(("root", "admin"));

        let res = build_app(state.clone())
            .oneshot(request("POST", &uri, admin, Some(serde_json::json!({ "action": "correct" }))))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let res = build_app(state.clone())
            .oneshot(request("POST", &uri, admin, Some(serde_json::json!({ "action": "block" }))))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let json = body_json(res).await;
        assert_eq!(json["status"], "blocked");
        assert_eq!(json["anomalyId"], id.to_string());

        let res = build_app(state)
            .oneshot(request("POST", &uri, admin, Some(serde_json::json!({ "action": "approve" }))))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn admin_lists_pending_with_details() {
        let state = test_state();
        open_ssn_case(&state);
        let res = build_app(state)
            .oneshot(request("GET", "/api/v1/admin/anomalies?status=pending&limit=5", Some(("root", "admin")), None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let json = body_json(res).await;
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["status"], "pending");
        assert_eq!(json[0]["details"][0]["subType"], "ssn");
    }

    #[tokio::test]
    async fn withheld_content_is_hidden_from_users() {
        let state = test_state();
        open_ssn_case(&state);
        let res = build_app(state)
            .oneshot(request("GET", "/api/v1/chats/chat-1/messages", Some(("alice", "user")), None))
            .await
            .unwrap();
        let json = body_json(res).await;
        assert_eq!(json[0]["content"], "");
        assert_eq!(json[0]["is_pending_review"], true);
    }

    #[tokio::test]
    async fn title_endpoint_returns_generated_title() {
        let res = build_app(test_state())
            .oneshot(request(
                "POST",
                "/api/v1/chats/chat-1/title",
                Some(("alice", "user")),
                Some(serde_json::json!({ "message": "How do I bake bread?" })),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(res).await["title"], "Test Title");
    }

    #[tokio::test]
    async fn chat_turn_streams_tokens_and_moderation() {
        let res = build_app(test_state())
            .oneshot(request(
                "POST",
                "/api/v1/chats/chat-1/messages",
                Some(("alice", "user")),
                Some(serde_json::json!({ "content": "Say hi" })),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(body.contains("event: token"), "{}", body);
        assert!(body.contains("Hi there"), "{}", body);
        assert_eq!(body.matches("event: moderation").count(), 2);
        let first_token = body.find("event: token").unwrap();
        assert!(body.find("event: moderation").unwrap() < first_token, "user message is reported first");
        assert!(first_token < body.rfind("event: moderation").unwrap(), "{}", body);
        assert!(body.contains("event: done"));
    }
}

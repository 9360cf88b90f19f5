//! HTTP surface under `/sessions`

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use mdxai_protocol::{new_id, SessionState, StreamEvent};

use crate::persistence::StoreError;
use crate::reducer::SessionInit;
use crate::session_actor::{ActorError, SessionActorHandle};
use crate::state::SessionRegistry;
use crate::websocket::ws_handler;

const MARKDOWN_CONTENT_TYPE: &str = "text/markdown; charset=utf-8";

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    /// Base for links handed back by `POST /sessions`; falls back to the Host header
    pub public_url: Option<String>,
}

impl AppState {
    fn base_url(&self, headers: &HeaderMap) -> String {
        if let Some(url) = &self.public_url {
            return url.clone();
        }
        let host = headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost");
        let scheme = headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .filter(|proto| *proto == "https")
            .unwrap_or("http");
        format!("{scheme}://{host}")
    }
}

/// Error body is always `{"error": "..."}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: "Not found".into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        error!(
            component = "routes",
            event = "session.activation_failed",
            error = %err,
            "Failed to open session"
        );
        ApiError::internal("Failed to open session")
    }
}

impl From<ActorError> for ApiError {
    fn from(err: ActorError) -> Self {
        match err {
            ActorError::Store(_) => ApiError::internal("Failed to persist session event"),
            ActorError::Closed(_) => ApiError::internal("Session is unavailable"),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sessions", post(create_session))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/markdown", get(get_markdown))
        .route("/sessions/{id}/mdx", get(get_mdx))
        .route("/sessions/{id}/event", post(post_event))
        .route("/sessions/{id}/ws", get(ws_handler))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

async fn not_found() -> ApiError {
    ApiError::not_found()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionBody {
    session_id: Option<String>,
    prompt: Option<String>,
    model: Option<String>,
    cwd: Option<String>,
    execution_mode: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionResponse {
    session_id: String,
    url: String,
    ws_url: String,
}

fn normalize_non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Ids end up as a single path segment in every session URL.
pub(crate) fn valid_session_id(id: &str) -> bool {
    id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}

fn ws_base(http_base: &str) -> String {
    if let Some(rest) = http_base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = http_base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        http_base.to_string()
    }
}

async fn create_session(
    State(app): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let body: CreateSessionBody = if body.iter().all(u8::is_ascii_whitespace) {
        CreateSessionBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("Invalid session body: {e}")))?
    };

    let session_id = normalize_non_empty(body.session_id).unwrap_or_else(new_id);
    if !valid_session_id(&session_id) {
        return Err(ApiError::bad_request("Invalid sessionId"));
    }

    let defaults = app.registry.defaults();
    let init = SessionInit {
        execution_mode: normalize_non_empty(body.execution_mode)
            .unwrap_or_else(|| defaults.execution_mode.clone()),
        model: normalize_non_empty(body.model).unwrap_or_else(|| defaults.model.clone()),
        cwd: normalize_non_empty(body.cwd).unwrap_or_else(|| defaults.cwd.clone()),
        prompt: normalize_non_empty(body.prompt),
    };

    app.registry
        .get_or_activate(&session_id, Some(init))
        .await?;

    let base = app.base_url(&headers);
    info!(
        component = "routes",
        event = "session.created",
        session_id = %session_id,
        active_sessions = app.registry.active_count(),
        "Session created"
    );

    Ok(Json(CreateSessionResponse {
        url: format!("{base}/sessions/{session_id}"),
        ws_url: format!("{}/sessions/{session_id}/ws", ws_base(&base)),
        session_id,
    }))
}

fn check_session_id(id: &str) -> Result<(), ApiError> {
    if valid_session_id(id) {
        Ok(())
    } else {
        Err(ApiError::bad_request("Invalid sessionId"))
    }
}

async fn resolve(app: &AppState, id: &str) -> Result<SessionActorHandle, ApiError> {
    check_session_id(id)?;
    Ok(app.registry.get_or_activate(id, None).await?)
}

async fn get_session(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionState>, ApiError> {
    let actor = resolve(&app, &id).await?;
    Ok(Json(actor.state().as_ref().clone()))
}

async fn get_markdown(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let actor = resolve(&app, &id).await?;
    Ok(([(header::CONTENT_TYPE, MARKDOWN_CONTENT_TYPE)], actor.markdown()).into_response())
}

async fn get_mdx(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let actor = resolve(&app, &id).await?;
    Ok(([(header::CONTENT_TYPE, MARKDOWN_CONTENT_TYPE)], actor.mdx()).into_response())
}

async fn post_event(
    State(app): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<SessionState>, ApiError> {
    check_session_id(&id)?;
    let event = std::str::from_utf8(&body)
        .map_err(|e| e.to_string())
        .and_then(|text| StreamEvent::parse(text).map_err(|e| e.to_string()))
        .map_err(|reason| {
            warn!(
                component = "routes",
                event = "session.event_rejected",
                session_id = %id,
                payload_bytes = body.len(),
                error = %reason,
                "Rejected malformed event"
            );
            // Client error, not an event-processing failure: the actor never sees it
            ApiError::bad_request(format!("Invalid event: {reason}"))
        })?;

    let state = app.registry.post_event(&id, event).await?;
    Ok(Json(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::persistence::{DurableStore, MemoryStore};

    /// Memory store whose writes can be switched off.
    #[derive(Default)]
    struct BrokenWrites {
        inner: MemoryStore,
        fail_puts: AtomicBool,
    }

    #[async_trait]
    impl DurableStore for BrokenWrites {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
            if self.fail_puts.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable(
                    "disk full at /var/lib/mdxai/sessions.db".into(),
                ));
            }
            self.inner.put(key, value).await
        }
    }

    fn test_state() -> AppState {
        AppState {
            registry: Arc::new(SessionRegistry::new(
                Arc::new(MemoryStore::default()),
                SessionInit::default(),
            )),
            public_url: None,
        }
    }

    async fn send(app: &AppState, request: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
        let response = super::app(app.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, body.to_vec())
    }

    async fn send_json(app: &AppState, request: Request<Body>) -> (StatusCode, Value) {
        let (status, _, body) = send(app, request).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header(header::HOST, "svc.test")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn create_session_returns_links_from_host() {
        let app = test_state();
        let (status, body) = send_json(
            &app,
            post("/sessions", r#"{"sessionId":"s-1","model":"opus","prompt":"go"}"#),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sessionId"], "s-1");
        assert_eq!(body["url"], "http://svc.test/sessions/s-1");
        assert_eq!(body["wsUrl"], "ws://svc.test/sessions/s-1/ws");

        let (_, state) = send_json(&app, get_req("/sessions/s-1")).await;
        assert_eq!(state["status"], "idle");
        assert_eq!(state["model"], "opus");
        assert_eq!(state["prompt"], "go");
        assert_eq!(state["cwd"], "/");
    }

    #[tokio::test]
    async fn create_session_with_empty_body_generates_id() {
        let app = test_state();
        let (status, body) = send_json(&app, post("/sessions", "")).await;

        assert_eq!(status, StatusCode::OK);
        let id = body["sessionId"].as_str().unwrap();
        assert!(!id.is_empty());
        assert_eq!(app.registry.active_count(), 1);
    }

    #[tokio::test]
    async fn create_session_prefers_public_url() {
        let mut app = test_state();
        app.public_url = Some("https://agents.example.com".into());

        let (_, body) = send_json(&app, post("/sessions", r#"{"sessionId":"abc"}"#)).await;
        assert_eq!(body["url"], "https://agents.example.com/sessions/abc");
        assert_eq!(body["wsUrl"], "wss://agents.example.com/sessions/abc/ws");
    }

    #[tokio::test]
    async fn create_session_rejects_path_unsafe_ids() {
        let app = test_state();
        let (status, body) = send_json(&app, post("/sessions", r#"{"sessionId":"a/b"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn events_drive_state() {
        let app = test_state();

        let (status, state) = send_json(
            &app,
            post(
                "/sessions/run-1/event",
                r#"{"type":"tool_use","id":"t1","tool":"Bash","input":{"command":"ls"}}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(state["status"], "running");
        assert_eq!(state["tools"][0]["status"], "running");

        send_json(
            &app,
            post(
                "/sessions/run-1/event",
                r#"{"type":"tool_result","id":"t1","output":"file.txt"}"#,
            ),
        )
        .await;
        let (_, state) = send_json(
            &app,
            post(
                "/sessions/run-1/event",
                &json!({
                    "type": "result",
                    "cost": 0.01,
                    "duration": 1500,
                    "usage": {"inputTokens": 10, "outputTokens": 5, "totalTokens": 15}
                })
                .to_string(),
            ),
        )
        .await;

        assert_eq!(state["status"], "completed");
        assert_eq!(state["tools"][0]["status"], "success");
        assert_eq!(state["usage"]["totalTokens"], 15);

        let (_, fetched) = send_json(&app, get_req("/sessions/run-1")).await;
        assert_eq!(fetched, state);
    }

    #[tokio::test]
    async fn malformed_event_is_rejected_without_state_change() {
        let app = test_state();
        send_json(&app, post("/sessions", r#"{"sessionId":"bad"}"#)).await;
        let (_, before) = send_json(&app, get_req("/sessions/bad")).await;

        for body in ["not json", "[1,2]", r#"{"content":"no type"}"#] {
            let (status, err) = send_json(&app, post("/sessions/bad/event", body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
            assert!(err["error"].as_str().unwrap().starts_with("Invalid event"));
        }

        let (_, after) = send_json(&app, get_req("/sessions/bad")).await;
        assert_eq!(before, after);

        let (status, _) = send_json(
            &app,
            post("/sessions/bad/event", r#"{"type":"assistant","content":"ok"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_event_types_are_accepted() {
        let app = test_state();
        let (status, state) = send_json(
            &app,
            post("/sessions/u/event", r#"{"type":"system","subtype":"init"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(state["status"], "idle");
        assert_eq!(state["messages"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn projections_are_served_as_markdown() {
        let app = test_state();
        send_json(&app, post("/sessions", r#"{"sessionId":"doc"}"#)).await;

        for uri in ["/sessions/doc/markdown", "/sessions/doc/mdx"] {
            let (status, headers, body) = send(&app, get_req(uri)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(headers[header::CONTENT_TYPE], MARKDOWN_CONTENT_TYPE);
            let text = String::from_utf8(body).unwrap();
            assert!(text.starts_with("---\n"));
            assert!(text.contains("# Session doc"));
        }
    }

    #[tokio::test]
    async fn persist_failure_is_a_sanitized_500() {
        let store = Arc::new(BrokenWrites::default());
        let app = AppState {
            registry: Arc::new(SessionRegistry::new(store.clone(), SessionInit::default())),
            public_url: None,
        };
        send_json(&app, post("/sessions", r#"{"sessionId":"disk"}"#)).await;

        store.fail_puts.store(true, Ordering::SeqCst);
        let (status, _, body) = send(
            &app,
            post("/sessions/disk/event", r#"{"type":"assistant","content":"lost"}"#),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let text = String::from_utf8(body).unwrap();
        let err: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(err["error"], "Failed to persist session event");
        assert!(!text.contains("disk full"));
        assert!(!text.contains("/var/lib"));

        let (_, state) = send_json(&app, get_req("/sessions/disk")).await;
        assert_eq!(state["messages"].as_array().unwrap().len(), 0);

        let (status, err) = send_json(&app, post("/sessions", r#"{"sessionId":"new"}"#)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err["error"], "Failed to open session");
    }

    #[tokio::test]
    async fn invalid_path_ids_are_rejected_without_activation() {
        let app = test_state();
        let long = "x".repeat(300);

        for uri in [
            format!("/sessions/{long}"),
            format!("/sessions/{long}/markdown"),
            format!("/sessions/{long}/mdx"),
            "/sessions/has%20space".to_string(),
        ] {
            let (status, body) = send_json(&app, get_req(&uri)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "uri: {uri}");
            assert_eq!(body["error"], "Invalid sessionId");
        }

        let (status, body) = send_json(
            &app,
            post(
                &format!("/sessions/{long}/event"),
                r#"{"type":"assistant","content":"x"}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid sessionId");

        let upgrade = Request::get(format!("/sessions/{long}/ws"))
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send_json(&app, upgrade).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid sessionId");

        assert_eq!(app.registry.active_count(), 0);
    }

    #[tokio::test]
    async fn ws_without_upgrade_is_bad_request() {
        let app = test_state();
        let (status, body) = send_json(&app, get_req("/sessions/x/ws")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn unknown_routes_return_json_404() {
        let app = test_state();
        let (status, body) = send_json(&app, get_req("/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Not found");

        let (status, _, body) = send(&app, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"OK");
    }

    #[tokio::test]
    async fn websocket_streams_state_then_events() {
        use tokio_tungstenite::tungstenite::Message;

        let app = test_state();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = super::app(app.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/sessions/live/ws"))
            .await
            .unwrap();

        let next_json =
            |msg: Message| -> Value { serde_json::from_str(msg.to_text().unwrap()).unwrap() };

        let first = next_json(ws.next().await.unwrap().unwrap());
        assert_eq!(first["type"], "state");
        assert_eq!(first["data"]["id"], "live");
        assert_eq!(first["data"]["status"], "idle");

        let handle = app.registry.get_or_activate("live", None).await.unwrap();
        handle
            .post_event(StreamEvent::Assistant {
                content: "hello".into(),
                timestamp: None,
            })
            .await
            .unwrap();

        let second = next_json(ws.next().await.unwrap().unwrap());
        assert_eq!(second["type"], "event");
        assert_eq!(second["event"]["type"], "assistant");
        assert_eq!(second["state"]["messages"][0]["content"], "hello");
    }
}

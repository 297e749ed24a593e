//! HTTP surfaces of a relay instance.
//!
//! The public router carries the WebSocket endpoint, the notification API
//! used by backend services, and the health check. The internal router is
//! bound on a separate listener and serves instance-to-instance forwards,
//! a per-session debug view, and Prometheus metrics.

use std::sync::Arc;

use axum::{
    extract::rejection::JsonRejection,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing, Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    auth::AuthMode,
    error::{ApiError, DeliveryError},
    protocol::{
        self, EVENT_FINAL_NOTIFICATION, EVENT_LIVESTATUS, EVENT_NOTIFICATION,
    },
    routing::EmitRequest,
    session::{ws_handler, SessionLifecycle},
};

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct MessageRequest {
    session_id: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct FinalMessageRequest {
    session_id: String,
    message: String,
    query_id: String,
    #[serde(default)]
    references: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct FeedbackRequest {
    session_id: String,
    vzid: String,
    query_id: String,
    feedback: String,
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

// ---------------------------------------------------------------------------
// Routers
// ---------------------------------------------------------------------------

pub fn public_router(relay: Arc<SessionLifecycle>) -> Router {
    Router::new()
        .route("/ws", routing::get(ws_handler))
        .route("/api/notify", routing::post(notify))
        .route("/api/finalnotify", routing::post(final_notify))
        .route("/api/livestatus", routing::post(livestatus))
        .route("/api/feedback", routing::post(feedback))
        .route("/health", routing::get(health))
        .with_state(relay)
}

pub fn internal_router(relay: Arc<SessionLifecycle>) -> Router {
    Router::new()
        .route("/internal/emit", routing::post(internal_emit))
        .route("/internal/session/{session_id}", routing::get(session_view))
        .route("/internal/metrics", routing::get(metrics_text))
        .with_state(relay)
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// Re-run the credential gate for a call about `session_id`, using the
/// session's stored mode. Returns the caller's bearer token in token mode.
async fn authorize_session_request(
    relay: &SessionLifecycle,
    session_id: &str,
    headers: &HeaderMap,
) -> Result<Option<String>, ApiError> {
    let stored = match relay.directory.session_auth(session_id).await {
        Ok(stored) => stored,
        Err(error) => {
            tracing::warn!(target = "session_relay::api", session_id = %session_id, error = %error, "stored credential lookup failed");
            None
        }
    };

    let env = match &stored {
        Some((credential, env)) if credential.mode == AuthMode::Secret => {
            relay.gate.revalidate(credential, *env).await?;
            return Ok(None);
        }
        Some((_, env)) => *env,
        None => crate::auth::Environment::DEFAULT,
    };

    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let credential = relay
        .gate
        .authenticate(AuthMode::Token, authorization, env)
        .await?;
    Ok(Some(credential.value))
}

// ---------------------------------------------------------------------------
// Public endpoints
// ---------------------------------------------------------------------------

async fn notify(
    axum::extract::State(relay): axum::extract::State<Arc<SessionLifecycle>>,
    headers: HeaderMap,
    payload: Result<Json<MessageRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let request = body(payload)?;
    let data = json!({
        "session_id": request.session_id,
        "message": request.message,
    });
    push_event(
        &relay,
        &headers,
        &request.session_id,
        EVENT_NOTIFICATION,
        data,
        "Notification sent successfully",
    )
    .await
}

async fn final_notify(
    axum::extract::State(relay): axum::extract::State<Arc<SessionLifecycle>>,
    headers: HeaderMap,
    payload: Result<Json<FinalMessageRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let request = body(payload)?;
    let mut data = json!({
        "session_id": request.session_id,
        "message": request.message,
        "query_id": request.query_id,
    });
    if let Some(references) = request.references {
        data["references"] = references;
    }
    push_event(
        &relay,
        &headers,
        &request.session_id,
        EVENT_FINAL_NOTIFICATION,
        data,
        "Final notification sent successfully",
    )
    .await
}

async fn livestatus(
    axum::extract::State(relay): axum::extract::State<Arc<SessionLifecycle>>,
    headers: HeaderMap,
    payload: Result<Json<MessageRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let request = body(payload)?;
    let data = json!({
        "session_id": request.session_id,
        "message": request.message,
    });
    push_event(
        &relay,
        &headers,
        &request.session_id,
        EVENT_LIVESTATUS,
        data,
        "Live status sent successfully",
    )
    .await
}

async fn push_event(
    relay: &SessionLifecycle,
    headers: &HeaderMap,
    session_id: &str,
    event: &str,
    data: Value,
    success_message: &str,
) -> Result<Json<Value>, ApiError> {
    authorize_session_request(relay, session_id, headers).await?;

    match relay.directory.connection_state(session_id).await {
        Ok(Some(true)) => {}
        Ok(Some(false)) => {
            let error = ApiError::NotConnected(session_id.to_string());
            notify_client_of_error(relay, session_id, "Session disconnected", &error.to_string())
                .await;
            return Err(error);
        }
        Ok(None) => return Err(ApiError::UnknownSession(session_id.to_string())),
        Err(error) => {
            tracing::warn!(target = "session_relay::api", session_id = %session_id, error = %error, "directory unavailable, treating session as unknown");
            return Err(ApiError::UnknownSession(session_id.to_string()));
        }
    }

    match relay.router.deliver(session_id, event, data).await {
        Ok(delivered) => {
            tracing::info!(target = "session_relay::api", session_id = %session_id, event = %event, delivered = ?delivered, "event delivered");
            Ok(Json(json!({
                "status": "success",
                "message": success_message,
            })))
        }
        Err(error @ DeliveryError::UnknownSession(_)) => Err(error.into()),
        Err(error) => {
            notify_client_of_error(relay, session_id, "Send failed", &error.to_string()).await;
            Err(error.into())
        }
    }
}

/// Best-effort `chat_error` to a socket held by this instance. Never
/// forwards, so a failed request costs at most one forwarding call.
async fn notify_client_of_error(relay: &SessionLifecycle, session_id: &str, error: &str, message: &str) {
    if !relay.registry.contains(session_id) {
        return;
    }
    let frame = protocol::chat_error(session_id, error, message);
    if let Err(send_error) = relay
        .router
        .deliver_local(session_id, &frame.event, frame.data)
        .await
    {
        tracing::debug!(target = "session_relay::api", session_id = %session_id, error = %send_error, "chat_error not delivered");
    }
}

async fn feedback(
    axum::extract::State(relay): axum::extract::State<Arc<SessionLifecycle>>,
    headers: HeaderMap,
    payload: Result<Json<FeedbackRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let request = body(payload)?;
    let bearer = authorize_session_request(&relay, &request.session_id, &headers).await?;

    tracing::info!(target = "session_relay::api", session_id = %request.session_id, vzid = %request.vzid, query_id = %request.query_id, "feedback received");
    let record = crate::dispatch::feedback_payload(&request.query_id, &request.feedback);
    relay
        .dispatcher
        .send_feedback(&request.session_id, &record, bearer.as_deref())
        .await;

    Ok(Json(json!({
        "status": "success",
        "message": "Feedback submitted successfully",
    })))
}

async fn health(
    axum::extract::State(relay): axum::extract::State<Arc<SessionLifecycle>>,
) -> Json<Value> {
    let connected = relay.directory.ping().await.is_ok();
    let approx_sessions = if connected {
        relay.directory.approx_sessions().await.ok()
    } else {
        None
    };

    Json(json!({
        "status": if connected { "healthy" } else { "degraded" },
        "service": "session-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "instance_id": relay.instance_id(),
        "local_sessions": relay.registry.len(),
        "directory": {
            "backend": relay.directory.describe(),
            "connected": connected,
            "approx_sessions": approx_sessions,
        },
        "metrics": relay.metrics.snapshot(),
    }))
}

// ---------------------------------------------------------------------------
// Internal endpoints
// ---------------------------------------------------------------------------

async fn internal_emit(
    axum::extract::State(relay): axum::extract::State<Arc<SessionLifecycle>>,
    payload: Result<Json<EmitRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let request = body(payload)?;
    relay
        .router
        .deliver_local(&request.session_id, &request.event, request.data)
        .await?;
    Ok(Json(json!({ "status": "success" })))
}

async fn session_view(
    axum::extract::State(relay): axum::extract::State<Arc<SessionLifecycle>>,
    axum::extract::Path(session_id): axum::extract::Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = match relay.directory.record(&session_id).await {
        Ok(Some(record)) => record,
        Ok(None) => return Err(ApiError::UnknownSession(session_id)),
        Err(error) => {
            tracing::warn!(target = "session_relay::api", session_id = %session_id, error = %error, "session record unreadable");
            return Err(ApiError::UnknownSession(session_id));
        }
    };

    let local = relay.registry.contains(&session_id);
    let route = match (&record.owner, local) {
        (_, true) => "local".to_string(),
        (Some(owner), false) if owner.instance_id != relay.instance_id() => {
            format!("forward:{}", owner.instance_id)
        }
        _ => "none".to_string(),
    };

    Ok(Json(json!({
        "session_id": session_id,
        "connection_state": record.connected,
        "last_activity_ms": record.last_activity_ms,
        "environment": record.environment.map(|env| env.as_str()),
        "auth_mode": record.credential.as_ref().map(|c| c.mode.as_str()),
        "credential": record.credential.as_ref().map(|_| "<redacted>"),
        "ui_source": record.ui_source,
        "owner": record.owner,
        "local_connection": local,
        "route": route,
    })))
}

async fn metrics_text(
    axum::extract::State(relay): axum::extract::State<Arc<SessionLifecycle>>,
) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        relay.metrics.to_prometheus(relay.registry.len()),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{header, Method, Request, StatusCode},
        Router,
    };
    use httpmock::{Method::POST, MockServer};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::{internal_router, public_router};
    use crate::{
        auth::{
            tests::{mint, TEST_KEY},
            CredentialGate, Environment, StaticSecretStore, TokenVerifier,
        },
        directory::{OwnerRecord, SessionDirectory},
        registry::tests::RecordingConnection,
        routing::tests::CountingForwarder,
        session::{ConnectionContext, HandshakeQuery, RelayOptions, SessionLifecycle},
        store::{KeyValueStore, MemoryStore},
    };

    struct Fixture {
        relay: Arc<SessionLifecycle>,
        store: Arc<MemoryStore>,
        forwarder: Arc<CountingForwarder>,
    }

    fn fixture_with(options: RelayOptions) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let forwarder = Arc::new(CountingForwarder::default());
        let verifier = TokenVerifier::new(None).with_hmac_secret(Environment::Dev, TEST_KEY);
        let gate = CredentialGate::new(
            verifier,
            Arc::new(StaticSecretStore::new(Some("s3cret".into()))),
        );
        let relay = Arc::new(SessionLifecycle::new(
            gate,
            SessionDirectory::new(store.clone()),
            forwarder.clone(),
            options,
        ));
        Fixture {
            relay,
            store,
            forwarder,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(RelayOptions::new(OwnerRecord::new(
            "server_a",
            "127.0.0.1",
            3004,
        )))
    }

    async fn connect(relay: &SessionLifecycle, query: HandshakeQuery, session_id: &str) -> Arc<RecordingConnection> {
        let handshake = relay.handshake(&query).await.unwrap();
        let conn = Arc::new(RecordingConnection::default());
        let mut ctx = ConnectionContext::new(handshake, conn.clone());
        relay
            .handle_frame(
                &mut ctx,
                crate::protocol::Frame::new("register_session", json!({ "session_id": session_id })),
            )
            .await;
        conn
    }

    fn token_query() -> HandshakeQuery {
        HandshakeQuery {
            authorization: Some(format!("Bearer {}", mint(TEST_KEY, 600))),
            ..Default::default()
        }
    }

    fn post(uri: &str, body: Value, bearer: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn notify_unknown_session_is_not_found_without_delivery() {
        let fx = fixture();
        let token = mint(TEST_KEY, 600);
        let (status, body) = send(
            public_router(fx.relay.clone()),
            post("/api/notify", json!({"session_id": "ghost", "message": "hi"}), Some(&token)),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "unknown_session");
        assert_eq!(body["error"]["statusCode"], 404);
        assert!(fx.forwarder.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn notify_local_token_session_delivers() {
        let fx = fixture();
        let conn = connect(&fx.relay, token_query(), "s1").await;
        let token = mint(TEST_KEY, 600);

        let (status, body) = send(
            public_router(fx.relay.clone()),
            post("/api/notify", json!({"session_id": "s1", "message": "done"}), Some(&token)),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        let frames = conn.frames.lock();
        let last = frames.last().unwrap();
        assert_eq!(last.event, "notification");
        assert_eq!(last.data["message"], "done");
    }

    #[tokio::test]
    async fn token_session_requires_authorization_header() {
        let fx = fixture();
        connect(&fx.relay, token_query(), "s1").await;

        let (status, body) = send(
            public_router(fx.relay.clone()),
            post("/api/notify", json!({"session_id": "s1", "message": "done"}), None),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "unauthorized");
    }

    #[tokio::test]
    async fn secret_session_is_authorized_by_stored_secret() {
        let fx = fixture();
        let conn = connect(
            &fx.relay,
            HandshakeQuery {
                secret: Some("s3cret".into()),
                uisource: Some("slack".into()),
                ..Default::default()
            },
            "slack-1",
        )
        .await;

        let (status, _) = send(
            public_router(fx.relay.clone()),
            post(
                "/api/finalnotify",
                json!({"session_id": "slack-1", "message": "answer", "query_id": "q-7", "references": ["doc-1"]}),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let frames = conn.frames.lock();
        let last = frames.last().unwrap();
        assert_eq!(last.event, "final_notification");
        assert_eq!(last.data["query_id"], "q-7");
        assert_eq!(last.data["references"], json!(["doc-1"]));
    }

    #[tokio::test]
    async fn disconnected_session_is_bad_request() {
        let fx = fixture();
        let conn = connect(&fx.relay, token_query(), "s1").await;
        fx.store
            .set("session:s1:connection_state", "false")
            .await
            .unwrap();
        let token = mint(TEST_KEY, 600);

        let (status, body) = send(
            public_router(fx.relay.clone()),
            post("/api/livestatus", json!({"session_id": "s1", "message": "x"}), Some(&token)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "session_not_connected");
        assert_eq!(conn.events().last().unwrap(), "chat_error");
    }

    #[tokio::test]
    async fn remote_session_is_forwarded_once() {
        let fx = fixture();
        let token = mint(TEST_KEY, 600);
        let credential = crate::auth::SessionCredential {
            mode: crate::auth::AuthMode::Token,
            value: token.clone(),
        };
        fx.relay
            .directory
            .register(
                &crate::directory::NewSession {
                    session_id: "s2",
                    environment: Environment::Dev,
                    credential: &credential,
                    ui_source: None,
                    now_ms: 0,
                },
                &OwnerRecord::new("server_b", "10.0.0.2", 3004),
            )
            .await
            .unwrap();

        let (status, _) = send(
            public_router(fx.relay.clone()),
            post("/api/notify", json!({"session_id": "s2", "message": "hi"}), Some(&token)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fx.forwarder.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let fx = fixture();
        let (status, body) = send(
            public_router(fx.relay.clone()),
            post("/api/notify", json!({"message": "no session"}), None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "bad_request");
    }

    #[tokio::test]
    async fn feedback_succeeds_even_when_sink_fails() {
        let server = MockServer::start();
        let sink = server.mock(|when, then| {
            when.method(POST)
                .path("/log")
                .json_body_partial(r#"{"table_name":"agent_feedback","data":{"ui_queries_id":"q-1"}}"#);
            then.status(503);
        });
        let mut options = RelayOptions::new(OwnerRecord::new("server_a", "127.0.0.1", 3004));
        options.log_url = Some(server.url("/log"));
        let fx = fixture_with(options);
        connect(&fx.relay, token_query(), "s1").await;
        let token = mint(TEST_KEY, 600);

        let (status, body) = send(
            public_router(fx.relay.clone()),
            post(
                "/api/feedback",
                json!({"session_id": "s1", "vzid": "u1", "query_id": "q-1", "feedback": "great"}),
                Some(&token),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Feedback submitted successfully");
        sink.assert_hits(1);
    }

    #[tokio::test]
    async fn health_reports_directory_and_local_sessions() {
        let fx = fixture();
        connect(&fx.relay, token_query(), "s1").await;

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(public_router(fx.relay.clone()), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["instance_id"], "server_a");
        assert_eq!(body["local_sessions"], 1);
        assert_eq!(body["directory"]["approx_sessions"], 1);
        assert_eq!(body["metrics"]["sessions_registered"], 1);

        fx.store.set_available(false);
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (_, body) = send(public_router(fx.relay.clone()), request).await;
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["directory"]["connected"], false);
    }

    #[tokio::test]
    async fn websocket_handshake_without_credentials_is_forbidden() {
        let fx = fixture();
        let request = Request::builder()
            .uri("/ws?env=DEV")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(public_router(fx.relay.clone()), request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["closeCode"], 1008);
        assert!(fx.relay.registry.is_empty());
    }

    #[tokio::test]
    async fn internal_emit_delivers_locally_only() {
        let fx = fixture();
        let conn = connect(&fx.relay, token_query(), "s1").await;

        let (status, body) = send(
            internal_router(fx.relay.clone()),
            post(
                "/internal/emit",
                json!({"session_id": "s1", "event": "livestatus", "data": {"message": "step 2"}}),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(conn.events().last().unwrap(), "livestatus");

        let (status, body) = send(
            internal_router(fx.relay.clone()),
            post(
                "/internal/emit",
                json!({"session_id": "elsewhere", "event": "notification", "data": {}}),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "not_local");
        assert!(fx.forwarder.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn session_view_redacts_credential() {
        let fx = fixture();
        connect(&fx.relay, token_query(), "s1").await;

        let request = Request::builder()
            .uri("/internal/session/s1")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(internal_router(fx.relay.clone()), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["credential"], "<redacted>");
        assert_eq!(body["auth_mode"], "token");
        assert_eq!(body["route"], "local");
        assert_eq!(body["owner"]["instance_id"], "server_a");
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_prometheus_text() {
        let fx = fixture();
        let response = internal_router(fx.relay.clone())
            .oneshot(
                Request::builder()
                    .uri("/internal/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("session_relay_local_sessions 0"));
    }
}

//! Session lifecycle: the per-connection state machine.
//!
//! A socket is authenticated before the upgrade is accepted, becomes a
//! session on `register_session`, and stays registered through `ping` and
//! `chat_request` until it closes. Frame handling is independent of the
//! transport so the machine can be driven with any [`ClientConnection`].

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    extract::ws::{
        rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{
    auth::{AuthMode, CredentialGate, Environment, SessionCredential},
    directory::{now_ms, NewSession, OwnerRecord, SessionDirectory},
    dispatch::{chat_payload, Dispatcher},
    error::AuthError,
    metrics::{Counter, RelayMetrics},
    protocol::{
        self, Frame, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION, CLOSE_PROTOCOL_ERROR,
        CLOSE_REGISTRATION_FAILED, EVENT_CHAT_REQUEST, EVENT_PING, EVENT_REGISTER_SESSION,
    },
    registry::{ClientConnection, ConnectionRegistry},
    routing::{DeliveryRouter, Forwarder},
};

/// Query parameters of the upgrade request.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct HandshakeQuery {
    #[serde(rename = "Authorization", alias = "authorization")]
    pub authorization: Option<String>,
    pub env: Option<String>,
    pub secret: Option<String>,
    pub uisource: Option<String>,
}

/// What the handshake established, before a socket exists.
#[derive(Debug, Clone)]
pub struct AcceptedHandshake {
    pub credential: SessionCredential,
    pub env: Environment,
    pub ui_source: Option<String>,
}

/// Per-socket state owned by the connection task.
pub struct ConnectionContext {
    pub conn_id: Uuid,
    pub conn: Arc<dyn ClientConnection>,
    pub env: Environment,
    pub credential: SessionCredential,
    pub ui_source: Option<String>,
    pub session_id: Option<String>,
}

impl ConnectionContext {
    pub fn new(handshake: AcceptedHandshake, conn: Arc<dyn ClientConnection>) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            conn,
            env: handshake.env,
            credential: handshake.credential,
            ui_source: handshake.ui_source,
            session_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close { code: u16, reason: String },
}

impl Flow {
    fn close(code: u16, reason: impl Into<String>) -> Self {
        Self::Close {
            code,
            reason: reason.into(),
        }
    }
}

/// Instance-level settings for [`SessionLifecycle`].
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub owner: OwnerRecord,
    pub send_timeout: Duration,
    pub fulfillment_url: Option<String>,
    pub log_url: Option<String>,
    pub dispatch_timeout: Duration,
    pub feedback_timeout: Duration,
}

impl RelayOptions {
    pub fn new(owner: OwnerRecord) -> Self {
        Self {
            owner,
            send_timeout: Duration::from_secs(5),
            fulfillment_url: None,
            log_url: None,
            dispatch_timeout: Duration::from_secs(5),
            feedback_timeout: Duration::from_secs(10),
        }
    }
}

/// Everything one relay instance shares between its connections and its
/// HTTP surfaces.
pub struct SessionLifecycle {
    pub gate: CredentialGate,
    pub registry: Arc<ConnectionRegistry>,
    pub directory: SessionDirectory,
    pub router: Arc<DeliveryRouter>,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Arc<RelayMetrics>,
    pub owner: OwnerRecord,
    send_timeout: Duration,
}

impl SessionLifecycle {
    pub fn new(
        gate: CredentialGate,
        directory: SessionDirectory,
        forwarder: Arc<dyn Forwarder>,
        options: RelayOptions,
    ) -> Self {
        let metrics = Arc::new(RelayMetrics::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(DeliveryRouter::new(
            registry.clone(),
            directory.clone(),
            forwarder,
            options.owner.instance_id.clone(),
            options.send_timeout,
            metrics.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            options.fulfillment_url,
            options.log_url,
            options.dispatch_timeout,
            options.feedback_timeout,
            metrics.clone(),
        ));
        Self {
            gate,
            registry,
            directory,
            router,
            dispatcher,
            metrics,
            owner: options.owner,
            send_timeout: options.send_timeout,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.owner.instance_id
    }

    /// Run the credential gate on upgrade query parameters.
    pub async fn handshake(&self, query: &HandshakeQuery) -> Result<AcceptedHandshake, AuthError> {
        let env = query
            .env
            .as_deref()
            .map(Environment::parse_lenient)
            .unwrap_or(Environment::DEFAULT);
        let ui_source = query
            .uisource
            .clone()
            .filter(|tag| !tag.trim().is_empty());
        let mode = AuthMode::for_ui_source(ui_source.as_deref());
        let presented = match mode {
            AuthMode::Token => query.authorization.as_deref(),
            AuthMode::Secret => query.secret.as_deref(),
        };

        let credential = self
            .gate
            .authenticate(mode, presented, env)
            .await
            .inspect_err(|error| {
                self.metrics.incr(Counter::HandshakesRejected);
                tracing::info!(target = "session_relay::ws", env = %env, mode = mode.as_str(), error = %error, "handshake rejected");
            })?;
        Ok(AcceptedHandshake {
            credential,
            env,
            ui_source,
        })
    }

    pub async fn handle_text(&self, ctx: &mut ConnectionContext, text: &str) -> Flow {
        match Frame::parse(text) {
            Ok(frame) => self.handle_frame(ctx, frame).await,
            Err(error) => {
                tracing::warn!(target = "session_relay::ws", conn_id = %ctx.conn_id, error = %error, "malformed frame");
                Flow::close(CLOSE_PROTOCOL_ERROR, "Malformed frame")
            }
        }
    }

    pub async fn handle_frame(&self, ctx: &mut ConnectionContext, frame: Frame) -> Flow {
        match frame.event.as_str() {
            EVENT_REGISTER_SESSION => self.on_register(ctx, &frame).await,
            EVENT_PING => self.on_ping(ctx, &frame).await,
            EVENT_CHAT_REQUEST => self.on_chat(ctx, &frame).await,
            other => {
                tracing::warn!(target = "session_relay::ws", conn_id = %ctx.conn_id, event = %other, "unknown event ignored");
                Flow::Continue
            }
        }
    }

    async fn on_register(&self, ctx: &mut ConnectionContext, frame: &Frame) -> Flow {
        let Some(session_id) = frame.session_id().map(str::to_string) else {
            tracing::error!(target = "session_relay::ws", conn_id = %ctx.conn_id, "register_session without session_id");
            return Flow::close(CLOSE_REGISTRATION_FAILED, "Registration failed");
        };

        let declared = frame
            .str_field("intendedEnv")
            .or_else(|| frame.str_field("env"))
            .map(Environment::parse_lenient);
        if let Some(env) = declared.filter(|env| *env != ctx.env) {
            if let Err(error) = self.gate.revalidate(&ctx.credential, env).await {
                tracing::warn!(target = "session_relay::ws", session_id = %session_id, env = %env, error = %error, "credential rejected for declared environment");
                return Flow::close(
                    CLOSE_POLICY_VIOLATION,
                    format!("Token invalid for environment {env}"),
                );
            }
            ctx.env = env;
        }

        if let Some(previous) = ctx.session_id.take() {
            if previous != session_id {
                self.router.release(&previous, ctx.conn_id).await;
            }
        }

        if let Some(displaced) = self
            .registry
            .insert(&session_id, ctx.conn_id, ctx.conn.clone())
        {
            if displaced.conn_id != ctx.conn_id {
                tracing::info!(target = "session_relay::ws", session_id = %session_id, "session taken over by a newer socket");
            }
        }

        let new_session = NewSession {
            session_id: &session_id,
            environment: ctx.env,
            credential: &ctx.credential,
            ui_source: ctx.ui_source.as_deref(),
            now_ms: now_ms(),
        };
        if let Err(error) = self.directory.register(&new_session, &self.owner).await {
            self.registry.remove_connection(&session_id, ctx.conn_id);
            tracing::error!(target = "session_relay::ws", session_id = %session_id, error = %error, "directory write failed during registration");
            // The grouped write may have landed without the ownership record.
            if let Err(error) = self.directory.purge(&session_id).await {
                tracing::warn!(target = "session_relay::ws", session_id = %session_id, error = %error, "could not purge partial registration");
            }
            return Flow::close(CLOSE_REGISTRATION_FAILED, "Registration failed");
        }

        ctx.session_id = Some(session_id.clone());
        self.metrics.incr(Counter::SessionsRegistered);
        tracing::info!(target = "session_relay::ws", session_id = %session_id, env = %ctx.env, mode = ctx.credential.mode.as_str(), instance = %self.owner.instance_id, "session registered");

        let reply = protocol::session_registered(
            &session_id,
            ctx.env.as_str(),
            ctx.ui_source.as_deref(),
        );
        self.reply(ctx, &reply).await;
        Flow::Continue
    }

    async fn on_ping(&self, ctx: &mut ConnectionContext, frame: &Frame) -> Flow {
        let Some(session_id) = ctx.session_id.clone() else {
            return Flow::close(CLOSE_POLICY_VIOLATION, "Session not registered");
        };
        if frame.session_id() != Some(session_id.as_str()) {
            tracing::warn!(target = "session_relay::ws", session_id = %session_id, claimed = ?frame.session_id(), "ping without a matching session_id ignored");
            return Flow::Continue;
        }
        if let Err(error) = self.directory.touch(&session_id, now_ms()).await {
            tracing::warn!(target = "session_relay::ws", session_id = %session_id, error = %error, "activity refresh failed");
        }
        let reply = protocol::pong(&session_id, frame.data.get("timestamp").cloned(), now_ms());
        self.reply(ctx, &reply).await;
        Flow::Continue
    }

    async fn on_chat(&self, ctx: &mut ConnectionContext, frame: &Frame) -> Flow {
        let Some(session_id) = ctx.session_id.clone() else {
            return Flow::close(CLOSE_POLICY_VIOLATION, "Session not registered");
        };
        let rejection = match frame.session_id() {
            None => Some((
                "Session ID is required",
                String::from("chat_request must carry data.session_id"),
            )),
            Some(claimed) if claimed != session_id => Some((
                "Session ID mismatch",
                format!("session {claimed} is not registered on this connection"),
            )),
            Some(_) => None,
        };
        if let Some((error, message)) = rejection {
            tracing::warn!(target = "session_relay::ws", session_id = %session_id, claimed = ?frame.session_id(), error, "chat request rejected");
            self.reply(ctx, &protocol::chat_error(&session_id, error, &message))
                .await;
            return Flow::Continue;
        }

        let (credential, env) = match self.directory.session_auth(&session_id).await {
            Ok(Some(stored)) => stored,
            Ok(None) => (ctx.credential.clone(), ctx.env),
            Err(error) => {
                tracing::warn!(target = "session_relay::ws", session_id = %session_id, error = %error, "stored credential unavailable, using connection credential");
                (ctx.credential.clone(), ctx.env)
            }
        };

        if let Err(error) = self.gate.revalidate(&credential, env).await {
            tracing::warn!(target = "session_relay::ws", session_id = %session_id, error = %error, "chat request failed re-authentication");
            self.router.cleanup(&session_id).await;
            ctx.session_id = None;
            let reason = match credential.mode {
                AuthMode::Token => "Token expired",
                AuthMode::Secret => "Secret expired or invalid",
            };
            return Flow::close(CLOSE_POLICY_VIOLATION, reason);
        }

        if let Err(error) = self.directory.touch(&session_id, now_ms()).await {
            tracing::warn!(target = "session_relay::ws", session_id = %session_id, error = %error, "activity refresh failed");
        }

        if !self.reply(ctx, &protocol::chat_started(&session_id)).await {
            tracing::info!(target = "session_relay::ws", session_id = %session_id, "client gone before acknowledgement, skipping dispatch");
            return Flow::Continue;
        }

        let payload = chat_payload(&session_id, &frame.data, &credential);
        self.dispatcher.dispatch_chat(&session_id, payload, credential);
        Flow::Continue
    }

    async fn reply(&self, ctx: &ConnectionContext, frame: &Frame) -> bool {
        match tokio::time::timeout(self.send_timeout, ctx.conn.send_frame(frame)).await {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                tracing::warn!(target = "session_relay::ws", conn_id = %ctx.conn_id, event = %frame.event, error = %error, "reply failed");
                false
            }
            Err(_) => {
                tracing::warn!(target = "session_relay::ws", conn_id = %ctx.conn_id, event = %frame.event, "reply timed out");
                false
            }
        }
    }

    /// Close every socket held by this instance with a normal closure. Each
    /// read loop then runs its own disconnect cleanup.
    pub async fn close_all(&self, reason: &str) -> usize {
        let entries: Vec<_> = self
            .registry
            .session_ids()
            .iter()
            .filter_map(|session_id| self.registry.get(session_id))
            .collect();
        for entry in &entries {
            entry.conn.close(CLOSE_NORMAL, reason).await;
        }
        entries.len()
    }

    /// Connection teardown. Runs once per socket.
    pub async fn disconnect(&self, ctx: &ConnectionContext) {
        if let Some(session_id) = &ctx.session_id {
            let outcome = self.router.release(session_id, ctx.conn_id).await;
            tracing::info!(target = "session_relay::ws", session_id = %session_id, outcome = ?outcome, "client disconnected");
        } else {
            tracing::debug!(target = "session_relay::ws", conn_id = %ctx.conn_id, "unregistered client disconnected");
        }
    }

    async fn run_socket(self: Arc<Self>, socket: WebSocket, handshake: AcceptedHandshake) {
        let (sink, mut stream) = socket.split();
        let conn = Arc::new(WsConnection::new(sink));
        let mut ctx = ConnectionContext::new(handshake, conn.clone());
        self.metrics.incr(Counter::ConnectionsAccepted);
        tracing::info!(target = "session_relay::ws", conn_id = %ctx.conn_id, env = %ctx.env, "client connected");

        let close = loop {
            let Some(message) = stream.next().await else {
                break None;
            };
            match message {
                Ok(Message::Text(text)) => match self.handle_text(&mut ctx, text.as_str()).await {
                    Flow::Continue => {}
                    Flow::Close { code, reason } => break Some((code, reason)),
                },
                Ok(Message::Ping(data)) => {
                    if conn.send_message(Message::Pong(data)).await.is_err() {
                        break None;
                    }
                }
                Ok(Message::Close(_)) => break None,
                // Binary and pong frames carry nothing for us.
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(target = "session_relay::ws", conn_id = %ctx.conn_id, error = %error, "socket error");
                    break None;
                }
            }
        };

        if let Some((code, reason)) = close {
            tracing::info!(target = "session_relay::ws", conn_id = %ctx.conn_id, code, reason = %reason, "closing socket");
            conn.close(code, &reason).await;
        }
        self.disconnect(&ctx).await;
    }
}

/// Sending half of an axum WebSocket.
struct WsConnection {
    sink: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
}

impl WsConnection {
    fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink: tokio::sync::Mutex::new(sink),
        }
    }

    async fn send_message(&self, message: Message) -> Result<(), axum::Error> {
        self.sink.lock().await.send(message).await
    }
}

#[async_trait]
impl ClientConnection for WsConnection {
    async fn send_frame(&self, frame: &Frame) -> Result<(), String> {
        self.send_message(Message::Text(frame.to_text().into()))
            .await
            .map_err(|error| error.to_string())
    }

    async fn close(&self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        let _ = self.send_message(Message::Close(Some(frame))).await;
    }
}

/// Upgrade handler. Credentials are checked before the upgrade is
/// accepted; a rejected client gets HTTP 403 and never reaches the
/// registry.
pub async fn ws_handler(
    axum::extract::State(relay): axum::extract::State<Arc<SessionLifecycle>>,
    axum::extract::Query(query): axum::extract::Query<HandshakeQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let handshake = match relay.handshake(&query).await {
        Ok(handshake) => handshake,
        Err(error) => {
            let body = json!({
                "error": {
                    "code": "policy_violation",
                    "message": error.to_string(),
                    "retryable": false,
                    "statusCode": StatusCode::FORBIDDEN.as_u16(),
                    "closeCode": CLOSE_POLICY_VIOLATION,
                }
            });
            return (StatusCode::FORBIDDEN, Json(body)).into_response();
        }
    };

    match ws {
        Ok(ws) => ws
            .on_upgrade(move |socket| relay.run_socket(socket, handshake))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

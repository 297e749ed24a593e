//! Fire-and-forget calls to downstream services.
//!
//! Chat requests are handed to the fulfillment service on a detached task;
//! results only reach the client later through the delivery router, so
//! failures here are logged and never surfaced. Feedback goes to the log
//! sink the same way.

use std::{sync::Arc, time::Duration};

use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;

use crate::{
    auth::{AuthMode, SessionCredential},
    metrics::{Counter, RelayMetrics},
};

pub struct Dispatcher {
    client: reqwest::Client,
    fulfillment_url: Option<String>,
    log_url: Option<String>,
    dispatch_timeout: Duration,
    feedback_timeout: Duration,
    metrics: Arc<RelayMetrics>,
}

impl Dispatcher {
    pub fn new(
        fulfillment_url: Option<String>,
        log_url: Option<String>,
        dispatch_timeout: Duration,
        feedback_timeout: Duration,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            fulfillment_url,
            log_url,
            dispatch_timeout,
            feedback_timeout,
            metrics,
        }
    }

    /// Start the fulfillment call for a chat request without waiting on it.
    pub fn dispatch_chat(
        self: &Arc<Self>,
        session_id: &str,
        payload: Value,
        credential: SessionCredential,
    ) -> Option<JoinHandle<()>> {
        let Some(url) = self.fulfillment_url.clone() else {
            tracing::warn!(target = "session_relay::dispatch", session_id = %session_id, "no fulfillment url configured, chat request dropped");
            return None;
        };

        self.metrics.incr(Counter::DispatchesStarted);
        let dispatcher = Arc::clone(self);
        let session_id = session_id.to_string();
        Some(tokio::spawn(async move {
            match dispatcher.send_chat(&url, &payload, &credential).await {
                Ok(status) => {
                    tracing::info!(target = "session_relay::dispatch", session_id = %session_id, status, "fulfillment call completed");
                }
                Err(error) => {
                    dispatcher.metrics.incr(Counter::DispatchFailures);
                    tracing::warn!(target = "session_relay::dispatch", session_id = %session_id, error = %error, "fulfillment call failed");
                }
            }
        }))
    }

    async fn send_chat(
        &self,
        url: &str,
        payload: &Value,
        credential: &SessionCredential,
    ) -> Result<u16, String> {
        let mut request = self
            .client
            .get(url)
            .timeout(self.dispatch_timeout)
            .json(payload);
        if credential.mode == AuthMode::Token {
            request = request.bearer_auth(&credential.value);
        }
        let response = request.send().await.map_err(|error| {
            if error.is_timeout() {
                format!("timed out after {}ms", self.dispatch_timeout.as_millis())
            } else {
                error.to_string()
            }
        })?;
        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(format!("HTTP {status}"))
        }
    }

    /// Post a feedback record to the log sink. Failures are logged only.
    pub async fn send_feedback(
        &self,
        session_id: &str,
        payload: &Value,
        bearer: Option<&str>,
    ) -> bool {
        let Some(url) = self.log_url.as_deref() else {
            tracing::warn!(target = "session_relay::dispatch", session_id = %session_id, "no log sink configured, feedback not forwarded");
            return false;
        };

        let mut request = self
            .client
            .post(url)
            .timeout(self.feedback_timeout)
            .json(payload);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                tracing::info!(target = "session_relay::dispatch", session_id = %session_id, "feedback logged");
                true
            }
            Ok(response) => {
                tracing::warn!(target = "session_relay::dispatch", session_id = %session_id, status = %response.status(), "log sink rejected feedback");
                false
            }
            Err(error) => {
                tracing::warn!(target = "session_relay::dispatch", session_id = %session_id, error = %error, "log sink unreachable");
                false
            }
        }
    }
}

/// Body sent to the fulfillment service for a chat request.
pub fn chat_payload(session_id: &str, data: &Value, credential: &SessionCredential) -> Value {
    let mut payload: Map<String, Value> = data.as_object().cloned().unwrap_or_default();
    let field = |key: &str| data.get(key).cloned().unwrap_or(Value::Null);

    payload.insert("session_id".into(), Value::String(session_id.to_string()));
    payload.insert("sso_details".into(), field("sso_details"));
    payload.insert("text".into(), field("text"));
    payload.insert("context".into(), field("context"));
    payload.insert(
        "hasAttachments".into(),
        data.get("hasAttachments").cloned().unwrap_or(Value::Bool(false)),
    );
    payload.insert(
        "agenticai_enabled".into(),
        data.get("agenticai_enabled").cloned().unwrap_or(Value::Bool(true)),
    );
    payload.insert("is_websocket".into(), Value::Bool(true));
    payload.insert("file".into(), field("file"));
    payload.insert("content_type".into(), field("content_type"));

    if credential.mode == AuthMode::Secret {
        payload.insert("secret".into(), Value::String(credential.value.clone()));
    } else {
        payload.remove("secret");
    }
    Value::Object(payload)
}

/// Record written to the log sink for a feedback submission.
pub fn feedback_payload(query_id: &str, feedback: &str) -> Value {
    json!({
        "operation": "log",
        "log_type": "agentic",
        "is_agentic": "true",
        "table_name": "agent_feedback",
        "data": {
            "ui_queries_id": query_id,
            "feedback": feedback,
        }
    })
}

//! Delivery router: "send event E to session S" from any instance.
//!
//! A session with a socket on this instance is served locally. Otherwise the
//! ownership record names the instance holding the socket and the event is
//! forwarded to it exactly once; the receiving side only ever delivers
//! through [`DeliveryRouter::deliver_local`], so forwarding is single-hop.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    directory::{OwnerRecord, SessionDirectory},
    error::DeliveryError,
    metrics::{Counter, RelayMetrics},
    protocol::Frame,
    registry::{ConnectionRegistry, RegistryEntry},
};

/// Body of an instance-to-instance forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitRequest {
    pub session_id: String,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, owner: &OwnerRecord, request: &EmitRequest) -> Result<(), String>;
}

/// Forwards over HTTP to the owner's internal listener.
pub struct HttpForwarder {
    client: reqwest::Client,
}

impl HttpForwarder {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, owner: &OwnerRecord, request: &EmitRequest) -> Result<(), String> {
        let response = self
            .client
            .post(owner.emit_url())
            .json(request)
            .send()
            .await
            .map_err(|error| error.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("HTTP {}", response.status()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivered {
    Local,
    Forwarded { instance: String },
}

/// What disconnect handling did for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Local entry removed and directory records purged.
    Purged,
    /// Only the local entry was removed; the directory names another owner.
    LocalOnly,
    /// A newer socket owns the session; nothing was touched.
    Superseded,
}

pub struct DeliveryRouter {
    registry: Arc<ConnectionRegistry>,
    directory: SessionDirectory,
    forwarder: Arc<dyn Forwarder>,
    instance_id: String,
    send_timeout: Duration,
    metrics: Arc<RelayMetrics>,
}

impl DeliveryRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        directory: SessionDirectory,
        forwarder: Arc<dyn Forwarder>,
        instance_id: impl Into<String>,
        send_timeout: Duration,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            registry,
            directory,
            forwarder,
            instance_id: instance_id.into(),
            send_timeout,
            metrics,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub async fn deliver(
        &self,
        session_id: &str,
        event: &str,
        data: Value,
    ) -> Result<Delivered, DeliveryError> {
        let result = self.route(session_id, event, data).await;
        if let Err(error) = &result {
            self.metrics.incr(Counter::FailedDeliveries);
            tracing::warn!(target = "session_relay::routing", session_id = %session_id, event = %event, error = %error, "delivery failed");
        }
        result
    }

    async fn route(
        &self,
        session_id: &str,
        event: &str,
        data: Value,
    ) -> Result<Delivered, DeliveryError> {
        match self.directory.connection_state(session_id).await {
            Ok(Some(_)) => {}
            Ok(None) => return Err(DeliveryError::UnknownSession(session_id.to_string())),
            Err(error) => {
                tracing::warn!(target = "session_relay::routing", session_id = %session_id, error = %error, "directory lookup failed, treating session as unknown");
                return Err(DeliveryError::UnknownSession(session_id.to_string()));
            }
        }

        if let Some(entry) = self.registry.get(session_id) {
            let frame = Frame::new(event, data);
            self.send_local(session_id, entry, &frame).await?;
            self.check_ownership(session_id).await;
            return Ok(Delivered::Local);
        }

        let owner = match self.directory.owner(session_id).await {
            Ok(Some(owner)) => owner,
            Ok(None) => return Err(DeliveryError::NoRoute(session_id.to_string())),
            Err(error) => {
                tracing::warn!(target = "session_relay::routing", session_id = %session_id, error = %error, "ownership lookup failed");
                return Err(DeliveryError::NoRoute(session_id.to_string()));
            }
        };

        if owner.instance_id == self.instance_id {
            // The directory says we own it, but the socket is gone.
            tracing::warn!(target = "session_relay::routing", session_id = %session_id, "ownership record names this instance without a local socket");
            return Err(DeliveryError::NoRoute(session_id.to_string()));
        }

        let request = EmitRequest {
            session_id: session_id.to_string(),
            event: event.to_string(),
            data,
        };
        tracing::debug!(target = "session_relay::routing", session_id = %session_id, instance = %owner.instance_id, url = %owner.emit_url(), "forwarding");
        self.forwarder
            .forward(&owner, &request)
            .await
            .map_err(|reason| DeliveryError::ForwardFailed {
                instance: owner.instance_id.clone(),
                reason,
            })?;
        self.metrics.incr(Counter::ForwardedDeliveries);
        Ok(Delivered::Forwarded {
            instance: owner.instance_id,
        })
    }

    /// Local delivery always wins, but a record naming another instance
    /// means the client reconnected there and this socket is on its way out.
    async fn check_ownership(&self, session_id: &str) {
        match self.directory.owner(session_id).await {
            Ok(Some(owner)) if owner.instance_id != self.instance_id => {
                self.metrics.incr(Counter::OwnershipConflicts);
                tracing::warn!(target = "session_relay::routing", session_id = %session_id, owner = %owner.instance_id, "delivered locally to a session owned by another instance");
            }
            Ok(_) => {}
            Err(error) => {
                tracing::debug!(target = "session_relay::routing", session_id = %session_id, error = %error, "ownership check skipped");
            }
        }
    }

    /// Deliver through this instance's registry only. Never forwards.
    pub async fn deliver_local(
        &self,
        session_id: &str,
        event: &str,
        data: Value,
    ) -> Result<(), DeliveryError> {
        let Some(entry) = self.registry.get(session_id) else {
            self.metrics.incr(Counter::FailedDeliveries);
            tracing::warn!(target = "session_relay::routing", session_id = %session_id, event = %event, "forwarded event for a session without a local socket");
            return Err(DeliveryError::NotLocal(session_id.to_string()));
        };
        let frame = Frame::new(event, data);
        self.send_local(session_id, entry, &frame).await.inspect_err(|_| {
            self.metrics.incr(Counter::FailedDeliveries);
        })
    }

    async fn send_local(
        &self,
        session_id: &str,
        entry: RegistryEntry,
        frame: &Frame,
    ) -> Result<(), DeliveryError> {
        let reason = match tokio::time::timeout(self.send_timeout, entry.conn.send_frame(frame)).await {
            Ok(Ok(())) => {
                self.metrics.incr(Counter::LocalDeliveries);
                return Ok(());
            }
            Ok(Err(reason)) => reason,
            Err(_) => format!("send timed out after {}ms", self.send_timeout.as_millis()),
        };

        // A failed send means the socket is dead.
        self.release(session_id, entry.conn_id).await;
        Err(DeliveryError::SendFailed {
            session_id: session_id.to_string(),
            reason,
        })
    }

    /// Disconnect cleanup for the socket `conn_id`. Directory records are
    /// purged only while this socket still holds the registry entry and the
    /// ownership record names this instance.
    pub async fn release(&self, session_id: &str, conn_id: Uuid) -> Release {
        if !self.registry.remove_connection(session_id, conn_id) {
            tracing::debug!(target = "session_relay::routing", session_id = %session_id, "release skipped, session owned by a newer socket");
            return Release::Superseded;
        }

        match self.directory.owner(session_id).await {
            Ok(Some(owner)) if owner.instance_id != self.instance_id => {
                tracing::info!(target = "session_relay::routing", session_id = %session_id, owner = %owner.instance_id, "session re-registered elsewhere, keeping directory records");
                Release::LocalOnly
            }
            Ok(_) => {
                self.purge_directory(session_id).await;
                Release::Purged
            }
            Err(error) => {
                tracing::warn!(target = "session_relay::routing", session_id = %session_id, error = %error, "ownership lookup failed during release");
                Release::LocalOnly
            }
        }
    }

    /// Full cleanup regardless of which socket holds the session.
    /// Idempotent.
    pub async fn cleanup(&self, session_id: &str) {
        self.registry.remove(session_id);
        self.purge_directory(session_id).await;
    }

    async fn purge_directory(&self, session_id: &str) {
        match self.directory.purge(session_id).await {
            Ok(0) => {}
            Ok(removed) => {
                self.metrics.incr(Counter::SessionsCleanedUp);
                tracing::info!(target = "session_relay::routing", session_id = %session_id, removed, "session cleaned up");
            }
            Err(error) => {
                tracing::warn!(target = "session_relay::routing", session_id = %session_id, error = %error, "directory cleanup failed");
            }
        }
    }
}

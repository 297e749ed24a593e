//! Multi-instance WebSocket session relay.
//!
//! Clients hold a WebSocket to one relay instance; backend services push
//! events to a session through any instance. A shared [`directory`] records
//! which instance owns each session, and the [`routing`] layer forwards a
//! delivery to the owner in a single hop when the socket is not local.

pub mod api;
pub mod auth;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod protocol;
pub mod reaper;
pub mod registry;
pub mod routing;
pub mod session;
pub mod store;

pub use config::Config;
pub use session::{RelayOptions, SessionLifecycle};

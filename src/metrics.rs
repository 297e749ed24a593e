//! Process-wide relay counters.
//!
//! Counters are plain atomics so any task can bump them without a lock.
//! [`RelayMetrics::snapshot`] feeds the health endpoint and
//! [`RelayMetrics::to_prometheus`] the internal metrics endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    ConnectionsAccepted,
    HandshakesRejected,
    SessionsRegistered,
    SessionsCleanedUp,
    LocalDeliveries,
    ForwardedDeliveries,
    FailedDeliveries,
    DispatchesStarted,
    DispatchFailures,
    SessionsReaped,
    ReaperCycles,
    DirectoryReconnects,
    OwnershipConflicts,
}

impl Counter {
    const ALL: [Counter; 13] = [
        Counter::ConnectionsAccepted,
        Counter::HandshakesRejected,
        Counter::SessionsRegistered,
        Counter::SessionsCleanedUp,
        Counter::LocalDeliveries,
        Counter::ForwardedDeliveries,
        Counter::FailedDeliveries,
        Counter::DispatchesStarted,
        Counter::DispatchFailures,
        Counter::SessionsReaped,
        Counter::ReaperCycles,
        Counter::DirectoryReconnects,
        Counter::OwnershipConflicts,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::ConnectionsAccepted => "connections_accepted",
            Self::HandshakesRejected => "handshakes_rejected",
            Self::SessionsRegistered => "sessions_registered",
            Self::SessionsCleanedUp => "sessions_cleaned_up",
            Self::LocalDeliveries => "local_deliveries",
            Self::ForwardedDeliveries => "forwarded_deliveries",
            Self::FailedDeliveries => "failed_deliveries",
            Self::DispatchesStarted => "dispatches_started",
            Self::DispatchFailures => "dispatch_failures",
            Self::SessionsReaped => "sessions_reaped",
            Self::ReaperCycles => "reaper_cycles",
            Self::DirectoryReconnects => "directory_reconnects",
            Self::OwnershipConflicts => "ownership_conflicts",
        }
    }

    fn help(self) -> &'static str {
        match self {
            Self::ConnectionsAccepted => "WebSocket upgrades accepted.",
            Self::HandshakesRejected => "WebSocket upgrades rejected by the credential gate.",
            Self::SessionsRegistered => "Sessions registered on this instance.",
            Self::SessionsCleanedUp => "Sessions purged by this instance.",
            Self::LocalDeliveries => "Events delivered to a local socket.",
            Self::ForwardedDeliveries => "Events forwarded to the owning instance.",
            Self::FailedDeliveries => "Delivery attempts that failed.",
            Self::DispatchesStarted => "Chat requests dispatched downstream.",
            Self::DispatchFailures => "Downstream dispatches that failed or timed out.",
            Self::SessionsReaped => "Stale sessions removed by the reaper.",
            Self::ReaperCycles => "Reaper cycles run.",
            Self::DirectoryReconnects => "Directory reconnect attempts.",
            Self::OwnershipConflicts => "Local deliveries to a session owned by another instance.",
        }
    }
}

/// Serializable view of every counter.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections_accepted: u64,
    pub handshakes_rejected: u64,
    pub sessions_registered: u64,
    pub sessions_cleaned_up: u64,
    pub local_deliveries: u64,
    pub forwarded_deliveries: u64,
    pub failed_deliveries: u64,
    pub dispatches_started: u64,
    pub dispatch_failures: u64,
    pub sessions_reaped: u64,
    pub reaper_cycles: u64,
    pub directory_reconnects: u64,
    pub ownership_conflicts: u64,
}

#[derive(Debug)]
pub struct RelayMetrics {
    started: Instant,
    counters: [AtomicU64; 13],
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            counters: Default::default(),
        }
    }

    fn slot(&self, counter: Counter) -> &AtomicU64 {
        &self.counters[counter as usize]
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.slot(counter).fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.slot(counter).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            connections_accepted: self.get(Counter::ConnectionsAccepted),
            handshakes_rejected: self.get(Counter::HandshakesRejected),
            sessions_registered: self.get(Counter::SessionsRegistered),
            sessions_cleaned_up: self.get(Counter::SessionsCleanedUp),
            local_deliveries: self.get(Counter::LocalDeliveries),
            forwarded_deliveries: self.get(Counter::ForwardedDeliveries),
            failed_deliveries: self.get(Counter::FailedDeliveries),
            dispatches_started: self.get(Counter::DispatchesStarted),
            dispatch_failures: self.get(Counter::DispatchFailures),
            sessions_reaped: self.get(Counter::SessionsReaped),
            reaper_cycles: self.get(Counter::ReaperCycles),
            directory_reconnects: self.get(Counter::DirectoryReconnects),
            ownership_conflicts: self.get(Counter::OwnershipConflicts),
        }
    }

    /// Export metrics in Prometheus text exposition format.
    pub fn to_prometheus(&self, local_sessions: usize) -> String {
        let mut out = String::new();

        out.push_str("# HELP session_relay_uptime_seconds Relay uptime in seconds.\n");
        out.push_str("# TYPE session_relay_uptime_seconds gauge\n");
        out.push_str(&format!(
            "session_relay_uptime_seconds {}\n",
            self.started.elapsed().as_secs()
        ));

        out.push_str("# HELP session_relay_local_sessions Sockets held by this instance.\n");
        out.push_str("# TYPE session_relay_local_sessions gauge\n");
        out.push_str(&format!("session_relay_local_sessions {local_sessions}\n"));

        for counter in Counter::ALL {
            let name = counter.name();
            out.push_str(&format!(
                "# HELP session_relay_{name}_total {}\n",
                counter.help()
            ));
            out.push_str(&format!("# TYPE session_relay_{name}_total counter\n"));
            out.push_str(&format!(
                "session_relay_{name}_total {}\n",
                self.get(counter)
            ));
        }

        out
    }
}

//! Stale session reaper.
//!
//! Each cycle probes the directory, reconnecting and skipping the pass when
//! it is unreachable, then purges sessions idle for longer than the
//! configured age. Sockets held elsewhere are untouched; their owner finds
//! out on the next failed send.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;

use crate::{
    directory::{now_ms, SessionDirectory},
    metrics::{Counter, RelayMetrics},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleReport {
    /// The directory did not answer; reconnect was attempted.
    Skipped { reconnected: bool },
    Swept { reaped: Vec<String> },
}

pub struct Reaper {
    directory: SessionDirectory,
    metrics: Arc<RelayMetrics>,
    interval: Duration,
    max_age: Duration,
    stats_every: u64,
    cycles: u64,
}

impl Reaper {
    pub fn new(
        directory: SessionDirectory,
        metrics: Arc<RelayMetrics>,
        interval: Duration,
        max_age: Duration,
        stats_every: u64,
    ) -> Self {
        Self {
            directory,
            metrics,
            interval,
            max_age,
            stats_every,
            cycles: 0,
        }
    }

    pub async fn run_cycle(&mut self, now_ms: i64) -> CycleReport {
        self.cycles += 1;
        self.metrics.incr(Counter::ReaperCycles);

        if let Err(error) = self.directory.ping().await {
            tracing::warn!(target = "session_relay::reaper", error = %error, "directory unreachable, reconnecting");
            self.metrics.incr(Counter::DirectoryReconnects);
            let reconnected = match self.directory.reconnect().await {
                Ok(()) => {
                    tracing::info!(target = "session_relay::reaper", "directory reconnected");
                    true
                }
                Err(error) => {
                    tracing::error!(target = "session_relay::reaper", error = %error, "directory reconnect failed");
                    false
                }
            };
            return CycleReport::Skipped { reconnected };
        }

        let stale = match self.directory.stale_sessions(self.max_age, now_ms).await {
            Ok(stale) => stale,
            Err(error) => {
                tracing::warn!(target = "session_relay::reaper", error = %error, "stale session scan failed");
                Vec::new()
            }
        };

        let mut reaped = Vec::with_capacity(stale.len());
        for session_id in stale {
            match self.directory.purge(&session_id).await {
                Ok(_) => {
                    tracing::info!(target = "session_relay::reaper", session_id = %session_id, "stale session reaped");
                    reaped.push(session_id);
                }
                Err(error) => {
                    tracing::warn!(target = "session_relay::reaper", session_id = %session_id, error = %error, "failed to reap session");
                }
            }
        }
        self.metrics.add(Counter::SessionsReaped, reaped.len() as u64);

        if self.stats_every > 0 && self.cycles % self.stats_every == 0 {
            self.log_stats().await;
        }

        CycleReport::Swept { reaped }
    }

    async fn log_stats(&self) {
        match self.directory.approx_sessions().await {
            Ok(approx_sessions) => {
                tracing::info!(target = "session_relay::reaper", backend = %self.directory.describe(), approx_sessions, cycles = self.cycles, "directory stats");
            }
            Err(error) => {
                tracing::warn!(target = "session_relay::reaper", error = %error, "directory stats unavailable");
            }
        }
    }

    /// Run forever on the configured interval.
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.run_cycle(now_ms()).await;
            }
        })
    }
}

//! Daemon registry: tracks the single session-watching daemon.
//!
//! Registration always succeeds and unconditionally replaces the current
//! record — a crashed-and-restarted daemon just registers again rather
//! than negotiating identity continuity. Heartbeats from any other daemon
//! id produce [`HeartbeatOutcome::UnknownDaemon`], which the daemon treats
//! as "re-register", not as a fatal error.

use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;

use crate::models::{now_ms, DaemonRecord};

/// Registration payload from the daemon.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDaemon {
    pub daemon_id: String,
    pub pid: u32,
    pub version: String,
    pub watch_path: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Defaults to now when the daemon does not report its start time.
    #[serde(default)]
    pub started_at: Option<i64>,
}

/// Result of a heartbeat attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Accepted,
    /// The heartbeat named a daemon that is not the registered one. The
    /// caller recovers by re-registering; the server may have restarted
    /// independently of the daemon.
    UnknownDaemon,
}

/// Read-only liveness view.
#[derive(Debug, Clone)]
pub struct DaemonStatus {
    pub connected: bool,
    pub daemon: Option<DaemonRecord>,
}

/// Holds at most one active [`DaemonRecord`].
///
/// Not internally synchronized: the [`Monitor`](crate::hub::Monitor)
/// serializes all access alongside the session table so registry and
/// table mutations publish atomically.
#[derive(Debug, Default)]
pub struct DaemonRegistry {
    current: Option<DaemonRecord>,
}

impl DaemonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current record. Returns the record that was displaced,
    /// if any, so the caller can decide what to do with its sessions.
    pub fn register(&mut self, req: RegisterDaemon) -> Option<DaemonRecord> {
        let now = now_ms();
        let record = DaemonRecord {
            daemon_id: req.daemon_id,
            pid: req.pid,
            version: req.version,
            watch_path: req.watch_path,
            capabilities: req.capabilities,
            started_at: req.started_at.unwrap_or(now),
            last_heartbeat_at: now,
        };
        tracing::info!(daemon_id = %record.daemon_id, pid = record.pid, "daemon registered");
        self.current.replace(record)
    }

    /// Refresh liveness for the registered daemon. `session_count` is the
    /// daemon's own view of how many sessions it is tracking, recorded
    /// here only for diagnostics.
    pub fn heartbeat(&mut self, daemon_id: &str, session_count: u64) -> HeartbeatOutcome {
        match self.current.as_mut() {
            Some(record) if record.daemon_id == daemon_id => {
                record.last_heartbeat_at = now_ms();
                tracing::trace!(daemon_id = %daemon_id, session_count, "heartbeat accepted");
                HeartbeatOutcome::Accepted
            }
            _ => {
                tracing::debug!(daemon_id = %daemon_id, "heartbeat from unknown daemon");
                HeartbeatOutcome::UnknownDaemon
            }
        }
    }

    /// Clear the record if it matches. A mismatch is a harmless no-op, so
    /// deregistering twice (or deregistering a superseded daemon) is safe.
    pub fn deregister(&mut self, daemon_id: &str) -> Option<DaemonRecord> {
        if self
            .current
            .as_ref()
            .is_some_and(|record| record.daemon_id == daemon_id)
        {
            tracing::info!(daemon_id = %daemon_id, "daemon deregistered");
            self.current.take()
        } else {
            None
        }
    }

    pub fn current(&self) -> Option<&DaemonRecord> {
        self.current.as_ref()
    }

    /// Whether `daemon_id` is the registered daemon.
    pub fn is_current(&self, daemon_id: &str) -> bool {
        self.current
            .as_ref()
            .is_some_and(|record| record.daemon_id == daemon_id)
    }

    /// Liveness snapshot. A daemon is connected while its last heartbeat
    /// is within `stale_after`; beyond that it is reported as disconnected
    /// even though the record is retained.
    pub fn status(&self, stale_after: Duration) -> DaemonStatus {
        let connected = self.current.as_ref().is_some_and(|record| {
            let age_ms = now_ms().saturating_sub(record.last_heartbeat_at);
            age_ms <= stale_after.as_millis() as i64
        });
        DaemonStatus {
            connected,
            daemon: self.current.clone(),
        }
    }
}

//! Broadcast hub: fans every monitoring state change out to stream
//! subscribers, and owns the atomicity story for new connections.
//!
//! [`Monitor`] holds the daemon registry and session table behind a single
//! mutex and publishes [`MonitorEvent`]s on a `tokio::sync::broadcast`
//! channel. Publishing happens while the lock is held — `broadcast::send`
//! never runs subscriber code, so a slow subscriber cannot stall ingestion
//! — which is what makes [`Monitor::subscribe`] airtight: composing the
//! snapshot and subscribing under that same lock means no event can slip
//! between the two, and no event already folded into the snapshot is
//! redelivered.
//!
//! Delivery is per-subscriber in publish order with no persistence. A
//! receiver that falls more than the channel capacity behind misses the
//! overwritten events and keeps going from the tail; only a reconnect
//! (fresh snapshot) restores full consistency.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::{DaemonRecord, SessionRecord};
use crate::registry::{DaemonRegistry, DaemonStatus, HeartbeatOutcome, RegisterDaemon};
use crate::sessions::SessionTable;

/// Events delivered to stream subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum MonitorEvent {
    /// Full current state. Sent exactly once, first, on every new stream;
    /// never re-sent automatically.
    Snapshot {
        sessions: Vec<SessionRecord>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        daemon: Option<DaemonRecord>,
        connected: bool,
    },
    /// Exactly what one accepted ingest changed.
    SessionsChanged {
        sessions: Vec<SessionRecord>,
        removed_session_ids: Vec<String>,
    },
    DaemonRegistered {
        daemon: DaemonRecord,
    },
    DaemonDeregistered {
        daemon_id: String,
    },
}

/// Result of a session ingest attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted { upserted: usize, removed: usize },
    /// The batch named a daemon that is not the registered one; the table
    /// was left untouched.
    UnknownDaemon,
}

/// One page of sessions plus the liveness flag the UI renders next to it.
#[derive(Debug, Clone)]
pub struct SessionPage {
    pub sessions: Vec<SessionRecord>,
    pub total: usize,
    pub connected: bool,
}

#[derive(Debug, Default)]
struct MonitorState {
    registry: DaemonRegistry,
    table: SessionTable,
}

/// Coordinator over the daemon registry, session table, and broadcast
/// channel. All mutation goes through these methods; the raw containers
/// are never exposed.
#[derive(Debug)]
pub struct Monitor {
    state: Mutex<MonitorState>,
    events_tx: broadcast::Sender<MonitorEvent>,
    stale_after: Duration,
}

impl Monitor {
    pub fn new(stale_after: Duration, event_capacity: usize) -> Self {
        let (events_tx, _) = broadcast::channel(event_capacity);
        Self {
            state: Mutex::new(MonitorState::default()),
            events_tx,
            stale_after,
        }
    }

    // A poisoned lock means a panic mid-mutation elsewhere; the state
    // itself is a plain map and registry slot, so recover rather than
    // cascade the panic into every request handler.
    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: MonitorEvent) {
        // Err here only means no subscribers are connected
        let _ = self.events_tx.send(event);
    }

    /// Register (or replace) the daemon. Sessions left behind by a
    /// previous registration are purged first: a new daemon starts from an
    /// empty table and syncs its own world with its first ingest. The
    /// purge and the registration publish as consecutive events.
    pub fn register(&self, req: RegisterDaemon) {
        let mut state = self.lock();

        if !state.table.is_empty() {
            let stale_ids: Vec<String> = state
                .table
                .all()
                .into_iter()
                .map(|s| s.session_id)
                .collect();
            let dropped = state.table.clear();
            tracing::info!(dropped, "purged sessions from previous daemon registration");
            self.publish(MonitorEvent::SessionsChanged {
                sessions: Vec::new(),
                removed_session_ids: stale_ids,
            });
        }

        state.registry.register(req);
        if let Some(daemon) = state.registry.current().cloned() {
            self.publish(MonitorEvent::DaemonRegistered { daemon });
        }
    }

    pub fn heartbeat(&self, daemon_id: &str, session_count: u64) -> HeartbeatOutcome {
        self.lock().registry.heartbeat(daemon_id, session_count)
    }

    /// Deregister the daemon if it is the current one. The session table
    /// is kept — its records stay visible (with `connected: false`) until
    /// a new daemon registers and purges them.
    pub fn deregister(&self, daemon_id: &str) {
        let removed = self.lock().registry.deregister(daemon_id);
        if let Some(record) = removed {
            self.publish(MonitorEvent::DaemonDeregistered {
                daemon_id: record.daemon_id,
            });
        }
    }

    /// Apply one diff batch from the daemon. Batches from a daemon that is
    /// not the registered one are rejected without touching the table.
    /// Every accepted call publishes exactly one `sessions_changed` event
    /// describing what was applied.
    pub fn ingest(
        &self,
        daemon_id: &str,
        upserts: Vec<SessionRecord>,
        removed_ids: Vec<String>,
    ) -> IngestOutcome {
        let mut state = self.lock();

        if !state.registry.is_current(daemon_id) {
            tracing::debug!(daemon_id = %daemon_id, "ingest rejected: unknown daemon");
            return IngestOutcome::UnknownDaemon;
        }

        let applied = state.table.apply(upserts, removed_ids);
        let outcome = IngestOutcome::Accepted {
            upserted: applied.upserted.len(),
            removed: applied.removed_ids.len(),
        };
        self.publish(MonitorEvent::SessionsChanged {
            sessions: applied.upserted,
            removed_session_ids: applied.removed_ids,
        });
        outcome
    }

    pub fn status(&self) -> DaemonStatus {
        self.lock().registry.status(self.stale_after)
    }

    pub fn list_sessions(&self, limit: Option<usize>, offset: Option<usize>) -> SessionPage {
        let state = self.lock();
        let (sessions, total) = state.table.list(limit, offset);
        let connected = state.registry.status(self.stale_after).connected;
        SessionPage {
            sessions,
            total,
            connected,
        }
    }

    /// Compose the snapshot and subscribe in one atomic step. The returned
    /// receiver sees every event published after the snapshot and none
    /// before it.
    pub fn subscribe(&self) -> (MonitorEvent, broadcast::Receiver<MonitorEvent>) {
        let state = self.lock();
        let status = state.registry.status(self.stale_after);
        let snapshot = MonitorEvent::Snapshot {
            sessions: state.table.all(),
            daemon: status.daemon,
            connected: status.connected,
        };
        let rx = self.events_tx.subscribe();
        (snapshot, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SessionStatus, TokenUsage};
    use std::collections::BTreeSet;

    fn monitor() -> Monitor {
        Monitor::new(Duration::from_secs(30), 64)
    }

    fn register_req(id: &str) -> RegisterDaemon {
        RegisterDaemon {
            daemon_id: id.to_string(),
            pid: 7,
            version: "1.0.0".to_string(),
            watch_path: "/watch".to_string(),
            capabilities: BTreeSet::new(),
            started_at: None,
        }
    }

    fn session(id: &str) -> SessionRecord {
        SessionRecord {
            session_id: id.to_string(),
            file_path: format!("/s/{}.jsonl", id),
            cwd: "/work".to_string(),
            project_name: "work".to_string(),
            project_hash: "beef".to_string(),
            status: SessionStatus::Working,
            message_count: 1,
            turn_count: 1,
            token_usage: TokenUsage::default(),
            started_at: 0,
            last_activity_at: 1,
            last_read_offset: 0,
            is_subagent: false,
            git_branch: None,
            goal: String::new(),
            recent_output: String::new(),
            pending_tool_use: None,
            model: None,
            parent_session_id: None,
        }
    }

    #[test]
    fn ingest_requires_registered_daemon() {
        let monitor = monitor();
        assert_eq!(
            monitor.ingest("d1", vec![session("s1")], vec![]),
            IngestOutcome::UnknownDaemon
        );
        assert_eq!(monitor.list_sessions(None, None).total, 0);
    }

    #[test]
    fn ingest_from_superseded_daemon_leaves_table_unchanged() {
        let monitor = monitor();
        monitor.register(register_req("d1"));
        monitor.ingest("d1", vec![session("s1")], vec![]);
        monitor.register(register_req("d2"));

        // d1 was replaced; its batches must no longer land
        assert_eq!(
            monitor.ingest("d1", vec![session("s2")], vec![]),
            IngestOutcome::UnknownDaemon
        );
        assert_eq!(monitor.list_sessions(None, None).total, 0);
    }

    #[test]
    fn accepted_ingest_is_visible_via_list() {
        let monitor = monitor();
        monitor.register(register_req("d1"));
        let outcome = monitor.ingest("d1", vec![session("s1")], vec![]);
        assert_eq!(
            outcome,
            IngestOutcome::Accepted {
                upserted: 1,
                removed: 0
            }
        );

        let page = monitor.list_sessions(None, None);
        assert_eq!(page.total, 1);
        assert_eq!(page.sessions[0].session_id, "s1");
        assert!(page.connected);

        monitor.ingest("d1", vec![], vec!["s1".to_string()]);
        assert_eq!(monitor.list_sessions(None, None).total, 0);
    }

    #[tokio::test]
    async fn accepted_ingest_publishes_exactly_one_change_event() {
        let monitor = monitor();
        monitor.register(register_req("d1"));
        let (_, mut rx) = monitor.subscribe();

        monitor.ingest("d1", vec![session("s1")], vec!["ghost".to_string()]);

        match rx.recv().await.unwrap() {
            MonitorEvent::SessionsChanged {
                sessions,
                removed_session_ids,
            } => {
                assert_eq!(sessions.len(), 1);
                assert_eq!(sessions[0].session_id, "s1");
                // "ghost" never existed, so it is not reported as removed
                assert!(removed_session_ids.is_empty());
            }
            other => panic!("Expected SessionsChanged, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejected_ingest_publishes_nothing() {
        let monitor = monitor();
        monitor.register(register_req("d1"));
        let (_, mut rx) = monitor.subscribe();
        monitor.ingest("intruder", vec![session("s1")], vec![]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn register_purges_previous_sessions_and_announces_daemon() {
        let monitor = monitor();
        monitor.register(register_req("d1"));
        monitor.ingest("d1", vec![session("s1")], vec![]);

        let (_, mut rx) = monitor.subscribe();
        monitor.register(register_req("d2"));

        match rx.recv().await.unwrap() {
            MonitorEvent::SessionsChanged {
                sessions,
                removed_session_ids,
            } => {
                assert!(sessions.is_empty());
                assert_eq!(removed_session_ids, vec!["s1".to_string()]);
            }
            other => panic!("Expected purge event, got {:?}", other),
        }
        match rx.recv().await.unwrap() {
            MonitorEvent::DaemonRegistered { daemon } => assert_eq!(daemon.daemon_id, "d2"),
            other => panic!("Expected DaemonRegistered, got {:?}", other),
        }
        assert_eq!(monitor.list_sessions(None, None).total, 0);
    }

    #[tokio::test]
    async fn deregister_announces_once_and_is_idempotent() {
        let monitor = monitor();
        monitor.register(register_req("d1"));
        let (_, mut rx) = monitor.subscribe();

        monitor.deregister("d1");
        monitor.deregister("d1");

        match rx.recv().await.unwrap() {
            MonitorEvent::DaemonDeregistered { daemon_id } => assert_eq!(daemon_id, "d1"),
            other => panic!("Expected DaemonDeregistered, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
        assert!(!monitor.status().connected);
    }

    #[tokio::test]
    async fn deregister_keeps_sessions_until_next_registration() {
        let monitor = monitor();
        monitor.register(register_req("d1"));
        monitor.ingest("d1", vec![session("s1")], vec![]);
        monitor.deregister("d1");

        let page = monitor.list_sessions(None, None);
        assert_eq!(page.total, 1);
        assert!(!page.connected);
    }

    #[tokio::test]
    async fn snapshot_reflects_state_and_receiver_sees_only_later_events() {
        let monitor = monitor();
        monitor.register(register_req("d1"));
        monitor.ingest("d1", vec![session("s1")], vec![]);

        let (snapshot, mut rx) = monitor.subscribe();
        match &snapshot {
            MonitorEvent::Snapshot {
                sessions,
                daemon,
                connected,
            } => {
                assert_eq!(sessions.len(), 1);
                assert_eq!(daemon.as_ref().unwrap().daemon_id, "d1");
                assert!(connected);
            }
            other => panic!("Expected Snapshot, got {:?}", other),
        }

        // Nothing published before subscribing is redelivered
        assert!(rx.try_recv().is_err());

        monitor.ingest("d1", vec![session("s2")], vec![]);
        match rx.recv().await.unwrap() {
            MonitorEvent::SessionsChanged { sessions, .. } => {
                assert_eq!(sessions[0].session_id, "s2");
            }
            other => panic!("Expected SessionsChanged, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let monitor = monitor();
        monitor.register(register_req("d1"));
        let (_, mut rx) = monitor.subscribe();

        for i in 0..5 {
            monitor.ingest("d1", vec![session(&format!("s{}", i))], vec![]);
        }
        for i in 0..5 {
            match rx.recv().await.unwrap() {
                MonitorEvent::SessionsChanged { sessions, .. } => {
                    assert_eq!(sessions[0].session_id, format!("s{}", i));
                }
                other => panic!("Expected SessionsChanged, got {:?}", other),
            }
        }
    }

    #[test]
    fn snapshot_event_wire_shape() {
        let event = MonitorEvent::Snapshot {
            sessions: vec![],
            daemon: None,
            connected: false,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"snapshot\""));
        assert!(json.contains("\"connected\":false"));
        assert!(!json.contains("daemon"));
    }

    #[test]
    fn sessions_changed_wire_shape() {
        let event = MonitorEvent::SessionsChanged {
            sessions: vec![session("s1")],
            removed_session_ids: vec!["s0".to_string()],
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"sessions_changed\""));
        assert!(json.contains("\"removedSessionIds\":[\"s0\"]"));
        assert!(json.contains("\"sessionId\":\"s1\""));
    }
}

//! Session table: the current set of daemon-observed sessions.
//!
//! The table is written only through diff-style batches pushed by the
//! daemon: upserts are applied first (full replace by `session_id`), then
//! removals. The daemon-identity gate and batch-size bounds live in the
//! [`Monitor`](crate::hub::Monitor), which also serializes access.

use std::collections::HashMap;

use crate::models::SessionRecord;

/// Maximum upserts (and, separately, removals) accepted per ingest call.
/// Larger syncs must be split across calls to cap per-request cost.
pub const MAX_BATCH: usize = 500;

/// The change set actually applied by one batch, in table order.
#[derive(Debug, Clone, Default)]
pub struct AppliedChanges {
    pub upserted: Vec<SessionRecord>,
    pub removed_ids: Vec<String>,
}

impl AppliedChanges {
    pub fn is_empty(&self) -> bool {
        self.upserted.is_empty() && self.removed_ids.is_empty()
    }
}

/// Owns every [`SessionRecord`]; a record exists iff it has been upserted
/// and not subsequently removed.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<String, SessionRecord>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one batch: all upserts, then all removals. Free-text fields
    /// are clamped to their storage caps on the way in. Removals of ids
    /// that are absent (or that were just upserted in the same batch) are
    /// honored; only ids actually removed are reported back.
    pub fn apply(
        &mut self,
        upserts: Vec<SessionRecord>,
        removed_ids: Vec<String>,
    ) -> AppliedChanges {
        let mut applied = AppliedChanges::default();

        for mut session in upserts {
            session.clamp_text_fields();
            self.sessions
                .insert(session.session_id.clone(), session.clone());
            applied.upserted.push(session);
        }

        for id in removed_ids {
            if self.sessions.remove(&id).is_some() {
                applied.removed_ids.push(id);
            }
        }

        applied
    }

    /// Full current set, sorted by most recent activity, with an optional
    /// page window. The total is returned alongside the page so clients
    /// can render "N of M".
    pub fn list(&self, limit: Option<usize>, offset: Option<usize>) -> (Vec<SessionRecord>, usize) {
        let total = self.sessions.len();
        let mut sessions: Vec<SessionRecord> = self.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| {
            b.last_activity_at
                .cmp(&a.last_activity_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });

        let offset = offset.unwrap_or(0).min(sessions.len());
        let mut page: Vec<SessionRecord> = sessions.split_off(offset);
        if let Some(limit) = limit {
            page.truncate(limit);
        }
        (page, total)
    }

    /// All records in list order. Used to compose stream snapshots.
    pub fn all(&self) -> Vec<SessionRecord> {
        self.list(None, None).0
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop every record. Used when a new daemon registers: sessions from
    /// a displaced daemon are not valid for its replacement.
    pub fn clear(&mut self) -> usize {
        let dropped = self.sessions.len();
        self.sessions.clear();
        dropped
    }
}

use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Maximum stored length of a session goal, in characters.
pub const GOAL_MAX_CHARS: usize = 500;

/// Maximum stored length of a session's recent output, in characters.
pub const RECENT_OUTPUT_MAX_CHARS: usize = 1000;

/// Identity and liveness of the single tracked daemon.
///
/// At most one record exists at a time; registering a new daemon replaces
/// any prior record. All timestamps are epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonRecord {
    pub daemon_id: String,
    pub pid: u32,
    pub version: String,
    pub watch_path: String,
    pub capabilities: BTreeSet<String>,
    pub started_at: i64,
    /// Refreshed by every accepted heartbeat.
    pub last_heartbeat_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Working,
    WaitingForApproval,
    WaitingForInput,
    Idle,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::WaitingForApproval => "waiting_for_approval",
            Self::WaitingForInput => "waiting_for_input",
            Self::Idle => "idle",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "working" => Ok(Self::Working),
            "waiting_for_approval" => Ok(Self::WaitingForApproval),
            "waiting_for_input" => Ok(Self::WaitingForInput),
            "idle" => Ok(Self::Idle),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

/// Token counters reported by the daemon for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    /// Ephemeral cache-window counters; absent when the model does not report them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_5m_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_1h_tokens: Option<u64>,
}

/// Tool invocation a session is currently blocked on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingToolUse {
    pub tool_name: String,
    pub tool_id: String,
}

/// One daemon-observed unit of work.
///
/// Keyed by `session_id`; an upsert with the same id fully replaces the
/// previous record rather than merging field-by-field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub file_path: String,
    pub cwd: String,
    pub project_name: String,
    pub project_hash: String,
    pub status: SessionStatus,
    pub message_count: u64,
    pub turn_count: u64,
    #[serde(default)]
    pub token_usage: TokenUsage,
    pub started_at: i64,
    pub last_activity_at: i64,
    #[serde(default)]
    pub last_read_offset: u64,
    #[serde(default)]
    pub is_subagent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub recent_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_tool_use: Option<PendingToolUse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
}

impl SessionRecord {
    /// Enforce the storage caps on free-text fields. Truncation is
    /// character-based so multi-byte input cannot split a code point.
    pub fn clamp_text_fields(&mut self) {
        truncate_chars(&mut self.goal, GOAL_MAX_CHARS);
        truncate_chars(&mut self.recent_output, RECENT_OUTPUT_MAX_CHARS);
    }
}

fn truncate_chars(s: &mut String, max_chars: usize) {
    if let Some((idx, _)) = s.char_indices().nth(max_chars) {
        s.truncate(idx);
    }
}

/// Single-use credential for one stream connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamToken {
    pub id: String,
    /// Opaque secret: 32 random bytes, hex-encoded (64 chars).
    pub token: String,
    pub user_id: String,
    pub stream_id: String,
    pub scopes: BTreeSet<String>,
    pub created_at: i64,
    pub expires_at: i64,
    pub used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_at: Option<i64>,
}

/// Claims returned by a successful token validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    pub user_id: String,
    pub stream_id: String,
    pub scopes: BTreeSet<String>,
}

/// Current epoch-milliseconds timestamp.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

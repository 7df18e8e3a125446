//! Server tunables and their defaults.

use std::time::Duration;

/// Configuration for the monitoring server.
///
/// Defaults match the deployed behavior: a 10 s daemon heartbeat cadence
/// with a 3x staleness window, 50 concurrent dashboard streams, 5-minute
/// single-use tokens swept every minute, and a 5 MiB request body ceiling.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Permissive CORS and 0.0.0.0 binding for local frontend development.
    pub dev_mode: bool,
    /// How long after the last heartbeat the daemon still counts as connected.
    pub daemon_stale_after: Duration,
    /// Cap on concurrently open SSE connections.
    pub max_stream_connections: usize,
    /// SSE comment-frame cadence so intermediaries keep the socket open.
    pub keep_alive_interval: Duration,
    pub token_ttl: Duration,
    pub max_tokens_per_user: usize,
    pub token_sweep_interval: Duration,
    pub max_body_bytes: usize,
    /// Broadcast channel depth; subscribers further behind than this miss events.
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4820,
            dev_mode: false,
            daemon_stale_after: Duration::from_secs(30),
            max_stream_connections: 50,
            keep_alive_interval: Duration::from_secs(15),
            token_ttl: Duration::from_secs(5 * 60),
            max_tokens_per_user: 10,
            token_sweep_interval: Duration::from_secs(60),
            max_body_bytes: 5 * 1024 * 1024,
            event_capacity: 256,
        }
    }
}

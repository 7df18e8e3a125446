//! Pulse — live session monitoring backend.
//!
//! Sits between a local session-watching CLI daemon and any number of
//! browser dashboards: tracks whether exactly one daemon is alive,
//! reconciles the session set it pushes, and fans every change out over
//! SSE to subscribers authenticated by single-use stream tokens.
//!
//! ```text
//! ┌────────┐  register/heartbeat/ingest  ┌─────────────────────────────┐
//! │ daemon │ ──────────────────────────> │  api.rs (handlers)          │
//! └────────┘                             │    └─ hub.rs  (Monitor)     │
//!                                        │         ├─ registry.rs      │
//! ┌─────────┐  GET /api/stream?token=…   │         └─ sessions.rs      │
//! │ browser │ <────────────────────────  │  stream.rs (SSE, cap guard) │
//! └─────────┘   snapshot, then events    │  tokens.rs (single-use)     │
//!                                        └─────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod errors;
pub mod hub;
pub mod models;
pub mod registry;
pub mod server;
pub mod sessions;
pub mod stream;
pub mod tokens;

//! Typed errors for the monitoring backend.
//!
//! Token lifecycle failures are the one place callers must branch on the
//! exact variant (each maps to a distinct machine-readable code), so they
//! get a dedicated enum. Daemon identity mismatches are deliberately NOT
//! errors: heartbeat and ingest return outcome enums instead, because an
//! unknown daemon is a recoverable signal the caller answers by
//! re-registering.

use thiserror::Error;

/// Failures from token issuance and validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("Token does not match the expected format")]
    InvalidFormat,

    #[error("Token not found")]
    NotFound,

    #[error("Token has already been used")]
    AlreadyUsed,

    #[error("Token has expired")]
    Expired,

    #[error("User {user_id} already holds {held} active tokens (max {max})")]
    MaxTokensExceeded {
        user_id: String,
        held: usize,
        max: usize,
    },
}

impl TokenError {
    /// Stable machine-readable code, reported to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidFormat => "INVALID_TOKEN",
            Self::NotFound => "TOKEN_NOT_FOUND",
            Self::AlreadyUsed => "TOKEN_ALREADY_USED",
            Self::Expired => "TOKEN_EXPIRED",
            Self::MaxTokensExceeded { .. } => "MAX_TOKENS_EXCEEDED",
        }
    }
}

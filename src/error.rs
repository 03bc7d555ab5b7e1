// src/error.rs

use thiserror::Error;

/// Result of a single outbound call against the platform.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    /// Bot lacks the permission or role position for this call.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Target (member, channel) no longer exists.
    #[error("not found: {0}")]
    NotFound(String),
    /// Rate limit, timeout or 5xx. Worth another attempt.
    #[error("transient platform error: {0}")]
    Transient(String),
    #[error("platform error: {0}")]
    Other(String),
}

impl PlatformError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PlatformError::Transient(_))
    }
}

/// Engine-level failures. None of them ever reach the state machine.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("policy store unavailable for guild {guild_id}: {reason}")]
    PolicyUnavailable { guild_id: u64, reason: String },
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

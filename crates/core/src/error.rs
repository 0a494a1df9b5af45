//! Error types for the loomi domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all loomi operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Cooperative cancellation ---
    #[error("Session {user_id}/{session_id} was stopped")]
    Stopped { user_id: String, session_id: String },

    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Store errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Event delivery ---
    #[error("Event sink closed: {0}")]
    EventSink(String),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a stop error for a session.
    pub fn stopped(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self::Stopped {
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }

    /// Whether this error is a cooperative cancellation rather than a failure.
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped { .. })
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("WRONGTYPE operation against key {key} holding the wrong kind of value")]
    WrongType { key: String },

    #[error("Value at {key} is not an integer")]
    NotAnInteger { key: String },

    #[error("Pool {pool} exhausted after {waited_ms}ms")]
    PoolExhausted { pool: String, waited_ms: u64 },

    #[error("Store serialization failed: {0}")]
    Serialization(String),
}

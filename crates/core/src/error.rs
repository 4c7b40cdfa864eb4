//! Typed error taxonomy (§7).
//!
//! Generalizes the teacher's single `HistoryExpiredError` (a bare
//! `thiserror` struct used to signal one fallback path) into the full
//! kind enum callers need to match on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MsgVaultError {
    #[error("not found")]
    NotFound,

    #[error("conflict: unique constraint violated")]
    Conflict,

    #[error("operation cancelled")]
    Cancelled,

    #[error("provider history cursor has expired")]
    HistoryExpired,

    #[error("credential lacks required scope")]
    InsufficientScope,

    #[error("rate limited by provider")]
    RateLimited,

    #[error("malformed MIME: {0}")]
    MalformedMime(String),

    #[error("blob store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("blob exceeds configured size limit")]
    LimitExceeded,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("remote provider error: {0}")]
    Remote(String),

    #[error("sync run exceeded its error threshold: {0} errors")]
    TooManyErrors(u64),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MsgVaultError {
    /// Whether the error kind should ever be logged at `error!` level;
    /// `Cancelled` is expected control flow, never a logged error (§5).
    pub fn is_loggable_error(&self) -> bool {
        !matches!(self, MsgVaultError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, MsgVaultError>;

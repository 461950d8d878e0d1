use thiserror::Error;

use crate::types::{RequestStatus, SessionId};

/// Unified error type for the whole gateway.
#[derive(Error, Debug)]
pub enum SlbError {
    // ── Session errors ─────────────────────────────────────────
    #[error("agent '{agent}' already has an active session")]
    ActiveSessionExists { agent: String },

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session has ended: {0}")]
    SessionEnded(SessionId),

    #[error("invalid session key for session {0}")]
    InvalidSessionKey(SessionId),

    #[error("agent '{0}' is blocked from creating requests")]
    AgentBlocked(String),

    // ── Request / review errors ────────────────────────────────
    #[error("request not found: {0}")]
    RequestNotFound(String),

    #[error("request is not pending (status: {status})")]
    RequestNotPending { status: RequestStatus },

    #[error("request has expired")]
    RequestExpired,

    #[error("reviewer cannot approve or reject their own request")]
    SelfApproval,

    #[error("session {0} has already reviewed this request")]
    AlreadyReviewed(SessionId),

    #[error("request is not approved for execution (status: {status})")]
    RequestNotApproved { status: RequestStatus },

    #[error("rate limited: {pending} pending requests, limit {limit}")]
    RateLimited { pending: usize, limit: usize },

    #[error("rate limited: {recent} requests in the current window, limit {limit} per minute")]
    RequestRateExceeded { recent: usize, limit: usize },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // ── Rollback errors ────────────────────────────────────────
    #[error("rollback capture unavailable: {0}")]
    RollbackCaptureUnavailable(String),

    #[error("rollback restore refused: working tree diverged from {recorded} (current {current}); use force")]
    RollbackRestoreDiverged { recorded: String, current: String },

    #[error("rollback error: {0}")]
    Rollback(String),

    #[error("operation cancelled")]
    Cancelled,

    // ── Store errors ───────────────────────────────────────────
    #[error("store error: {0}")]
    Store(String),

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl SlbError {
    /// Whether this error must deny execution of the guarded command.
    ///
    /// Fails closed: anything that is not a reviewer or session bookkeeping
    /// mistake denies, including I/O, store and serialization failures.
    pub fn blocks_execution(&self) -> bool {
        !matches!(
            self,
            SlbError::SelfApproval
                | SlbError::AlreadyReviewed(_)
                | SlbError::ActiveSessionExists { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SlbError>;

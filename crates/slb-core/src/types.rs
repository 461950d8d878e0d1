use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for an agent session.
pub type SessionId = Uuid;

/// Unique identifier for a command request.
pub type RequestId = Uuid;

// ── Risk tiers ─────────────────────────────────────────────────

/// Severity classification for a proposed command.
///
/// Ordered from least to most severe, so `max()` over a set of tiers yields
/// the one that governs the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    /// No rule matched. Never blocked (fail-open).
    Unclassified,
    /// Explicitly recognized as benign.
    Safe,
    /// Irreversible but recoverable; tracked, never blocking.
    Caution,
    Dangerous,
    Critical,
}

impl RiskTier {
    pub const ALL: [RiskTier; 5] = [
        RiskTier::Critical,
        RiskTier::Dangerous,
        RiskTier::Caution,
        RiskTier::Safe,
        RiskTier::Unclassified,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Unclassified => "unclassified",
            RiskTier::Safe => "safe",
            RiskTier::Caution => "caution",
            RiskTier::Dangerous => "dangerous",
            RiskTier::Critical => "critical",
        }
    }

    /// Built-in approval threshold for the tier.
    pub fn default_min_approvals(&self) -> u32 {
        match self {
            RiskTier::Critical => 2,
            RiskTier::Dangerous => 1,
            RiskTier::Caution | RiskTier::Safe | RiskTier::Unclassified => 0,
        }
    }

    /// Whether commands of this tier enter the request workflow at all.
    pub fn needs_approval(&self) -> bool {
        matches!(
            self,
            RiskTier::Critical | RiskTier::Dangerous | RiskTier::Caution
        )
    }

    /// Whether a rollback point must exist before execution is cleared.
    pub fn requires_rollback(&self) -> bool {
        matches!(self, RiskTier::Critical | RiskTier::Dangerous)
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unclassified" => Ok(RiskTier::Unclassified),
            "safe" => Ok(RiskTier::Safe),
            "caution" => Ok(RiskTier::Caution),
            "dangerous" => Ok(RiskTier::Dangerous),
            "critical" => Ok(RiskTier::Critical),
            other => Err(format!("unknown risk tier '{other}'")),
        }
    }
}

// ── Request status ─────────────────────────────────────────────

/// Lifecycle state of a request. Every value except `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    Timeout,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "approved" => Ok(RequestStatus::Approved),
            "rejected" => Ok(RequestStatus::Rejected),
            "timeout" => Ok(RequestStatus::Timeout),
            other => Err(format!("unknown request status '{other}'")),
        }
    }
}

// ── Review decision ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Decision::Approve),
            "reject" => Ok(Decision::Reject),
            other => Err(format!("unknown decision '{other}'")),
        }
    }
}

// ── Records ────────────────────────────────────────────────────

/// An agent's identity for one working period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub agent_name: String,
    /// Agent program, e.g. "claude-code" or "codex-cli".
    pub program: String,
    pub model: String,
    pub project_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    /// Set once when the session ends; never cleared.
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// A freshly created session together with its one-time-issued key.
///
/// The key is only ever returned here; the store keeps a digest of it.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub session: Session,
    pub session_key: String,
}

/// A proposed command awaiting (or past) review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub requestor_session_id: SessionId,
    pub requestor_agent: String,
    pub project_path: PathBuf,
    pub command_raw: String,
    /// Command with secrets masked, safe to show to reviewers.
    pub display_redacted: String,
    pub contains_sensitive: bool,
    pub cwd: PathBuf,
    pub tier: RiskTier,
    pub min_approvals: u32,
    pub approvals_so_far: u32,
    pub status: RequestStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Directory of the rollback point captured for this request, if any.
    pub rollback_path: Option<PathBuf>,
}

impl Request {
    /// Expiry derived from wall-clock time, independent of the stored status.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// An approve/reject decision against a request. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: Uuid,
    pub request_id: RequestId,
    pub reviewer_session_id: SessionId,
    pub reviewer_agent: String,
    pub decision: Decision,
    pub comments: String,
    pub submitted_at: DateTime<Utc>,
}

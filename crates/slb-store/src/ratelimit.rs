//! Per-session request limits: requests held open at once, and requests
//! opened per sliding minute.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::info;

use slb_config::RateLimitAction;
use slb_core::{Result, SessionId, SlbError};

use crate::store::{RequestPolicy, Store, db_err, now, parse_opt_col, ts};

/// Where a session stands against its limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    /// Whether a new request would be opened now.
    pub allowed: bool,
    pub action: RateLimitAction,
    pub pending: usize,
    /// 0 = unlimited.
    pub max_pending: usize,
    /// Requests opened since the window start.
    pub recent: usize,
    /// 0 = unlimited.
    pub max_per_minute: usize,
    pub window_start: DateTime<Utc>,
    /// When the oldest request in the window drops out of it.
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateLimitStatus {
    /// The limit a new request would break, pending limit first.
    pub fn exceeded(&self) -> Option<SlbError> {
        if self.max_pending > 0 && self.pending >= self.max_pending {
            return Some(SlbError::RateLimited {
                pending: self.pending,
                limit: self.max_pending,
            });
        }
        if self.max_per_minute > 0 && self.recent >= self.max_per_minute {
            return Some(SlbError::RequestRateExceeded {
                recent: self.recent,
                limit: self.max_per_minute,
            });
        }
        None
    }
}

/// Measure `session_id` against `policy`. The window is the last minute, cut
/// short by a manual reset.
pub(crate) fn rate_limit_status(
    conn: &Connection,
    policy: &RequestPolicy,
    session_id: SessionId,
    now: DateTime<Utc>,
) -> Result<RateLimitStatus> {
    let reset: Option<DateTime<Utc>> = conn
        .query_row(
            "SELECT rate_limit_reset_at FROM sessions WHERE id = ?1",
            params![session_id.to_string()],
            |row| parse_opt_col(row, 0),
        )
        .optional()
        .map_err(db_err)?
        .ok_or(SlbError::SessionNotFound(session_id))?;

    let window_start = match reset {
        Some(reset) if reset > now - Duration::minutes(1) => reset,
        _ => now - Duration::minutes(1),
    };

    let pending: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM requests
             WHERE requestor_session_id = ?1 AND status = 'pending' AND expires_at > ?2",
            params![session_id.to_string(), ts(now)],
            |row| row.get(0),
        )
        .map_err(db_err)?;

    let (recent, oldest): (i64, Option<DateTime<Utc>>) = conn
        .query_row(
            "SELECT COUNT(*), MIN(created_at) FROM requests
             WHERE requestor_session_id = ?1 AND created_at > ?2",
            params![session_id.to_string(), ts(window_start)],
            |row| Ok((row.get(0)?, parse_opt_col(row, 1)?)),
        )
        .map_err(db_err)?;

    let mut status = RateLimitStatus {
        allowed: true,
        action: policy.rate_limit_action,
        pending: pending.max(0) as usize,
        max_pending: policy.max_pending_per_session,
        recent: recent.max(0) as usize,
        max_per_minute: policy.max_requests_per_minute,
        window_start,
        reset_at: oldest.map(|t| t + Duration::minutes(1)),
    };
    status.allowed = status.exceeded().is_none() || status.action == RateLimitAction::Warn;
    Ok(status)
}

impl Store {
    /// Whether `session_id` may open another request right now.
    pub fn check_rate_limit(&self, session_id: SessionId) -> Result<RateLimitStatus> {
        let conn = self.db.lock();
        rate_limit_status(&conn, &self.policy, session_id, now())
    }

    /// Start a fresh per-minute window for `session_id`. Requests opened
    /// before the reset no longer count; pending requests still do.
    pub fn reset_rate_limits(&self, session_id: SessionId) -> Result<DateTime<Utc>> {
        let at = now();
        let conn = self.db.lock();
        let updated = conn
            .execute(
                "UPDATE sessions SET rate_limit_reset_at = ?1 WHERE id = ?2",
                params![ts(at), session_id.to_string()],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(SlbError::SessionNotFound(session_id));
        }
        info!(session_id = %session_id, "rate limits reset");
        Ok(at)
    }
}

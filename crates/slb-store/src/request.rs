use chrono::Duration;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use slb_config::RateLimitAction;
use slb_core::{
    Decision, Request, RequestId, RequestStatus, Result, Review, RiskTier, SessionId, SlbError,
};

use crate::ratelimit::rate_limit_status;
use crate::session::authorize;
use crate::store::{Store, db_err, is_constraint_violation, now, parse_col, parse_opt_col, ts};

const REQUEST_COLUMNS: &str = "id, requestor_session_id, requestor_agent, project_path, \
     command_raw, display_redacted, contains_sensitive, cwd, tier, min_approvals, approvals, \
     status, expires_at, created_at, resolved_at, rollback_path";

const REVIEW_COLUMNS: &str =
    "id, request_id, reviewer_session_id, reviewer_agent, decision, comments, submitted_at";

/// Everything needed to open a request. Tier and threshold come from classification.
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub requestor_session_id: SessionId,
    pub session_key: String,
    pub command_raw: String,
    pub display_redacted: String,
    pub contains_sensitive: bool,
    pub cwd: PathBuf,
    pub tier: RiskTier,
    pub min_approvals: u32,
    pub ttl: Duration,
}

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<Request> {
    Ok(Request {
        id: parse_col(row, 0)?,
        requestor_session_id: parse_col(row, 1)?,
        requestor_agent: row.get(2)?,
        project_path: parse_col(row, 3)?,
        command_raw: row.get(4)?,
        display_redacted: row.get(5)?,
        contains_sensitive: row.get(6)?,
        cwd: parse_col(row, 7)?,
        tier: parse_col(row, 8)?,
        min_approvals: row.get(9)?,
        approvals_so_far: row.get(10)?,
        status: parse_col(row, 11)?,
        expires_at: parse_col(row, 12)?,
        created_at: parse_col(row, 13)?,
        resolved_at: parse_opt_col(row, 14)?,
        rollback_path: parse_opt_col(row, 15)?,
    })
}

fn review_from_row(row: &Row<'_>) -> rusqlite::Result<Review> {
    Ok(Review {
        id: parse_col(row, 0)?,
        request_id: parse_col(row, 1)?,
        reviewer_session_id: parse_col(row, 2)?,
        reviewer_agent: row.get(3)?,
        decision: parse_col(row, 4)?,
        comments: row.get(5)?,
        submitted_at: parse_col(row, 6)?,
    })
}

fn load_request(conn: &Connection, request_id: RequestId) -> Result<Request> {
    conn.query_row(
        &format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = ?1"),
        params![request_id.to_string()],
        request_from_row,
    )
    .optional()
    .map_err(db_err)?
    .ok_or_else(|| SlbError::RequestNotFound(request_id.to_string()))
}

impl Store {
    /// Open a request on behalf of an authenticated session.
    ///
    /// A request whose threshold is 0 is recorded already `Approved`.
    pub fn create_request(&self, new: &NewRequest) -> Result<Request> {
        if new.command_raw.trim().is_empty() {
            return Err(SlbError::InvalidRequest("command is empty".into()));
        }
        if new.ttl <= Duration::zero() {
            return Err(SlbError::InvalidRequest("ttl must be positive".into()));
        }

        let mut conn = self.db.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let session = authorize(&tx, new.requestor_session_id, &new.session_key)?;
        if self.policy.is_blocked(&session.agent_name) {
            warn!(agent = %session.agent_name, "blocked agent attempted to create a request");
            return Err(SlbError::AgentBlocked(session.agent_name));
        }

        let now = now();
        let limits = rate_limit_status(&tx, &self.policy, session.id, now)?;
        if let Some(exceeded) = limits.exceeded() {
            match limits.action {
                RateLimitAction::Reject => return Err(exceeded),
                RateLimitAction::Warn => {
                    warn!(session_id = %session.id, agent = %session.agent_name, error = %exceeded, "request limit exceeded, opening anyway")
                }
            }
        }

        let (status, resolved_at) = if new.min_approvals == 0 {
            (RequestStatus::Approved, Some(now))
        } else {
            (RequestStatus::Pending, None)
        };

        let request = Request {
            id: Uuid::new_v4(),
            requestor_session_id: session.id,
            requestor_agent: session.agent_name.clone(),
            project_path: session.project_path.clone(),
            command_raw: new.command_raw.clone(),
            display_redacted: new.display_redacted.clone(),
            contains_sensitive: new.contains_sensitive,
            cwd: new.cwd.clone(),
            tier: new.tier,
            min_approvals: new.min_approvals,
            approvals_so_far: 0,
            status,
            expires_at: now + new.ttl,
            created_at: now,
            resolved_at,
            rollback_path: None,
        };

        tx.execute(
            "INSERT INTO requests
                (id, requestor_session_id, requestor_agent, project_path, command_raw,
                 display_redacted, contains_sensitive, cwd, tier, min_approvals, approvals,
                 status, expires_at, created_at, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?12, ?13, ?14)",
            params![
                request.id.to_string(),
                request.requestor_session_id.to_string(),
                request.requestor_agent,
                request.project_path.to_string_lossy(),
                request.command_raw,
                request.display_redacted,
                request.contains_sensitive,
                request.cwd.to_string_lossy(),
                request.tier.as_str(),
                request.min_approvals as i64,
                request.status.as_str(),
                ts(request.expires_at),
                ts(request.created_at),
                request.resolved_at.map(ts),
            ],
        )
        .map_err(db_err)?;
        tx.execute(
            "UPDATE sessions SET last_active_at = MAX(last_active_at, ?1) WHERE id = ?2",
            params![ts(now), session.id.to_string()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        info!(
            request_id = %request.id,
            agent = %request.requestor_agent,
            tier = %request.tier,
            min_approvals = request.min_approvals,
            status = %request.status,
            "request created"
        );
        Ok(request)
    }

    /// Record a review and advance the request state machine.
    ///
    /// Expiry is recomputed from the wall clock here; a stored `pending`
    /// status is never trusted on its own.
    pub fn submit_review(
        &self,
        request_id: RequestId,
        reviewer_session_id: SessionId,
        reviewer_key: &str,
        decision: Decision,
        comments: &str,
    ) -> Result<Request> {
        let mut conn = self.db.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let reviewer = authorize(&tx, reviewer_session_id, reviewer_key)?;
        let request = load_request(&tx, request_id)?;

        if request.requestor_session_id == reviewer.id {
            return Err(SlbError::SelfApproval);
        }
        if request.status != RequestStatus::Pending {
            return Err(SlbError::RequestNotPending {
                status: request.status,
            });
        }

        let now = now();
        if request.is_expired_at(now) {
            tx.execute(
                "UPDATE requests SET status = 'timeout', resolved_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![ts(now), request_id.to_string()],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            info!(request_id = %request_id, "review arrived after expiry, request timed out");
            return Err(SlbError::RequestExpired);
        }

        tx.execute(
            "INSERT INTO reviews
                (id, request_id, reviewer_session_id, reviewer_agent, decision, comments, submitted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Uuid::new_v4().to_string(),
                request_id.to_string(),
                reviewer.id.to_string(),
                reviewer.agent_name,
                decision.as_str(),
                comments,
                ts(now),
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                SlbError::AlreadyReviewed(reviewer.id)
            } else {
                db_err(e)
            }
        })?;

        match decision {
            Decision::Reject => {
                tx.execute(
                    "UPDATE requests SET status = 'rejected', resolved_at = ?1
                     WHERE id = ?2 AND status = 'pending'",
                    params![ts(now), request_id.to_string()],
                )
                .map_err(db_err)?;
            }
            Decision::Approve => {
                // Increment and threshold check in one statement.
                tx.query_row(
                    "UPDATE requests
                     SET approvals = approvals + 1,
                         status = CASE WHEN approvals + 1 >= min_approvals
                                       THEN 'approved' ELSE status END,
                         resolved_at = CASE WHEN approvals + 1 >= min_approvals
                                            THEN ?1 ELSE resolved_at END
                     WHERE id = ?2 AND status = 'pending'
                     RETURNING approvals",
                    params![ts(now), request_id.to_string()],
                    |row| row.get::<_, i64>(0),
                )
                .map_err(db_err)?;
            }
        }

        let updated = load_request(&tx, request_id)?;
        tx.execute(
            "UPDATE sessions SET last_active_at = MAX(last_active_at, ?1) WHERE id = ?2",
            params![ts(now), reviewer.id.to_string()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        info!(
            request_id = %request_id,
            reviewer = %reviewer.agent_name,
            decision = %decision,
            approvals = updated.approvals_so_far,
            min_approvals = updated.min_approvals,
            status = %updated.status,
            "review recorded"
        );
        Ok(updated)
    }

    pub fn get_request(&self, request_id: RequestId) -> Result<Request> {
        let conn = self.db.lock();
        load_request(&conn, request_id)
    }

    /// Reviews of a request in submission order.
    pub fn list_reviews(&self, request_id: RequestId) -> Result<Vec<Review>> {
        let conn = self.db.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {REVIEW_COLUMNS} FROM reviews WHERE request_id = ?1 ORDER BY submitted_at"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![request_id.to_string()], review_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Requests still stored as pending, optionally limited to one project.
    pub fn list_pending(&self, project_path: Option<&Path>) -> Result<Vec<Request>> {
        let conn = self.db.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {REQUEST_COLUMNS} FROM requests
                 WHERE status = 'pending' AND (?1 IS NULL OR project_path = ?1)
                 ORDER BY created_at"
            ))
            .map_err(db_err)?;
        let project = project_path.map(|p| p.to_string_lossy().into_owned());
        let rows = stmt
            .query_map(params![project], request_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Pending requests whose expiry has passed.
    pub fn find_expired_requests(&self) -> Result<Vec<Request>> {
        let conn = self.db.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {REQUEST_COLUMNS} FROM requests
                 WHERE status = 'pending' AND expires_at < ?1
                 ORDER BY expires_at"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![ts(now())], request_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Move an expired pending request to `Timeout`.
    ///
    /// Returns `false` if the request was already terminal or has not expired.
    pub fn mark_timeout(&self, request_id: RequestId) -> Result<bool> {
        let conn = self.db.lock();
        let now = ts(now());
        let updated = conn
            .execute(
                "UPDATE requests SET status = 'timeout', resolved_at = ?1
                 WHERE id = ?2 AND status = 'pending' AND expires_at < ?1",
                params![now, request_id.to_string()],
            )
            .map_err(db_err)?;
        if updated == 0 {
            load_request(&conn, request_id)?;
            return Ok(false);
        }
        info!(request_id = %request_id, "request timed out");
        Ok(true)
    }

    /// Record where the rollback point for a request lives.
    pub fn attach_rollback(&self, request_id: RequestId, rollback_path: &Path) -> Result<()> {
        let conn = self.db.lock();
        let updated = conn
            .execute(
                "UPDATE requests SET rollback_path = ?1 WHERE id = ?2",
                params![rollback_path.to_string_lossy(), request_id.to_string()],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(SlbError::RequestNotFound(request_id.to_string()));
        }
        info!(request_id = %request_id, path = %rollback_path.display(), "rollback point attached");
        Ok(())
    }

    /// Live pending requests held by a session.
    pub fn count_pending(&self, session_id: SessionId) -> Result<usize> {
        let conn = self.db.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM requests
                 WHERE requestor_session_id = ?1 AND status = 'pending' AND expires_at > ?2",
                params![session_id.to_string(), ts(now())],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count.max(0) as usize)
    }
}

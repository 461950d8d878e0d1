use base64::Engine;
use chrono::Duration;
use ring::rand::{SecureRandom, SystemRandom};
use rusqlite::{OptionalExtension, Row, params};
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

use slb_core::{IssuedSession, Result, Session, SessionId, SlbError};

use crate::store::{Store, db_err, is_constraint_violation, now, parse_col, parse_opt_col, ts};

pub(crate) const SESSION_COLUMNS: &str =
    "id, agent_name, program, model, project_path, created_at, last_active_at, ended_at";

pub(crate) fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: parse_col(row, 0)?,
        agent_name: row.get(1)?,
        program: row.get(2)?,
        model: row.get(3)?,
        project_path: parse_col(row, 4)?,
        created_at: parse_col(row, 5)?,
        last_active_at: parse_col(row, 6)?,
        ended_at: parse_opt_col(row, 7)?,
    })
}

/// 32 random bytes, URL-safe base64.
fn generate_session_key() -> Result<String> {
    let mut bytes = [0u8; 32];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| SlbError::Store("system random source unavailable".into()))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

fn key_digest(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

/// Constant-time comparison of a presented key against the stored digest.
pub(crate) fn key_matches(stored_digest: &str, presented: &str) -> bool {
    match blake3::Hash::from_hex(stored_digest) {
        Ok(expected) => expected == blake3::hash(presented.as_bytes()),
        Err(_) => false,
    }
}

/// Load a session together with its key digest.
pub(crate) fn load_with_digest(
    conn: &rusqlite::Connection,
    session_id: SessionId,
) -> Result<(Session, String)> {
    conn.query_row(
        &format!("SELECT {SESSION_COLUMNS}, key_digest FROM sessions WHERE id = ?1"),
        params![session_id.to_string()],
        |row| Ok((session_from_row(row)?, row.get::<_, String>(8)?)),
    )
    .optional()
    .map_err(db_err)?
    .ok_or(SlbError::SessionNotFound(session_id))
}

/// Check that a session exists, is active, and `key` is its key.
pub(crate) fn authorize(
    conn: &rusqlite::Connection,
    session_id: SessionId,
    key: &str,
) -> Result<Session> {
    let (session, digest) = load_with_digest(conn, session_id)?;
    if !session.is_active() {
        return Err(SlbError::SessionEnded(session_id));
    }
    if !key_matches(&digest, key) {
        warn!(session_id = %session_id, "session key mismatch");
        return Err(SlbError::InvalidSessionKey(session_id));
    }
    Ok(session)
}

impl Store {
    /// Register a new active session for `agent_name`.
    ///
    /// The one-active-session rule is enforced by a partial unique index, so
    /// the check and the insert are the same statement.
    pub fn create_session(
        &self,
        agent_name: &str,
        program: &str,
        model: &str,
        project_path: &Path,
    ) -> Result<IssuedSession> {
        if agent_name.trim().is_empty() {
            return Err(SlbError::InvalidRequest("agent name is required".into()));
        }

        let session_key = generate_session_key()?;
        let now = now();
        let session = Session {
            id: Uuid::new_v4(),
            agent_name: agent_name.to_string(),
            program: program.to_string(),
            model: model.to_string(),
            project_path: project_path.to_path_buf(),
            created_at: now,
            last_active_at: now,
            ended_at: None,
        };

        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO sessions
                (id, agent_name, program, model, project_path, key_digest, created_at, last_active_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                session.id.to_string(),
                session.agent_name,
                session.program,
                session.model,
                session.project_path.to_string_lossy(),
                key_digest(&session_key),
                ts(now),
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                SlbError::ActiveSessionExists {
                    agent: agent_name.to_string(),
                }
            } else {
                db_err(e)
            }
        })?;

        info!(session_id = %session.id, agent = %session.agent_name, "session created");
        Ok(IssuedSession {
            session,
            session_key,
        })
    }

    /// Refresh `last_active_at`. Idempotent; concurrent calls never move it backwards.
    pub fn heartbeat(&self, session_id: SessionId) -> Result<()> {
        let conn = self.db.lock();
        let updated = conn
            .execute(
                "UPDATE sessions SET last_active_at = MAX(last_active_at, ?1)
                 WHERE id = ?2 AND ended_at IS NULL",
                params![ts(now()), session_id.to_string()],
            )
            .map_err(db_err)?;
        if updated == 0 {
            let (session, _) = load_with_digest(&conn, session_id)?;
            if !session.is_active() {
                return Err(SlbError::SessionEnded(session_id));
            }
        }
        debug!(session_id = %session_id, "heartbeat");
        Ok(())
    }

    /// End a session. Terminal; ending an already-ended session returns it unchanged.
    pub fn end_session(&self, session_id: SessionId) -> Result<Session> {
        let conn = self.db.lock();
        let ended = conn
            .query_row(
                &format!(
                    "UPDATE sessions SET ended_at = ?1
                     WHERE id = ?2 AND ended_at IS NULL
                     RETURNING {SESSION_COLUMNS}"
                ),
                params![ts(now()), session_id.to_string()],
                session_from_row,
            )
            .optional()
            .map_err(db_err)?;

        match ended {
            Some(session) => {
                info!(session_id = %session_id, agent = %session.agent_name, "session ended");
                Ok(session)
            }
            None => load_with_digest(&conn, session_id).map(|(session, _)| session),
        }
    }

    /// End a session only if it is still active and has not heartbeated
    /// within `threshold`. The staleness test happens in the same statement
    /// as the write, so a heartbeat that lands after the session was listed
    /// as stale keeps it alive. Returns whether the session was ended.
    pub fn end_stale_session(&self, session_id: SessionId, threshold: Duration) -> Result<bool> {
        let now = now();
        let conn = self.db.lock();
        let ended = conn
            .execute(
                "UPDATE sessions SET ended_at = ?1
                 WHERE id = ?2 AND ended_at IS NULL AND last_active_at < ?3",
                params![ts(now), session_id.to_string(), ts(now - threshold)],
            )
            .map_err(db_err)?;
        Ok(ended == 1)
    }

    /// Active sessions whose last heartbeat is older than `threshold`.
    pub fn find_stale_sessions(&self, threshold: Duration) -> Result<Vec<Session>> {
        let cutoff = now() - threshold;
        let conn = self.db.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE ended_at IS NULL AND last_active_at < ?1
                 ORDER BY last_active_at"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![ts(cutoff)], session_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn get_session(&self, session_id: SessionId) -> Result<Session> {
        let conn = self.db.lock();
        load_with_digest(&conn, session_id).map(|(session, _)| session)
    }

    /// Active sessions, optionally limited to one project.
    pub fn list_active_sessions(&self, project_path: Option<&Path>) -> Result<Vec<Session>> {
        let conn = self.db.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE ended_at IS NULL AND (?1 IS NULL OR project_path = ?1)
                 ORDER BY created_at"
            ))
            .map_err(db_err)?;
        let project = project_path.map(|p| p.to_string_lossy().into_owned());
        let rows = stmt
            .query_map(params![project], session_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Verify `key` against the stored digest of an active session.
    pub fn verify_session_key(&self, session_id: SessionId, key: &str) -> Result<Session> {
        let conn = self.db.lock();
        authorize(&conn, session_id, key)
    }
}

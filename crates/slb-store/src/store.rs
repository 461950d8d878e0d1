use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use slb_config::{RateLimitAction, SlbConfig};
use slb_core::{Result, SlbError};

/// Limits applied when a request is created.
#[derive(Debug, Clone)]
pub struct RequestPolicy {
    /// 0 = unlimited.
    pub max_pending_per_session: usize,
    /// Requests opened per sliding minute. 0 = unlimited.
    pub max_requests_per_minute: usize,
    pub rate_limit_action: RateLimitAction,
    /// Agent names (case-insensitive) that may not open requests.
    pub blocked_agents: Vec<String>,
}

impl Default for RequestPolicy {
    fn default() -> Self {
        Self {
            max_pending_per_session: 5,
            max_requests_per_minute: 10,
            rate_limit_action: RateLimitAction::Reject,
            blocked_agents: vec![],
        }
    }
}

impl RequestPolicy {
    pub fn from_config(config: &SlbConfig) -> Self {
        Self {
            max_pending_per_session: config.general.max_pending_per_session,
            max_requests_per_minute: config.general.max_requests_per_minute,
            rate_limit_action: config.general.rate_limit_action,
            blocked_agents: config.agents.blocked.clone(),
        }
    }

    pub(crate) fn is_blocked(&self, agent_name: &str) -> bool {
        self.blocked_agents
            .iter()
            .any(|b| b.eq_ignore_ascii_case(agent_name))
    }
}

/// Handle to the state database. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Store {
    pub(crate) db: Arc<Mutex<Connection>>,
    pub(crate) policy: Arc<RequestPolicy>,
}

impl Store {
    /// Open or create the state database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        info!(?path, "opening state store");

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Writers from other processes wait instead of failing with SQLITE_BUSY
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA foreign_keys=ON;",
        )
        .map_err(db_err)?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                agent_name TEXT NOT NULL,
                program TEXT NOT NULL,
                model TEXT NOT NULL,
                project_path TEXT NOT NULL,
                key_digest TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_active_at TEXT NOT NULL,
                ended_at TEXT,
                rate_limit_reset_at TEXT
            );

            -- At most one active session per agent name.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_one_active
                ON sessions(agent_name) WHERE ended_at IS NULL;
            CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project_path);

            CREATE TABLE IF NOT EXISTS requests (
                id TEXT PRIMARY KEY,
                requestor_session_id TEXT NOT NULL REFERENCES sessions(id),
                requestor_agent TEXT NOT NULL,
                project_path TEXT NOT NULL,
                command_raw TEXT NOT NULL,
                display_redacted TEXT NOT NULL,
                contains_sensitive INTEGER NOT NULL DEFAULT 0,
                cwd TEXT NOT NULL,
                tier TEXT NOT NULL,
                min_approvals INTEGER NOT NULL,
                approvals INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                resolved_at TEXT,
                rollback_path TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_requests_status ON requests(status, expires_at);
            CREATE INDEX IF NOT EXISTS idx_requests_session ON requests(requestor_session_id);

            CREATE TABLE IF NOT EXISTS reviews (
                id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL REFERENCES requests(id),
                reviewer_session_id TEXT NOT NULL REFERENCES sessions(id),
                reviewer_agent TEXT NOT NULL,
                decision TEXT NOT NULL,
                comments TEXT NOT NULL DEFAULT '',
                submitted_at TEXT NOT NULL,
                UNIQUE(request_id, reviewer_session_id)
            );
            ",
        )
        .map_err(db_err)?;
        add_column_if_missing(&conn, "sessions", "rate_limit_reset_at", "TEXT")?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            policy: Arc::new(RequestPolicy::default()),
        })
    }

    /// Open an in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    /// Replace the request-creation policy.
    pub fn with_policy(mut self, policy: RequestPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn policy(&self) -> &RequestPolicy {
        &self.policy
    }
}

/// Bring a database created by an older build up to the current columns.
fn add_column_if_missing(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("SELECT name FROM pragma_table_info('{table}')"))
        .map_err(db_err)?;
    let exists = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(db_err)?
        .filter_map(|name| name.ok())
        .any(|name| name == column);
    if !exists {
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))
            .map_err(db_err)?;
        info!(table, column, "migrated store schema");
    }
    Ok(())
}

// ── Row helpers ────────────────────────────────────────────────

pub(crate) fn db_err(e: rusqlite::Error) -> SlbError {
    SlbError::Store(e.to_string())
}

pub(crate) fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    e.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation)
}

/// Current time at the precision timestamps are stored with.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a TEXT column through `FromStr`.
pub(crate) fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

pub(crate) fn parse_opt_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| {
        r.parse::<T>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
    })
    .transpose()
}

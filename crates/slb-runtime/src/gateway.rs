use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use slb_classify::{ClassificationResult, PatternEngine, Redactor};
use slb_config::SlbConfig;
use slb_core::{
    Decision, IssuedSession, Request, RequestId, RequestStatus, Result, SessionId, SlbError,
};
use slb_rollback::{CaptureOptions, RestoreOptions, RollbackRecord, load_rollback_data};
use slb_store::{NewRequest, RequestPolicy, Store, Sweeper};

/// Outcome of proposing a command.
#[derive(Debug, Clone, Serialize)]
pub struct Proposal {
    pub classification: ClassificationResult,
    /// `None` when the command runs without review (safe or unclassified).
    pub request: Option<Request>,
}

/// Permission to run an approved command.
#[derive(Debug, Clone)]
pub struct Clearance {
    pub request: Request,
    /// Present for dangerous and critical commands.
    pub rollback: Option<RollbackRecord>,
}

/// Ties classification, the request workflow and rollback capture together.
pub struct Gateway {
    config: SlbConfig,
    engine: PatternEngine,
    redactor: Redactor,
    store: Store,
    capture: CaptureOptions,
}

impl Gateway {
    /// Build a gateway over `store`, compiling the configured rule table once.
    pub fn new(config: SlbConfig, store: Store) -> Result<Self> {
        let engine = PatternEngine::from_config(&config.patterns)?;
        let redactor = Redactor::new(&config.general.redact_patterns)?;
        let store = store.with_policy(RequestPolicy::from_config(&config));
        let capture = CaptureOptions::from_config(&config.rollback);

        info!(
            rules = engine.rule_count(),
            rollback = config.rollback.enabled,
            "gateway ready"
        );
        Ok(Self {
            config,
            engine,
            redactor,
            store,
            capture,
        })
    }

    /// Open the configured state database and build a gateway over it.
    pub fn open(config: SlbConfig) -> Result<Self> {
        let store = Store::open(&config.store.db_path)?;
        Self::new(config, store)
    }

    pub fn config(&self) -> &SlbConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// A sweeper using the configured stale-session threshold.
    pub fn sweeper(&self) -> Sweeper {
        let secs = i64::try_from(self.config.sessions.stale_threshold_secs).unwrap_or(i64::MAX);
        Sweeper::new(self.store.clone(), chrono::Duration::seconds(secs))
    }

    pub fn classify(&self, command: &str, cwd: &Path) -> ClassificationResult {
        self.engine.classify(command, cwd)
    }

    pub fn open_session(
        &self,
        agent_name: &str,
        program: &str,
        model: &str,
        project_path: &Path,
    ) -> Result<IssuedSession> {
        self.store
            .create_session(agent_name, program, model, project_path)
    }

    /// Classify `command` and, if it needs review, open a request for it.
    ///
    /// Safe and unclassified commands return no request. Caution commands are
    /// recorded and come back already approved.
    pub fn propose(
        &self,
        session_id: SessionId,
        session_key: &str,
        command: &str,
        cwd: &Path,
    ) -> Result<Proposal> {
        let classification = self.classify(command, cwd);
        if !classification.needs_approval {
            debug!(tier = %classification.tier, "no review needed");
            return Ok(Proposal {
                classification,
                request: None,
            });
        }

        let redacted = self.redactor.redact(command);
        let secs = i64::try_from(self.config.general.request_timeout_secs).unwrap_or(i64::MAX);
        let request = self.store.create_request(&NewRequest {
            requestor_session_id: session_id,
            session_key: session_key.to_string(),
            command_raw: command.to_string(),
            display_redacted: redacted.display,
            contains_sensitive: redacted.contains_sensitive,
            cwd: cwd.to_path_buf(),
            tier: classification.tier,
            min_approvals: classification.min_approvals,
            ttl: chrono::Duration::seconds(secs),
        })?;

        Ok(Proposal {
            classification,
            request: Some(request),
        })
    }

    pub fn review(
        &self,
        request_id: RequestId,
        reviewer_session_id: SessionId,
        reviewer_key: &str,
        decision: Decision,
        comments: &str,
    ) -> Result<Request> {
        self.store
            .submit_review(request_id, reviewer_session_id, reviewer_key, decision, comments)
    }

    /// Decide whether the requestor may now run its command.
    ///
    /// The request must be approved. Dangerous and critical commands also need
    /// a rollback point on stable storage; one already recorded for the
    /// request is reused if it still loads. Any failure is a denial.
    pub async fn clear_for_execution(
        &self,
        request_id: RequestId,
        session_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Clearance> {
        let result = self.clear(request_id, session_key, cancel).await;
        if let Err(e) = &result {
            warn!(request_id = %request_id, error = %e, "execution denied");
        }
        result
    }

    async fn clear(
        &self,
        request_id: RequestId,
        session_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Clearance> {
        let request = self.store.get_request(request_id)?;
        self.store
            .verify_session_key(request.requestor_session_id, session_key)?;

        match request.status {
            RequestStatus::Approved => {}
            RequestStatus::Pending if request.is_expired_at(chrono::Utc::now()) => {
                self.store.mark_timeout(request_id)?;
                return Err(SlbError::RequestExpired);
            }
            status => return Err(SlbError::RequestNotApproved { status }),
        }

        if !request.tier.requires_rollback() {
            info!(request_id = %request_id, tier = %request.tier, "cleared for execution");
            return Ok(Clearance {
                request,
                rollback: None,
            });
        }

        if !self.config.rollback.enabled {
            return Err(SlbError::RollbackCaptureUnavailable(
                "rollback capture is disabled".into(),
            ));
        }

        let existing = request
            .rollback_path
            .as_deref()
            .and_then(|path| match load_rollback_data(path) {
                Ok(record) if record.request_id == request.id => Some(record),
                Ok(_) => None,
                Err(e) => {
                    warn!(request_id = %request_id, error = %e, "recorded rollback point unusable, capturing again");
                    None
                }
            });

        let record = match existing {
            Some(record) => record,
            None => {
                let record = slb_rollback::capture(&request, &self.capture, cancel).await?;
                self.store
                    .attach_rollback(request_id, &record.rollback_path)?;
                record
            }
        };

        let request = self.store.get_request(request_id)?;
        info!(
            request_id = %request_id,
            tier = %request.tier,
            rollback = %record.rollback_path.display(),
            "cleared for execution"
        );
        Ok(Clearance {
            request,
            rollback: Some(record),
        })
    }

    /// Restore the rollback point recorded for `request_id`.
    pub async fn restore(
        &self,
        request_id: RequestId,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<RollbackRecord> {
        let request = self.store.get_request(request_id)?;
        let path = request.rollback_path.ok_or_else(|| {
            SlbError::Rollback(format!("request {request_id} has no rollback point"))
        })?;
        let record = load_rollback_data(&path)?;
        let options = RestoreOptions {
            force,
            command_timeout: Duration::from_secs(self.config.rollback.command_timeout_secs.max(1)),
        };
        slb_rollback::restore(&record, &options, cancel).await?;
        Ok(record)
    }
}

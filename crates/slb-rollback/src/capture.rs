use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use slb_config::RollbackConfig;
use slb_core::{Request, Result, SlbError};

use crate::archive;
use crate::git;
use crate::kube;
use crate::plan::{RollbackPlan, plan_rollback};
use crate::record::{RECORD_VERSION, RollbackPayload, RollbackRecord, sync_dir, write_metadata};

/// How and where rollback points are captured.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Root for `req-<id>` directories. `None` = `<project>/.slb/rollback`.
    pub base_dir: Option<PathBuf>,
    /// Largest filesystem capture, in bytes. 0 = unlimited.
    pub max_size_bytes: u64,
    /// Rollback points older than this are removed on capture. `None` keeps them.
    pub retention: Option<Duration>,
    /// Per external command.
    pub command_timeout: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self::from_config(&RollbackConfig::default())
    }
}

impl CaptureOptions {
    pub fn from_config(config: &RollbackConfig) -> Self {
        Self {
            base_dir: config.base_dir.clone(),
            max_size_bytes: config.max_size_mb.saturating_mul(1024 * 1024),
            retention: (config.retention_days > 0)
                .then(|| Duration::from_secs(config.retention_days.saturating_mul(86_400))),
            command_timeout: Duration::from_secs(config.command_timeout_secs.max(1)),
        }
    }

    /// Base directory for rollback points of `project_path`.
    pub fn base_dir_for(&self, project_path: &Path) -> PathBuf {
        self.base_dir
            .clone()
            .unwrap_or_else(|| project_path.join(".slb").join("rollback"))
    }
}

/// Removes a half-written rollback directory unless the capture completes.
/// Dropping it also cancels work still running on its behalf.
struct PartialCapture {
    dir: PathBuf,
    cancel: CancellationToken,
    committed: bool,
}

impl PartialCapture {
    fn new(dir: PathBuf, cancel: CancellationToken) -> Self {
        Self {
            dir,
            cancel,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PartialCapture {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        self.cancel.cancel();
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %self.dir.display(), error = %e, "failed to remove partial rollback point");
            }
        } else {
            debug!(dir = %self.dir.display(), "discarded partial rollback point");
        }
    }
}

/// Capture a rollback point for `request` before its command runs.
///
/// The record is on stable storage when this returns. On any failure,
/// including cancellation, no rollback directory is left behind. Commands
/// with no applicable strategy fail with `RollbackCaptureUnavailable`.
pub async fn capture(
    request: &Request,
    options: &CaptureOptions,
    cancel: &CancellationToken,
) -> Result<RollbackRecord> {
    if request.command_raw.trim().is_empty() {
        return Err(SlbError::InvalidRequest("command is required".into()));
    }
    let plan = plan_rollback(&request.command_raw)?.ok_or_else(|| {
        SlbError::RollbackCaptureUnavailable(format!(
            "no rollback strategy for command: {}",
            request.display_redacted
        ))
    })?;

    let cwd = if request.cwd.as_os_str().is_empty() {
        request.project_path.clone()
    } else {
        request.cwd.clone()
    };
    let base_dir = options.base_dir_for(&request.project_path);

    if let Some(retention) = options.retention {
        cleanup_expired(&base_dir, retention);
    }

    let rollback_dir = base_dir.join(format!("req-{}", request.id));
    if rollback_dir.exists() {
        // Left over from an interrupted capture; never trust it.
        fs::remove_dir_all(&rollback_dir)?;
    }
    fs::create_dir_all(&rollback_dir)?;
    let work = cancel.child_token();
    let guard = PartialCapture::new(rollback_dir.clone(), work.clone());

    let payload = match plan {
        RollbackPlan::Git => RollbackPayload::Git(
            git::capture_git(&rollback_dir, &cwd, options.command_timeout, &work).await?,
        ),
        RollbackPlan::Filesystem { targets } => {
            let (paths, missing) = archive::resolve_targets(&cwd, &targets)?;
            if paths.is_empty() {
                return Err(SlbError::RollbackCaptureUnavailable(
                    "none of the rm targets exist".into(),
                ));
            }
            if let Some(covering) = paths.iter().find(|p| base_dir.starts_with(p)) {
                return Err(SlbError::RollbackCaptureUnavailable(format!(
                    "{} contains the rollback store",
                    covering.display()
                )));
            }

            let dir = rollback_dir.clone();
            let exclude = base_dir.clone();
            let max = options.max_size_bytes;
            let token = work.clone();
            let snapshot = tokio::select! {
                _ = work.cancelled() => return Err(SlbError::Cancelled),
                joined = tokio::task::spawn_blocking(move || {
                    archive::capture_files(&dir, &exclude, paths, missing, max, &token)
                }) => joined.map_err(|e| SlbError::Rollback(format!("archive task failed: {e}")))??,
            };
            RollbackPayload::Filesystem(snapshot)
        }
        RollbackPlan::Kubernetes(delete) => RollbackPayload::Kubernetes(
            kube::capture_kube(&rollback_dir, &cwd, &delete, options.command_timeout, &work).await?,
        ),
    };

    if work.is_cancelled() {
        return Err(SlbError::Cancelled);
    }

    let record = RollbackRecord {
        version: RECORD_VERSION,
        request_id: request.id,
        command_raw: request.command_raw.clone(),
        cwd,
        project_path: request.project_path.clone(),
        captured_at: Utc::now(),
        rollback_path: rollback_dir,
        payload,
    };
    write_metadata(&record)?;
    sync_dir(&base_dir)?;
    guard.commit();

    info!(
        request_id = %record.request_id,
        kind = %record.kind(),
        path = %record.rollback_path.display(),
        "rollback point captured"
    );
    Ok(record)
}

/// Delete `req-*` rollback directories last modified before `now - retention`.
/// Best effort: failures are logged. Returns how many were removed.
pub fn cleanup_expired(base_dir: &Path, retention: Duration) -> usize {
    let Ok(entries) = fs::read_dir(base_dir) else {
        return 0;
    };
    let Some(cutoff) = SystemTime::now().checked_sub(retention) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.filter_map(|e| e.ok()) {
        let is_rollback_dir = entry.file_name().to_string_lossy().starts_with("req-")
            && entry.file_type().is_ok_and(|t| t.is_dir());
        if !is_rollback_dir {
            continue;
        }
        let expired = entry
            .metadata()
            .and_then(|m| m.modified())
            .is_ok_and(|modified| modified < cutoff);
        if !expired {
            continue;
        }
        match fs::remove_dir_all(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %entry.path().display(), error = %e, "failed to remove expired rollback point"),
        }
    }
    if removed > 0 {
        info!(removed, base = %base_dir.display(), "removed expired rollback points");
    }
    removed
}

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use slb_core::{Result, SlbError};

use crate::archive;
use crate::git;
use crate::kube;
use crate::record::{RollbackPayload, RollbackRecord};

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Git: reset even if that discards work done since the capture.
    pub force: bool,
    pub command_timeout: Duration,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            force: false,
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// Put the state captured in `record` back in place. Idempotent.
pub async fn restore(
    record: &RollbackRecord,
    options: &RestoreOptions,
    cancel: &CancellationToken,
) -> Result<()> {
    if record.rollback_path.as_os_str().is_empty() {
        return Err(SlbError::Rollback("rollback path is required".into()));
    }

    match &record.payload {
        RollbackPayload::Git(snapshot) => {
            git::restore_git(
                snapshot,
                &record.rollback_path,
                options.force,
                options.command_timeout,
                cancel,
            )
            .await?
        }
        RollbackPayload::Filesystem(snapshot) => {
            let snapshot = snapshot.clone();
            let dir = record.rollback_path.clone();
            let token = cancel.clone();
            let restored = tokio::task::spawn_blocking(move || {
                archive::restore_files(&snapshot, &dir, &token)
            })
            .await
            .map_err(|e| SlbError::Rollback(format!("restore task failed: {e}")))??;
            info!(request_id = %record.request_id, entries = restored, "restored filesystem state");
        }
        RollbackPayload::Kubernetes(snapshot) => {
            let cwd = if record.cwd.is_dir() {
                record.cwd.as_path()
            } else {
                record.rollback_path.as_path()
            };
            let applied = kube::restore_kube(
                snapshot,
                &record.rollback_path,
                cwd,
                options.command_timeout,
                cancel,
            )
            .await?;
            info!(request_id = %record.request_id, manifests = applied, "restored kubernetes resources");
        }
    }

    info!(request_id = %record.request_id, kind = %record.kind(), "rollback restored");
    Ok(())
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use slb_core::{RequestId, Result, SlbError};

use crate::kube::KubeResource;

/// Name of the metadata file inside every rollback directory.
pub const METADATA_FILE: &str = "metadata.json";

/// Bumped when the metadata layout changes incompatibly.
pub const RECORD_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackKind {
    Git,
    Filesystem,
    Kubernetes,
}

impl std::fmt::Display for RollbackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RollbackKind::Git => write!(f, "git"),
            RollbackKind::Filesystem => write!(f, "filesystem"),
            RollbackKind::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

/// Repository state at capture time. Artifacts live under `git/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSnapshot {
    pub repo_root: PathBuf,
    pub head: String,
    /// `HEAD` when the repository was detached.
    pub branch: String,
    pub has_staged_changes: bool,
    pub has_unstaged_changes: bool,
    pub untracked_files: usize,
}

impl GitSnapshot {
    pub fn is_detached(&self) -> bool {
        self.branch.is_empty() || self.branch == "HEAD"
    }
}

/// One archived path. Archive entries are named `<id>/<relative path>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemRoot {
    pub id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemSnapshot {
    /// Archive file name, relative to the rollback directory.
    pub archive: String,
    pub roots: Vec<FilesystemRoot>,
    /// Bytes of regular-file content archived.
    pub total_bytes: u64,
    /// Targets named by the command that did not exist at capture time.
    #[serde(default)]
    pub missing: Vec<PathBuf>,
}

/// Manifests of the resources a `kubectl delete` names. Paths in
/// `manifests` are relative to the rollback directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesSnapshot {
    #[serde(default)]
    pub namespace: Option<String>,
    pub resources: Vec<KubeResource>,
    pub manifests: Vec<String>,
}

/// Kind-specific payload, tagged by `kind` in the metadata file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RollbackPayload {
    Git(GitSnapshot),
    Filesystem(FilesystemSnapshot),
    Kubernetes(KubernetesSnapshot),
}

impl RollbackPayload {
    pub fn kind(&self) -> RollbackKind {
        match self {
            RollbackPayload::Git(_) => RollbackKind::Git,
            RollbackPayload::Filesystem(_) => RollbackKind::Filesystem,
            RollbackPayload::Kubernetes(_) => RollbackKind::Kubernetes,
        }
    }
}

/// A captured rollback point, as persisted in `metadata.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub version: u32,
    pub request_id: RequestId,
    pub command_raw: String,
    pub cwd: PathBuf,
    pub project_path: PathBuf,
    pub captured_at: DateTime<Utc>,
    /// Directory holding this record. Rewritten on load to where it was found.
    pub rollback_path: PathBuf,
    pub payload: RollbackPayload,
}

impl RollbackRecord {
    pub fn kind(&self) -> RollbackKind {
        self.payload.kind()
    }
}

/// Reconstruct a record from its rollback directory alone.
pub fn load_rollback_data(rollback_dir: &Path) -> Result<RollbackRecord> {
    if rollback_dir.as_os_str().is_empty() {
        return Err(SlbError::Rollback("rollback directory is required".into()));
    }
    let path = rollback_dir.join(METADATA_FILE);
    let raw = fs::read_to_string(&path).map_err(|e| {
        SlbError::Rollback(format!("reading {}: {e}", path.display()))
    })?;
    let mut record: RollbackRecord = serde_json::from_str(&raw)?;
    if record.version > RECORD_VERSION {
        return Err(SlbError::Rollback(format!(
            "unsupported rollback record version {} (max {RECORD_VERSION})",
            record.version
        )));
    }
    record.rollback_path = rollback_dir.to_path_buf();
    Ok(record)
}

/// Write `metadata.json` through a temp file and rename, flushing both the
/// file and its directory.
pub(crate) fn write_metadata(record: &RollbackRecord) -> Result<()> {
    let dir = &record.rollback_path;
    let tmp = dir.join(format!("{METADATA_FILE}.tmp"));
    let json = serde_json::to_vec_pretty(record)?;

    let mut file = File::create(&tmp)?;
    file.write_all(&json)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, dir.join(METADATA_FILE))?;
    sync_dir(dir)
}

/// Write an artifact and flush it to disk.
pub(crate) fn write_synced(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}

/// Flush directory entries (new files, renames) to disk.
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    File::open(dir)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

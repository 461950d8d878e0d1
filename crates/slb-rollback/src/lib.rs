//! # slb-rollback
//!
//! Rollback points for commands that destroy state. Before a dangerous or
//! critical command is cleared for execution, the gateway captures enough of
//! the current state to undo it:
//!
//! - **Git**: HEAD, branch, status, staged and unstaged diffs of the repository.
//! - **Filesystem**: a gzip-compressed tar archive of every `rm` target.
//! - **Kubernetes**: the YAML manifest of every resource a `kubectl delete` names.
//!
//! Each rollback point is a self-describing directory (`req-<id>/`) holding a
//! `metadata.json` and its payload, so it can be restored without the state
//! database.

pub mod archive;
pub mod capture;
pub mod git;
pub mod kube;
pub mod plan;
mod process;
pub mod record;
pub mod restore;

pub use capture::{CaptureOptions, capture, cleanup_expired};
pub use kube::{KubeResource, KubectlDelete, parse_kubectl, sanitize_file_name};
pub use plan::{RollbackPlan, plan_rollback};
pub use record::{
    FilesystemRoot, FilesystemSnapshot, GitSnapshot, KubernetesSnapshot, METADATA_FILE,
    RollbackKind, RollbackPayload, RollbackRecord, load_rollback_data,
};
pub use restore::{RestoreOptions, restore};

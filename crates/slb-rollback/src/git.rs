//! Git snapshots: capture HEAD, branch and pending changes, and put them back.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use slb_core::{Result, SlbError};

use crate::process::{ToolOutput, run_tool};
use crate::record::{GitSnapshot, write_synced};

pub const GIT_DIR: &str = "git";
pub const HEAD_FILE: &str = "head.txt";
pub const BRANCH_FILE: &str = "branch.txt";
pub const STATUS_FILE: &str = "status.txt";
pub const DIFF_FILE: &str = "diff.patch";
pub const CACHED_DIFF_FILE: &str = "diff_cached.patch";
pub const UNTRACKED_FILE: &str = "untracked.txt";

/// Run `git` in `dir`, with prompts disabled.
pub async fn run_git(
    dir: &Path,
    args: &[&str],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ToolOutput> {
    run_git_env(dir, args, &[], timeout, cancel).await
}

/// [`run_git`] with extra environment variables.
pub async fn run_git_env(
    dir: &Path,
    args: &[&str],
    envs: &[(&str, &OsStr)],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ToolOutput> {
    let mut all = vec![("GIT_TERMINAL_PROMPT", OsStr::new("0"))];
    all.extend_from_slice(envs);
    run_tool("git", dir, args, &all, timeout, cancel).await
}

/// Run `git` and fail unless it exits successfully.
async fn git_ok(
    dir: &Path,
    args: &[&str],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    git_ok_env(dir, args, &[], timeout, cancel).await
}

async fn git_ok_env(
    dir: &Path,
    args: &[&str],
    envs: &[(&str, &OsStr)],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    let out = run_git_env(dir, args, envs, timeout, cancel).await?;
    if !out.success {
        return Err(SlbError::Rollback(format!(
            "git {} failed: {}",
            args.join(" "),
            out.stderr.trim()
        )));
    }
    Ok(out.stdout)
}

/// [`git_ok`] for commands whose output is a single line of text.
async fn git_line(
    dir: &Path,
    args: &[&str],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<String> {
    let out = git_ok(dir, args, timeout, cancel).await?;
    Ok(String::from_utf8_lossy(&out).trim().to_string())
}

/// `git diff` flags that keep the patch applicable whatever the user's
/// diff configuration says.
const DIFF_ARGS: &[&str] = &[
    "diff",
    "--binary",
    "--no-color",
    "--no-ext-diff",
    "--src-prefix=a/",
    "--dst-prefix=b/",
];

/// Top level of the repository containing `dir`, or `None` outside one.
pub async fn repo_root(
    dir: &Path,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let out = run_git(dir, &["rev-parse", "--show-toplevel"], timeout, cancel).await?;
    if !out.success {
        return Ok(None);
    }
    Ok(Some(PathBuf::from(out.text())))
}

/// Record the repository state at `cwd` into `<rollback_dir>/git/`.
///
/// Fails with `RollbackCaptureUnavailable` when `cwd` is not inside a
/// repository or HEAD cannot be resolved (an unborn branch).
pub async fn capture_git(
    rollback_dir: &Path,
    cwd: &Path,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<GitSnapshot> {
    let repo_root = repo_root(cwd, timeout, cancel).await?.ok_or_else(|| {
        SlbError::RollbackCaptureUnavailable(format!(
            "{} is not inside a git repository",
            cwd.display()
        ))
    })?;

    let head = run_git(&repo_root, &["rev-parse", "HEAD"], timeout, cancel).await?;
    if !head.success {
        return Err(SlbError::RollbackCaptureUnavailable(format!(
            "cannot resolve HEAD in {}: {}",
            repo_root.display(),
            head.stderr.trim()
        )));
    }
    let head = head.text();
    let branch = git_line(&repo_root, &["rev-parse", "--abbrev-ref", "HEAD"], timeout, cancel).await?;
    let status = git_ok(&repo_root, &["status", "--porcelain=v1"], timeout, cancel).await?;
    let diff = git_ok(&repo_root, DIFF_ARGS, timeout, cancel).await?;
    let mut cached_args = DIFF_ARGS.to_vec();
    cached_args.push("--cached");
    let cached = git_ok(&repo_root, &cached_args, timeout, cancel).await?;
    let untracked = git_ok(
        &repo_root,
        &["ls-files", "--others", "--exclude-standard"],
        timeout,
        cancel,
    )
    .await?;

    let dir = rollback_dir.join(GIT_DIR);
    fs::create_dir_all(&dir)?;
    write_synced(&dir.join(HEAD_FILE), format!("{head}\n").as_bytes())?;
    write_synced(&dir.join(BRANCH_FILE), format!("{branch}\n").as_bytes())?;
    write_synced(&dir.join(STATUS_FILE), &status)?;
    write_synced(&dir.join(DIFF_FILE), &diff)?;
    write_synced(&dir.join(CACHED_DIFF_FILE), &cached)?;
    write_synced(&dir.join(UNTRACKED_FILE), &untracked)?;
    crate::record::sync_dir(&dir)?;

    info!(repo = %repo_root.display(), %head, %branch, "captured git state");

    Ok(GitSnapshot {
        repo_root,
        head,
        branch,
        has_staged_changes: !is_blank(&cached),
        has_unstaged_changes: !is_blank(&diff),
        untracked_files: untracked.split(|b| *b == b'\n').filter(|l| !l.is_empty()).count(),
    })
}

/// Put the repository back to the captured HEAD, branch and pending changes.
///
/// Without `force` the restore goes ahead only when it cannot lose work:
/// the repository must already match the snapshot (a no-op), or be on the
/// recorded branch with a clean tree and a HEAD the recorded commit descends
/// from. Anything else is `RollbackRestoreDiverged`.
pub async fn restore_git(
    snapshot: &GitSnapshot,
    rollback_dir: &Path,
    force: bool,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let root = &snapshot.repo_root;
    if !root.is_dir() {
        return Err(SlbError::Rollback(format!(
            "repository {} no longer exists",
            root.display()
        )));
    }
    let artifacts = rollback_dir.join(GIT_DIR);
    let recorded_status = fs::read(artifacts.join(STATUS_FILE)).unwrap_or_default();
    let recorded_status = String::from_utf8_lossy(&recorded_status);

    let current_head = git_line(root, &["rev-parse", "HEAD"], timeout, cancel).await?;
    let current_branch = git_line(root, &["rev-parse", "--abbrev-ref", "HEAD"], timeout, cancel).await?;
    let current_status = git_ok(root, &["status", "--porcelain=v1"], timeout, cancel).await?;
    let current_status = String::from_utf8_lossy(&current_status);

    let same_ref = current_head == snapshot.head && current_branch == snapshot.branch;
    if same_ref && tracked_changes(&current_status) == tracked_changes(&recorded_status) {
        info!(repo = %root.display(), head = %snapshot.head, "git state already matches rollback point");
        return Ok(());
    }

    if !force {
        let dirty = git_line(
            root,
            &["status", "--porcelain=v1", "--untracked-files=no"],
            timeout,
            cancel,
        )
        .await?;
        let ancestor = run_git(
            root,
            &["merge-base", "--is-ancestor", current_head.as_str(), snapshot.head.as_str()],
            timeout,
            cancel,
        )
        .await?
        .success;

        if current_branch != snapshot.branch || !dirty.is_empty() || !ancestor {
            warn!(
                repo = %root.display(),
                recorded = %snapshot.head,
                current = %current_head,
                "refusing git restore without force"
            );
            return Err(SlbError::RollbackRestoreDiverged {
                recorded: snapshot.head.clone(),
                current: current_head,
            });
        }
    }

    // Nothing below may run unless the captured changes are known to apply.
    check_patches(root, &artifacts, &snapshot.head, timeout, cancel).await?;

    if snapshot.is_detached() {
        git_ok(root, &["checkout", "-f", "--detach", snapshot.head.as_str()], timeout, cancel).await?;
    } else {
        git_ok(
            root,
            &["checkout", "-f", "-B", snapshot.branch.as_str(), snapshot.head.as_str()],
            timeout,
            cancel,
        )
        .await?;
    }
    git_ok(root, &["reset", "--hard", snapshot.head.as_str()], timeout, cancel).await?;

    apply_patch(root, &artifacts.join(CACHED_DIFF_FILE), true, timeout, cancel).await?;
    apply_patch(root, &artifacts.join(DIFF_FILE), false, timeout, cancel).await?;

    info!(repo = %root.display(), head = %snapshot.head, branch = %snapshot.branch, force, "restored git state");
    Ok(())
}

/// Status lines for tracked paths. Untracked files are never restored, so
/// they do not count when comparing against the snapshot.
fn tracked_changes(status: &str) -> Vec<&str> {
    status
        .lines()
        .filter(|l| !l.is_empty() && !l.starts_with("??"))
        .collect()
}

fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(u8::is_ascii_whitespace)
}

/// A captured patch worth applying, or `None` when absent or empty.
fn patch_file(path: &Path) -> Option<&Path> {
    let contents = fs::read(path).ok()?;
    (!is_blank(&contents)).then_some(path)
}

/// Dry-run both patches against `head` in a scratch index, leaving the
/// repository's own index and working tree untouched.
async fn check_patches(
    root: &Path,
    artifacts: &Path,
    head: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let cached_path = artifacts.join(CACHED_DIFF_FILE);
    let diff_path = artifacts.join(DIFF_FILE);
    let cached = patch_file(&cached_path);
    let diff = patch_file(&diff_path);
    if cached.is_none() && diff.is_none() {
        return Ok(());
    }

    let scratch = tempfile::tempdir()?;
    let index = scratch.path().join("index");
    let envs = [("GIT_INDEX_FILE", index.as_os_str())];
    let check = |e: SlbError| SlbError::Rollback(format!("captured changes no longer apply: {e}"));

    git_ok_env(root, &["read-tree", head], &envs, timeout, cancel).await?;
    if let Some(patch) = cached {
        let patch = patch.to_string_lossy();
        git_ok_env(root, &["apply", "--cached", "--whitespace=nowarn", &*patch], &envs, timeout, cancel)
            .await
            .map_err(check)?;
    }
    if let Some(patch) = diff {
        let patch = patch.to_string_lossy();
        git_ok_env(
            root,
            &["apply", "--cached", "--check", "--whitespace=nowarn", &*patch],
            &envs,
            timeout,
            cancel,
        )
        .await
        .map_err(check)?;
    }
    debug!(repo = %root.display(), "captured patches apply cleanly");
    Ok(())
}

/// Apply a captured diff. Staged changes go to the index and the working
/// tree, unstaged ones to the working tree only.
async fn apply_patch(
    root: &Path,
    patch: &Path,
    staged: bool,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let Some(patch) = patch_file(patch) else {
        return Ok(());
    };
    let patch = patch.to_string_lossy();
    let mut args = vec!["apply", "--whitespace=nowarn"];
    if staged {
        args.push("--index");
    }
    args.push(&patch);
    git_ok(root, &args, timeout, cancel).await?;
    Ok(())
}

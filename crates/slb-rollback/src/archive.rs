//! Filesystem snapshots as gzip-compressed tar archives.
//!
//! Every archived root gets an id (`p0`, `p1`, ...) and its entries are
//! stored under that id, so extraction maps each entry back onto a recorded
//! root and can never write outside of one.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use globset::Glob;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};
use tar::EntryType;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use slb_classify::normalize::clean_path;
use slb_core::{Result, SlbError};

use crate::record::{FilesystemRoot, FilesystemSnapshot};

pub const ARCHIVE_FILE: &str = "files.tar.gz";

/// Resolve `rm` operands against `cwd` into absolute paths, split into those
/// that exist and those that do not. Globs in the last path component are
/// expanded. Operands that need the shell to resolve (`$VAR`, backticks) are
/// refused, since the capture could not know what they name.
pub fn resolve_targets(cwd: &Path, targets: &[String]) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut existing = Vec::new();
    let mut missing = Vec::new();
    let mut seen = HashSet::new();

    for target in targets {
        if target.contains(['$', '`']) {
            return Err(SlbError::RollbackCaptureUnavailable(format!(
                "cannot resolve rm target '{target}' without a shell"
            )));
        }

        let expanded = expand_home(target);
        let joined = if expanded.is_absolute() {
            expanded
        } else {
            cwd.join(expanded)
        };

        let candidates = if target.contains(['*', '?', '[']) {
            expand_glob(&joined)?
        } else {
            vec![]
        };
        let candidates = if candidates.is_empty() {
            vec![clean_path(&joined)]
        } else {
            candidates
        };

        for candidate in candidates {
            if !seen.insert(candidate.clone()) {
                continue;
            }
            if fs::symlink_metadata(&candidate).is_ok() {
                existing.push(candidate);
            } else {
                missing.push(candidate);
            }
        }
    }

    Ok((existing, missing))
}

fn expand_home(target: &str) -> PathBuf {
    match target.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => match dirs::home_dir() {
            Some(home) => home.join(rest.trim_start_matches('/')),
            None => PathBuf::from(target),
        },
        _ => PathBuf::from(target),
    }
}

/// Expand a glob in the final component against the entries of its parent.
fn expand_glob(pattern: &Path) -> Result<Vec<PathBuf>> {
    let (Some(parent), Some(name)) = (pattern.parent(), pattern.file_name()) else {
        return Ok(vec![]);
    };
    let parent = clean_path(parent);
    let matcher = Glob::new(&name.to_string_lossy())
        .map_err(|e| SlbError::RollbackCaptureUnavailable(format!("bad glob {}: {e}", pattern.display())))?
        .compile_matcher();

    // Shell globs skip dotfiles unless the pattern itself starts with a dot.
    let include_hidden = name.to_string_lossy().starts_with('.');

    let Ok(entries) = fs::read_dir(&parent) else {
        return Ok(vec![]);
    };
    let mut matches: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name())
        .filter(|n| include_hidden || !n.to_string_lossy().starts_with('.'))
        .filter(|n| matcher.is_match(n))
        .map(|n| parent.join(n))
        .collect();
    matches.sort();
    Ok(matches)
}

/// Walk `root` without following symlinks, skipping anything under `exclude`.
fn walk<'a>(root: &Path, exclude: &'a Path) -> impl Iterator<Item = walkdir::Result<walkdir::DirEntry>> + 'a {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(move |e| !e.path().starts_with(exclude))
}

/// Total size of regular files under `roots`. Fails closed once `max_bytes`
/// (0 = unlimited) is exceeded.
pub fn measure(
    roots: &[PathBuf],
    exclude: &Path,
    max_bytes: u64,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut total = 0u64;
    for root in roots {
        for entry in walk(root, exclude) {
            if cancel.is_cancelled() {
                return Err(SlbError::Cancelled);
            }
            let entry = entry.map_err(|e| SlbError::Rollback(format!("walking {}: {e}", root.display())))?;
            if entry.file_type().is_file() {
                let len = entry
                    .metadata()
                    .map_err(|e| SlbError::Rollback(format!("stat {}: {e}", entry.path().display())))?
                    .len();
                total += len;
                if max_bytes > 0 && total > max_bytes {
                    return Err(SlbError::RollbackCaptureUnavailable(format!(
                        "targets exceed rollback size limit of {max_bytes} bytes"
                    )));
                }
            }
        }
    }
    Ok(total)
}

/// Archive `paths` into `<rollback_dir>/files.tar.gz` and flush it to disk.
/// Nothing under `exclude` (the rollback store itself) is archived.
pub fn capture_files(
    rollback_dir: &Path,
    exclude: &Path,
    paths: Vec<PathBuf>,
    missing: Vec<PathBuf>,
    max_bytes: u64,
    cancel: &CancellationToken,
) -> Result<FilesystemSnapshot> {
    let total_bytes = measure(&paths, exclude, max_bytes, cancel)?;

    let roots: Vec<FilesystemRoot> = paths
        .into_iter()
        .enumerate()
        .map(|(i, path)| FilesystemRoot {
            id: format!("p{i}"),
            path,
        })
        .collect();

    let file = File::create(rollback_dir.join(ARCHIVE_FILE))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for root in &roots {
        append_root(&mut builder, root, exclude, cancel)?;
    }

    let encoder = builder.into_inner()?;
    let file = encoder.finish()?;
    file.sync_all()?;

    info!(roots = roots.len(), total_bytes, "archived filesystem targets");

    Ok(FilesystemSnapshot {
        archive: ARCHIVE_FILE.to_string(),
        roots,
        total_bytes,
        missing,
    })
}

fn append_root<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    root: &FilesystemRoot,
    exclude: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    for entry in walk(&root.path, exclude) {
        if cancel.is_cancelled() {
            return Err(SlbError::Cancelled);
        }
        let entry = entry.map_err(|e| SlbError::Rollback(format!("walking {}: {e}", root.path.display())))?;
        let rel = entry
            .path()
            .strip_prefix(&root.path)
            .map_err(|e| SlbError::Rollback(format!("archiving {}: {e}", entry.path().display())))?;

        let mut name = PathBuf::from(&root.id);
        if !rel.as_os_str().is_empty() {
            name.push(rel);
        }
        builder
            .append_path_with_name(entry.path(), &name)
            .map_err(|e| SlbError::Rollback(format!("archiving {}: {e}", entry.path().display())))?;
    }
    Ok(())
}

/// Put every root back exactly as captured. The archive is checked in full
/// before anything is touched; each root is then removed and re-extracted, so
/// files created after the capture do not survive. Directory modes are applied
/// last so read-only directories can still be filled. Running it twice gives
/// the same result.
pub fn restore_files(snapshot: &FilesystemSnapshot, rollback_dir: &Path, cancel: &CancellationToken) -> Result<usize> {
    let roots: HashMap<&str, &Path> = snapshot
        .roots
        .iter()
        .map(|r| (r.id.as_str(), r.path.as_path()))
        .collect();
    if roots.is_empty() {
        return Err(SlbError::Rollback("filesystem rollback has no roots".into()));
    }
    let archive_path = rollback_dir.join(&snapshot.archive);

    // Validation pass: a bad entry must fail before the first removal.
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(&archive_path)?));
    for entry in archive.entries()? {
        if cancel.is_cancelled() {
            return Err(SlbError::Cancelled);
        }
        let entry = entry?;
        let entry_path = entry.path()?.into_owned();
        target_for(&roots, &entry_path)?;
    }

    for root in &snapshot.roots {
        remove_existing(&root.path)?;
    }

    let mut archive = tar::Archive::new(GzDecoder::new(File::open(&archive_path)?));
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);

    let mut restored = 0;
    let mut dir_modes = Vec::new();
    for entry in archive.entries()? {
        if cancel.is_cancelled() {
            return Err(SlbError::Cancelled);
        }
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        let (root, target) = target_for(&roots, &entry_path)?;
        ensure_no_symlink_parents(root, &target)?;

        match entry.header().entry_type() {
            EntryType::Directory => {
                if fs::symlink_metadata(&target).is_ok_and(|m| !m.is_dir()) {
                    fs::remove_file(&target)?;
                }
                fs::create_dir_all(&target)?;
                dir_modes.push((target.clone(), entry.header().mode()?));
            }
            EntryType::Regular | EntryType::Continuous | EntryType::Symlink => {
                remove_existing(&target)?;
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                entry.unpack(&target)?;
            }
            other => {
                warn!(path = %target.display(), ?other, "skipping unsupported archive entry");
                continue;
            }
        }
        restored += 1;
        debug!(path = %target.display(), "restored");
    }

    // Deepest first, so a parent's mode never blocks its children.
    for (dir, mode) in dir_modes.iter().rev() {
        set_dir_mode(dir, *mode)?;
    }

    Ok(restored)
}

/// Map an archive entry onto the path it restores to.
fn target_for<'a>(roots: &HashMap<&str, &'a Path>, entry_path: &Path) -> Result<(&'a Path, PathBuf)> {
    let (root_id, rel) = split_entry_path(entry_path)?;
    let root = *roots.get(root_id.as_str()).ok_or_else(|| {
        SlbError::Rollback(format!("archive entry for unknown root {root_id}"))
    })?;
    let target = if rel.as_os_str().is_empty() {
        root.to_path_buf()
    } else {
        root.join(&rel)
    };
    Ok((root, target))
}

#[cfg(unix)]
fn set_dir_mode(dir: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(mode & 0o7777))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_mode(_dir: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// `p0/a/b` → (`p0`, `a/b`). Only plain components are accepted.
fn split_entry_path(path: &Path) -> Result<(String, PathBuf)> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SlbError::Rollback(format!(
                    "unsafe archive entry path: {}",
                    path.display()
                )));
            }
        }
    }
    let Some((root, rest)) = parts.split_first() else {
        return Err(SlbError::Rollback("empty archive entry path".into()));
    };
    Ok((root.to_string_lossy().into_owned(), rest.iter().collect()))
}

/// Refuse to write through a symlink planted between a root and the target.
fn ensure_no_symlink_parents(root: &Path, target: &Path) -> Result<()> {
    let Ok(rel) = target.strip_prefix(root) else {
        return Err(SlbError::Rollback(format!(
            "restore path {} escapes {}",
            target.display(),
            root.display()
        )));
    };
    let mut current = root.to_path_buf();
    let mut components = rel.components().peekable();
    while let Some(component) = components.next() {
        // The target itself may be a symlink; it gets replaced.
        if components.peek().is_none() {
            break;
        }
        current.push(component);
        if fs::symlink_metadata(&current).is_ok_and(|m| m.file_type().is_symlink()) {
            return Err(SlbError::Rollback(format!(
                "refusing to restore through symlink {}",
                current.display()
            )));
        }
    }
    Ok(())
}

fn remove_existing(target: &Path) -> Result<()> {
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(target)?,
        Ok(_) => fs::remove_file(target)?,
        Err(_) => {}
    }
    Ok(())
}

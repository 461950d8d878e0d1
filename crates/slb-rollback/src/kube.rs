//! Kubernetes snapshots: the manifests of every named resource, fetched with
//! `kubectl get -o yaml` before a delete and re-applied to undo it.
//!
//! Only resources named on the command line are captured. Deletes by
//! selector, `--all` or `-f` name nothing up front and are refused.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use slb_core::{Result, SlbError};

use crate::process::run_tool;
use crate::record::{KubernetesSnapshot, sync_dir, write_synced};

pub const KUBE_DIR: &str = "k8s";

/// One resource named by a delete, as `kind/name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeResource {
    pub kind: String,
    pub name: String,
}

/// What a `kubectl delete` removes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KubectlDelete {
    pub namespace: Option<String>,
    pub resources: Vec<KubeResource>,
}

/// Parse the arguments of `kubectl ...`. `None` unless the subcommand is
/// `delete`. Namespace flags may appear anywhere.
///
/// Resources are read as `kind/name` words or as `kind name...`, up to the
/// first other flag.
pub fn parse_kubectl(args: &[String]) -> Option<KubectlDelete> {
    let mut namespace = None;
    let mut words = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-n" | "--namespace" => {
                if let Some(value) = iter.next() {
                    namespace = Some(value.clone());
                }
            }
            _ => match arg
                .strip_prefix("--namespace=")
                .or_else(|| arg.strip_prefix("-n="))
            {
                Some(value) => namespace = Some(value.to_string()),
                None => words.push(arg.as_str()),
            },
        }
    }

    let (subcommand, rest) = words.split_first()?;
    if *subcommand != "delete" {
        return None;
    }

    Some(KubectlDelete {
        namespace,
        resources: resource_operands(rest),
    })
}

fn resource_operands(words: &[&str]) -> Vec<KubeResource> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < words.len() {
        let word = words[i];
        if word == "--" {
            i += 1;
            continue;
        }
        if word.starts_with('-') {
            break;
        }
        if let Some((kind, name)) = word.split_once('/') {
            if !kind.is_empty() && !name.is_empty() {
                out.push(KubeResource {
                    kind: kind.to_string(),
                    name: name.to_string(),
                });
            }
            i += 1;
            continue;
        }

        let kind = word;
        let before = out.len();
        i += 1;
        while i < words.len() && !words[i].starts_with('-') && !words[i].contains('/') {
            out.push(KubeResource {
                kind: kind.to_string(),
                name: words[i].to_string(),
            });
            i += 1;
        }
        if out.len() == before {
            break;
        }
    }
    out
}

/// Lowercase, keep `[a-z0-9_.-]`, map separators and spaces to `_`.
pub fn sanitize_file_name(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == ' ' { '_' } else { c })
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-' | '.'))
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

/// Fetch the manifest of every resource into `<rollback_dir>/k8s/`.
///
/// Fails with `RollbackCaptureUnavailable` when no resource is named or
/// any manifest cannot be fetched.
pub async fn capture_kube(
    rollback_dir: &Path,
    cwd: &Path,
    delete: &KubectlDelete,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<KubernetesSnapshot> {
    if delete.resources.is_empty() {
        return Err(SlbError::RollbackCaptureUnavailable(
            "kubectl delete names no resources to capture".into(),
        ));
    }

    let dir = rollback_dir.join(KUBE_DIR);
    fs::create_dir_all(&dir)?;

    let mut manifests = Vec::with_capacity(delete.resources.len());
    let mut used = HashSet::new();
    for resource in &delete.resources {
        let mut args = vec!["get", resource.kind.as_str(), resource.name.as_str()];
        if let Some(ns) = &delete.namespace {
            args.extend(["-n", ns.as_str()]);
        }
        args.extend(["-o", "yaml"]);

        let out = run_tool("kubectl", cwd, &args, &[], timeout, cancel)
            .await
            .map_err(|e| match e {
                SlbError::Rollback(msg) => SlbError::RollbackCaptureUnavailable(msg),
                other => other,
            })?;
        if !out.success {
            return Err(SlbError::RollbackCaptureUnavailable(format!(
                "kubectl get {}/{} failed: {}",
                resource.kind,
                resource.name,
                out.stderr.trim()
            )));
        }

        let stem = format!(
            "{}_{}",
            sanitize_file_name(&resource.kind),
            sanitize_file_name(&resource.name)
        );
        let mut file_name = format!("{stem}.yaml");
        let mut n = 1;
        while !used.insert(file_name.clone()) {
            n += 1;
            file_name = format!("{stem}_{n}.yaml");
        }
        write_synced(&dir.join(&file_name), &out.stdout)?;
        manifests.push(format!("{KUBE_DIR}/{file_name}"));
    }
    sync_dir(&dir)?;

    info!(
        resources = delete.resources.len(),
        namespace = delete.namespace.as_deref().unwrap_or("(current)"),
        "captured kubernetes manifests"
    );

    Ok(KubernetesSnapshot {
        namespace: delete.namespace.clone(),
        resources: delete.resources.clone(),
        manifests,
    })
}

/// Re-apply every captured manifest. `kubectl apply` is idempotent, so
/// running this twice is harmless.
pub async fn restore_kube(
    snapshot: &KubernetesSnapshot,
    rollback_dir: &Path,
    cwd: &Path,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<usize> {
    for manifest in &snapshot.manifests {
        let path = rollback_dir.join(manifest);
        if !path.is_file() {
            return Err(SlbError::Rollback(format!(
                "manifest {} is missing",
                path.display()
            )));
        }
        let path = path.to_string_lossy();
        let out = run_tool("kubectl", cwd, &["apply", "-f", &*path], &[], timeout, cancel).await?;
        if !out.success {
            return Err(SlbError::Rollback(format!(
                "kubectl apply {manifest} failed: {}",
                out.stderr.trim()
            )));
        }
    }
    Ok(snapshot.manifests.len())
}

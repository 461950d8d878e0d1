//! Deciding which kind of rollback point a command needs.

use slb_classify::normalize::{command_name, split_compound, strip_wrappers, tokenize};
use slb_core::{Result, SlbError};

use crate::kube::{KubectlDelete, parse_kubectl};

/// Programs whose operands are paths removed from disk.
const REMOVERS: &[&str] = &["rm", "rmdir", "unlink"];

/// What to capture before a command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackPlan {
    /// The command rewrites repository state.
    Git,
    /// The command removes these operands, as written (relative to the cwd).
    Filesystem { targets: Vec<String> },
    /// The command deletes cluster resources.
    Kubernetes(KubectlDelete),
}

/// Work out the rollback strategy for `command`.
///
/// `Ok(None)` means no strategy applies; callers that require a rollback
/// point must treat that as a denial. A compound command that needs more
/// than one kind of rollback point cannot be covered by a single one and is
/// refused.
pub fn plan_rollback(command: &str) -> Result<Option<RollbackPlan>> {
    let mut git = false;
    let mut targets = Vec::new();
    let mut kube: Option<KubectlDelete> = None;

    for segment in split_compound(command) {
        let tokens = tokenize(&segment).ok_or_else(|| {
            SlbError::RollbackCaptureUnavailable(format!("cannot parse command segment: {segment}"))
        })?;
        let (rest, _) = strip_wrappers(&tokens);
        let Some((program, args)) = rest.split_first() else {
            continue;
        };

        let program = command_name(program);
        if program == "git" {
            git = true;
        } else if REMOVERS.contains(&program) {
            targets.extend(removal_operands(args));
        } else if program == "kubectl" {
            if let Some(delete) = parse_kubectl(args) {
                match &mut kube {
                    Some(plan) if plan.namespace == delete.namespace => {
                        plan.resources.extend(delete.resources)
                    }
                    Some(_) => {
                        return Err(SlbError::RollbackCaptureUnavailable(
                            "kubectl deletes span more than one namespace".into(),
                        ));
                    }
                    None => kube = Some(delete),
                }
            }
        }
    }

    let kinds = usize::from(git) + usize::from(!targets.is_empty()) + usize::from(kube.is_some());
    if kinds > 1 {
        return Err(SlbError::RollbackCaptureUnavailable(
            "command needs more than one kind of rollback point".into(),
        ));
    }
    if git {
        return Ok(Some(RollbackPlan::Git));
    }
    if !targets.is_empty() {
        return Ok(Some(RollbackPlan::Filesystem { targets }));
    }
    Ok(kube.map(RollbackPlan::Kubernetes))
}

/// Operands of `rm`-style commands: everything that is not an option, and
/// everything after `--`. Stops at a pipe; redirections are skipped.
pub fn removal_operands(args: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let mut options_done = false;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg.starts_with('|') {
            break;
        }
        if let Some(operator_only) = redirection(arg) {
            if operator_only {
                iter.next();
            }
            continue;
        }
        if !options_done && arg == "--" {
            options_done = true;
            continue;
        }
        if !options_done && arg.starts_with('-') && arg != "-" {
            continue;
        }
        out.push(arg.clone());
    }
    out
}

/// `Some(true)` for a bare redirection operator (`>`, `2>>`), whose target is
/// the next word; `Some(false)` when the target is attached (`2>/dev/null`).
fn redirection(token: &str) -> Option<bool> {
    let rest = token.trim_start_matches(|c: char| c.is_ascii_digit());
    let rest = rest.strip_prefix('&').unwrap_or(rest);
    if !rest.starts_with(['>', '<']) {
        return None;
    }
    let target = rest.trim_start_matches(['>', '<', '&', '|']);
    Some(target.is_empty())
}

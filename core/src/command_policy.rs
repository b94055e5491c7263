//! The decision tree that authorizes a command reference.
//!
//! Three properties drive the shape: unqualified names are decided without
//! disk I/O, a policy written against the basename `git` keeps applying when
//! the user writes `./git` or `/usr/bin/git`, and project-local scripts can
//! be blanket-allowed without listing each one.

use std::path::Path;
use std::path::PathBuf;

use crate::path_resolver::is_contained;
use crate::path_resolver::normalize_lexically;
use crate::policy::EffectivePolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandDecision {
    /// A bare name on the allow-list; resolution is deferred to the
    /// platform's PATH search at spawn time.
    AllowedName(String),
    /// Allowed, with the absolute path that should be executed.
    AllowedPath(PathBuf),
    Denied(DenyReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// Carries the reference actually evaluated (post-resolution).
    NotAllowed(String),
    /// Carries the original reference: hosts must not prompt the user to
    /// allow a binary that does not exist.
    NotFound(String),
}

impl CommandDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::AllowedName(_) | Self::AllowedPath(_))
    }
}

/// Decide whether `cmd_ref` may run under `policy`, resolving relative
/// references against `cwd`.
pub fn check(cmd_ref: &str, policy: &EffectivePolicy, cwd: &Path) -> CommandDecision {
    if !cmd_ref.contains('/') {
        return if policy.is_command_listed(cmd_ref) {
            CommandDecision::AllowedName(cmd_ref.to_string())
        } else {
            CommandDecision::Denied(DenyReason::NotAllowed(cmd_ref.to_string()))
        };
    }

    // Qualified reference: a listed basename allows any spelling of the
    // same command.
    let path_ref = Path::new(cmd_ref);
    if let Some(base) = path_ref.file_name().and_then(|name| name.to_str())
        && policy.is_command_listed(base)
    {
        return CommandDecision::AllowedPath(resolve_ref(path_ref, cwd));
    }

    if path_ref.is_absolute() {
        let normalized = normalize_lexically(path_ref);
        return if policy.is_command_listed(&normalized.display().to_string()) {
            CommandDecision::AllowedPath(normalized)
        } else {
            CommandDecision::Denied(DenyReason::NotAllowed(normalized.display().to_string()))
        };
    }

    // Relative reference, basename not listed: probe the filesystem.
    let cwd_candidate = normalize_lexically(&cwd.join(path_ref));
    if cwd_candidate.is_file() {
        return decide_resolved(cwd_candidate, policy);
    }

    if let Some(project_dir) = &policy.project_dir {
        let project_candidate = normalize_lexically(&project_dir.join(path_ref));
        if project_candidate.is_file() {
            return decide_resolved(project_candidate, policy);
        }
    }

    CommandDecision::Denied(DenyReason::NotFound(cmd_ref.to_string()))
}

fn decide_resolved(candidate: PathBuf, policy: &EffectivePolicy) -> CommandDecision {
    if policy.allow_project_commands
        && let Some(project_dir) = &policy.project_dir
        && is_contained(&candidate, project_dir)
    {
        return CommandDecision::AllowedPath(candidate);
    }
    if policy.is_command_listed(&candidate.display().to_string()) {
        return CommandDecision::AllowedPath(candidate);
    }
    CommandDecision::Denied(DenyReason::NotAllowed(candidate.display().to_string()))
}

fn resolve_ref(path_ref: &Path, cwd: &Path) -> PathBuf {
    if path_ref.is_absolute() {
        normalize_lexically(path_ref)
    } else {
        normalize_lexically(&cwd.join(path_ref))
    }
}

//! The frozen per-session decision structure.
//!
//! An [`EffectivePolicy`] is produced once by the policy store when a session
//! opens and never mutated afterwards; the single sanctioned widening —
//! appending to `session_allowed_commands` — goes through
//! [`crate::config::PolicyStore::with_session_allow`], which returns a new
//! value.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::PathBuf;

use wildmatch::WildMatch;

use crate::config_types::Preset;
use crate::config_types::TaskConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Permissions {
    /// Allowed read roots, canonicalized at load time.
    pub read: Vec<PathBuf>,
    /// Allowed write roots, canonicalized at load time. Not required to be a
    /// subset of `read`.
    pub write: Vec<PathBuf>,
    /// Allowed network targets, `host[:port]`.
    pub net: Vec<String>,
    /// Environment variable names visible to the child.
    pub env: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportRules {
    pub trusted: Vec<String>,
    /// `None` means no explicit allow-list was declared, in which case any
    /// module not otherwise matched is allowed.
    pub allowed: Option<Vec<String>>,
    pub blocked: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportDecision {
    Trusted,
    Allowed,
    Blocked,
}

impl ImportRules {
    /// `blocked` wins over everything; `trusted` beats `allowed`; a module
    /// matching no list is allowed only when no explicit `allowed` list was
    /// declared.
    pub fn check(&self, module: &str) -> ImportDecision {
        if matches_any(&self.blocked, module) {
            return ImportDecision::Blocked;
        }
        if matches_any(&self.trusted, module) {
            return ImportDecision::Trusted;
        }
        match &self.allowed {
            Some(allowed) if matches_any(allowed, module) => ImportDecision::Allowed,
            Some(_) => ImportDecision::Blocked,
            None => ImportDecision::Allowed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvRules {
    /// Glob patterns for variables forwarded from the parent environment.
    pub allow: Vec<String>,
    /// Glob patterns masked even when allowed.
    pub mask: Vec<String>,
}

impl Default for EnvRules {
    fn default() -> Self {
        Self {
            allow: Vec::new(),
            mask: vec![
                "*KEY*".to_string(),
                "*SECRET*".to_string(),
                "*TOKEN*".to_string(),
            ],
        }
    }
}

fn matches_any(patterns: &[String], value: &str) -> bool {
    patterns
        .iter()
        .any(|pattern| WildMatch::new(pattern).matches(value))
}

/// The merged rule set governing what a session may do. Frozen at session
/// start; see the module docs for the one exception.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectivePolicy {
    pub preset: Preset,
    pub permissions: Permissions,
    /// Command references permitted globally.
    pub allowed_commands: BTreeSet<String>,
    /// Commands granted by the deny-with-retry protocol. Append-only.
    pub session_allowed_commands: BTreeSet<String>,
    pub project_dir: Option<PathBuf>,
    pub allow_project_commands: bool,
    pub workspace_dir: Option<PathBuf>,
    pub imports: ImportRules,
    pub env: EnvRules,
    /// Mapping of command name to the flags it may be invoked with.
    pub external: BTreeMap<String, Vec<String>>,
    pub tasks: BTreeMap<String, TaskConfig>,
    /// Default per-execution hard ceiling.
    pub timeout_ms: u64,
}

impl EffectivePolicy {
    /// A policy that permits nothing. Starting point for tests and for the
    /// store's merge.
    pub fn empty() -> Self {
        Self {
            preset: Preset::Strict,
            permissions: Permissions::default(),
            allowed_commands: BTreeSet::new(),
            session_allowed_commands: BTreeSet::new(),
            project_dir: None,
            allow_project_commands: false,
            workspace_dir: None,
            imports: ImportRules::default(),
            env: EnvRules::default(),
            external: BTreeMap::new(),
            tasks: BTreeMap::new(),
            timeout_ms: crate::flags::SAFESH_DEFAULT_TIMEOUT_MS.as_millis() as u64,
        }
    }

    /// `allowed_commands ∪ session_allowed_commands` membership test.
    pub fn is_command_listed(&self, command_ref: &str) -> bool {
        self.allowed_commands.contains(command_ref)
            || self.session_allowed_commands.contains(command_ref)
    }

    /// The union handed to the sandbox runtime as its `--allow-run` list.
    pub fn run_allow_list(&self) -> Vec<String> {
        self.allowed_commands
            .iter()
            .chain(self.session_allowed_commands.iter())
            .cloned()
            .collect()
    }

    pub fn check_import(&self, module: &str) -> ImportDecision {
        self.imports.check(module)
    }
}

//! Serde mirror types for the declarative config file.
//!
//! Every list-valued field is an `Option<Vec<_>>`: a layer that omits a field
//! inherits it, while a layer that sets it (even to `[]`) replaces the
//! inherited value. Collapsing the two would make it impossible for a project
//! config to revoke an inherited permission.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// Named baseline policies. A preset is merged in as a layer immediately
/// after the built-in defaults; it is not consulted again at runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Preset {
    Strict,
    #[default]
    Standard,
    Permissive,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionsToml {
    /// Allowed read roots. Path templates may use `~`, `${CWD}`, `${HOME}`.
    pub read: Option<Vec<String>>,
    /// Allowed write roots. Independent of `read`.
    pub write: Option<Vec<String>>,
    /// Allowed network targets, `host[:port]`.
    pub net: Option<Vec<String>>,
    /// Command references permitted globally.
    pub run: Option<Vec<String>>,
    /// Environment variable names visible to the child.
    pub env: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportsToml {
    pub trusted: Option<Vec<String>>,
    pub allowed: Option<Vec<String>>,
    pub blocked: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvPolicyToml {
    /// Glob patterns for variables forwarded from the parent environment.
    pub allow: Option<Vec<String>>,
    /// Glob patterns masked even when matched by `allow`.
    pub mask: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub cmd: String,
}

/// One config layer as authored on disk (or supplied by the host handshake).
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ConfigToml {
    pub preset: Option<Preset>,

    pub permissions: Option<PermissionsToml>,

    /// Mapping of command name to the flags it may be invoked with.
    pub external: Option<BTreeMap<String, Vec<String>>>,

    pub env: Option<EnvPolicyToml>,

    pub imports: Option<ImportsToml>,

    pub tasks: Option<BTreeMap<String, TaskConfig>>,

    /// Per-execution hard ceiling in milliseconds.
    pub timeout: Option<u64>,

    /// Root under which project-local binaries live. Usually implied by the
    /// location of the project config file rather than written out.
    pub project_dir: Option<String>,

    /// When true, any executable under `project_dir` runs without being
    /// listed in `permissions.run`.
    pub allow_project_commands: Option<bool>,

    /// A broader read/write root than `project_dir`.
    pub workspace_dir: Option<String>,
}

impl ConfigToml {
    /// Overlay `layer` onto `self`. Scalars: later wins. Lists: an explicit
    /// value replaces, an omitted one inherits.
    pub fn merge_from(&mut self, layer: ConfigToml) {
        if layer.preset.is_some() {
            self.preset = layer.preset;
        }
        if let Some(perms) = layer.permissions {
            let dst = self.permissions.get_or_insert_with(Default::default);
            merge_list(&mut dst.read, perms.read);
            merge_list(&mut dst.write, perms.write);
            merge_list(&mut dst.net, perms.net);
            merge_list(&mut dst.run, perms.run);
            merge_list(&mut dst.env, perms.env);
        }
        if let Some(external) = layer.external {
            self.external = Some(external);
        }
        if let Some(env) = layer.env {
            let dst = self.env.get_or_insert_with(Default::default);
            merge_list(&mut dst.allow, env.allow);
            merge_list(&mut dst.mask, env.mask);
        }
        if let Some(imports) = layer.imports {
            let dst = self.imports.get_or_insert_with(Default::default);
            merge_list(&mut dst.trusted, imports.trusted);
            merge_list(&mut dst.allowed, imports.allowed);
            merge_list(&mut dst.blocked, imports.blocked);
        }
        if let Some(tasks) = layer.tasks {
            let dst = self.tasks.get_or_insert_with(Default::default);
            dst.extend(tasks);
        }
        if layer.timeout.is_some() {
            self.timeout = layer.timeout;
        }
        if layer.project_dir.is_some() {
            self.project_dir = layer.project_dir;
        }
        if layer.allow_project_commands.is_some() {
            self.allow_project_commands = layer.allow_project_commands;
        }
        if layer.workspace_dir.is_some() {
            self.workspace_dir = layer.workspace_dir;
        }
    }
}

fn merge_list(dst: &mut Option<Vec<String>>, src: Option<Vec<String>>) {
    if src.is_some() {
        *dst = src;
    }
}

//! Layered policy loading and composition.
//!
//! Merge order (earlier overridden by later): built-in defaults, the preset
//! baseline selected by the topmost layer, the global user config
//! (`$SAFESH_HOME/config.toml`), the project config (`<project>/safesh.toml`),
//! and explicit session overrides from the host handshake. The result is
//! reduced to a frozen [`EffectivePolicy`] with every root canonicalized.

use std::collections::BTreeSet;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use tempfile::NamedTempFile;
use toml_edit::DocumentMut;

use crate::config_types::ConfigToml;
use crate::config_types::EnvPolicyToml;
use crate::config_types::PermissionsToml;
use crate::config_types::Preset;
use crate::error::Result;
use crate::error::SafeshErr;
use crate::flags::SAFESH_DEFAULT_TIMEOUT_MS;
use crate::flags::SAFESH_HOME;
use crate::path_resolver;
use crate::policy::EffectivePolicy;
use crate::policy::EnvRules;
use crate::policy::ImportRules;
use crate::policy::Permissions;

const GLOBAL_CONFIG_FILE: &str = "config.toml";
const PROJECT_CONFIG_FILE: &str = "safesh.toml";

/// The config layers a session is assembled from. `global` and `project` are
/// usually read from disk by [`PolicyStore::load`]; `session` comes from the
/// host handshake.
#[derive(Debug, Clone, Default)]
pub struct ConfigLayers {
    pub global: Option<ConfigToml>,
    pub project: Option<ConfigToml>,
    /// Directory the project config was found in; becomes the default
    /// `project_dir` when no layer sets one explicitly.
    pub project_dir: Option<PathBuf>,
    pub session: Option<ConfigToml>,
}

pub struct PolicyStore;

impl PolicyStore {
    /// Read the global and project config files and reduce them, together
    /// with the session overrides, to an [`EffectivePolicy`].
    pub fn load(
        cwd: &Path,
        project_dir: Option<&Path>,
        session: Option<ConfigToml>,
    ) -> Result<EffectivePolicy> {
        let global = read_config_file(&find_safesh_home()?.join(GLOBAL_CONFIG_FILE))?;
        let project = match project_dir {
            Some(dir) => read_config_file(&dir.join(PROJECT_CONFIG_FILE))?,
            None => None,
        };
        Self::from_layers(
            ConfigLayers {
                global,
                project,
                project_dir: project_dir.map(Path::to_path_buf),
                session,
            },
            cwd,
        )
    }

    /// Merge pre-parsed layers. Exposed separately so hosts and tests can
    /// supply layers without touching the real filesystem locations.
    pub fn from_layers(layers: ConfigLayers, cwd: &Path) -> Result<EffectivePolicy> {
        let ConfigLayers {
            global,
            project,
            project_dir,
            session,
        } = layers;

        // The preset is taken from the topmost layer that names one.
        let preset = [&session, &project, &global]
            .into_iter()
            .find_map(|layer| layer.as_ref().and_then(|cfg| cfg.preset))
            .unwrap_or_default();

        let mut merged = builtin_defaults();
        merged.merge_from(preset_baseline(preset));
        if let Some(layer) = global {
            merged.merge_from(layer);
        }
        if let Some(layer) = project {
            merged.merge_from(layer);
        }
        if let Some(layer) = session {
            merged.merge_from(layer);
        }

        build_effective_policy(merged, preset, project_dir, cwd)
    }

    /// Return a copy of `policy` with `commands` appended to the
    /// session-allowed set. Every other field is untouched; this is the only
    /// widening operation the store offers after session start.
    pub fn with_session_allow(policy: &EffectivePolicy, commands: &[String]) -> EffectivePolicy {
        let mut widened = policy.clone();
        widened
            .session_allowed_commands
            .extend(commands.iter().cloned());
        widened
    }

    /// Persist `commands` into `permissions.run` of the project config file,
    /// creating the file if needed. Used by the deny-with-retry protocol's
    /// "always allow" choice. Written atomically via rename-into-place.
    pub fn append_project_allowed_commands(
        project_dir: &Path,
        commands: &[String],
    ) -> Result<()> {
        let config_path = project_dir.join(PROJECT_CONFIG_FILE);
        let mut doc = match std::fs::read_to_string(&config_path) {
            Ok(contents) => contents.parse::<DocumentMut>().map_err(|err| {
                SafeshErr::InvalidConfig(format!("{}: {err}", config_path.display()))
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => DocumentMut::new(),
            Err(err) => return Err(err.into()),
        };

        {
            let root = doc.as_table_mut();
            let needs_table = !root.contains_key("permissions")
                || root
                    .get("permissions")
                    .and_then(|item| item.as_table())
                    .is_none();
            if needs_table {
                root.insert("permissions", toml_edit::table());
            }
        }
        let Some(permissions) = doc["permissions"].as_table_mut() else {
            return Err(SafeshErr::InvalidConfig(
                "permissions table missing after initialization".to_string(),
            ));
        };
        if permissions.get("run").and_then(|item| item.as_array()).is_none() {
            permissions.insert("run", toml_edit::value(toml_edit::Array::new()));
        }
        let Some(run) = permissions
            .get_mut("run")
            .and_then(|item| item.as_array_mut())
        else {
            return Err(SafeshErr::InvalidConfig(
                "permissions.run is not an array".to_string(),
            ));
        };
        for command in commands {
            let already = run
                .iter()
                .any(|entry| entry.as_str() == Some(command.as_str()));
            if !already {
                run.push(command.as_str());
            }
        }

        std::fs::create_dir_all(project_dir)?;
        let tmp_file = NamedTempFile::new_in(project_dir)?;
        std::fs::write(tmp_file.path(), doc.to_string())?;
        tmp_file
            .persist(&config_path)
            .map_err(|err| SafeshErr::Io(err.error))?;
        Ok(())
    }
}

/// Resolve the directory that stores global safesh state (`~/.safesh`, or
/// the value of `$SAFESH_HOME`).
pub fn find_safesh_home() -> Result<PathBuf> {
    if let Some(home) = &*SAFESH_HOME
        && !home.is_empty()
    {
        return Ok(PathBuf::from(*home));
    }
    dirs::home_dir()
        .map(|home| home.join(".safesh"))
        .ok_or_else(|| SafeshErr::InvalidConfig("could not locate home directory".to_string()))
}

fn read_config_file(path: &Path) -> Result<Option<ConfigToml>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str::<ConfigToml>(&contents) {
            Ok(cfg) => Ok(Some(cfg)),
            Err(err) => {
                tracing::error!("failed to parse {}: {err}", path.display());
                Err(SafeshErr::InvalidConfig(format!(
                    "{}: {err}",
                    path.display()
                )))
            }
        },
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            tracing::debug!("{} not found, skipping layer", path.display());
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

fn builtin_defaults() -> ConfigToml {
    ConfigToml {
        env: Some(EnvPolicyToml {
            allow: Some(vec![]),
            mask: Some(vec![
                "*KEY*".to_string(),
                "*SECRET*".to_string(),
                "*TOKEN*".to_string(),
            ]),
        }),
        ..Default::default()
    }
}

fn preset_baseline(preset: Preset) -> ConfigToml {
    let string_vec = |items: &[&str]| Some(items.iter().map(|s| s.to_string()).collect());
    match preset {
        Preset::Strict => ConfigToml {
            permissions: Some(PermissionsToml {
                read: string_vec(&["${CWD}"]),
                write: Some(vec![]),
                net: Some(vec![]),
                run: Some(vec![]),
                env: string_vec(&["HOME", "PATH"]),
            }),
            env: Some(EnvPolicyToml {
                allow: string_vec(&["HOME", "PATH"]),
                mask: None,
            }),
            ..Default::default()
        },
        Preset::Standard => ConfigToml {
            permissions: Some(PermissionsToml {
                read: string_vec(&["${CWD}", "${HOME}"]),
                write: string_vec(&["${CWD}", "/tmp"]),
                net: Some(vec![]),
                run: string_vec(&[
                    "cat", "echo", "grep", "head", "ls", "pwd", "tail", "wc", "which",
                ]),
                env: string_vec(&[
                    "HOME", "LANG", "LC_ALL", "PATH", "PWD", "SHELL", "TERM", "TMPDIR", "USER",
                ]),
            }),
            env: Some(EnvPolicyToml {
                allow: string_vec(&[
                    "HOME", "LANG", "LC_ALL", "PATH", "PWD", "SHELL", "TERM", "TMPDIR", "USER",
                ]),
                mask: None,
            }),
            ..Default::default()
        },
        Preset::Permissive => ConfigToml {
            permissions: Some(PermissionsToml {
                read: string_vec(&["/"]),
                write: string_vec(&["${CWD}", "/tmp"]),
                net: string_vec(&["*"]),
                run: string_vec(&[
                    "cargo", "cat", "echo", "find", "git", "grep", "head", "ls", "make", "pwd",
                    "sed", "tail", "wc", "which",
                ]),
                env: string_vec(&["*"]),
            }),
            env: Some(EnvPolicyToml {
                allow: string_vec(&["*"]),
                mask: None,
            }),
            ..Default::default()
        },
    }
}

fn build_effective_policy(
    merged: ConfigToml,
    preset: Preset,
    project_dir_hint: Option<PathBuf>,
    cwd: &Path,
) -> Result<EffectivePolicy> {
    let home = dirs::home_dir();
    let home = home.as_deref();

    let perms = merged.permissions.unwrap_or_default();
    let mut read = canonicalize_roots(perms.read.unwrap_or_default(), cwd, home)?;
    let mut write = canonicalize_roots(perms.write.unwrap_or_default(), cwd, home)?;

    let project_dir = match merged.project_dir {
        Some(template) => Some(canonicalize_root(&template, cwd, home)?),
        None => match project_dir_hint {
            Some(dir) => Some(canonicalize_root(&dir.display().to_string(), cwd, home)?),
            None => None,
        },
    };
    let workspace_dir = match merged.workspace_dir {
        Some(template) => {
            let dir = canonicalize_root(&template, cwd, home)?;
            // The workspace is a broader read/write root.
            read.push(dir.clone());
            write.push(dir.clone());
            Some(dir)
        }
        None => None,
    };
    read.sort();
    read.dedup();
    write.sort();
    write.dedup();

    let imports = merged.imports.unwrap_or_default();
    let env = merged.env.unwrap_or_default();

    Ok(EffectivePolicy {
        preset,
        permissions: Permissions {
            read,
            write,
            net: perms.net.unwrap_or_default(),
            env: perms.env.unwrap_or_default(),
        },
        allowed_commands: perms.run.unwrap_or_default().into_iter().collect(),
        session_allowed_commands: BTreeSet::new(),
        project_dir,
        allow_project_commands: merged.allow_project_commands.unwrap_or(false),
        workspace_dir,
        imports: ImportRules {
            trusted: imports.trusted.unwrap_or_default(),
            allowed: imports.allowed,
            blocked: imports.blocked.unwrap_or_default(),
        },
        env: EnvRules {
            allow: env.allow.unwrap_or_default(),
            mask: env.mask.unwrap_or_default(),
        },
        external: merged.external.unwrap_or_default(),
        tasks: merged.tasks.unwrap_or_default(),
        timeout_ms: merged
            .timeout
            .unwrap_or(SAFESH_DEFAULT_TIMEOUT_MS.as_millis() as u64),
    })
}

fn canonicalize_roots(
    templates: Vec<String>,
    cwd: &Path,
    home: Option<&Path>,
) -> Result<Vec<PathBuf>> {
    templates
        .into_iter()
        .map(|template| canonicalize_root(&template, cwd, home))
        .collect()
}

/// Expand and canonicalize one declared root. An explicitly listed root that
/// does not exist is a config error, except under `/tmp` where the host is
/// permitted to create it at session open.
fn canonicalize_root(template: &str, cwd: &Path, home: Option<&Path>) -> Result<PathBuf> {
    let expanded = path_resolver::resolve(template, cwd, home)?;
    let normalized = path_resolver::normalize_lexically(&expanded);
    match std::fs::canonicalize(&normalized) {
        Ok(canonical) => Ok(canonical),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            if normalized.starts_with("/tmp") {
                std::fs::create_dir_all(&normalized)?;
                Ok(std::fs::canonicalize(&normalized)?)
            } else {
                Err(SafeshErr::InvalidConfig(format!(
                    "permission root does not exist: {}",
                    normalized.display()
                )))
            }
        }
        Err(err) => Err(err.into()),
    }
}

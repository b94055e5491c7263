//! The in-child half of the runtime: what sandboxed script code calls to
//! run external commands.
//!
//! [`init_cmds`] performs the command-policy check for a whole batch up
//! front and hands back capability tokens; holding a [`CommandFn`] is proof
//! the command was authorized in this session. When anything in the batch is
//! blocked, the pending-command record is persisted, the `INIT_ERROR` marker
//! and the BLOCKED prompt go out on stderr, and the caller is expected to
//! exit non-zero so the supervisor can start the deny-with-retry handshake.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use safesh_protocol::CmdErrorMarker;
use safesh_protocol::DenyRetryRequest;
use safesh_protocol::InitErrorMarker;
use safesh_protocol::JobMarker;
use safesh_protocol::JobMarkerKind;
use safesh_protocol::PendingCommand;
use safesh_protocol::CMD_ERROR_MARKER_PREFIX;
use safesh_protocol::INIT_ERROR_MARKER_PREFIX;
use safesh_protocol::JOB_MARKER_PREFIX;

use crate::command::Command;
use crate::command::CommandOptions;
use crate::command::CommandResult;
use crate::command_policy;
use crate::command_policy::CommandDecision;
use crate::command_policy::DenyReason;
use crate::error::Result;
use crate::error::SafeshErr;
use crate::executor;
use crate::executor::PreambleConfig;
use crate::fs_dispatcher::SandboxContext;
use crate::policy::EffectivePolicy;
use crate::retry;

/// Identity and policy material the executor injected into this process.
#[derive(Debug, Clone)]
pub struct ChildContext {
    pub script_id: String,
    pub shell_id: String,
    pub script_hash: String,
    pub cwd: PathBuf,
    policy: Arc<EffectivePolicy>,
}

impl ChildContext {
    /// Reconstruct from the `SAFESH_*` environment. Fails when this process
    /// was not spawned by a safesh executor.
    pub fn from_env() -> Result<Self> {
        let script_id = require_env(executor::SCRIPT_ID_ENV_VAR)?;
        let shell_id = require_env(executor::SHELL_ID_ENV_VAR)?;
        let script_hash = require_env(executor::SCRIPT_HASH_ENV_VAR)?;
        let preamble: PreambleConfig =
            serde_json::from_str(&require_env(executor::CONFIG_ENV_VAR)?)?;
        Ok(Self::from_parts(script_id, shell_id, script_hash, preamble))
    }

    pub fn from_parts(
        script_id: String,
        shell_id: String,
        script_hash: String,
        preamble: PreambleConfig,
    ) -> Self {
        let mut policy = EffectivePolicy::empty();
        policy.allowed_commands = preamble.allowed_commands.into_iter().collect();
        policy.session_allowed_commands =
            preamble.session_allowed_commands.into_iter().collect();
        policy.project_dir = preamble.project_dir;
        policy.allow_project_commands = preamble.allow_project_commands;
        // Env filtering already happened when this process was spawned;
        // forward the whole visible environment to grandchildren.
        policy.env.allow = vec!["*".to_string()];
        policy.env.mask = Vec::new();
        Self {
            script_id,
            shell_id,
            script_hash,
            cwd: preamble.cwd,
            policy: Arc::new(policy),
        }
    }

    pub fn sandbox_context(&self) -> SandboxContext {
        SandboxContext::new(Arc::clone(&self.policy), self.cwd.clone())
    }
}

/// Check every command in the batch; all must pass before any token is
/// returned.
///
/// On failure: pending record written, `INIT_ERROR` marker and BLOCKED
/// prompt emitted, and `CommandNotAllowed` (or `CommandNotFound` when
/// nothing was blocked, only missing) returned.
pub fn init_cmds(ctx: &ChildContext, commands: &[&str]) -> Result<Vec<CommandFn>> {
    let mut tokens = Vec::new();
    let mut not_allowed: Vec<String> = Vec::new();
    let mut not_found: Vec<String> = Vec::new();

    for &command in commands {
        match command_policy::check(command, &ctx.policy, &ctx.cwd) {
            CommandDecision::AllowedName(name) => tokens.push(CommandFn {
                ctx: ctx.clone(),
                command: command.to_string(),
                spawn_target: name,
            }),
            CommandDecision::AllowedPath(path) => tokens.push(CommandFn {
                ctx: ctx.clone(),
                command: command.to_string(),
                spawn_target: path.display().to_string(),
            }),
            CommandDecision::Denied(DenyReason::NotAllowed(_)) => {
                not_allowed.push(command.to_string());
            }
            CommandDecision::Denied(DenyReason::NotFound(_)) => {
                not_found.push(command.to_string());
            }
        }
    }

    if not_allowed.is_empty() && not_found.is_empty() {
        return Ok(tokens);
    }

    emit_marker(
        INIT_ERROR_MARKER_PREFIX,
        &InitErrorMarker::new(not_allowed.clone(), not_found.clone()),
    );

    if !not_allowed.is_empty() {
        let pending = PendingCommand {
            id: ctx.script_id.clone(),
            script_hash: ctx.script_hash.clone(),
            commands: not_allowed.clone(),
            cwd: ctx.cwd.display().to_string(),
            created_at: Utc::now().timestamp_millis(),
        };
        if let Err(err) = retry::write_pending(&pending) {
            tracing::error!("failed to persist pending-command record: {err}");
        }
        let request = DenyRetryRequest {
            script_id: ctx.script_id.clone(),
            commands: not_allowed.clone(),
        };
        emit_raw(&request.render_prompt());
        return Err(SafeshErr::CommandNotAllowed(not_allowed.join(", ")));
    }
    Err(SafeshErr::CommandNotFound(not_found.join(", ")))
}

/// Capability token for one authorized command. Calling it spawns the
/// command with job markers around the run.
#[derive(Debug, Clone)]
pub struct CommandFn {
    ctx: ChildContext,
    command: String,
    spawn_target: String,
}

impl CommandFn {
    pub fn command(&self) -> &str {
        &self.command
    }

    pub async fn call(&self, args: &[&str]) -> Result<CommandResult> {
        self.call_with(args, CommandOptions::default()).await
    }

    pub async fn call_with(
        &self,
        args: &[&str],
        opts: CommandOptions,
    ) -> Result<CommandResult> {
        let job_id = new_job_id(&self.ctx.shell_id);
        let args_owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let started_at = Utc::now().timestamp_millis();
        emit_marker(
            JOB_MARKER_PREFIX,
            &JobMarker {
                kind: JobMarkerKind::Start,
                id: job_id.clone(),
                script_id: self.ctx.script_id.clone(),
                shell_id: self.ctx.shell_id.clone(),
                command: self.command.clone(),
                args: args_owned.clone(),
                pid: Some(std::process::id()),
                started_at: Some(started_at),
                completed_at: None,
                duration: None,
                exit_code: None,
            },
        );

        let sandbox = self.ctx.sandbox_context();
        let result = Command::new(self.spawn_target.as_str())
            .args(args_owned.clone())
            .opts(opts)
            .exec(&sandbox)
            .await;

        match &result {
            Ok(output) => {
                let completed_at = Utc::now().timestamp_millis();
                emit_marker(
                    JOB_MARKER_PREFIX,
                    &JobMarker {
                        kind: JobMarkerKind::End,
                        id: job_id,
                        script_id: self.ctx.script_id.clone(),
                        shell_id: self.ctx.shell_id.clone(),
                        command: self.command.clone(),
                        args: args_owned,
                        pid: Some(std::process::id()),
                        started_at: None,
                        completed_at: Some(completed_at),
                        duration: Some(completed_at.saturating_sub(started_at) as u64),
                        exit_code: Some(output.exit_code),
                    },
                );
            }
            Err(SafeshErr::CommandNotAllowed(command)) => {
                // Denied at spawn despite the init check (e.g. the target
                // changed underneath us): still report it on the wire.
                emit_marker(CMD_ERROR_MARKER_PREFIX, &CmdErrorMarker::new(command.clone()));
            }
            Err(_) => {}
        }
        result
    }
}

/// `job-<shellPrefix>-<rand_hex>`.
pub fn new_job_id(shell_id: &str) -> String {
    let suffix: u32 = rand::rng().random();
    format!(
        "job-{}-{:06x}",
        executor::shell_prefix(shell_id),
        suffix & 0xff_ffff
    )
}

fn require_env(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| SafeshErr::Execution {
        script_id: String::new(),
        message: format!("missing required environment variable {name}"),
    })
}

fn emit_marker<T: serde::Serialize>(prefix: &str, payload: &T) {
    match serde_json::to_string(payload) {
        Ok(json) => emit_raw(&format!("{prefix}{json}\n")),
        Err(err) => tracing::error!("failed to serialize marker: {err}"),
    }
}

/// Markers and the BLOCKED prompt bypass the tracing stack: they are wire
/// protocol, not diagnostics.
fn emit_raw(text: &str) {
    let mut stderr = std::io::stderr();
    let _ = stderr.write_all(text.as_bytes());
    let _ = stderr.flush();
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn child_ctx(commands: &[&str], cwd: &std::path::Path) -> ChildContext {
        ChildContext::from_parts(
            "script-ab12cd34-1".to_string(),
            "ab12cd34ef567890".to_string(),
            executor::hash_code("code"),
            PreambleConfig {
                project_dir: None,
                allow_project_commands: false,
                allowed_commands: commands.iter().map(|c| c.to_string()).collect(),
                session_allowed_commands: Vec::new(),
                cwd: cwd.to_path_buf(),
            },
        )
    }

    #[test]
    fn job_id_format() {
        let id = new_job_id("ab12cd34ef567890");
        let mut parts = id.splitn(3, '-');
        assert_eq!(parts.next(), Some("job"));
        assert_eq!(parts.next(), Some("ab12cd34"));
        let hex = parts.next().unwrap();
        assert_eq!(hex.len(), 6);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn init_cmds_returns_tokens_for_allowed_batch() {
        let cwd = TempDir::new().unwrap();
        let ctx = child_ctx(&["echo", "cat"], cwd.path());
        let tokens = init_cmds(&ctx, &["echo", "cat"]).unwrap();
        assert_eq!(tokens.len(), 2);

        let result = tokens[0].call(&["token-run"]).await.unwrap();
        assert!(result.success);
        assert_eq!(result.stdout, "token-run\n");
    }

    #[test]
    fn init_cmds_blocks_the_whole_batch_and_persists_pending() {
        let cwd = TempDir::new().unwrap();
        let ctx = child_ctx(&["echo"], cwd.path());
        let err = init_cmds(&ctx, &["echo", "curl"]).unwrap_err();
        assert!(matches!(err, SafeshErr::CommandNotAllowed(c) if c == "curl"));

        let pending = retry::load_pending(&ctx.script_id).unwrap().unwrap();
        assert_eq!(pending.commands, vec!["curl".to_string()]);
        assert_eq!(pending.script_hash, ctx.script_hash);
        retry::delete_pending(&ctx.script_id).unwrap();
    }

    #[test]
    fn init_cmds_distinguishes_not_found() {
        let cwd = TempDir::new().unwrap();
        let ctx = child_ctx(&[], cwd.path());
        // A relative path that exists nowhere: NotFound, not NotAllowed.
        let err = init_cmds(&ctx, &["./missing/tool"]).unwrap_err();
        assert!(matches!(err, SafeshErr::CommandNotFound(c) if c == "./missing/tool"));
    }
}

//! Typed command builder: the only way user-facing code reaches the
//! process-spawning machinery in [`crate::exec`].
//!
//! Every `exec`/`stream` call takes a [`SandboxContext`] and runs the
//! command-policy check before anything is spawned, so an unlisted command
//! is reported as a precise policy denial rather than whatever the OS would
//! have said.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::unbounded_channel;

use crate::command_policy;
use crate::command_policy::CommandDecision;
use crate::command_policy::DenyReason;
use crate::error::Result;
use crate::error::SafeshErr;
use crate::exec;
use crate::exec::RawOutput;
use crate::exec::StreamChunk;
use crate::exec_env;
use crate::fs_dispatcher::SandboxContext;

#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    pub cwd: Option<PathBuf>,
    /// Explicit environment overrides, applied on top of the policy-derived
    /// environment (or alone under `clear_env`).
    pub env: HashMap<String, String>,
    /// Drop the inherited (policy-filtered) environment entirely.
    pub clear_env: bool,
    /// Combine stderr into stdout, preserving arrival order.
    pub merge_streams: bool,
    pub timeout_ms: Option<u64>,
}

/// Result of a completed command.
///
/// Separate mode fills `stdout`/`stderr` and leaves `output` empty; merged
/// mode fills `output` and leaves the other two empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub output: String,
    pub exit_code: i32,
    pub success: bool,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct Command {
    program: String,
    args: Vec<String>,
    opts: CommandOptions,
    stdin: Option<Vec<u8>>,
    upstream: Option<Box<Command>>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            opts: CommandOptions::default(),
            stdin: None,
            upstream: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn opts(mut self, opts: CommandOptions) -> Self {
        self.opts = opts;
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.opts.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.opts.env.insert(name.into(), value.into());
        self
    }

    pub fn clear_env(mut self) -> Self {
        self.opts.clear_env = true;
        self
    }

    pub fn merge_streams(mut self, merge: bool) -> Self {
        self.opts.merge_streams = merge;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.opts.timeout_ms = Some(timeout_ms);
        self
    }

    /// Preset stdin text. There is no sentinel `cat` stage; the first
    /// command of a pipeline simply starts with its input in hand.
    pub fn stdin_str(mut self, text: impl Into<String>) -> Self {
        self.stdin = Some(text.into().into_bytes());
        self
    }

    pub fn stdin_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    /// Feed this command's stdout into `next`. Buffered contract: the
    /// upstream runs to completion, and a non-zero upstream exit fails the
    /// pipeline before the downstream is ever spawned.
    pub fn pipe(self, next: Command) -> Command {
        let mut next = next;
        next.upstream = Some(Box::new(self));
        next
    }

    pub async fn exec(self, ctx: &SandboxContext) -> Result<CommandResult> {
        let merge = self.opts.merge_streams;
        let started = Instant::now();
        let raw = self.exec_raw(ctx).await?;
        let duration = started.elapsed();
        Ok(finish(raw, merge, duration))
    }

    /// Lazy chunk sequence: stdout/stderr in arrival order, then one `Exit`.
    pub async fn stream(self, ctx: &SandboxContext) -> Result<UnboundedReceiver<StreamChunk>> {
        let merge = self.opts.merge_streams;
        let stdin = match self.upstream {
            Some(upstream) => {
                let label = upstream.program.clone();
                let up_raw = Box::pin(upstream.exec_raw(ctx)).await?;
                if up_raw.exit_code != 0 {
                    let (tx, rx) = unbounded_channel();
                    let message = pipeline_failure(&label, up_raw.exit_code);
                    let _ = tx.send(if merge {
                        StreamChunk::Stdout(message.into_bytes())
                    } else {
                        StreamChunk::Stderr(message.into_bytes())
                    });
                    let _ = tx.send(StreamChunk::Exit {
                        code: up_raw.exit_code,
                    });
                    return Ok(rx);
                }
                Some(up_raw.stdout)
            }
            None => self.stdin,
        };

        let single = Command {
            program: self.program,
            args: self.args,
            opts: self.opts,
            stdin,
            upstream: None,
        };
        let (child, stdin, timeout) = single.prepare(ctx)?;
        Ok(exec::drive_child_streaming(child, stdin, timeout, merge))
    }

    async fn exec_raw(self, ctx: &SandboxContext) -> Result<RawOutput> {
        let stdin = match self.upstream {
            Some(upstream) => {
                let label = upstream.program.clone();
                let up_raw = Box::pin(upstream.exec_raw(ctx)).await?;
                if up_raw.exit_code != 0 {
                    let mut raw = RawOutput::default();
                    let message = pipeline_failure(&label, up_raw.exit_code);
                    raw.stderr = message.clone().into_bytes();
                    raw.merged = message.into_bytes();
                    raw.exit_code = up_raw.exit_code;
                    return Ok(raw);
                }
                Some(up_raw.stdout)
            }
            None => self.stdin,
        };

        let merge = self.opts.merge_streams;
        let single = Command {
            program: self.program,
            args: self.args,
            opts: self.opts,
            stdin,
            upstream: None,
        };
        let (child, stdin, timeout) = single.prepare(ctx)?;

        let (tx, mut rx) = unbounded_channel();
        exec::drive_child(child, stdin, timeout, merge, tx).await?;
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        Ok(exec::collect_raw(chunks))
    }

    /// Policy check + spawn. Consumes the builder; the upstream must already
    /// have been folded into `stdin`.
    fn prepare(
        self,
        ctx: &SandboxContext,
    ) -> Result<(tokio::process::Child, Option<Vec<u8>>, Duration)> {
        let cwd = self.opts.cwd.clone().unwrap_or_else(|| ctx.cwd.clone());

        let spawn_target = match command_policy::check(&self.program, &ctx.policy, &cwd) {
            CommandDecision::AllowedName(name) => name,
            CommandDecision::AllowedPath(path) => path.display().to_string(),
            CommandDecision::Denied(DenyReason::NotAllowed(evaluated)) => {
                return Err(SafeshErr::CommandNotAllowed(evaluated));
            }
            CommandDecision::Denied(DenyReason::NotFound(reference)) => {
                return Err(SafeshErr::CommandNotFound(reference));
            }
        };
        check_external_flags(&self.program, &self.args, ctx)?;

        let env = if self.opts.clear_env {
            self.opts.env.clone()
        } else {
            exec_env::create_env(&ctx.policy.env, &self.opts.env)
        };

        let timeout = Duration::from_millis(
            self.opts.timeout_ms.unwrap_or(ctx.policy.timeout_ms),
        );

        let child = exec::spawn_child(&spawn_target, &self.args, &cwd, &env, self.stdin.is_some())
            .map_err(|err| classify_spawn_error(err, &self.program))?;
        Ok((child, self.stdin, timeout))
    }
}

/// Per-command flag allow-list from the `external` config table. A command
/// with no entry is unrestricted; a command with one may only be invoked
/// with listed flags.
fn check_external_flags(program: &str, args: &[String], ctx: &SandboxContext) -> Result<()> {
    let base = program.rsplit('/').next().unwrap_or(program);
    let Some(allowed_flags) = ctx.policy.external.get(base) else {
        return Ok(());
    };
    for arg in args {
        if arg.starts_with('-') && !allowed_flags.iter().any(|flag| flag == arg) {
            return Err(SafeshErr::CommandNotAllowed(format!(
                "{base} (flag {arg} not permitted)"
            )));
        }
    }
    Ok(())
}

fn classify_spawn_error(err: std::io::Error, program: &str) -> SafeshErr {
    match err.kind() {
        std::io::ErrorKind::NotFound => SafeshErr::CommandNotFound(program.to_string()),
        std::io::ErrorKind::PermissionDenied => SafeshErr::CommandNotAllowed(program.to_string()),
        _ => SafeshErr::Io(err),
    }
}

fn pipeline_failure(upstream: &str, code: i32) -> String {
    format!("pipeline failed: `{upstream}` exited with code {code}\n")
}

fn finish(raw: RawOutput, merged: bool, duration: Duration) -> CommandResult {
    let success = raw.exit_code == 0;
    if merged {
        CommandResult {
            stdout: String::new(),
            stderr: String::new(),
            output: String::from_utf8_lossy(&raw.merged).into_owned(),
            exit_code: raw.exit_code,
            success,
            duration,
        }
    } else {
        CommandResult {
            stdout: String::from_utf8_lossy(&raw.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&raw.stderr).into_owned(),
            output: String::new(),
            exit_code: raw.exit_code,
            success,
            duration,
        }
    }
}

/// Pre-populated builders for commands that show up constantly in scripts.
pub fn git() -> Command {
    Command::new("git")
}

pub fn docker() -> Command {
    Command::new("docker")
}

pub fn tmux() -> Command {
    Command::new("tmux")
}

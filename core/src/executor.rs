//! Accepts a code snippet, runs it in a sandboxed child, and parses the
//! markers the child emits on stderr.
//!
//! The child is the sandbox runtime itself (deno by default) invoked with
//! capability flags derived from the effective policy, the same way the
//! seatbelt path derives a sandbox argv from a policy. Tests substitute a
//! stub runtime, so nothing here assumes a particular binary beyond the
//! flag grammar.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use safesh_protocol::DenyRetryRequest;
use safesh_protocol::Marker;
use safesh_protocol::parse_marker_line;
use serde::Deserialize;
use serde::Serialize;
use sha1::Digest;
use sha1::Sha1;
use tokio::sync::mpsc::unbounded_channel;

use crate::error::Result;
use crate::error::SafeshErr;
use crate::exec;
use crate::exec_env;
use crate::flags::SAFESH_RUNTIME;
use crate::policy::EffectivePolicy;
use crate::session::JobRecord;
use crate::session::Session;

pub const SCRIPT_ID_ENV_VAR: &str = "SAFESH_SCRIPT_ID";
pub const SHELL_ID_ENV_VAR: &str = "SAFESH_SHELL_ID";
pub const SCRIPT_HASH_ENV_VAR: &str = "SAFESH_SCRIPT_HASH";
pub const CONFIG_ENV_VAR: &str = "SAFESH_CONFIG";

/// How the executor invokes the sandbox runtime.
#[derive(Debug, Clone)]
pub struct SandboxRuntime {
    pub program: String,
    pub base_args: Vec<String>,
    pub script_suffix: String,
    /// Emit `--allow-*` capability flags derived from the policy. Stub
    /// runtimes used in tests turn this off.
    pub permission_flags: bool,
}

impl Default for SandboxRuntime {
    fn default() -> Self {
        Self {
            program: SAFESH_RUNTIME.to_string(),
            base_args: vec!["run".to_string(), "--quiet".to_string()],
            script_suffix: ".ts".to_string(),
            permission_flags: true,
        }
    }
}

/// Serialized preamble the in-child command API reads back, so policy
/// checks run in user space before the OS reports a less-informative
/// capability error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreambleConfig {
    pub project_dir: Option<PathBuf>,
    pub allow_project_commands: bool,
    pub allowed_commands: Vec<String>,
    pub session_allowed_commands: Vec<String>,
    pub cwd: PathBuf,
}

impl PreambleConfig {
    pub fn from_policy(policy: &EffectivePolicy, cwd: &Path) -> Self {
        Self {
            project_dir: policy.project_dir.clone(),
            allow_project_commands: policy.allow_project_commands,
            allowed_commands: policy.allowed_commands.iter().cloned().collect(),
            session_allowed_commands: policy.session_allowed_commands.iter().cloned().collect(),
            cwd: cwd.to_path_buf(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub script_id: String,
    pub stdout: String,
    /// Child stderr with marker lines stripped; markers are surfaced
    /// structurally instead.
    pub stderr: String,
    pub exit_code: i32,
    pub jobs: Vec<JobRecord>,
    pub blocked_commands: Vec<String>,
    pub not_found_commands: Vec<String>,
    /// Present when the run was blocked and can be re-driven via the
    /// deny-with-retry protocol.
    pub deny_retry: Option<DenyRetryRequest>,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ScriptRecord {
    pub code: String,
    pub hash: String,
}

pub struct Executor {
    runtime: SandboxRuntime,
    seq: AtomicU64,
    scripts: Mutex<HashMap<String, ScriptRecord>>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(SandboxRuntime::default())
    }
}

impl Executor {
    pub fn new(runtime: SandboxRuntime) -> Self {
        Self {
            runtime,
            seq: AtomicU64::new(1),
            scripts: Mutex::new(HashMap::new()),
        }
    }

    /// Run `code` in a fresh sandboxed child for `session`.
    pub async fn run(&self, session: &Arc<Mutex<Session>>, code: &str) -> Result<RunResult> {
        let (policy, shell_id, cwd, env_overrides) = snapshot(session);
        let script_id = self.next_script_id(&shell_id);
        self.run_inner(
            session,
            code,
            script_id,
            policy,
            shell_id,
            cwd,
            env_overrides,
        )
        .await
    }

    /// Re-run a previously registered script (deny-with-retry), optionally
    /// under a one-shot widened policy.
    pub async fn rerun(
        &self,
        session: &Arc<Mutex<Session>>,
        script_id: &str,
        policy_override: Option<Arc<EffectivePolicy>>,
    ) -> Result<RunResult> {
        let record = self
            .script(script_id)
            .ok_or_else(|| SafeshErr::StalePending(script_id.to_string()))?;
        let (policy, shell_id, cwd, env_overrides) = snapshot(session);
        let policy = policy_override.unwrap_or(policy);
        self.run_inner(
            session,
            &record.code,
            script_id.to_string(),
            policy,
            shell_id,
            cwd,
            env_overrides,
        )
        .await
    }

    /// Look up a registered script, falling back to the materialized copy
    /// on disk so retries survive a supervisor restart.
    pub(crate) fn script(&self, script_id: &str) -> Option<ScriptRecord> {
        if let Some(record) = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(script_id)
        {
            return Some(record.clone());
        }
        let code = std::fs::read_to_string(self.script_path(script_id)).ok()?;
        let hash = hash_code(&code);
        Some(ScriptRecord { code, hash })
    }

    fn script_path(&self, script_id: &str) -> PathBuf {
        std::env::temp_dir()
            .join("safesh")
            .join("scripts")
            .join(format!("{script_id}{}", self.runtime.script_suffix))
    }

    fn next_script_id(&self, shell_id: &str) -> String {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        format!("script-{}-{seq}", shell_prefix(shell_id))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_inner(
        &self,
        session: &Arc<Mutex<Session>>,
        code: &str,
        script_id: String,
        policy: Arc<EffectivePolicy>,
        shell_id: String,
        cwd: PathBuf,
        env_overrides: HashMap<String, String>,
    ) -> Result<RunResult> {
        let script_hash = hash_code(code);
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                script_id.clone(),
                ScriptRecord {
                    code: code.to_string(),
                    hash: script_hash.clone(),
                },
            );

        // Materialize the code under a stable, id-keyed path so a later
        // retry can re-drive it even from a fresh supervisor process.
        let script_path = self.script_path(&script_id);
        if let Some(parent) = script_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&script_path, code)?;

        let args = self.build_runtime_args(&policy, &cwd, &script_path);

        let mut env = exec_env::create_env(&policy.env, &env_overrides);
        env.insert(SCRIPT_ID_ENV_VAR.to_string(), script_id.clone());
        env.insert(SHELL_ID_ENV_VAR.to_string(), shell_id.clone());
        env.insert(SCRIPT_HASH_ENV_VAR.to_string(), script_hash.clone());
        env.insert(
            CONFIG_ENV_VAR.to_string(),
            serde_json::to_string(&PreambleConfig::from_policy(&policy, &cwd))?,
        );
        // The child's own spawns still need a PATH even under a masking
        // policy; forward the parent's if the filter dropped it.
        if !env.contains_key("PATH")
            && let Ok(path) = std::env::var("PATH")
        {
            env.insert("PATH".to_string(), path);
        }

        let child = exec::spawn_child(&self.runtime.program, &args, &cwd, &env, false)
            .map_err(|err| SafeshErr::Execution {
                script_id: script_id.clone(),
                message: format!("failed to spawn sandbox runtime: {err}"),
            })?;

        let (tx, mut rx) = unbounded_channel();
        let timeout = Duration::from_millis(policy.timeout_ms);
        exec::drive_child(child, None, timeout, false, tx).await?;
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        let raw = exec::collect_raw(chunks);

        let parsed = parse_child_stderr(&raw.stderr);
        {
            let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
            for marker in &parsed.job_markers {
                session.apply_job_marker(marker);
            }
        }
        let jobs = session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .jobs_for_script(&script_id);

        let deny_retry = if parsed.blocked.is_empty() {
            None
        } else {
            Some(DenyRetryRequest {
                script_id: script_id.clone(),
                commands: parsed.blocked.clone(),
            })
        };

        Ok(RunResult {
            script_id,
            stdout: String::from_utf8_lossy(&raw.stdout).into_owned(),
            stderr: parsed.stderr,
            exit_code: raw.exit_code,
            jobs,
            blocked_commands: parsed.blocked,
            not_found_commands: parsed.not_found,
            deny_retry,
        })
    }

    /// Derive the runtime argv from the policy: read/write roots, net
    /// targets, env names, and the run allow-list become capability flags.
    fn build_runtime_args(
        &self,
        policy: &EffectivePolicy,
        cwd: &Path,
        script_path: &Path,
    ) -> Vec<String> {
        let mut args = self.runtime.base_args.clone();
        if self.runtime.permission_flags {
            let mut read_roots: Vec<String> = policy
                .permissions
                .read
                .iter()
                .map(|root| root.display().to_string())
                .collect();
            // The runtime must be able to read the materialized script and
            // resolve the cwd regardless of the declared roots.
            read_roots.push(script_path.display().to_string());
            read_roots.push(cwd.display().to_string());
            args.push(format!("--allow-read={}", read_roots.join(",")));

            if !policy.permissions.write.is_empty() {
                let write_roots: Vec<String> = policy
                    .permissions
                    .write
                    .iter()
                    .map(|root| root.display().to_string())
                    .collect();
                args.push(format!("--allow-write={}", write_roots.join(",")));
            }
            if !policy.permissions.net.is_empty() {
                if policy.permissions.net.iter().any(|target| target == "*") {
                    args.push("--allow-net".to_string());
                } else {
                    args.push(format!(
                        "--allow-net={}",
                        policy.permissions.net.join(",")
                    ));
                }
            }
            if !policy.permissions.env.is_empty() {
                if policy.permissions.env.iter().any(|name| name == "*") {
                    args.push("--allow-env".to_string());
                } else {
                    args.push(format!(
                        "--allow-env={}",
                        policy.permissions.env.join(",")
                    ));
                }
            }
            let run_list = policy.run_allow_list();
            if !run_list.is_empty() {
                args.push(format!("--allow-run={}", run_list.join(",")));
            }
        }
        args.push(script_path.display().to_string());
        args
    }
}

pub fn shell_prefix(shell_id: &str) -> &str {
    &shell_id[..shell_id.len().min(8)]
}

pub fn hash_code(code: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(code.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn snapshot(
    session: &Arc<Mutex<Session>>,
) -> (
    Arc<EffectivePolicy>,
    String,
    PathBuf,
    HashMap<String, String>,
) {
    let session = session.lock().unwrap_or_else(PoisonError::into_inner);
    (
        session.policy(),
        session.shell_id().to_string(),
        session.cwd.clone(),
        session.env_overrides.clone(),
    )
}

struct ParsedStderr {
    stderr: String,
    job_markers: Vec<safesh_protocol::JobMarker>,
    blocked: Vec<String>,
    not_found: Vec<String>,
}

/// Walk stderr line by line: marker lines become structured data, the rest
/// is kept verbatim for the caller.
fn parse_child_stderr(stderr: &[u8]) -> ParsedStderr {
    let text = String::from_utf8_lossy(stderr);
    let mut kept = String::new();
    let mut job_markers = Vec::new();
    let mut blocked: Vec<String> = Vec::new();
    let mut not_found: Vec<String> = Vec::new();

    for line in text.lines() {
        match parse_marker_line(line) {
            Some(Marker::Job(marker)) => job_markers.push(marker),
            Some(Marker::CmdError(marker)) => {
                if !blocked.contains(&marker.command) {
                    blocked.push(marker.command);
                }
            }
            Some(Marker::InitError(marker)) => {
                for command in marker.not_allowed {
                    if !blocked.contains(&command) {
                        blocked.push(command);
                    }
                }
                for command in marker.not_found {
                    if !not_found.contains(&command) {
                        not_found.push(command);
                    }
                }
            }
            None => {
                kept.push_str(line);
                kept.push('\n');
            }
        }
    }

    ParsedStderr {
        stderr: kept,
        job_markers,
        blocked,
        not_found,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    fn stub_runtime() -> SandboxRuntime {
        SandboxRuntime {
            program: "bash".to_string(),
            base_args: Vec::new(),
            script_suffix: ".sh".to_string(),
            permission_flags: false,
        }
    }

    fn test_session(commands: &[&str]) -> Arc<Mutex<Session>> {
        let mut policy = EffectivePolicy::empty();
        policy.allowed_commands = commands.iter().map(|c| c.to_string()).collect();
        policy.env.allow = vec!["PATH".to_string(), "SAFESH_*".to_string()];
        policy.timeout_ms = 10_000;
        Arc::new(Mutex::new(Session::new(
            Arc::new(policy),
            std::env::temp_dir(),
        )))
    }

    #[test]
    fn script_ids_are_sequential_per_shell_prefix() {
        let executor = Executor::new(stub_runtime());
        let a = executor.next_script_id("ab12cd34ef567890");
        let b = executor.next_script_id("ab12cd34ef567890");
        assert_eq!(a, "script-ab12cd34-1");
        assert_eq!(b, "script-ab12cd34-2");
    }

    #[test]
    fn hash_is_stable_sha1_hex() {
        assert_eq!(hash_code("abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(hash_code("abc"), hash_code("abc"));
        assert_ne!(hash_code("abc"), hash_code("abd"));
    }

    #[test]
    fn runtime_args_carry_capability_flags() {
        let executor = Executor::default();
        let mut policy = EffectivePolicy::empty();
        policy.permissions.read = vec![PathBuf::from("/proj")];
        policy.permissions.write = vec![PathBuf::from("/proj/out")];
        policy.permissions.net = vec!["api.example.com:443".to_string()];
        policy.permissions.env = vec!["PATH".to_string()];
        policy.allowed_commands.insert("git".to_string());
        policy.session_allowed_commands.insert("curl".to_string());

        let args = executor.build_runtime_args(
            &policy,
            &PathBuf::from("/proj"),
            Path::new("/tmp/safesh-script-x.ts"),
        );
        let joined = args.join(" ");
        assert!(joined.starts_with("run --quiet"));
        assert!(joined.contains("--allow-read=/proj,/tmp/safesh-script-x.ts,/proj"));
        assert!(joined.contains("--allow-write=/proj/out"));
        assert!(joined.contains("--allow-net=api.example.com:443"));
        assert!(joined.contains("--allow-env=PATH"));
        assert!(joined.contains("--allow-run=git,curl"));
        assert_eq!(args.last().unwrap(), "/tmp/safesh-script-x.ts");
    }

    #[test]
    fn wildcard_net_collapses_to_bare_flag() {
        let executor = Executor::default();
        let mut policy = EffectivePolicy::empty();
        policy.permissions.net = vec!["*".to_string()];
        let args = executor.build_runtime_args(
            &policy,
            &PathBuf::from("/p"),
            Path::new("/tmp/s.ts"),
        );
        assert!(args.contains(&"--allow-net".to_string()));
    }

    #[test]
    fn marker_lines_are_stripped_and_parsed() {
        let stderr = format!(
            "regular diagnostics\n\
             {}{{\"type\":\"start\",\"id\":\"job-ab12-0f\",\"scriptId\":\"script-ab12-1\",\"shellId\":\"ab12\",\"command\":\"git\",\"args\":[],\"pid\":7,\"startedAt\":1}}\n\
             more output with {} mid-line\n\
             {}{{\"type\":\"COMMANDS_BLOCKED\",\"notAllowed\":[\"curl\"],\"notFound\":[\"nope\"]}}\n",
            safesh_protocol::JOB_MARKER_PREFIX,
            safesh_protocol::JOB_MARKER_PREFIX,
            safesh_protocol::INIT_ERROR_MARKER_PREFIX,
        );
        let parsed = parse_child_stderr(stderr.as_bytes());
        assert_eq!(parsed.job_markers.len(), 1);
        assert_eq!(parsed.blocked, vec!["curl".to_string()]);
        assert_eq!(parsed.not_found, vec!["nope".to_string()]);
        assert!(parsed.stderr.contains("regular diagnostics"));
        assert!(parsed.stderr.contains("mid-line"), "mid-line prefix is data");
        assert!(!parsed.stderr.contains("\"type\":\"start\""));
    }

    #[tokio::test]
    async fn run_collects_output_jobs_and_blocked_commands() {
        let executor = Executor::new(stub_runtime());
        let session = test_session(&[]);
        let shell_id = session.lock().unwrap().shell_id().to_string();
        let prefix = shell_prefix(&shell_id).to_string();

        let code = format!(
            "echo visible-stdout\n\
             echo plain-stderr >&2\n\
             echo '{job}{{\"type\":\"start\",\"id\":\"job-{p}-aa\",\"scriptId\":\"'$SAFESH_SCRIPT_ID'\",\"shellId\":\"{p}\",\"command\":\"ls\",\"args\":[],\"pid\":1,\"startedAt\":5}}' >&2\n\
             echo '{job}{{\"type\":\"end\",\"id\":\"job-{p}-aa\",\"scriptId\":\"'$SAFESH_SCRIPT_ID'\",\"shellId\":\"{p}\",\"command\":\"ls\",\"args\":[],\"completedAt\":9,\"duration\":4,\"exitCode\":0}}' >&2\n\
             echo '{cmderr}{{\"type\":\"COMMAND_NOT_ALLOWED\",\"command\":\"curl\"}}' >&2\n\
             exit 0\n",
            job = safesh_protocol::JOB_MARKER_PREFIX,
            cmderr = safesh_protocol::CMD_ERROR_MARKER_PREFIX,
            p = prefix,
        );

        let result = executor.run(&session, &code).await.unwrap();
        assert_eq!(result.stdout, "visible-stdout\n");
        assert_eq!(result.stderr, "plain-stderr\n");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.jobs.len(), 1);
        assert_eq!(result.jobs[0].command, "ls");
        assert_eq!(result.blocked_commands, vec!["curl".to_string()]);
        let deny_retry = result.deny_retry.unwrap();
        assert_eq!(deny_retry.commands, vec!["curl".to_string()]);
        assert_eq!(deny_retry.script_id, result.script_id);
    }

    #[tokio::test]
    async fn child_sees_script_identity_env() {
        let executor = Executor::new(stub_runtime());
        let session = test_session(&[]);
        let code = "printf '%s %s' \"$SAFESH_SCRIPT_ID\" \"$SAFESH_SCRIPT_HASH\"";
        let result = executor.run(&session, code).await.unwrap();
        let expected_hash = hash_code(code);
        assert_eq!(
            result.stdout,
            format!("{} {}", result.script_id, expected_hash)
        );
    }

    #[tokio::test]
    async fn rerun_reuses_the_registered_script() {
        let executor = Executor::new(stub_runtime());
        let session = test_session(&[]);
        let result = executor.run(&session, "echo first-run").await.unwrap();

        let rerun = executor
            .rerun(&session, &result.script_id, None)
            .await
            .unwrap();
        assert_eq!(rerun.stdout, "first-run\n");
        assert_eq!(rerun.script_id, result.script_id);

        assert!(matches!(
            executor.rerun(&session, "script-none-99", None).await,
            Err(SafeshErr::StalePending(_))
        ));
    }
}

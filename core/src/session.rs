//! Per-connection mutable state.
//!
//! Every mutation of a session goes through its mutex: the core is
//! single-writer per session, and sessions share nothing with each other.
//! The policy reference is immutable except for the swap performed by
//! [`Session::allow_for_session`], which only ever widens the
//! session-allowed command set.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use safesh_protocol::JobMarker;
use safesh_protocol::JobMarkerKind;
use uuid::Uuid;

use crate::config::PolicyStore;
use crate::error::Result;
use crate::error::SafeshErr;
use crate::error::TIMEOUT_EXIT_CODE;
use crate::fs_dispatcher::SandboxContext;
use crate::policy::EffectivePolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Finished,
    Killed,
    TimedOut,
}

/// One external-command invocation, observed through the child's stderr
/// markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub id: String,
    pub script_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub pid: Option<u32>,
    /// Milliseconds since the Unix epoch.
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub exit_code: Option<i32>,
    pub duration_ms: Option<u64>,
    pub status: JobStatus,
}

pub struct Session {
    pub id: String,
    shell_id: String,
    pub cwd: PathBuf,
    pub env_overrides: HashMap<String, String>,
    /// Free-form store for user scripts; opaque to the core.
    pub vars: HashMap<String, String>,
    jobs: HashMap<(String, String), JobRecord>,
    policy: Arc<EffectivePolicy>,
}

impl Session {
    pub fn new(policy: Arc<EffectivePolicy>, cwd: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            shell_id: Uuid::new_v4().simple().to_string(),
            cwd,
            env_overrides: HashMap::new(),
            vars: HashMap::new(),
            jobs: HashMap::new(),
            policy,
        }
    }

    pub fn shell_id(&self) -> &str {
        &self.shell_id
    }

    pub fn policy(&self) -> Arc<EffectivePolicy> {
        Arc::clone(&self.policy)
    }

    pub fn context(&self) -> SandboxContext {
        SandboxContext::new(self.policy(), self.cwd.clone())
    }

    /// Change the session cwd. Affects only path resolution; the permission
    /// boundaries are frozen in the policy.
    pub fn set_cwd(&mut self, cwd: PathBuf) -> Result<()> {
        if !cwd.is_absolute() {
            return Err(SafeshErr::InvalidConfig(format!(
                "session cwd must be absolute: {}",
                cwd.display()
            )));
        }
        self.cwd = cwd;
        Ok(())
    }

    /// Widen the policy with session-allowed commands. The only sanctioned
    /// path here is the deny-with-retry protocol.
    pub fn allow_for_session(&mut self, commands: &[String]) {
        self.policy = Arc::new(PolicyStore::with_session_allow(&self.policy, commands));
    }

    /// Fold a job marker into the record table. Records are keyed by
    /// `(id, script_id)`: a marker replayed on a retry of the same script
    /// updates rather than duplicates.
    pub fn apply_job_marker(&mut self, marker: &JobMarker) {
        let key = (marker.id.clone(), marker.script_id.clone());
        match marker.kind {
            JobMarkerKind::Start => {
                let record = self.jobs.entry(key).or_insert_with(|| JobRecord {
                    id: marker.id.clone(),
                    script_id: marker.script_id.clone(),
                    command: marker.command.clone(),
                    args: marker.args.clone(),
                    pid: None,
                    started_at: None,
                    completed_at: None,
                    exit_code: None,
                    duration_ms: None,
                    status: JobStatus::Running,
                });
                record.pid = marker.pid;
                record.started_at = marker.started_at;
                record.status = JobStatus::Running;
            }
            JobMarkerKind::End => {
                let Some(record) = self.jobs.get_mut(&key) else {
                    tracing::warn!("end marker for unknown job {}", marker.id);
                    return;
                };
                record.completed_at = marker.completed_at;
                record.exit_code = marker.exit_code;
                record.duration_ms = marker.duration;
                record.status = match marker.exit_code {
                    Some(TIMEOUT_EXIT_CODE) => JobStatus::TimedOut,
                    _ => JobStatus::Finished,
                };
            }
        }
    }

    pub fn jobs(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self.jobs.values().cloned().collect();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        records
    }

    pub fn jobs_for_script(&self, script_id: &str) -> Vec<JobRecord> {
        self.jobs()
            .into_iter()
            .filter(|record| record.script_id == script_id)
            .collect()
    }

    /// Session teardown: every still-running job is marked killed. The
    /// child processes themselves die with the executor handles
    /// (`kill_on_drop`).
    pub fn end(&mut self) {
        for record in self.jobs.values_mut() {
            if record.status == JobStatus::Running {
                record.status = JobStatus::Killed;
            }
        }
    }
}

#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<Mutex<Session>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_session(&self, policy: Arc<EffectivePolicy>, cwd: PathBuf) -> Arc<Mutex<Session>> {
        let session = Arc::new(Mutex::new(Session::new(policy, cwd)));
        let id = session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .id
            .clone();
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::clone(&session));
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn end_session(&self, id: &str) -> Result<()> {
        let session = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .ok_or_else(|| SafeshErr::SessionNotFound(id.to_string()))?;
        session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .end();
        Ok(())
    }
}

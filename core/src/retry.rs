//! The supervisor half of the deny-with-retry handshake.
//!
//! The child persisted a pending-command record and emitted the BLOCKED
//! prompt; once the human answers 1-4, [`DenyRetryProtocol::retry`] applies
//! the choice to the session policy, deletes the record, and re-drives the
//! original script. A record whose hash no longer matches the registered
//! script aborts with `StalePending` — the code changed between block and
//! retry, and silently re-running different code under a widened policy is
//! exactly the hole this check closes.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use safesh_protocol::PendingCommand;
use safesh_protocol::RetryChoice;
use tempfile::NamedTempFile;

use crate::config::PolicyStore;
use crate::error::Result;
use crate::error::SafeshErr;
use crate::executor::Executor;
use crate::executor::RunResult;
use crate::flags::SAFESH_PENDING_DIR;
use crate::session::Session;

/// Where pending-command records live: `<tmp>/safesh/pending/<script_id>.json`.
pub fn pending_dir() -> PathBuf {
    if let Some(dir) = &*SAFESH_PENDING_DIR
        && !dir.is_empty()
    {
        return PathBuf::from(*dir);
    }
    std::env::temp_dir().join("safesh").join("pending")
}

pub fn pending_path(script_id: &str) -> PathBuf {
    pending_path_in(&pending_dir(), script_id)
}

fn pending_path_in(dir: &std::path::Path, script_id: &str) -> PathBuf {
    dir.join(format!("{script_id}.json"))
}

/// Atomic write: serialized into a temp file, then renamed into place.
pub fn write_pending(pending: &PendingCommand) -> Result<()> {
    write_pending_in(&pending_dir(), pending)
}

pub fn write_pending_in(dir: &std::path::Path, pending: &PendingCommand) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let tmp_file = NamedTempFile::new_in(dir)?;
    std::fs::write(tmp_file.path(), serde_json::to_vec_pretty(pending)?)?;
    tmp_file
        .persist(pending_path_in(dir, &pending.id))
        .map_err(|err| SafeshErr::Io(err.error))?;
    Ok(())
}

pub fn load_pending(script_id: &str) -> Result<Option<PendingCommand>> {
    load_pending_in(&pending_dir(), script_id)
}

pub fn load_pending_in(
    dir: &std::path::Path,
    script_id: &str,
) -> Result<Option<PendingCommand>> {
    match std::fs::read_to_string(pending_path_in(dir, script_id)) {
        Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub fn delete_pending(script_id: &str) -> Result<()> {
    delete_pending_in(&pending_dir(), script_id)
}

pub fn delete_pending_in(dir: &std::path::Path, script_id: &str) -> Result<()> {
    match std::fs::remove_file(pending_path_in(dir, script_id)) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// What a retry produced.
#[derive(Debug)]
pub enum RetryOutcome {
    /// The user denied; nothing was run.
    Denied { commands: Vec<String> },
    /// The script was re-driven under the chosen grant.
    Reran(RunResult),
}

pub struct DenyRetryProtocol;

impl DenyRetryProtocol {
    pub async fn retry(
        executor: &Executor,
        session: &Arc<Mutex<Session>>,
        script_id: &str,
        choice: RetryChoice,
    ) -> Result<RetryOutcome> {
        Self::retry_in(&pending_dir(), executor, session, script_id, choice).await
    }

    pub async fn retry_in(
        dir: &std::path::Path,
        executor: &Executor,
        session: &Arc<Mutex<Session>>,
        script_id: &str,
        choice: RetryChoice,
    ) -> Result<RetryOutcome> {
        let pending = load_pending_in(dir, script_id)?
            .ok_or_else(|| SafeshErr::PendingNotFound(script_id.to_string()))?;

        // The record must still describe the script we have registered.
        let registered = executor
            .script(script_id)
            .ok_or_else(|| SafeshErr::StalePending(script_id.to_string()))?;
        if registered.hash != pending.script_hash {
            return Err(SafeshErr::StalePending(script_id.to_string()));
        }

        let commands = pending.commands.clone();
        match choice {
            RetryChoice::Deny => {
                delete_pending_in(dir, script_id)?;
                Ok(RetryOutcome::Denied { commands })
            }
            RetryChoice::AllowOnce => {
                delete_pending_in(dir, script_id)?;
                // Widen for this retry only; the session policy is untouched.
                let widened = {
                    let session = session.lock().unwrap_or_else(PoisonError::into_inner);
                    Arc::new(PolicyStore::with_session_allow(&session.policy(), &commands))
                };
                let result = executor.rerun(session, script_id, Some(widened)).await?;
                Ok(RetryOutcome::Reran(result))
            }
            RetryChoice::AllowForSession => {
                delete_pending_in(dir, script_id)?;
                session
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .allow_for_session(&commands);
                let result = executor.rerun(session, script_id, None).await?;
                Ok(RetryOutcome::Reran(result))
            }
            RetryChoice::AlwaysAllow => {
                delete_pending_in(dir, script_id)?;
                let project_dir = {
                    let mut session =
                        session.lock().unwrap_or_else(PoisonError::into_inner);
                    session.allow_for_session(&commands);
                    session.policy().project_dir.clone()
                };
                match project_dir {
                    Some(project_dir) => {
                        PolicyStore::append_project_allowed_commands(&project_dir, &commands)?;
                    }
                    None => {
                        tracing::warn!(
                            "always-allow without a project dir; grant applies to this session only"
                        );
                    }
                }
                let result = executor.rerun(session, script_id, None).await?;
                Ok(RetryOutcome::Reran(result))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::executor::SandboxRuntime;
    use crate::policy::EffectivePolicy;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn stub_executor() -> Executor {
        Executor::new(SandboxRuntime {
            program: "bash".to_string(),
            base_args: Vec::new(),
            script_suffix: ".sh".to_string(),
            permission_flags: false,
        })
    }

    fn test_session(project_dir: Option<PathBuf>) -> Arc<Mutex<Session>> {
        let mut policy = EffectivePolicy::empty();
        policy.env.allow = vec!["PATH".to_string()];
        policy.timeout_ms = 10_000;
        policy.project_dir = project_dir;
        Arc::new(Mutex::new(Session::new(
            Arc::new(policy),
            std::env::temp_dir(),
        )))
    }

    fn pending_for(script_id: &str, hash: &str, commands: &[&str]) -> PendingCommand {
        PendingCommand {
            id: script_id.to_string(),
            script_hash: hash.to_string(),
            commands: commands.iter().map(|c| c.to_string()).collect(),
            cwd: "/tmp".to_string(),
            created_at: Utc::now().timestamp_millis(),
        }
    }

    #[test]
    fn pending_round_trip_and_delete() {
        let dir = TempDir::new().unwrap();
        let pending = pending_for("script-ab12-1", "deadbeef", &["curl"]);
        write_pending_in(dir.path(), &pending).unwrap();
        assert_eq!(
            load_pending_in(dir.path(), "script-ab12-1").unwrap(),
            Some(pending)
        );
        delete_pending_in(dir.path(), "script-ab12-1").unwrap();
        assert_eq!(load_pending_in(dir.path(), "script-ab12-1").unwrap(), None);
        // Deleting a missing record is not an error.
        delete_pending_in(dir.path(), "script-ab12-1").unwrap();
    }

    #[tokio::test]
    async fn deny_deletes_and_runs_nothing() {
        let dir = TempDir::new().unwrap();
        let executor = stub_executor();
        let session = test_session(None);
        let result = executor.run(&session, "echo ran").await.unwrap();
        let record = executor.script(&result.script_id).unwrap();
        write_pending_in(
            dir.path(),
            &pending_for(&result.script_id, &record.hash, &["curl"]),
        )
        .unwrap();

        let outcome = DenyRetryProtocol::retry_in(
            dir.path(),
            &executor,
            &session,
            &result.script_id,
            RetryChoice::Deny,
        )
        .await
        .unwrap();
        assert!(matches!(outcome, RetryOutcome::Denied { commands } if commands == ["curl"]));
        assert_eq!(
            load_pending_in(dir.path(), &result.script_id).unwrap(),
            None
        );
        assert!(
            !session.lock().unwrap().policy().is_command_listed("curl"),
            "deny must not widen anything"
        );
    }

    #[tokio::test]
    async fn allow_for_session_widens_and_reruns() {
        let dir = TempDir::new().unwrap();
        let executor = stub_executor();
        let session = test_session(None);
        let result = executor.run(&session, "echo rerun-me").await.unwrap();
        let record = executor.script(&result.script_id).unwrap();
        write_pending_in(
            dir.path(),
            &pending_for(&result.script_id, &record.hash, &["curl"]),
        )
        .unwrap();

        let outcome = DenyRetryProtocol::retry_in(
            dir.path(),
            &executor,
            &session,
            &result.script_id,
            RetryChoice::AllowForSession,
        )
        .await
        .unwrap();
        let RetryOutcome::Reran(rerun) = outcome else {
            panic!("expected rerun");
        };
        assert_eq!(rerun.stdout, "rerun-me\n");
        assert!(session.lock().unwrap().policy().is_command_listed("curl"));
    }

    #[tokio::test]
    async fn allow_once_does_not_touch_the_session() {
        let dir = TempDir::new().unwrap();
        let executor = stub_executor();
        let session = test_session(None);
        let result = executor.run(&session, "echo once").await.unwrap();
        let record = executor.script(&result.script_id).unwrap();
        write_pending_in(
            dir.path(),
            &pending_for(&result.script_id, &record.hash, &["curl"]),
        )
        .unwrap();

        let outcome = DenyRetryProtocol::retry_in(
            dir.path(),
            &executor,
            &session,
            &result.script_id,
            RetryChoice::AllowOnce,
        )
        .await
        .unwrap();
        assert!(matches!(outcome, RetryOutcome::Reran(_)));
        assert!(
            !session.lock().unwrap().policy().is_command_listed("curl"),
            "allow-once is scoped to the single retry"
        );
    }

    #[tokio::test]
    async fn always_allow_persists_to_project_config() {
        let dir = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        let project_dir = project.path().canonicalize().unwrap();
        let executor = stub_executor();
        let session = test_session(Some(project_dir.clone()));
        let result = executor.run(&session, "echo always").await.unwrap();
        let record = executor.script(&result.script_id).unwrap();
        write_pending_in(
            dir.path(),
            &pending_for(&result.script_id, &record.hash, &["curl"]),
        )
        .unwrap();

        DenyRetryProtocol::retry_in(
            dir.path(),
            &executor,
            &session,
            &result.script_id,
            RetryChoice::AlwaysAllow,
        )
        .await
        .unwrap();

        let written = std::fs::read_to_string(project_dir.join("safesh.toml")).unwrap();
        assert!(written.contains("curl"));
        assert!(session.lock().unwrap().policy().is_command_listed("curl"));
    }

    #[tokio::test]
    async fn hash_mismatch_is_stale() {
        let dir = TempDir::new().unwrap();
        let executor = stub_executor();
        let session = test_session(None);
        let result = executor.run(&session, "echo original").await.unwrap();
        write_pending_in(
            dir.path(),
            &pending_for(&result.script_id, "0000000000000000000000000000000000000000", &["curl"]),
        )
        .unwrap();

        let err = DenyRetryProtocol::retry_in(
            dir.path(),
            &executor,
            &session,
            &result.script_id,
            RetryChoice::AllowForSession,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SafeshErr::StalePending(_)));
    }

    #[tokio::test]
    async fn missing_pending_record_is_its_own_error() {
        let dir = TempDir::new().unwrap();
        let executor = stub_executor();
        let session = test_session(None);
        let err = DenyRetryProtocol::retry_in(
            dir.path(),
            &executor,
            &session,
            "script-none-1",
            RetryChoice::Deny,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SafeshErr::PendingNotFound(_)));
    }
}

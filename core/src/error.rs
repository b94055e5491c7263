use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SafeshErr>;

/// Exit code reported when a command is killed by the timeout path,
/// mirroring the `timeout(1)` utility.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// What the VFS ran out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowKind {
    Size,
    Files,
    Fds,
}

impl std::fmt::Display for OverflowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            OverflowKind::Size => "size",
            OverflowKind::Files => "files",
            OverflowKind::Fds => "fds",
        };
        write!(f, "{label}")
    }
}

/// Errors raised by the VFS and the path engine while enforcing sandbox
/// boundaries. Split out from [`SafeshErr`] so callers can match on the
/// sandbox-shaped subset without a catch-all arm.
#[derive(Error, Debug)]
pub enum SandboxErr {
    /// Access outside every allowed root. Carries the expanded allow-list so
    /// the host can surface a precise message.
    #[error("path not permitted: {} (allowed roots: {})", .path.display(), format_roots(.roots))]
    PathViolation { path: PathBuf, roots: Vec<PathBuf> },

    /// The path or one of its ancestors could not be resolved on the host
    /// filesystem. Distinct from a violation: nothing was denied, the lookup
    /// itself failed.
    #[error("failed to canonicalize {}: {source}", .path.display())]
    CanonicalizeFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A VFS ceiling was hit; the operation is aborted and VFS state is
    /// unchanged.
    #[error("sandbox overflow ({kind})")]
    Overflow { kind: OverflowKind },

    #[error("symlink cycle at {}", .0.display())]
    SymlinkCycle(PathBuf),

    #[error("too many open files")]
    TooManyOpenFiles,
}

#[derive(Error, Debug)]
pub enum SafeshErr {
    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxErr),

    /// The command reference was evaluated and rejected by policy. Carries
    /// the path actually checked (post-resolution).
    #[error("command not allowed: {0}")]
    CommandNotAllowed(String),

    /// Distinguished from `CommandNotAllowed` so hosts do not prompt the
    /// user to allow a binary that does not exist.
    #[error("command not found: {0}")]
    CommandNotFound(String),

    /// A `${...}` placeholder in a path template that is not one of the
    /// recognized set (`~`, `${CWD}`, `${HOME}`).
    #[error("unrecognized placeholder in path template: {0}")]
    UnknownPlaceholder(String),

    /// The pending-command record no longer matches the script it was
    /// written for; the code changed between block and retry.
    #[error("pending command record is stale: {0}")]
    StalePending(String),

    #[error("no pending command record for {0}")]
    PendingNotFound(String),

    /// Command exceeded its deadline; partial output was collected.
    #[error("command timed out")]
    Timeout,

    /// Generic executor failure, tagged with the script it belongs to.
    #[error("execution failed for {script_id}: {message}")]
    Execution { script_id: String, message: String },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A second filesystem interceptor installation in the same process.
    #[error("a sandbox filesystem is already installed in this process")]
    AlreadyInstalled,

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn format_roots(roots: &[PathBuf]) -> String {
    if roots.is_empty() {
        return "none".to_string();
    }
    roots
        .iter()
        .map(|root| root.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

use std::time::Duration;

use env_flags::env_flags;

env_flags! {
    /// Overrides the directory holding the global config (default `~/.safesh`).
    pub SAFESH_HOME: Option<&str> = None;

    /// Hard ceiling applied to a run when neither the config nor the caller
    /// sets one.
    pub SAFESH_DEFAULT_TIMEOUT_MS: Duration = Duration::from_millis(120_000), |value| {
        value.parse().map(Duration::from_millis)
    };

    /// Program used as the sandbox runtime for executor children.
    pub SAFESH_RUNTIME: &str = "deno";

    /// Overrides the pending-command directory (used by tests).
    pub SAFESH_PENDING_DIR: Option<&str> = None;
}

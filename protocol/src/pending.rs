//! Pending-command records and the deny-with-retry handshake types.

use serde::Deserialize;
use serde::Serialize;

/// Persisted when the child blocks one or more commands. The supervisor reads
/// this back when the user answers the prompt, and `script_hash` guards
/// against re-driving code that has changed since the block was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCommand {
    /// The script id of the blocked invocation.
    pub id: String,
    pub script_hash: String,
    /// Blocked command references, in first-seen order.
    pub commands: Vec<String>,
    pub cwd: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
}

/// The user's answer to the BLOCKED prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryChoice {
    /// Widen the policy for this one retry only.
    AllowOnce,
    /// Persist to the project config and allow for the session.
    AlwaysAllow,
    /// Allow for the rest of the session.
    AllowForSession,
    /// Do not run; discard the pending record.
    Deny,
}

impl RetryChoice {
    /// Map the `1-4` answer the prompt asks for.
    pub fn from_prompt_digit(digit: u8) -> Option<Self> {
        match digit {
            1 => Some(Self::AllowOnce),
            2 => Some(Self::AlwaysAllow),
            3 => Some(Self::AllowForSession),
            4 => Some(Self::Deny),
            _ => None,
        }
    }
}

/// Structured deny-with-retry payload returned to the host.
///
/// The host renders the human-facing prompt from this; the core never parses
/// its own prompt text back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DenyRetryRequest {
    pub script_id: String,
    pub commands: Vec<String>,
}

impl DenyRetryRequest {
    /// The exact prompt surfaced on the child's stderr when commands are
    /// blocked. The wording is part of the external contract: supervising
    /// agents pattern-match on it.
    pub fn render_prompt(&self) -> String {
        format!(
            "[SAFESH] BLOCKED: {}\n\
             \n\
             WAIT for user choice (1-4):\n\
             1. Allow once\n\
             2. Always allow\n\
             3. Allow for session\n\
             4. Deny\n\
             \n\
             DO NOT SHOW OR REPEAT OPTIONS. AFTER USER RESPONDS: \
             desh retry --id={} --choice=<user's choice>\n",
            self.commands.join(", "),
            self.script_id,
        )
    }
}

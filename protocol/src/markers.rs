//! Stderr markers emitted by the sandboxed child.
//!
//! Each marker occupies one line and starts with a fixed prefix followed by a
//! JSON payload. The prefix must be the first characters on the line: the
//! child's own stdout may legitimately contain marker-looking text, so the
//! parser never scans mid-line.

use serde::Deserialize;
use serde::Serialize;

pub const JOB_MARKER_PREFIX: &str = "__SAFESH_JOB__:";
pub const CMD_ERROR_MARKER_PREFIX: &str = "__SAFESH_CMD_ERROR__:";
pub const INIT_ERROR_MARKER_PREFIX: &str = "__SAFESH_INIT_ERROR__:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMarkerKind {
    Start,
    End,
}

/// Lifecycle event for one external-command invocation inside a script.
///
/// A `start` marker is emitted immediately after the child spawns the
/// command; the matching `end` marker carries the exit code and duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMarker {
    #[serde(rename = "type")]
    pub kind: JobMarkerKind,
    pub id: String,
    pub script_id: String,
    pub shell_id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Milliseconds since the Unix epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    /// Wall-clock duration in milliseconds; only on `end`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// A single command was denied at spawn time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmdErrorMarker {
    #[serde(rename = "type")]
    pub kind: String,
    pub command: String,
}

impl CmdErrorMarker {
    pub const KIND: &'static str = "COMMAND_NOT_ALLOWED";

    pub fn new(command: impl Into<String>) -> Self {
        Self {
            kind: Self::KIND.to_string(),
            command: command.into(),
        }
    }
}

/// The batched `init` check found blocked commands before the script body
/// ran. `not_allowed` and `not_found` are disjoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitErrorMarker {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "notAllowed")]
    pub not_allowed: Vec<String>,
    #[serde(rename = "notFound")]
    pub not_found: Vec<String>,
}

impl InitErrorMarker {
    pub const KIND: &'static str = "COMMANDS_BLOCKED";

    pub fn new(not_allowed: Vec<String>, not_found: Vec<String>) -> Self {
        Self {
            kind: Self::KIND.to_string(),
            not_allowed,
            not_found,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Marker {
    Job(JobMarker),
    CmdError(CmdErrorMarker),
    InitError(InitErrorMarker),
}

/// Parse one stderr line into a marker, if it is one.
///
/// Returns `None` both for ordinary output and for lines that carry a marker
/// prefix with a payload that does not deserialize; a child that garbles its
/// own markers must not take the supervisor down with it.
pub fn parse_marker_line(line: &str) -> Option<Marker> {
    if let Some(payload) = line.strip_prefix(JOB_MARKER_PREFIX) {
        return match serde_json::from_str::<JobMarker>(payload) {
            Ok(marker) => Some(Marker::Job(marker)),
            Err(err) => {
                tracing::warn!("discarding malformed job marker: {err}");
                None
            }
        };
    }
    if let Some(payload) = line.strip_prefix(CMD_ERROR_MARKER_PREFIX) {
        return match serde_json::from_str::<CmdErrorMarker>(payload) {
            Ok(marker) => Some(Marker::CmdError(marker)),
            Err(err) => {
                tracing::warn!("discarding malformed cmd-error marker: {err}");
                None
            }
        };
    }
    if let Some(payload) = line.strip_prefix(INIT_ERROR_MARKER_PREFIX) {
        return match serde_json::from_str::<InitErrorMarker>(payload) {
            Ok(marker) => Some(Marker::InitError(marker)),
            Err(err) => {
                tracing::warn!("discarding malformed init-error marker: {err}");
                None
            }
        };
    }
    None
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn job_marker_round_trips_with_camel_case_field_names() {
        let marker = JobMarker {
            kind: JobMarkerKind::Start,
            id: "job-ab12-0f3a9c".to_string(),
            script_id: "script-ab12-1".to_string(),
            shell_id: "ab12cd34".to_string(),
            command: "git".to_string(),
            args: vec!["status".to_string()],
            pid: Some(4242),
            started_at: Some(1_700_000_000_000),
            completed_at: None,
            duration: None,
            exit_code: None,
        };
        let json = serde_json::to_string(&marker).unwrap();
        assert!(json.contains("\"scriptId\""));
        assert!(json.contains("\"shellId\""));
        assert!(json.contains("\"startedAt\""));
        let line = format!("{JOB_MARKER_PREFIX}{json}");
        assert_eq!(Some(Marker::Job(marker)), parse_marker_line(&line));
    }

    #[test]
    fn init_error_marker_parses() {
        let line = format!(
            "{INIT_ERROR_MARKER_PREFIX}{}",
            r#"{"type":"COMMANDS_BLOCKED","notAllowed":["curl"],"notFound":["frobnicate"]}"#
        );
        let parsed = parse_marker_line(&line).unwrap();
        assert_eq!(
            Marker::InitError(InitErrorMarker::new(
                vec!["curl".to_string()],
                vec!["frobnicate".to_string()],
            )),
            parsed
        );
    }

    #[test]
    fn marker_prefix_mid_line_is_not_a_marker() {
        let line = format!("echoed: {CMD_ERROR_MARKER_PREFIX}{{}}");
        assert_eq!(None, parse_marker_line(&line));
    }

    #[test]
    fn malformed_payload_is_discarded() {
        let line = format!("{CMD_ERROR_MARKER_PREFIX}not json");
        assert_eq!(None, parse_marker_line(&line));
    }
}

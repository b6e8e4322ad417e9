pub mod normalize;
pub mod quote;
pub mod resolve;
pub mod shell;

use crate::approval::ApprovalDecision;
use crate::command::resolve::Resolution;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Inbound execution request, exactly as received from the transport.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecRequest {
    #[serde(default)]
    pub command: Vec<String>,
    /// The exact shell command the operator will see; must agree with `command`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub needs_screen_recording: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default)]
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_decision: Option<ApprovalDecision>,
}

/// Canonical form of a request command.
///
/// `argv` is what the executor receives and is never mutated after
/// normalization. `shell_command` is present iff `argv` was a recognized
/// shell-wrapper invocation, and holds the reconstructed command string.
/// `cmd_text` is the human-readable form used in UI and audit events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedCommand {
    pub argv: Vec<String>,
    pub shell_command: Option<String>,
    pub cmd_text: String,
}

/// Operator found between (or attached to) segments of a shell command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellOperator {
    Pipe,
    And,
    Or,
    Semicolon,
    Background,
    Redirection,
    Subshell,
}

/// A redirection attached to a segment, e.g. `2>> err.log`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirection {
    pub op: String,
    pub target: Option<String>,
}

impl Redirection {
    /// Whether this redirection writes to its target (`>`, `>>`, `2>`, `&>`, ...).
    pub fn writes(&self) -> bool {
        self.op.contains('>')
    }
}

/// One command between pipe/logical operators: a program plus its arguments.
#[derive(Debug, Clone, Default)]
pub struct Segment {
    pub argv: Vec<String>,
    pub redirections: Vec<Redirection>,
    pub resolution: Option<Resolution>,
}

impl Segment {
    pub fn from_argv(argv: Vec<String>) -> Self {
        Self {
            argv,
            redirections: Vec::new(),
            resolution: None,
        }
    }

    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }
}

/// Result of decomposing a command into segments.
///
/// `ok` is false when the command contains constructs that prevent safe
/// analysis (unterminated quotes, command/process substitution, a variable
/// assignment or glob in program position).
#[derive(Debug, Clone, Default)]
pub struct AnalyzedCommand {
    pub ok: bool,
    pub segments: Vec<Segment>,
    pub operators: Vec<ShellOperator>,
}

impl AnalyzedCommand {
    /// Analysis of a plain argv invocation: one segment, nothing between.
    pub fn single(argv: Vec<String>) -> Self {
        Self {
            ok: true,
            segments: vec![Segment::from_argv(argv)],
            operators: Vec::new(),
        }
    }
}

//! Audit events and the sink they flow into.

use crate::policy::DenyReason;
use crate::utils::truncate_chars;
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Mutex;
use tracing::{info, warn};

/// Per-stream cap applied before an event is emitted.
pub const MAX_STREAM_CHARS: usize = 16 * 1024;
/// Appended to whichever stream is non-empty when output was cut.
pub const TRUNCATION_SUFFIX: &str = "... (truncated)";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ExecEvent {
    #[serde(rename = "exec.denied")]
    Denied {
        #[serde(rename = "sessionKey", skip_serializing_if = "Option::is_none")]
        session_key: Option<String>,
        #[serde(rename = "runId")]
        run_id: String,
        host: String,
        command: String,
        reason: DenyReason,
    },
    #[serde(rename = "exec.finished")]
    Finished {
        #[serde(rename = "sessionKey", skip_serializing_if = "Option::is_none")]
        session_key: Option<String>,
        #[serde(rename = "runId")]
        run_id: String,
        #[serde(rename = "cmdText")]
        cmd_text: String,
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
        #[serde(rename = "timedOut")]
        timed_out: bool,
        success: bool,
        stdout: String,
        stderr: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ExecEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecEvent::Denied { .. } => "exec.denied",
            ExecEvent::Finished { .. } => "exec.finished",
        }
    }

    pub fn session_key(&self) -> Option<&str> {
        match self {
            ExecEvent::Denied { session_key, .. } | ExecEvent::Finished { session_key, .. } => {
                session_key.as_deref()
            }
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            ExecEvent::Denied { run_id, .. } | ExecEvent::Finished { run_id, .. } => run_id,
        }
    }
}

/// Cap both streams, marking the cut on stderr when possible.
pub fn truncate_streams(stdout: &str, stderr: &str) -> (String, String) {
    let stdout_cut = stdout.chars().count() > MAX_STREAM_CHARS;
    let stderr_cut = stderr.chars().count() > MAX_STREAM_CHARS;
    let mut stdout = truncate_chars(stdout, MAX_STREAM_CHARS, "");
    let mut stderr = truncate_chars(stderr, MAX_STREAM_CHARS, "");
    if stdout_cut || stderr_cut {
        if !stderr.is_empty() {
            stderr.push_str(TRUNCATION_SUFFIX);
        } else if !stdout.is_empty() {
            stdout.push_str(TRUNCATION_SUFFIX);
        }
    }
    (stdout, stderr)
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: ExecEvent) -> Result<()>;
}

/// Default sink: structured log lines through `tracing`.
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn emit(&self, event: ExecEvent) -> Result<()> {
        let payload = serde_json::to_string(&event)?;
        match &event {
            ExecEvent::Denied { .. } => warn!(target: "execgate::events", "{}", payload),
            ExecEvent::Finished { .. } => info!(target: "execgate::events", "{}", payload),
        }
        Ok(())
    }
}

/// Buffering sink for tests and dry runs.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<ExecEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<ExecEvent> {
        std::mem::take(&mut self.events.lock().expect("memory sink lock"))
    }

    pub fn snapshot(&self) -> Vec<ExecEvent> {
        self.events.lock().expect("memory sink lock").clone()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn emit(&self, event: ExecEvent) -> Result<()> {
        self.events.lock().expect("memory sink lock").push(event);
        Ok(())
    }
}

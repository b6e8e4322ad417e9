//! Executor seam: the orchestrator hands an approved argv to a capability
//! and awaits the result. The in-process implementation spawns the argv
//! directly (no shell interposed) with a scrubbed environment.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Environment variables safe to pass through to child processes.
const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "LC_ALL",
    "TZ",
    "TERM",
    "RUST_LOG",
    "TMPDIR",
    "XDG_RUNTIME_DIR",
];

/// What the executor is asked to run.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Option<HashMap<String, String>>,
    pub timeout: Duration,
}

/// Outcome of one executor run; forwarded verbatim in the reply payload.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The executor itself cannot be reached (companion process down,
    /// transport broken). Spawn failures of the child are NOT this; they
    /// come back as a `RunResult` with `error` set.
    #[error("executor unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, spec: ExecSpec) -> Result<RunResult, ExecutorError>;
}

/// Runs commands as local child processes.
pub struct ProcessExecutor;

/// Create a `Command` with a scrubbed environment.
///
/// Clears everything, copies only the allowlisted variables from the current
/// process, then applies the request's explicit overrides. This prevents
/// accidental leakage of API keys and tokens to child processes.
fn scrubbed_command(program: &str, overrides: Option<&HashMap<String, String>>) -> Command {
    let mut cmd = Command::new(program);
    cmd.env_clear();
    for &var in ALLOWED_ENV_VARS {
        if let Ok(val) = std::env::var(var) {
            cmd.env(var, val);
        }
    }
    if let Some(overrides) = overrides {
        for (key, val) in overrides {
            cmd.env(key, val);
        }
    }
    cmd
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn execute(&self, spec: ExecSpec) -> Result<RunResult, ExecutorError> {
        let Some(program) = spec.argv.first() else {
            return Ok(RunResult {
                success: false,
                error: Some("empty argv".to_string()),
                ..RunResult::default()
            });
        };

        let mut cmd = scrubbed_command(program, spec.env.as_ref());
        cmd.args(&spec.argv[1..]);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        cmd.kill_on_drop(true);

        debug!("executing {:?} (timeout {:?})", spec.argv, spec.timeout);
        match tokio::time::timeout(spec.timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(RunResult {
                exit_code: output.status.code(),
                timed_out: false,
                success: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                error: None,
            }),
            // Spawn failure (missing program, permission denied)
            Ok(Err(e)) => Ok(RunResult {
                exit_code: None,
                timed_out: false,
                success: false,
                stdout: String::new(),
                stderr: String::new(),
                error: Some(e.to_string()),
            }),
            // Timeout: the future is dropped, kill_on_drop reaps the child
            Err(_) => Ok(RunResult {
                exit_code: None,
                timed_out: true,
                success: false,
                stdout: String::new(),
                stderr: String::new(),
                error: None,
            }),
        }
    }
}

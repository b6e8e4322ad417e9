//! Effective policy resolution and the allow/ask/deny decision tables.

use crate::approval::ApprovalDecision;
use crate::config::{AskMode, Config, SecurityLevel};
use serde::{Serialize, Serializer};
use std::collections::HashSet;
use std::path::PathBuf;

/// Host platform, threaded explicitly so decision tables are testable
/// off-platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Unix,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }
}

/// Effective policy for one agent: agent overrides merged over global config.
#[derive(Debug, Clone)]
pub struct Policy {
    pub security: SecurityLevel,
    pub ask: AskMode,
    pub safe_bins: Vec<PathBuf>,
    pub skill_bins: HashSet<String>,
    pub auto_allow_skills: bool,
}

impl Policy {
    pub fn resolve(config: &Config, agent_id: Option<&str>) -> Policy {
        let base = &config.policy;
        let overrides = agent_id.and_then(|id| config.agents.get(id));

        Policy {
            security: overrides.and_then(|o| o.security).unwrap_or(base.security),
            ask: overrides.and_then(|o| o.ask).unwrap_or(base.ask),
            safe_bins: overrides
                .and_then(|o| o.safe_bins.clone())
                .unwrap_or_else(|| base.safe_bins.clone()),
            skill_bins: overrides
                .and_then(|o| o.skill_bins.clone())
                .unwrap_or_else(|| base.skill_bins.clone())
                .into_iter()
                .collect(),
            auto_allow_skills: overrides
                .and_then(|o| o.auto_allow_skills)
                .unwrap_or(base.auto_allow_skills),
        }
    }
}

/// Why a request was refused; rendered verbatim into `exec.denied` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    SecurityDeny,
    AllowlistMiss,
    ApprovalRequired,
    ScreenRecording,
    CompanionUnavailable,
    Cancelled,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::SecurityDeny => "security=deny",
            DenyReason::AllowlistMiss => "allowlist-miss",
            DenyReason::ApprovalRequired => "approval-required",
            DenyReason::ScreenRecording => "permission:screenRecording",
            DenyReason::CompanionUnavailable => "companion-unavailable",
            DenyReason::Cancelled => "cancelled",
        }
    }
}

impl Serialize for DenyReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Ask,
    Deny(DenyReason),
}

/// The approval state a request arrived with, after sanitization.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApprovalInput {
    pub approved: bool,
    pub decision: Option<ApprovalDecision>,
}

impl ApprovalInput {
    pub fn approved(decision: ApprovalDecision) -> Self {
        Self {
            approved: true,
            decision: Some(decision),
        }
    }
}

/// Whether this combination needs an operator in the loop.
pub fn requires_approval(
    ask: AskMode,
    security: SecurityLevel,
    analysis_ok: bool,
    allowlist_satisfied: bool,
) -> bool {
    match ask {
        AskMode::Always => true,
        AskMode::Never => false,
        AskMode::Untrusted => match security {
            SecurityLevel::Allowlist => !analysis_ok || !allowlist_satisfied,
            SecurityLevel::Off => !analysis_ok,
            SecurityLevel::Deny => false,
        },
    }
}

/// Everything `final_decision` looks at.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInput<'a> {
    pub policy: &'a Policy,
    pub platform: Platform,
    pub analysis_ok: bool,
    pub allowlist_satisfied: bool,
    /// The outer invocation is `cmd`/`cmd.exe`, before any unwrapping.
    pub outer_is_cmd_exe: bool,
    pub needs_screen_recording: bool,
    pub screen_recording_allowed: bool,
    pub approval: ApprovalInput,
}

pub fn final_decision(input: DecisionInput) -> Decision {
    let policy = input.policy;

    if policy.security == SecurityLevel::Deny {
        return Decision::Deny(DenyReason::SecurityDeny);
    }

    if input.needs_screen_recording && !input.screen_recording_allowed {
        return Decision::Deny(DenyReason::ScreenRecording);
    }

    // cmd.exe /c can smuggle arbitrary trailing tokens; without a prior
    // operator approval the analysis cannot be trusted on Windows.
    let mut analysis_ok = input.analysis_ok;
    if input.platform == Platform::Windows
        && policy.security == SecurityLevel::Allowlist
        && input.outer_is_cmd_exe
        && !input.approval.approved
    {
        analysis_ok = false;
    }

    if requires_approval(
        policy.ask,
        policy.security,
        analysis_ok,
        input.allowlist_satisfied,
    ) && !input.approval.approved
    {
        return Decision::Ask;
    }

    if policy.security == SecurityLevel::Allowlist
        && !input.allowlist_satisfied
        && !input.approval.approved
    {
        return Decision::Deny(DenyReason::AllowlistMiss);
    }

    Decision::Allow
}

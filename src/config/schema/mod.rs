use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Security posture for command execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    /// Execute anything; analysis still runs for audit purposes.
    Off,
    /// Only allowlisted (or safe-bin / skill-bin) programs run unattended.
    #[default]
    Allowlist,
    /// Refuse every command.
    Deny,
}

/// When the operator is asked to confirm a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AskMode {
    Never,
    #[default]
    Untrusted,
    Always,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub security: SecurityLevel,
    #[serde(default)]
    pub ask: AskMode,
    /// Directories whose contents are trusted to run without an allowlist entry.
    #[serde(default, rename = "safeBins")]
    pub safe_bins: Vec<PathBuf>,
    /// Program names granted by the agent's skill configuration.
    #[serde(default, rename = "skillBins")]
    pub skill_bins: Vec<String>,
    #[serde(default, rename = "autoAllowSkills")]
    pub auto_allow_skills: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            security: SecurityLevel::default(),
            ask: AskMode::default(),
            safe_bins: Vec::new(),
            skill_bins: Vec::new(),
            auto_allow_skills: false,
        }
    }
}

/// Per-agent overrides; any field left unset falls back to the global policy.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentOverrides {
    #[serde(default)]
    pub security: Option<SecurityLevel>,
    #[serde(default)]
    pub ask: Option<AskMode>,
    #[serde(default, rename = "safeBins")]
    pub safe_bins: Option<Vec<PathBuf>>,
    #[serde(default, rename = "skillBins")]
    pub skill_bins: Option<Vec<String>>,
    #[serde(default, rename = "autoAllowSkills")]
    pub auto_allow_skills: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Hard ceiling on executor run time; request timeouts are clamped to it.
    #[serde(default = "default_max_timeout_ms", rename = "maxTimeoutMs")]
    pub max_timeout_ms: u64,
    #[serde(default = "default_approval_ttl_ms", rename = "approvalTtlMs")]
    pub approval_ttl_ms: i64,
    #[serde(default, rename = "screenRecordingAllowed")]
    pub screen_recording_allowed: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            max_timeout_ms: default_max_timeout_ms(),
            approval_ttl_ms: default_approval_ttl_ms(),
            screen_recording_allowed: false,
        }
    }
}

fn default_host() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn default_max_timeout_ms() -> u64 {
    30 * 60 * 1000
}

fn default_approval_ttl_ms() -> i64 {
    60 * 60 * 1000
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Keyed by agent id; overrides merge over `policy` field-by-field.
    #[serde(default)]
    pub agents: HashMap<String, AgentOverrides>,
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Defaults to `$EXECGATE_HOME/allowlist.json` when unset.
    #[serde(default, rename = "allowlistPath")]
    pub allowlist_path: Option<PathBuf>,
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        for dir in &self.policy.safe_bins {
            if !dir.is_absolute() {
                return Err(format!(
                    "policy.safeBins entries must be absolute paths, got '{}'",
                    dir.display()
                ));
            }
        }
        for (agent, overrides) in &self.agents {
            for dir in overrides.safe_bins.iter().flatten() {
                if !dir.is_absolute() {
                    return Err(format!(
                        "agents.{}.safeBins entries must be absolute paths, got '{}'",
                        agent,
                        dir.display()
                    ));
                }
            }
        }
        if self.runner.max_timeout_ms == 0 {
            return Err("runner.maxTimeoutMs must be positive".to_string());
        }
        if self.runner.approval_ttl_ms <= 0 {
            return Err("runner.approvalTtlMs must be positive".to_string());
        }
        Ok(())
    }
}

//! Per-agent allowlist of resolved program paths.
//!
//! Entries are exact canonical paths, never globs or bare names; matching a
//! segment means matching the real file its program token resolves to. The
//! store is the only durable mutable resource: reads snapshot under a read
//! lock, disk writes serialize on an outer async lock around an
//! atomic-replace write, and the in-memory lock is never held across I/O.

use crate::command::resolve::{ResolveContext, resolve_program};
use crate::command::shell::parse_shell;
use crate::command::{AnalyzedCommand, Segment, ShellOperator};
use crate::errors::{GateError, GateResult};
use crate::policy::{Platform, Policy};
use crate::utils::{atomic_write, canonicalize_or_normalize, now_ms};
use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Argument characters that disqualify a safe-bin/skill-bin auto-pass.
const ARG_METACHARACTERS: &[char] = &['&', '|', ';', '<', '>', '`', '$', '(', ')'];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowlistEntry {
    /// None means the entry applies to every agent.
    #[serde(default)]
    pub agent_id: Option<String>,
    pub pattern: String,
    #[serde(default)]
    pub use_count: u64,
    #[serde(default)]
    pub created_at_ms: i64,
    #[serde(default)]
    pub last_used_at_ms: i64,
    #[serde(default)]
    pub last_cmd_text: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AllowlistFile {
    #[serde(default)]
    entries: Vec<AllowlistEntry>,
}

/// Outcome of evaluating an analyzed command against the allowlist.
#[derive(Debug, Clone, Default)]
pub struct ExecEvaluation {
    /// Entries matched by at least one segment, in segment order.
    pub matches: Vec<AllowlistEntry>,
    /// Every segment is covered and no forbidden construct is present.
    pub satisfied: bool,
}

pub struct AllowlistStore {
    path: PathBuf,
    entries: RwLock<Vec<AllowlistEntry>>,
    /// Serializes writers to disk, independent of the reader lock.
    write_lock: Mutex<()>,
}

impl AllowlistStore {
    /// Open the store at `path`, loading and deduplicating existing entries.
    pub fn open(path: PathBuf) -> Result<Self> {
        let entries = if path.exists() {
            load_entries(&path)?
        } else {
            Vec::new()
        };
        Ok(Self {
            path,
            entries: RwLock::new(entries),
            write_lock: Mutex::new(()),
        })
    }

    pub fn snapshot(&self) -> Vec<AllowlistEntry> {
        self.entries.read().expect("allowlist read lock").clone()
    }

    /// Global and agent-specific entries whose pattern equals `resolved_path`.
    pub fn matches_for(&self, agent_id: Option<&str>, resolved_path: &str) -> Vec<AllowlistEntry> {
        self.entries
            .read()
            .expect("allowlist read lock")
            .iter()
            .filter(|e| {
                e.pattern == resolved_path
                    && (e.agent_id.is_none() || e.agent_id.as_deref() == agent_id)
            })
            .cloned()
            .collect()
    }

    /// Idempotent insertion. The pattern must be an absolute path.
    pub async fn add_entry(&self, agent_id: Option<&str>, pattern: &str) -> GateResult<bool> {
        if !Path::new(pattern).is_absolute() {
            return Err(GateError::Store(format!(
                "allowlist patterns must be absolute paths, got '{pattern}'"
            )));
        }
        let inserted = {
            let mut entries = self.entries.write().expect("allowlist write lock");
            let exists = entries
                .iter()
                .any(|e| e.pattern == pattern && e.agent_id.as_deref() == agent_id);
            if exists {
                false
            } else {
                let now = now_ms();
                entries.push(AllowlistEntry {
                    agent_id: agent_id.map(ToString::to_string),
                    pattern: pattern.to_string(),
                    use_count: 0,
                    created_at_ms: now,
                    last_used_at_ms: now,
                    last_cmd_text: String::new(),
                });
                true
            }
        };
        if inserted {
            debug!("allowlist: added {} for {:?}", pattern, agent_id);
            self.persist().await?;
        }
        Ok(inserted)
    }

    /// Drop an entry; returns whether anything was removed.
    pub async fn remove_entry(&self, agent_id: Option<&str>, pattern: &str) -> GateResult<bool> {
        let removed = {
            let mut entries = self.entries.write().expect("allowlist write lock");
            let before = entries.len();
            entries.retain(|e| !(e.pattern == pattern && e.agent_id.as_deref() == agent_id));
            entries.len() != before
        };
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Bump use metadata on one entry, write-through to disk.
    pub async fn record_use(
        &self,
        agent_id: Option<&str>,
        pattern: &str,
        cmd_text: &str,
    ) -> GateResult<()> {
        let touched = {
            let mut entries = self.entries.write().expect("allowlist write lock");
            let mut touched = false;
            for entry in entries
                .iter_mut()
                .filter(|e| e.pattern == pattern && e.agent_id.as_deref() == agent_id)
            {
                entry.use_count += 1;
                entry.last_used_at_ms = now_ms();
                entry.last_cmd_text = cmd_text.to_string();
                touched = true;
            }
            touched
        };
        if touched {
            self.persist().await?;
        }
        Ok(())
    }

    async fn persist(&self) -> GateResult<()> {
        // Snapshot first; the in-memory lock must not span the disk write
        let file = AllowlistFile {
            entries: self.snapshot(),
        };
        let content = serde_json::to_string_pretty(&file)
            .context("Failed to serialize allowlist")
            .map_err(GateError::Internal)?;
        let _guard = self.write_lock.lock().await;
        atomic_write(&self.path, &content).map_err(GateError::Internal)
    }

    /// Evaluate analyzed segments against the allowlist under `policy`.
    ///
    /// Satisfied iff the analysis is clean, no forbidden operator appears,
    /// every write-redirection stays inside the cwd subtree (unless the
    /// segment is safe-bin), and every segment is either trusted-bin with
    /// metacharacter-free arguments or covered by an entry.
    pub fn evaluate_exec(
        &self,
        analysis: &AnalyzedCommand,
        agent_id: Option<&str>,
        _policy: &Policy,
        cwd: &Path,
    ) -> ExecEvaluation {
        let mut matches = Vec::new();
        let mut satisfied = analysis.ok;

        if analysis
            .operators
            .iter()
            .any(|op| matches!(op, ShellOperator::Background | ShellOperator::Subshell))
        {
            satisfied = false;
        }

        for segment in &analysis.segments {
            let Some(resolution) = &segment.resolution else {
                satisfied = false;
                continue;
            };

            let trusted = resolution.is_trusted_bin();
            if !redirections_contained(segment, cwd, trusted) {
                satisfied = false;
            }

            if trusted {
                // Trusted bins auto-satisfy, but only with inert arguments
                if segment.argv.iter().skip(1).any(|arg| {
                    arg.chars().any(|c| ARG_METACHARACTERS.contains(&c))
                }) {
                    satisfied = false;
                }
                continue;
            }

            let segment_matches = self.matches_for(agent_id, &resolution.resolved_path);
            if segment_matches.is_empty() {
                satisfied = false;
            } else {
                matches.extend(segment_matches);
            }
        }

        if analysis.segments.is_empty() {
            satisfied = false;
        }

        ExecEvaluation { matches, satisfied }
    }

    /// Parse a shell command, resolve its segments, and evaluate them.
    pub fn evaluate_shell(
        &self,
        command: &str,
        agent_id: Option<&str>,
        policy: &Policy,
        cwd: &Path,
        env: Option<&HashMap<String, String>>,
        platform: Platform,
    ) -> (AnalyzedCommand, ExecEvaluation) {
        let mut analysis = parse_shell(command);
        let ctx = ResolveContext {
            cwd,
            env,
            safe_bins: &policy.safe_bins,
            skill_bins: &policy.skill_bins,
            auto_allow_skills: policy.auto_allow_skills,
            platform,
        };
        for segment in &mut analysis.segments {
            if let Some(program) = segment.argv.first() {
                segment.resolution = Some(resolve_program(program, &ctx));
            }
        }
        let evaluation = self.evaluate_exec(&analysis, agent_id, policy, cwd);
        (analysis, evaluation)
    }
}

/// Every write-redirection target must resolve inside the cwd subtree,
/// unless the segment runs a safe-bin program.
fn redirections_contained(segment: &Segment, cwd: &Path, trusted: bool) -> bool {
    if trusted {
        return true;
    }
    for redirection in &segment.redirections {
        if !redirection.writes() {
            continue;
        }
        let Some(target) = &redirection.target else {
            return false;
        };
        // fd duplication ("2>&1") has a numeric target, not a path
        if redirection.op.ends_with('&') && target.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let path = Path::new(target);
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            cwd.join(path)
        };
        let resolved = canonicalize_or_normalize(&joined);
        let cwd_real = canonicalize_or_normalize(cwd);
        if !resolved.starts_with(&cwd_real) {
            return false;
        }
    }
    true
}

fn load_entries(path: &Path) -> Result<Vec<AllowlistEntry>> {
    // Shared lock, same discipline as the config loader
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open allowlist at {}", path.display()))?;
    file.lock_shared()
        .with_context(|| "Failed to acquire shared lock on allowlist file")?;
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read allowlist from {}", path.display()))?;

    let parsed: AllowlistFile = match serde_json::from_str(&content) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("allowlist at {} is unreadable: {}", path.display(), e);
            return Ok(Vec::new());
        }
    };
    Ok(dedupe_entries(parsed.entries))
}

/// Collapse duplicate (agentId, pattern) pairs, keeping the maximum useCount
/// and the most recent timestamps.
fn dedupe_entries(entries: Vec<AllowlistEntry>) -> Vec<AllowlistEntry> {
    let mut merged: HashMap<(Option<String>, String), AllowlistEntry> = HashMap::new();
    for entry in entries {
        let key = (entry.agent_id.clone(), entry.pattern.clone());
        match merged.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                existing.use_count = existing.use_count.max(entry.use_count);
                existing.created_at_ms = existing.created_at_ms.max(entry.created_at_ms);
                if entry.last_used_at_ms > existing.last_used_at_ms {
                    existing.last_used_at_ms = entry.last_used_at_ms;
                    existing.last_cmd_text = entry.last_cmd_text;
                }
            }
        }
    }
    let mut out: Vec<AllowlistEntry> = merged.into_values().collect();
    out.sort_by(|a, b| (&a.agent_id, &a.pattern).cmp(&(&b.agent_id, &b.pattern)));
    out
}

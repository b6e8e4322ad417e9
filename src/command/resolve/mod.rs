//! Program-token resolution.
//!
//! Allowlist entries are keyed by absolute canonical paths, so every
//! segment's program token has to be pinned to the real file it would
//! execute — through cwd, PATH, and symlinks — before any lookup happens.
//! A symlinked alias (`ln -s /usr/bin/dd ~/safe/echo`) therefore matches
//! the target, not the alias.

use crate::policy::Platform;
use crate::utils::{canonicalize_or_normalize, expand_tilde};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResolvedVia {
    #[serde(rename = "absolute")]
    Absolute,
    #[serde(rename = "relative-to-cwd")]
    RelativeToCwd,
    #[serde(rename = "PATH")]
    Path,
    #[serde(rename = "skill-bin")]
    SkillBin,
    #[serde(rename = "safe-bin")]
    SafeBin,
    #[serde(rename = "unresolved")]
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    #[serde(rename = "resolvedPath")]
    pub resolved_path: String,
    #[serde(rename = "resolvedVia")]
    pub resolved_via: ResolvedVia,
}

impl Resolution {
    pub fn is_trusted_bin(&self) -> bool {
        matches!(
            self.resolved_via,
            ResolvedVia::SafeBin | ResolvedVia::SkillBin
        )
    }
}

/// Everything resolution needs from the request and the effective policy.
pub struct ResolveContext<'a> {
    pub cwd: &'a Path,
    pub env: Option<&'a HashMap<String, String>>,
    pub safe_bins: &'a [PathBuf],
    pub skill_bins: &'a HashSet<String>,
    pub auto_allow_skills: bool,
    pub platform: Platform,
}

fn has_drive_prefix(token: &str) -> bool {
    let bytes = token.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn is_executable_file(path: &Path) -> bool {
    let Ok(meta) = path.metadata() else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

fn path_var(ctx: &ResolveContext) -> Option<String> {
    if let Some(env) = ctx.env
        && let Some(path) = env.get("PATH")
    {
        return Some(path.clone());
    }
    std::env::var("PATH").ok()
}

fn search_path(token: &str, ctx: &ResolveContext) -> Option<PathBuf> {
    let path = path_var(ctx)?;
    let separator = match ctx.platform {
        Platform::Windows => ';',
        Platform::Unix => ':',
    };
    for dir in path.split(separator).filter(|d| !d.is_empty()) {
        let candidate = Path::new(dir).join(token);
        if is_executable_file(&candidate) {
            return Some(candidate);
        }
        if ctx.platform == Platform::Windows {
            let exe = Path::new(dir).join(format!("{token}.exe"));
            if is_executable_file(&exe) {
                return Some(exe);
            }
        }
    }
    None
}

/// Apply safe-bin / skill-bin tags to an already-resolved program.
/// Directory trust (safe-bin) wins over name trust (skill-bin).
fn tag(resolved: &Path, token: &str, via: ResolvedVia, ctx: &ResolveContext) -> ResolvedVia {
    if ctx.auto_allow_skills && ctx.skill_bins.contains(token) {
        if parent_is_safe(resolved, ctx) {
            return ResolvedVia::SafeBin;
        }
        return ResolvedVia::SkillBin;
    }
    if parent_is_safe(resolved, ctx) {
        return ResolvedVia::SafeBin;
    }
    via
}

fn parent_is_safe(resolved: &Path, ctx: &ResolveContext) -> bool {
    let Some(parent) = resolved.parent() else {
        return false;
    };
    ctx.safe_bins
        .iter()
        .any(|dir| canonicalize_or_normalize(dir) == parent)
}

/// Resolve a program token to the absolute real path it would execute.
pub fn resolve_program(token: &str, ctx: &ResolveContext) -> Resolution {
    let path_like = token.contains('/')
        || token.contains('\\')
        || token.starts_with('~')
        || (ctx.platform == Platform::Windows && has_drive_prefix(token));

    if path_like {
        let expanded = expand_tilde(token);
        let via = if expanded.is_absolute() || has_drive_prefix(token) {
            ResolvedVia::Absolute
        } else {
            ResolvedVia::RelativeToCwd
        };
        let joined = if expanded.is_absolute() {
            expanded
        } else {
            ctx.cwd.join(expanded)
        };
        let real = canonicalize_or_normalize(&joined);
        if !is_executable_file(&real) {
            return Resolution {
                resolved_path: token.to_string(),
                resolved_via: ResolvedVia::Unresolved,
            };
        }
        let via = tag(&real, token, via, ctx);
        return Resolution {
            resolved_path: real.to_string_lossy().into_owned(),
            resolved_via: via,
        };
    }

    if let Some(found) = search_path(token, ctx) {
        let real = canonicalize_or_normalize(&found);
        let via = tag(&real, token, ResolvedVia::Path, ctx);
        return Resolution {
            resolved_path: real.to_string_lossy().into_owned(),
            resolved_via: via,
        };
    }

    Resolution {
        resolved_path: token.to_string(),
        resolved_via: ResolvedVia::Unresolved,
    }
}

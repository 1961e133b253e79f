//! POSIX mode helpers. Symlinks are treated as opaque: their permission
//! bits are never changed, because chmod on a link mutates the target.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl FromStr for RiskLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            other => Err(anyhow!("unknown risk level: {other}")),
        }
    }
}

/// Octal rendering of the permission bits, e.g. `"644"`.
pub fn mode_octal(mode: u32) -> String {
    format!("{:o}", mode & 0o7777)
}

/// Symbolic rendering of the lower nine bits, e.g. `"rw-r--r--"`.
pub fn mode_symbolic(mode: u32) -> String {
    let mut out = String::with_capacity(9);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

/// Parse an octal mode string such as `"644"` or `"0o644"`.
pub fn parse_mode(raw: &str) -> Result<u32> {
    let trimmed = raw.trim().trim_start_matches("0o");
    let mode = u32::from_str_radix(trimmed, 8)
        .with_context(|| format!("invalid octal mode: {raw}"))?;
    if mode > 0o7777 {
        return Err(anyhow!("mode out of range: {raw}"));
    }
    Ok(mode)
}

pub fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

/// Current permission bits, read without following symlinks.
pub fn current_mode(path: &Path) -> Result<u32> {
    let meta = fs::symlink_metadata(path)
        .with_context(|| format!("stat {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        Ok(meta.permissions().mode() & 0o7777)
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        Ok(0)
    }
}

/// Apply `mode` and verify by reading it back. Refuses symlinks.
pub fn apply_mode(path: &Path, mode: u32) -> Result<()> {
    if is_symlink(path) {
        return Err(anyhow!("refusing to chmod symlink {}", path.display()));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("chmod {:o} on {}", mode, path.display()))?;
        let applied = fs::metadata(path)?.permissions().mode() & 0o7777;
        if applied != mode & 0o7777 {
            return Err(anyhow!(
                "permission verification failed on {}: wanted {:o}, got {:o}",
                path.display(),
                mode,
                applied
            ));
        }
    }
    #[cfg(not(unix))]
    {
        let _ = mode;
    }
    Ok(())
}

/// Default target mode by file type: directories and executables keep the
/// execute bit, everything else becomes owner-write/world-read.
pub fn suggested_mode(path: &Path) -> u32 {
    if path.is_dir() {
        return 0o755;
    }
    #[cfg(unix)]
    {
        if let Ok(mode) = current_mode(path) {
            if mode & 0o100 != 0 {
                return 0o755;
            }
        }
    }
    0o644
}

//! Quarantine for plaintext originals displaced by encryption. Files are
//! **never deleted**, only moved, so a bad password or a corrupted
//! ciphertext can always be recovered from.
//!
//! Layout: {parent_of_original}/.permlock_quarantine/{timestamp}_{filename}

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const QUARANTINE_DIR_NAME: &str = ".permlock_quarantine";

pub struct QuarantineZone {
    root: PathBuf,
}

impl QuarantineZone {
    /// Zone rooted next to `file`, created on demand with owner-only access.
    pub fn for_file(file: &Path) -> Result<Self> {
        let parent = file
            .parent()
            .ok_or_else(|| anyhow!("no parent dir for {}", file.display()))?;
        Self::new(parent.join(QUARANTINE_DIR_NAME))
    }

    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("create quarantine dir {}", root.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&root, fs::Permissions::from_mode(0o700));
        }
        Ok(Self { root })
    }

    /// Move a file into quarantine. Returns the quarantine destination path,
    /// or `None` if the source doesn't exist (already moved).
    pub fn quarantine_file(&self, source: &Path) -> Result<Option<PathBuf>> {
        if !source.exists() {
            info!(path = %source.display(), "quarantine: source already gone, nothing to move");
            return Ok(None);
        }

        let filename = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let ts = Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let dest_name = format!("{}_{}", ts, filename);
        let dest = self.root.join(&dest_name);

        match fs::rename(source, &dest) {
            Ok(()) => {
                info!(
                    from = %source.display(),
                    to = %dest.display(),
                    "original quarantined (moved)"
                );
                Ok(Some(dest))
            }
            Err(rename_err) => {
                // Cross-filesystem rename fails; fall back to copy-then-delete.
                warn!(
                    error = %rename_err,
                    "rename to quarantine failed, trying copy"
                );
                fs::copy(source, &dest)
                    .with_context(|| format!("copy {} to quarantine", source.display()))?;
                let _ = fs::remove_file(source);
                info!(
                    from = %source.display(),
                    to = %dest.display(),
                    "original quarantined (copied)"
                );
                Ok(Some(dest))
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Move a quarantined file back to its original location. Used by pipeline
/// rollback after an encryption step is undone.
pub fn restore_from_quarantine(quarantined: &Path, original: &Path) -> Result<()> {
    if !quarantined.exists() {
        return Err(anyhow!(
            "quarantined copy missing: {}",
            quarantined.display()
        ));
    }
    match fs::rename(quarantined, original) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(quarantined, original)
                .with_context(|| format!("copy {} back from quarantine", quarantined.display()))?;
            let _ = fs::remove_file(quarantined);
            Ok(())
        }
    }
}

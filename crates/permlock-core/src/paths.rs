use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "darklock";
pub const APP_NAME: &str = "permlock";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(override_dir) = std::env::var("PERMLOCK_DATA_DIR") {
        if !override_dir.is_empty() {
            return Ok(PathBuf::from(override_dir));
        }
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn database_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("permlock.db"))
}

pub fn backups_dir() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("backups"))
}

pub fn permission_log_dir() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("permission_logs"))
}

pub fn settings_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("settings.json"))
}

/// Create the data directory tree and clamp it to owner-only access.
pub fn ensure_data_dirs() -> anyhow::Result<()> {
    let data = data_dir()?;
    fs::create_dir_all(&data)?;
    restrict_dir_permissions(&data);
    for dir in [backups_dir()?, permission_log_dir()?] {
        fs::create_dir_all(&dir)?;
        restrict_dir_permissions(&dir);
    }
    Ok(())
}

pub(crate) fn restrict_dir_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o700)) {
            warn!("cannot restrict permissions on {}: {}", path.display(), e);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

pub(crate) fn restrict_file_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if path.exists() {
            if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
                warn!("cannot restrict permissions on {}: {}", path.display(), e);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

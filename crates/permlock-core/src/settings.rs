use crate::paths;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoSettings {
    pub kdf_iterations: u32,
    pub max_file_size_mb: u64,
    #[serde(default)]
    pub quarantine_originals: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub max_attempts: u32,
    pub window_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSettings {
    pub history_limit: usize,
    #[serde(default)]
    pub note_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    pub workers: usize,
    pub encrypt_backups: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermlockSettings {
    pub crypto: CryptoSettings,
    pub rate_limit: RateLimitSettings,
    pub backup: BackupSettings,
    pub pipeline: PipelineSettings,
}

impl Default for PermlockSettings {
    fn default() -> Self {
        Self {
            crypto: CryptoSettings {
                kdf_iterations: 600_000,
                max_file_size_mb: 500,
                quarantine_originals: true,
            },
            rate_limit: RateLimitSettings {
                max_attempts: 5,
                window_seconds: 300,
            },
            backup: BackupSettings {
                history_limit: 50,
                note_prefix: String::new(),
            },
            pipeline: PipelineSettings {
                workers: 4,
                encrypt_backups: false,
            },
        }
    }
}

pub fn load_settings(path: &Path) -> anyhow::Result<PermlockSettings> {
    if path.exists() {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    } else {
        Ok(PermlockSettings::default())
    }
}

pub fn save_settings(path: &Path, settings: &PermlockSettings) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;
    paths::restrict_file_permissions(path);
    Ok(())
}

//! Error taxonomy shared by every engine in the crate.
//!
//! Callers are expected to match on the kind, not on message text; messages
//! exist for humans and logs only.

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum HardenError {
    /// Wrong credential. User-correctable; retry with another password.
    #[error("invalid password")]
    InvalidPassword,

    /// Too many failed attempts inside the trailing window.
    #[error("rate limited; retry in {wait_seconds}s")]
    RateLimited { wait_seconds: u64 },

    /// Ciphertext is corrupted or the cipher failed unexpectedly. Not
    /// user-correctable.
    #[error("decryption failed: {0}")]
    DecryptionError(String),

    /// An archive entry resolved outside the restore root. Always refused,
    /// never retried.
    #[error("path traversal blocked: {path}")]
    PathTraversalBlocked { path: String },

    /// Current on-disk state diverged from a registered baseline.
    #[error("integrity violation on {path}: {detail}")]
    IntegrityViolation { path: String, detail: String },

    /// Post-change content hash diverged without an encryption step to
    /// explain it.
    #[error("data corruption detected on {path}")]
    DataCorruptionDetected { path: String },

    /// Generic per-step pipeline failure carrying the step identity.
    #[error("pipeline step {step} failed: {message}")]
    PipelineStepFailure { step: String, message: String },

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HardenError {
    /// Stable machine-checkable kind string, independent of display text.
    pub fn kind(&self) -> &'static str {
        match self {
            HardenError::InvalidPassword => "invalid_password",
            HardenError::RateLimited { .. } => "rate_limited",
            HardenError::DecryptionError(_) => "decryption_error",
            HardenError::PathTraversalBlocked { .. } => "path_traversal_blocked",
            HardenError::IntegrityViolation { .. } => "integrity_violation",
            HardenError::DataCorruptionDetected { .. } => "data_corruption_detected",
            HardenError::PipelineStepFailure { .. } => "pipeline_step_failure",
            HardenError::Store(_) => "store_error",
            HardenError::Io(_) => "io_error",
        }
    }
}

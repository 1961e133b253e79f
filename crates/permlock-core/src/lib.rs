//! Core engine of the permlock hardening toolkit.
//!
//! Confidentiality, integrity, and availability each map onto a dedicated
//! module family:
//! - `crypto`, `rate_limit`, `quarantine`: password-based file encryption
//!   with persisted attempt throttling and quarantine of plaintext originals
//! - `audit`, `store`: checksummed audit trail, file hash ledger, and CIA
//!   status checks on top of a single SQLite database
//! - `backup`, `pipeline`: tar.gz backups with traversal-guarded restore,
//!   permission snapshots with revert, and the staged hardening pipeline
//!   with ordered rollback
//!
//! All engines share one [`store::Store`] handle and log through one
//! [`audit::AuditLedger`], so every mutation ends up in the same audit
//! trail regardless of which surface triggered it.

pub mod audit;
pub mod backup;
pub mod crypto;
pub mod error;
pub mod paths;
pub mod permissions;
pub mod pipeline;
pub mod quarantine;
pub mod rate_limit;
pub mod settings;
pub mod store;

pub use audit::AuditLedger;
pub use backup::BackupEngine;
pub use crypto::CryptoEngine;
pub use error::HardenError;
pub use pipeline::PermissionPipeline;
pub use rate_limit::RateLimiter;
pub use store::Store;

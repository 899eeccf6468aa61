//! fcrypt-core: shared types, config schema, error types, and port traits
//!
//! Every other fcrypt crate depends on this one. It holds no cryptography
//! and performs no file I/O beyond loading the config.

pub mod config;
pub mod error;
pub mod ports;
pub mod progress;
pub mod types;

pub use config::{DeleteMode, FcryptConfig};
pub use error::{FcryptError, FcryptResult};
pub use ports::{AuditPort, BackupFetch, BackupPort, MetadataPort, PasswordVerifierPort};
pub use progress::{CancellationToken, NoProgress, ProgressPort};
pub use types::*;

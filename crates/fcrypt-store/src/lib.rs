//! fcrypt-store: collaborator implementations for the fcrypt engine
//!
//! - [`JsonMetadataStore`] / [`JsonVerifierStore`]: single JSON document each,
//!   rewritten atomically on every mutation
//! - [`JsonlAuditLog`]: append-only audit rows with a time-window query
//! - [`DirectoryBackup`]: flat mirror directory of ciphertexts
//! - [`memory`]: in-process stores with failure injection

pub mod audit;
pub mod backup;
pub mod json;
pub mod memory;

pub use audit::JsonlAuditLog;
pub use backup::DirectoryBackup;
pub use json::{JsonMetadataStore, JsonVerifierStore};
pub use memory::{MemoryAuditLog, MemoryBackup, MemoryMetadataStore, MemoryVerifierStore};

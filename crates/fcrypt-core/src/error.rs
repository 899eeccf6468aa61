use std::path::PathBuf;
use thiserror::Error;

pub type FcryptResult<T> = Result<T, FcryptError>;

/// Closed set of failures surfaced by the encryption engine.
#[derive(Debug, Error)]
pub enum FcryptError {
    /// Caller-side misuse (bad iteration count, wrong salt length, ...). Never retried.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Password verification or AEAD tag verification failed.
    #[error("authentication failed: wrong password or tampered ciphertext")]
    AuthenticationFailed,

    #[error("file record is not owned by the caller")]
    NotOwner,

    #[error("ciphertext missing: {}", .0.display())]
    CiphertextMissing(PathBuf),

    /// Ciphertext too short to hold a tag, undecodable payload, or unknown algorithm.
    #[error("corrupted: {0}")]
    Corrupted(String),

    #[error("metadata store error: {0}")]
    MetadataError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    /// Failure inside a rekey pipeline; ciphertext and metadata were left untouched.
    #[error("rekey failed: {0}")]
    RekeyFailed(Box<FcryptError>),
}

impl FcryptError {
    /// Stable short name of the error kind, used in reports and audit rows.
    pub fn kind(&self) -> &'static str {
        match self {
            FcryptError::InvalidParameter(_) => "invalid_parameter",
            FcryptError::AuthenticationFailed => "authentication_failed",
            FcryptError::NotOwner => "not_owner",
            FcryptError::CiphertextMissing(_) => "ciphertext_missing",
            FcryptError::Corrupted(_) => "corrupted",
            FcryptError::MetadataError(_) => "metadata_error",
            FcryptError::Io(_) => "io_error",
            FcryptError::Cancelled => "cancelled",
            FcryptError::RekeyFailed(_) => "rekey_failed",
        }
    }

    /// True for wrong-password / bad-tag failures, looking through `RekeyFailed`.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            FcryptError::AuthenticationFailed => true,
            FcryptError::RekeyFailed(inner) => inner.is_auth_failure(),
            _ => false,
        }
    }

    pub fn metadata(err: anyhow::Error) -> Self {
        FcryptError::MetadataError(format!("{err:#}"))
    }

    pub fn rekey(err: FcryptError) -> Self {
        match err {
            FcryptError::Cancelled => FcryptError::Cancelled,
            already @ FcryptError::RekeyFailed(_) => already,
            other => FcryptError::RekeyFailed(Box::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rekey_wrapping() {
        let wrapped = FcryptError::rekey(FcryptError::AuthenticationFailed);
        assert!(matches!(wrapped, FcryptError::RekeyFailed(_)));
        assert!(wrapped.is_auth_failure());
        assert_eq!(wrapped.kind(), "rekey_failed");

        // cancellation is reported as-is, never as a rekey failure
        assert!(matches!(
            FcryptError::rekey(FcryptError::Cancelled),
            FcryptError::Cancelled
        ));

        // no double wrapping
        let twice = FcryptError::rekey(FcryptError::rekey(FcryptError::NotOwner));
        match twice {
            FcryptError::RekeyFailed(inner) => assert!(matches!(*inner, FcryptError::NotOwner)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_metadata_keeps_context_chain() {
        let err = anyhow::anyhow!("disk full").context("writing metadata.json");
        let mapped = FcryptError::metadata(err);
        let msg = mapped.to_string();
        assert!(msg.contains("writing metadata.json"));
        assert!(msg.contains("disk full"));
    }
}

//! Password verifiers: a PBKDF2 tag stored per user, checked in constant time.

use secrecy::SecretString;
use subtle::ConstantTimeEq;

use fcrypt_core::{FcryptError, FcryptResult, UserId, UserKeyVerifier};

use crate::kdf::{derive_key, generate_salt, DEFAULT_ITERATIONS};

/// Build a fresh verifier for `password` (random salt, default iterations).
pub fn create_verifier(owner_id: UserId, password: &SecretString) -> FcryptResult<UserKeyVerifier> {
    let verifier_salt = generate_salt();
    let tag = derive_key(password, &verifier_salt, DEFAULT_ITERATIONS)?;
    Ok(UserKeyVerifier {
        owner_id,
        verifier_salt,
        iteration_count: DEFAULT_ITERATIONS,
        verifier_tag: tag.as_bytes().to_vec(),
    })
}

/// Check `password` against a stored verifier.
///
/// Returns `AuthenticationFailed` on mismatch. A verifier whose iteration
/// count is below the accepted minimum surfaces as `InvalidParameter`.
pub fn verify_password(verifier: &UserKeyVerifier, password: &SecretString) -> FcryptResult<()> {
    let candidate = derive_key(password, &verifier.verifier_salt, verifier.iteration_count)?;
    if bool::from(candidate.as_bytes()[..].ct_eq(&verifier.verifier_tag[..])) {
        Ok(())
    } else {
        tracing::debug!(owner = %verifier.owner_id, "password verification failed");
        Err(FcryptError::AuthenticationFailed)
    }
}

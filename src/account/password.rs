use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::rngs::OsRng;
use tracing::error;

/// Hash a plaintext password into an Argon2 PHC string. The salt is drawn
/// fresh from the OS RNG on every call, so equal inputs produce distinct
/// digests.
pub fn hash_password(plain: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let digest = Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| {
            error!(error = %e, "password hashing failed");
            anyhow::anyhow!("password hashing failed: {e}")
        })?;
    Ok(digest.to_string())
}

/// Check a plaintext password against a stored PHC digest. Argon2 recomputes
/// the hash under the salt and parameters embedded in the digest and compares
/// in constant time. A digest that cannot be parsed is an error, not a
/// mismatch.
pub fn verify_password(plain: &str, digest: &str) -> anyhow::Result<bool> {
    let parsed = PasswordHash::new(digest).map_err(|e| {
        error!(error = %e, "stored password digest is malformed");
        anyhow::anyhow!("malformed password digest: {e}")
    })?;
    Ok(Argon2::default()
        .verify_password(plain.as_bytes(), &parsed)
        .is_ok())
}

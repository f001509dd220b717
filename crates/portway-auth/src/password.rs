//! Tunnel password hashing and verification (Argon2id, PHC strings)

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use thiserror::Error;

/// Longest password accepted for hashing or verification, in bytes
pub const MAX_PASSWORD_BYTES: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PasswordError {
    #[error("Failed to hash password: {0}")]
    HashingFailed(String),

    #[error("Failed to verify password: {0}")]
    VerificationFailed(String),

    #[error("Invalid password hash format: {0}")]
    InvalidHashFormat(String),

    #[error("Password exceeds {MAX_PASSWORD_BYTES} bytes")]
    TooLong,

    #[error("Invalid Argon2 parameters: {0}")]
    InvalidParams(String),
}

/// Argon2id cost parameters used when creating new hashes
///
/// Verification always uses the parameters embedded in the stored hash, so
/// changing these only affects passwords hashed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for HashParams {
    fn default() -> Self {
        Self {
            memory_kib: Params::DEFAULT_M_COST,
            iterations: Params::DEFAULT_T_COST,
            parallelism: Params::DEFAULT_P_COST,
        }
    }
}

impl HashParams {
    /// Cheapest parameters Argon2 accepts. Only meant for tests.
    pub fn minimal() -> Self {
        Self {
            memory_kib: Params::MIN_M_COST,
            iterations: 1,
            parallelism: 1,
        }
    }

    fn hasher(&self) -> Result<Argon2<'static>, PasswordError> {
        let params = Params::new(self.memory_kib, self.iterations, self.parallelism, None)
            .map_err(|e| PasswordError::InvalidParams(e.to_string()))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

/// Hash a password with the default Argon2id parameters
pub fn hash_password(password: &str) -> Result<String, PasswordError> {
    hash_password_with(password, &HashParams::default())
}

/// Hash a password with explicit cost parameters and a fresh random salt
pub fn hash_password_with(password: &str, params: &HashParams) -> Result<String, PasswordError> {
    if password.len() > MAX_PASSWORD_BYTES {
        return Err(PasswordError::TooLong);
    }

    let salt = SaltString::generate(&mut OsRng);
    let hash = params
        .hasher()?
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| PasswordError::HashingFailed(e.to_string()))?;

    Ok(hash.to_string())
}

/// Check `password` against a stored PHC hash
///
/// Returns `Ok(false)` for a mismatch (including over-long input) and `Err`
/// only when the stored hash itself is unusable.
pub fn verify_password(password: &str, hash: &str) -> Result<bool, PasswordError> {
    let parsed =
        PasswordHash::new(hash).map_err(|e| PasswordError::InvalidHashFormat(e.to_string()))?;

    if password.len() > MAX_PASSWORD_BYTES {
        return Ok(false);
    }

    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(PasswordError::VerificationFailed(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_hash(password: &str) -> String {
        hash_password_with(password, &HashParams::minimal()).unwrap()
    }

    #[test]
    fn test_default_hash_is_argon2id_phc() {
        let hash = hash_password("s3cret").unwrap();
        assert!(hash.starts_with("$argon2id$v=19$"));
        assert!(hash.contains(&format!("m={}", Params::DEFAULT_M_COST)));
        assert!(verify_password("s3cret", &hash).unwrap());
    }

    #[test]
    fn test_verify_match_and_mismatch() {
        let hash = quick_hash("tunnel-pass");
        assert!(verify_password("tunnel-pass", &hash).unwrap());
        assert!(!verify_password("Tunnel-pass", &hash).unwrap());
        assert!(!verify_password("", &hash).unwrap());
    }

    #[test]
    fn test_salts_are_random() {
        let a = quick_hash("same");
        let b = quick_hash("same");
        assert_ne!(a, b);
        assert!(verify_password("same", &a).unwrap());
        assert!(verify_password("same", &b).unwrap());
    }

    #[test]
    fn test_garbage_hash_is_an_error() {
        assert!(matches!(
            verify_password("x", "plaintext-password"),
            Err(PasswordError::InvalidHashFormat(_))
        ));
    }

    #[test]
    fn test_length_limit() {
        let long = "a".repeat(MAX_PASSWORD_BYTES + 1);
        assert_eq!(
            hash_password_with(&long, &HashParams::minimal()),
            Err(PasswordError::TooLong)
        );

        let hash = quick_hash("short");
        assert!(!verify_password(&long, &hash).unwrap());
    }

    #[test]
    fn test_invalid_params_rejected() {
        let params = HashParams {
            memory_kib: 1,
            iterations: 0,
            parallelism: 1,
        };
        assert!(matches!(
            hash_password_with("x", &params),
            Err(PasswordError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_unicode_password() {
        let hash = quick_hash("пароль🔐");
        assert!(verify_password("пароль🔐", &hash).unwrap());
    }
}

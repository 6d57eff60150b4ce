//! bcrypt password hashing.

/// Cost used for newly stored hashes.
pub const BCRYPT_COST: u32 = bcrypt::DEFAULT_COST;

/// Minimum accepted password length (chars).
pub const MIN_PASSWORD_LENGTH: usize = 8;

pub fn hash_password(password: &str) -> Result<String, bcrypt::BcryptError> {
    bcrypt::hash(password, BCRYPT_COST)
}

/// Constant-time check of a password against a stored bcrypt hash.
/// A malformed hash counts as a mismatch.
pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

use uuid::Uuid;

use crate::error::BackendError;

pub const MIN_PASSWORD_LEN: usize = 6;

/// Checks applied by every provider before an account is created.
pub fn check_new_account(email: &str, password: &str) -> Result<(), BackendError> {
    let well_formed = email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if !well_formed || email.contains(char::is_whitespace) {
        return Err(BackendError::InvalidEmail(email.to_owned()));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(BackendError::WeakPassword(MIN_PASSWORD_LEN));
    }
    Ok(())
}

pub fn new_salt() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher.finalize().to_hex().to_string()
}

pub fn verify_password(salt: &str, password: &str, expected_hash: &str) -> bool {
    hash_password(salt, password) == expected_hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_email_and_short_password() {
        assert_eq!(
            check_new_account("nobody", "secret1"),
            Err(BackendError::InvalidEmail("nobody".into()))
        );
        assert_eq!(
            check_new_account("a@example.com", "12345"),
            Err(BackendError::WeakPassword(MIN_PASSWORD_LEN))
        );
        assert!(check_new_account("a@example.com", "123456").is_ok());
    }

    #[test]
    fn hashes_depend_on_salt() {
        let a = hash_password("s1", "hunter22");
        let b = hash_password("s2", "hunter22");
        assert_ne!(a, b);
        assert!(verify_password("s1", "hunter22", &a));
        assert!(!verify_password("s1", "hunter23", &a));
    }
}

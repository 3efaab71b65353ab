//! Random item identifiers and owner tokens.

use rand::{distributions::Alphanumeric, Rng};

/// Length of the public item id.
pub const ID_LENGTH: usize = 12;

/// Length of the secret owner token.
pub const OWNER_LENGTH: usize = 32;

/// Generate a random alphanumeric token from the OS-seeded CSPRNG.
pub fn generate(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Returns true if `token` could have been produced by [`generate`].
pub fn is_valid(token: &str, length: usize) -> bool {
    token.len() == length && token.bytes().all(|c| c.is_ascii_alphanumeric())
}

/// Compare two secrets without an early exit on the first mismatch.
pub fn ct_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate() {
        let id = generate(ID_LENGTH);
        assert!(is_valid(&id, ID_LENGTH));
        assert!(!is_valid(&id, OWNER_LENGTH));
        assert_ne!(generate(OWNER_LENGTH), generate(OWNER_LENGTH));
    }

    #[test]
    fn test_is_valid() {
        assert!(is_valid("abcDEF123456", ID_LENGTH));
        assert!(!is_valid("abcDEF12345", ID_LENGTH));
        assert!(!is_valid("../etc/passw", ID_LENGTH));
        assert!(!is_valid("abcDEF12345.", ID_LENGTH));
    }

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq("secret", "secret"));
        assert!(!ct_eq("secret", "secreT"));
        assert!(!ct_eq("secret", "secrets"));
        assert!(ct_eq("", ""));
    }
}

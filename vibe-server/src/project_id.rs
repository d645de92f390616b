//! Project ids.
//!
//! An id doubles as the subdomain a project is served from, so it is limited
//! to what a single DNS label allows, minus uppercase and hyphens:
//! `[a-z0-9]{1,63}`.

use rand::Rng;

const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Length of generated ids.
pub const LEN: usize = 12;

/// Longest id that still fits in one host label.
pub const MAX_LEN: usize = 63;

/// Labels that belong to the platform itself and never name a project.
pub const RESERVED: &[&str] = &["www", "api"];

/// Generate a new random id.
pub fn generate() -> String {
    let mut rng = rand::thread_rng();
    (0..LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Whether `id` is acceptable as a project id.
pub fn is_valid(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        && !RESERVED.contains(&id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_valid_and_distinct() {
        let a = generate();
        let b = generate();
        assert_eq!(a.len(), LEN);
        assert!(is_valid(&a), "{a}");
        assert!(is_valid(&b), "{b}");
        assert_ne!(a, b);
    }

    #[test]
    fn validation() {
        assert!(is_valid("abc123"));
        assert!(is_valid("7"));
        assert!(is_valid(&"a".repeat(MAX_LEN)));
        assert!(!is_valid(""));
        assert!(!is_valid(&"a".repeat(MAX_LEN + 1)));
        assert!(!is_valid("ABC"));
        assert!(!is_valid("my-site"));
        assert!(!is_valid("a.b"));
        assert!(!is_valid("../x"));
        assert!(!is_valid("www"));
    }
}

//! Hashing and generation of one-time secrets.
//!
//! Refresh tokens, verification links, reset links and OTPs are only ever
//! stored as SHA-256 hex digests.

use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// SHA-256 of `input`, hex-encoded.
#[must_use]
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// `len` random bytes, hex-encoded.
#[must_use]
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// A six-digit numeric one-time password.
#[must_use]
pub fn random_otp() -> String {
    rand::thread_rng().gen_range(100_000..=999_999).to_string()
}

/// Constant-time string comparison.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_random_hex_length() {
        let secret = random_hex(20);
        assert_eq!(secret.len(), 40);
        assert_ne!(secret, random_hex(20));
    }

    #[test]
    fn test_random_otp_is_six_digits() {
        for _ in 0..100 {
            let otp = random_otp();
            assert_eq!(otp.len(), 6);
            assert!(otp.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(constant_time_eq("", ""));
        assert!(!constant_time_eq(&sha256_hex("a"), &sha256_hex("b")));
    }
}

//! §4.1 Token Mint: opaque, cryptographically strong, URL-safe tokens and a
//! constant-time comparator so presented tokens never leak timing info.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use subtle::ConstantTimeEq;

use crate::constants::TOKEN_BYTES;

pub struct TokenMint;

impl TokenMint {
    /// Mint a fresh opaque token with at least 128 bits of entropy.
    pub fn mint() -> String {
        URL_SAFE_NO_PAD.encode(Self::random_bytes(TOKEN_BYTES))
    }

    /// Constant-time equality, used for every lookup of a presented token
    /// against a stored one.
    pub fn constant_time_equal(a: &str, b: &str) -> bool {
        a.as_bytes().ct_eq(b.as_bytes()).into()
    }

    pub(crate) fn random_bytes(len: usize) -> Vec<u8> {
        let mut rng = rand::rng();
        let mut bytes = vec![0u8; len];
        rng.fill(bytes.as_mut_slice());
        bytes
    }

    /// A short, non-secret random identifier — used for `Server::cookie_name`
    /// defaults (§6 "Defaults"), not for authentication.
    pub fn short_identifier() -> String {
        URL_SAFE_NO_PAD.encode(Self::random_bytes(6))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_is_url_safe_and_long_enough() {
        let token = TokenMint::mint();
        assert!(token.len() >= 22); // 24 bytes base64, no padding
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn mint_produces_distinct_tokens() {
        let a = TokenMint::mint();
        let b = TokenMint::mint();
        assert_ne!(a, b);
    }

    #[test]
    fn constant_time_equal_matches_string_equality() {
        let token = TokenMint::mint();
        assert!(TokenMint::constant_time_equal(&token, &token));
        assert!(!TokenMint::constant_time_equal(&token, "not-the-token"));
    }
}

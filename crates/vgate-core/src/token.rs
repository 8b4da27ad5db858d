//! Console access tokens.
//!
//! A token is an opaque random value bound to exactly one target identifier
//! for a bounded window. Timestamps are unix milliseconds so sub-second TTLs
//! behave the same in every store backend.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Number of random bytes in a token value (hex-encoded to 64 chars).
pub const TOKEN_BYTES: usize = 32;

/// An issued grant. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub value: String,
    pub target_id: String,
    pub created_at: u64,
    pub expires_at: u64,
}

impl Token {
    /// Build a fresh token for `target_id` valid for `ttl` from now.
    pub fn issue(target_id: &str, ttl: Duration) -> Self {
        Self::issue_at(target_id, ttl, unix_millis())
    }

    /// Build a token with an explicit creation time.
    pub fn issue_at(target_id: &str, ttl: Duration, now_ms: u64) -> Self {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        Self {
            value: generate_token_value(),
            target_id: target_id.to_string(),
            created_at: now_ms,
            expires_at: now_ms.saturating_add(ttl_ms),
        }
    }

    /// A token is expired once the clock reaches `expires_at`.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }

    /// Whole seconds remaining at `now_ms` (rounded up, zero once expired).
    pub fn expires_in_secs(&self, now_ms: u64) -> u64 {
        self.expires_at.saturating_sub(now_ms).div_ceil(1000)
    }
}

/// Generate a token value from the thread-local CSPRNG.
pub fn generate_token_value() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Current wall-clock time in unix milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Short prefix safe to put in logs.
pub fn token_prefix(value: &str) -> &str {
    let end = value
        .char_indices()
        .nth(8)
        .map_or(value.len(), |(idx, _)| idx);
    &value[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn values_are_hex_and_unique() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let v = generate_token_value();
            assert_eq!(v.len(), TOKEN_BYTES * 2);
            assert!(v.chars().all(|c| c.is_ascii_hexdigit()));
            assert!(seen.insert(v), "token value collided");
        }
    }

    #[test]
    fn expiry_boundary_is_exclusive() {
        let token = Token::issue_at("vm1", Duration::from_secs(10), 1_000);
        assert_eq!(token.expires_at, 11_000);
        assert!(!token.is_expired_at(10_999));
        assert!(token.is_expired_at(11_000));
    }

    #[test]
    fn expires_in_rounds_up() {
        let token = Token::issue_at("vm1", Duration::from_millis(1500), 0);
        assert_eq!(token.expires_in_secs(0), 2);
        assert_eq!(token.expires_in_secs(1_000), 1);
        assert_eq!(token.expires_in_secs(5_000), 0);
    }

    #[test]
    fn prefix_handles_short_values() {
        assert_eq!(token_prefix("abc"), "abc");
        assert_eq!(token_prefix("0123456789abcdef"), "01234567");
    }

    #[test]
    fn serializes_camel_case() {
        let token = Token::issue_at("vm1", Duration::from_secs(1), 0);
        let json = serde_json::to_value(&token).unwrap();
        assert_eq!(json["targetId"], "vm1");
        assert_eq!(json["expiresAt"], 1000);
    }
}

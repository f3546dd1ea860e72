// =============================================================================
// Tier Resolution — token-based subscription tiers
// =============================================================================
//
// Subscribers pass an optional token on the WebSocket upgrade
// (`/api/v1/ws?token=<token>`). The token is matched against the
// `MERIDIAN_PRO_TOKEN` and `MERIDIAN_PLUS_TOKEN` environment variables;
// no match (or no token) means the free tier. Comparison is performed in
// constant time to prevent timing side-channels. An unknown token is not an
// error — the connection proceeds at the free tier.
// =============================================================================

use tracing::debug;

use crate::types::Tier;

const PRO_TOKEN_ENV: &str = "MERIDIAN_PRO_TOKEN";
const PLUS_TOKEN_ENV: &str = "MERIDIAN_PLUS_TOKEN";

/// Compare two byte slices in constant time. The comparison examines every
/// byte even when a mismatch is found early.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Resolve a subscriber's tier from an optional upgrade token.
///
/// Tokens are read from the environment on every call so rotation does not
/// require a restart. An unset variable disables its tier.
pub fn resolve_tier(token: Option<&str>) -> Tier {
    let Some(token) = token else {
        return Tier::Free;
    };
    if token.is_empty() {
        return Tier::Free;
    }

    if matches_env_token(token, PRO_TOKEN_ENV) {
        return Tier::Pro;
    }
    if matches_env_token(token, PLUS_TOKEN_ENV) {
        return Tier::Plus;
    }

    debug!("unrecognised subscriber token, defaulting to free tier");
    Tier::Free
}

fn matches_env_token(token: &str, env_var: &str) -> bool {
    let expected = std::env::var(env_var).unwrap_or_default();
    !expected.is_empty() && constant_time_eq(token.as_bytes(), expected.as_bytes())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_identical() {
        assert!(constant_time_eq(b"hello", b"hello"));
    }

    #[test]
    fn constant_time_eq_different() {
        assert!(!constant_time_eq(b"hello", b"world"));
    }

    #[test]
    fn constant_time_eq_different_lengths() {
        assert!(!constant_time_eq(b"short", b"longer_string"));
    }

    #[test]
    fn constant_time_eq_empty() {
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn missing_token_is_free_tier() {
        assert_eq!(resolve_tier(None), Tier::Free);
        assert_eq!(resolve_tier(Some("")), Tier::Free);
    }

    // Env-var matching is covered manually: the test binary shares process
    // environment across threads, so setting vars here would race with the
    // cases above.
}

//! Environment variable helpers
//!
//! Config structs read their `CQRPC_*` overrides through these, e.g.
//!
//! ```ignore
//! let queues: usize = env_get("CQRPC_NUM_QUEUES", defaults::NUM_QUEUES);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, falling back to `default` when unset or malformed.
#[inline]
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    env_get_opt(key).unwrap_or(default)
}

/// `Some(T)` if `key` is set and parses.
#[inline]
pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean flag. "1", "true", "yes", "on" are true and "0", "false", "no",
/// "off" are false (case-insensitive); anything else yields `default`.
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Duration given in milliseconds.
pub fn env_get_millis(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key).map(Duration::from_millis).unwrap_or(default)
}

#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var_os(key).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_uses_default() {
        let v: usize = env_get("__CQRPC_TEST_UNSET__", 7);
        assert_eq!(v, 7);
        assert!(env_get_opt::<u32>("__CQRPC_TEST_UNSET__").is_none());
        assert!(env_get_bool("__CQRPC_TEST_UNSET__", true));
        assert!(!env_is_set("__CQRPC_TEST_UNSET__"));
    }

    #[test]
    fn test_parse_set_values() {
        std::env::set_var("__CQRPC_TEST_NUM__", " 12 ");
        assert_eq!(env_get("__CQRPC_TEST_NUM__", 0usize), 12);
        std::env::remove_var("__CQRPC_TEST_NUM__");

        std::env::set_var("__CQRPC_TEST_BAD__", "twelve");
        assert_eq!(env_get("__CQRPC_TEST_BAD__", 3u8), 3);
        std::env::remove_var("__CQRPC_TEST_BAD__");
    }

    #[test]
    fn test_bool_variants() {
        for (raw, expect) in [("YES", true), ("on", true), ("0", false), ("Off", false)] {
            std::env::set_var("__CQRPC_TEST_BOOL__", raw);
            assert_eq!(env_get_bool("__CQRPC_TEST_BOOL__", !expect), expect);
        }
        std::env::set_var("__CQRPC_TEST_BOOL__", "maybe");
        assert!(env_get_bool("__CQRPC_TEST_BOOL__", true));
        std::env::remove_var("__CQRPC_TEST_BOOL__");
    }

    #[test]
    fn test_millis() {
        std::env::set_var("__CQRPC_TEST_MS__", "250");
        assert_eq!(
            env_get_millis("__CQRPC_TEST_MS__", Duration::ZERO),
            Duration::from_millis(250)
        );
        std::env::remove_var("__CQRPC_TEST_MS__");
    }
}

//! Environment variable helpers
//!
//! Every runtime knob can be overridden from the environment with an
//! `FIO_` prefixed variable. These helpers parse such variables and fall
//! back to a default when the variable is unset or malformed.
//!
//! ```ignore
//! use fiberio_core::env::{env_get, env_get_bool, env_get_ms};
//!
//! let threads: usize = env_get("FIO_THREADS", 1);
//! let debug = env_get_bool("FIO_DEBUG", false);
//! let connect = env_get_ms("FIO_CONNECT_TIMEOUT_MS", 5000);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, or return `default`
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T` if it is set and well formed
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean variable
///
/// "1", "true", "yes" and "on" (any case) are true, "0", "false", "no"
/// and "off" are false. Anything else, including unset, yields `default`.
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Millisecond duration
///
/// A value of `-1` (or any negative number) means "no timeout" and
/// yields `None`, same as a `default` of `None`.
pub fn env_get_ms(key: &str, default: Option<u64>) -> Option<Duration> {
    let ms = match env_get_opt::<i64>(key) {
        Some(v) if v < 0 => None,
        Some(v) => Some(v as u64),
        None => default,
    };
    ms.map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__FIO_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        let opt: Option<u32> = env_get_opt("__FIO_TEST_UNSET__");
        assert!(opt.is_none());
    }

    #[test]
    fn test_env_get_parses_trimmed() {
        std::env::set_var("__FIO_TEST_NUM__", " 123 ");
        let val: usize = env_get("__FIO_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__FIO_TEST_NUM__");
    }

    #[test]
    fn test_env_get_invalid_falls_back() {
        std::env::set_var("__FIO_TEST_BAD__", "twelve");
        let val: usize = env_get("__FIO_TEST_BAD__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__FIO_TEST_BAD__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        let key = "__FIO_TEST_BOOL__";
        for v in ["1", "true", "TRUE", "yes", "on"] {
            std::env::set_var(key, v);
            assert!(env_get_bool(key, false), "{v}");
        }
        for v in ["0", "false", "No", "off"] {
            std::env::set_var(key, v);
            assert!(!env_get_bool(key, true), "{v}");
        }
        std::env::set_var(key, "maybe");
        assert!(env_get_bool(key, true));
        assert!(!env_get_bool(key, false));
        std::env::remove_var(key);
    }

    #[test]
    fn test_env_get_ms() {
        let key = "__FIO_TEST_MS__";
        assert_eq!(env_get_ms(key, Some(5000)), Some(Duration::from_millis(5000)));
        assert_eq!(env_get_ms(key, None), None);

        std::env::set_var(key, "250");
        assert_eq!(env_get_ms(key, None), Some(Duration::from_millis(250)));

        std::env::set_var(key, "-1");
        assert_eq!(env_get_ms(key, Some(10)), None);
        std::env::remove_var(key);
    }
}

//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Largest accepted `JOBQUEUE_CLAIM_BACKOFF_MS`.
pub const MAX_CLAIM_BACKOFF_MS: u64 = 60_000;

/// How hard `claim_job` tries before reporting contention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimPolicy {
    /// Conditional-update attempts per claim (at least 1).
    pub max_attempts: u32,
    /// Base delay between attempts; grows linearly and gets random jitter.
    pub backoff_base: Duration,
}

impl Default for ClaimPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            backoff_base: Duration::from_millis(5),
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// HTTP listen address.
    pub bind: String,
    /// HTTP listen port.
    pub port: u16,
    pub claim: ClaimPolicy,
    /// Directory for daily-rolling log files (disabled when `None`).
    pub log_dir: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/jobqueue.db"),
            bind: "0.0.0.0".to_string(),
            port: 8080,
            claim: ClaimPolicy::default(),
            log_dir: None,
        }
    }
}

impl QueueConfig {
    /// Build config from `JOBQUEUE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable source. Unset variables keep
    /// their defaults; set but unparseable ones are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_attempts: u32 = parse_var(&lookup, "JOBQUEUE_CLAIM_MAX_ATTEMPTS")?
            .unwrap_or(defaults.claim.max_attempts);
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "JOBQUEUE_CLAIM_MAX_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let backoff_ms: Option<u64> = parse_var(&lookup, "JOBQUEUE_CLAIM_BACKOFF_MS")?;
        if backoff_ms.is_some_and(|ms| ms > MAX_CLAIM_BACKOFF_MS) {
            return Err(ConfigError::InvalidValue {
                key: "JOBQUEUE_CLAIM_BACKOFF_MS".to_string(),
                message: format!("must be at most {MAX_CLAIM_BACKOFF_MS}"),
            });
        }
        let backoff_base = backoff_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.claim.backoff_base);

        Ok(Self {
            db_path: lookup("JOBQUEUE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            bind: lookup("JOBQUEUE_BIND").unwrap_or(defaults.bind),
            port: parse_var(&lookup, "JOBQUEUE_PORT")?.unwrap_or(defaults.port),
            claim: ClaimPolicy {
                max_attempts,
                backoff_base,
            },
            log_dir: lookup("JOBQUEUE_LOG_DIR")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
        })
    }

    /// `bind:port`, for the TCP listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = QueueConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.db_path, PathBuf::from("./data/jobqueue.db"));
        assert_eq!(config.listen_addr(), "0.0.0.0:8080");
        assert_eq!(config.claim, ClaimPolicy::default());
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn overrides_from_variables() {
        let config = QueueConfig::from_lookup(lookup_from(&[
            ("JOBQUEUE_DB_PATH", "/tmp/q.db"),
            ("JOBQUEUE_BIND", "127.0.0.1"),
            ("JOBQUEUE_PORT", "9000"),
            ("JOBQUEUE_CLAIM_MAX_ATTEMPTS", "3"),
            ("JOBQUEUE_CLAIM_BACKOFF_MS", "20"),
            ("JOBQUEUE_LOG_DIR", "/var/log/jobqueue"),
        ]))
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/q.db"));
        assert_eq!(config.listen_addr(), "127.0.0.1:9000");
        assert_eq!(config.claim.max_attempts, 3);
        assert_eq!(config.claim.backoff_base, Duration::from_millis(20));
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/jobqueue")));
    }

    #[test]
    fn bad_port_names_the_variable() {
        let err = QueueConfig::from_lookup(lookup_from(&[("JOBQUEUE_PORT", "http")])).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "JOBQUEUE_PORT"),
            other => panic!("Expected InvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn zero_claim_attempts_rejected() {
        let err = QueueConfig::from_lookup(lookup_from(&[("JOBQUEUE_CLAIM_MAX_ATTEMPTS", "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("JOBQUEUE_CLAIM_MAX_ATTEMPTS"));
    }

    #[test]
    fn oversized_backoff_rejected() {
        let err = QueueConfig::from_lookup(lookup_from(&[(
            "JOBQUEUE_CLAIM_BACKOFF_MS",
            "18446744073709551615",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("JOBQUEUE_CLAIM_BACKOFF_MS"));

        let config = QueueConfig::from_lookup(lookup_from(&[(
            "JOBQUEUE_CLAIM_BACKOFF_MS",
            "60000",
        )]))
        .unwrap();
        assert_eq!(config.claim.backoff_base, Duration::from_millis(MAX_CLAIM_BACKOFF_MS));
    }
}

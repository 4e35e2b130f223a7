/**
 * Configuration constants and process-wide defaults for queries and cache groups
 */
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Upper bound for per-key cache capacity
pub const MAX_CACHING: usize = 50;

/// Default cache capacity (0 = single-slot mode, only the initial snapshot)
pub const DEFAULT_CACHING: usize = 0;

/// Default number of retries after the first failed attempt
pub const DEFAULT_RETRY: u32 = 2;

/// Default delay between retries in seconds
pub const DEFAULT_RETRY_DELAY_SECONDS: u64 = 3;

/// Default staleness window in seconds
pub const DEFAULT_STALE_TIME_SECONDS: u64 = 60;

/// Shortest accepted refetch interval in seconds
pub const MIN_REFETCH_INTERVAL_SECONDS: u64 = 2;

/// Online signal must hold this long before a reconnect refetch
pub const DEFAULT_MIN_VALID_RECONNECT_SECONDS: u64 = 12;

/// Window-active signal must hold this long before a focus refetch
pub const DEFAULT_MIN_VALID_FOCUS_SECONDS: u64 = 60;

/// Interval re-check period while refetches are suppressed in background mode
pub const DEFAULT_BACKGROUND_RECHECK_SECONDS: u64 = 300;

/// Default equality depth for `select` streams
pub const DEFAULT_SELECT_DEPTH: usize = 1;

/// Default equality depth for `status` streams
pub const DEFAULT_STATUS_DEPTH: usize = 2;

/// Param field whose value, when present, is used as the cache key as-is
pub const CACHING_KEY_FIELD: &str = "caching_key";

/// Environment variables read by [`Defaults::from_env`]
pub const ENV_RETRY: &str = "QUERYCACHE_RETRY";
pub const ENV_RETRY_DELAY: &str = "QUERYCACHE_RETRY_DELAY_SECS";
pub const ENV_STALE_TIME: &str = "QUERYCACHE_STALE_TIME_SECS";
pub const ENV_MAX_CACHING: &str = "QUERYCACHE_MAX_CACHING";
pub const ENV_MIN_VALID_RECONNECT: &str = "QUERYCACHE_MIN_VALID_RECONNECT_SECS";
pub const ENV_MIN_VALID_FOCUS: &str = "QUERYCACHE_MIN_VALID_FOCUS_SECS";
pub const ENV_BACKGROUND_RECHECK: &str = "QUERYCACHE_BACKGROUND_RECHECK_SECS";

static GLOBAL_DEFAULTS: OnceLock<Defaults> = OnceLock::new();

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DefaultsError {
    #[error("{name} must be a non-negative integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },

    #[error("{name} must be at most {max}, got {value}")]
    OutOfRange {
        name: &'static str,
        value: u64,
        max: u64,
    },

    #[error("defaults are already installed")]
    AlreadyInstalled,
}

/// Tunables applied to every option a query leaves unset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defaults {
    pub max_caching: usize,
    pub caching: usize,
    pub retry: u32,
    pub retry_delay: Duration,
    pub stale_time: Duration,
    pub min_refetch_interval: Duration,
    pub min_valid_reconnect_time: Duration,
    pub min_valid_focus_time: Duration,
    pub background_recheck: Duration,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            max_caching: MAX_CACHING,
            caching: DEFAULT_CACHING,
            retry: DEFAULT_RETRY,
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECONDS),
            stale_time: Duration::from_secs(DEFAULT_STALE_TIME_SECONDS),
            min_refetch_interval: Duration::from_secs(MIN_REFETCH_INTERVAL_SECONDS),
            min_valid_reconnect_time: Duration::from_secs(DEFAULT_MIN_VALID_RECONNECT_SECONDS),
            min_valid_focus_time: Duration::from_secs(DEFAULT_MIN_VALID_FOCUS_SECONDS),
            background_recheck: Duration::from_secs(DEFAULT_BACKGROUND_RECHECK_SECONDS),
        }
    }
}

impl Defaults {
    /// Built-in defaults overlaid with `QUERYCACHE_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but is not a valid number
    pub fn from_env() -> Result<Self, DefaultsError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`Defaults::from_env`] with a custom variable source
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but is not a valid number
    pub fn from_lookup<F>(lookup: F) -> Result<Self, DefaultsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut defaults = Self::default();
        let read = |name: &'static str| -> Result<Option<u64>, DefaultsError> {
            lookup(name)
                .map(|raw| {
                    raw.trim()
                        .parse::<u64>()
                        .map_err(|_| DefaultsError::InvalidNumber { name, value: raw })
                })
                .transpose()
        };

        if let Some(retry) = read(ENV_RETRY)? {
            defaults.retry = u32::try_from(retry).map_err(|_| DefaultsError::OutOfRange {
                name: ENV_RETRY,
                value: retry,
                max: u64::from(u32::MAX),
            })?;
        }
        if let Some(secs) = read(ENV_RETRY_DELAY)? {
            defaults.retry_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = read(ENV_STALE_TIME)? {
            defaults.stale_time = Duration::from_secs(secs);
        }
        if let Some(max) = read(ENV_MAX_CACHING)? {
            if max > MAX_CACHING as u64 {
                return Err(DefaultsError::OutOfRange {
                    name: ENV_MAX_CACHING,
                    value: max,
                    max: MAX_CACHING as u64,
                });
            }
            defaults.max_caching = usize::try_from(max).unwrap_or(MAX_CACHING);
        }
        if let Some(secs) = read(ENV_MIN_VALID_RECONNECT)? {
            defaults.min_valid_reconnect_time = Duration::from_secs(secs);
        }
        if let Some(secs) = read(ENV_MIN_VALID_FOCUS)? {
            defaults.min_valid_focus_time = Duration::from_secs(secs);
        }
        if let Some(secs) = read(ENV_BACKGROUND_RECHECK)? {
            defaults.background_recheck = Duration::from_secs(secs);
        }
        Ok(defaults)
    }

    /// Install process-wide defaults. Only the first call wins.
    ///
    /// # Errors
    ///
    /// Returns an error if defaults were already installed or read
    pub fn install(defaults: Self) -> Result<(), DefaultsError> {
        GLOBAL_DEFAULTS.set(defaults).map_err(|_| {
            warn!("Query defaults already installed, ignoring new values");
            DefaultsError::AlreadyInstalled
        })?;
        info!("Query defaults installed");
        Ok(())
    }

    /// Process-wide defaults, read from the environment on first use
    pub fn global() -> &'static Self {
        GLOBAL_DEFAULTS.get_or_init(|| {
            Self::from_env().unwrap_or_else(|e| {
                warn!("Ignoring query defaults from environment: {e}");
                Self::default()
            })
        })
    }
}

/// Validate configuration constants at compile time
const _: () = {
    assert!(MAX_CACHING > 0, "MAX_CACHING must be greater than 0");
    assert!(DEFAULT_CACHING <= MAX_CACHING, "DEFAULT_CACHING must not exceed MAX_CACHING");
    assert!(MIN_REFETCH_INTERVAL_SECONDS > 0, "MIN_REFETCH_INTERVAL_SECONDS must be greater than 0");
    assert!(DEFAULT_BACKGROUND_RECHECK_SECONDS > 0, "DEFAULT_BACKGROUND_RECHECK_SECONDS must be greater than 0");
    assert!(DEFAULT_SELECT_DEPTH > 0, "DEFAULT_SELECT_DEPTH must be greater than 0");
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_match_constants() {
        let d = Defaults::default();
        assert_eq!(d.retry, 2);
        assert_eq!(d.retry_delay, Duration::from_secs(3));
        assert_eq!(d.stale_time, Duration::from_secs(60));
        assert_eq!(d.caching, 0);
        assert_eq!(d.max_caching, 50);
        assert_eq!(d.min_valid_reconnect_time, Duration::from_secs(12));
        assert_eq!(d.min_valid_focus_time, Duration::from_secs(60));
    }

    #[test]
    fn test_env_overlay() {
        let d = Defaults::from_lookup(lookup(&[(ENV_RETRY, "5"), (ENV_STALE_TIME, " 10 ")])).unwrap();
        assert_eq!(d.retry, 5);
        assert_eq!(d.stale_time, Duration::from_secs(10));
        assert_eq!(d.retry_delay, Duration::from_secs(3));
    }

    #[test]
    fn test_env_rejects_garbage() {
        let err = Defaults::from_lookup(lookup(&[(ENV_RETRY_DELAY, "soon")])).unwrap_err();
        assert!(matches!(err, DefaultsError::InvalidNumber { .. }));

        let err = Defaults::from_lookup(lookup(&[(ENV_MAX_CACHING, "51")])).unwrap_err();
        assert!(matches!(err, DefaultsError::OutOfRange { .. }));
    }
}

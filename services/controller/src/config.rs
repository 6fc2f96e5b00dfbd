//! Configuration for the appscaler controller.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use appscaler_reconcile::{
    DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_RECONCILE_INTERVAL, DEFAULT_RESYNC_INTERVAL,
};

/// Controller configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Number of concurrent reconcile workers.
    pub workers: usize,

    /// Requeue delay after a successful pass.
    pub requeue_interval: Duration,

    /// Interval between full resyncs of every AppScaler.
    pub resync_interval: Duration,

    /// First retry delay after a failed pass.
    pub backoff_base: Duration,

    /// Ceiling for the retry delay.
    pub backoff_max: Duration,

    /// Optional JSON file used to seed the in-memory store.
    pub state_file: Option<PathBuf>,

    /// How long to wait for tasks to stop on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            workers: 2,
            requeue_interval: DEFAULT_RECONCILE_INTERVAL,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            state_file: None,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let log_level = lookup("APPSCALER_LOG_LEVEL").unwrap_or(defaults.log_level);

        let workers = parse_var(&lookup, "APPSCALER_WORKERS")?.unwrap_or(defaults.workers);
        if workers == 0 {
            bail!("APPSCALER_WORKERS must be at least 1");
        }

        let requeue_interval = parse_var(&lookup, "APPSCALER_REQUEUE_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.requeue_interval);
        if requeue_interval.is_zero() {
            bail!("APPSCALER_REQUEUE_INTERVAL_SECS must be greater than 0");
        }

        let resync_interval = parse_var(&lookup, "APPSCALER_RESYNC_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.resync_interval);
        if resync_interval.is_zero() {
            bail!("APPSCALER_RESYNC_INTERVAL_SECS must be greater than 0");
        }

        let backoff_base = parse_var(&lookup, "APPSCALER_BACKOFF_BASE_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.backoff_base);
        if backoff_base.is_zero() {
            bail!("APPSCALER_BACKOFF_BASE_MS must be greater than 0");
        }

        let backoff_max = parse_var(&lookup, "APPSCALER_BACKOFF_MAX_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.backoff_max);
        if backoff_max < backoff_base {
            bail!("APPSCALER_BACKOFF_MAX_SECS must not be below APPSCALER_BACKOFF_BASE_MS");
        }

        let state_file = lookup("APPSCALER_STATE_FILE")
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);

        let shutdown_timeout = parse_var(&lookup, "APPSCALER_SHUTDOWN_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.shutdown_timeout);

        Ok(Self {
            log_level,
            workers,
            requeue_interval,
            resync_interval,
            backoff_base,
            backoff_max,
            state_file,
            shutdown_timeout,
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("invalid value for {name}: {raw:?}"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_config_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.requeue_interval, Duration::from_secs(30));
        assert_eq!(config.workers, 2);
        assert!(config.state_file.is_none());
    }

    #[test]
    fn test_config_overrides() {
        let config = load(&[
            ("APPSCALER_WORKERS", "8"),
            ("APPSCALER_REQUEUE_INTERVAL_SECS", "5"),
            ("APPSCALER_BACKOFF_BASE_MS", "250"),
            ("APPSCALER_STATE_FILE", "/etc/appscaler/seed.json"),
        ])
        .unwrap();

        assert_eq!(config.workers, 8);
        assert_eq!(config.requeue_interval, Duration::from_secs(5));
        assert_eq!(config.backoff_base, Duration::from_millis(250));
        assert_eq!(
            config.state_file,
            Some(PathBuf::from("/etc/appscaler/seed.json"))
        );
    }

    #[test]
    fn test_config_rejects_garbage() {
        let err = load(&[("APPSCALER_WORKERS", "many")]).unwrap_err();
        assert!(err.to_string().contains("APPSCALER_WORKERS"));
    }

    #[test]
    fn test_config_rejects_zero_workers() {
        assert!(load(&[("APPSCALER_WORKERS", "0")]).is_err());
    }

    #[test]
    fn test_config_rejects_zero_requeue_interval() {
        let err = load(&[("APPSCALER_REQUEUE_INTERVAL_SECS", "0")]).unwrap_err();
        assert!(err.to_string().contains("APPSCALER_REQUEUE_INTERVAL_SECS"));
    }

    #[test]
    fn test_config_rejects_zero_backoff() {
        let err = load(&[
            ("APPSCALER_BACKOFF_BASE_MS", "0"),
            ("APPSCALER_BACKOFF_MAX_SECS", "0"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("APPSCALER_BACKOFF_BASE_MS"));
    }

    #[test]
    fn test_config_rejects_inverted_backoff() {
        assert!(load(&[
            ("APPSCALER_BACKOFF_BASE_MS", "5000"),
            ("APPSCALER_BACKOFF_MAX_SECS", "1"),
        ])
        .is_err());
    }
}

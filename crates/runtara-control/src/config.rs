// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for runtara-control.

use std::path::PathBuf;
use std::time::Duration;

/// Control plane configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound for every wait on task coordinator replies
    pub deployment_timeout: Duration,
    /// Timeout for hooks that do not declare one
    pub hook_timeout: Duration,
    /// Delay before reacting to an unsolicited critical task failure
    pub reaction_delay: Duration,
    /// Lowest port handed out to TCP inbound channels
    pub tcp_port_min: u64,
    /// Lowest port handed out as a task control port
    pub control_port_min: u64,
    /// Capacity of the environment-to-coordinator message channel
    pub channel_capacity: usize,
    /// Directory holding workflow templates (`<name>.json`)
    pub workflow_dir: PathBuf,
    /// First run number handed out
    pub first_run_number: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            deployment_timeout: Duration::from_secs(90),
            hook_timeout: Duration::from_secs(30),
            reaction_delay: Duration::from_millis(500),
            tcp_port_min: 9000,
            control_port_min: 30000,
            channel_capacity: 1024,
            workflow_dir: PathBuf::from("workflows"),
            first_run_number: 1,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let deployment_timeout = Duration::from_secs(number_var(
            "RUNTARA_CONTROL_DEPLOYMENT_TIMEOUT_SECS",
            defaults.deployment_timeout.as_secs(),
        )?);
        let hook_timeout = Duration::from_secs(number_var(
            "RUNTARA_CONTROL_HOOK_TIMEOUT_SECS",
            defaults.hook_timeout.as_secs(),
        )?);
        let reaction_delay = Duration::from_millis(number_var(
            "RUNTARA_CONTROL_REACTION_DELAY_MS",
            defaults.reaction_delay.as_millis() as u64,
        )?);

        let tcp_port_min = number_var("RUNTARA_CONTROL_TCP_PORT_MIN", defaults.tcp_port_min)?;
        let control_port_min =
            number_var("RUNTARA_CONTROL_CONTROL_PORT_MIN", defaults.control_port_min)?;
        let channel_capacity =
            number_var("RUNTARA_CONTROL_CHANNEL_CAPACITY", defaults.channel_capacity)?;
        if channel_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "RUNTARA_CONTROL_CHANNEL_CAPACITY",
                "must be greater than zero",
            ));
        }
        let first_run_number =
            number_var("RUNTARA_CONTROL_FIRST_RUN_NUMBER", defaults.first_run_number)?;

        let workflow_dir = std::env::var("RUNTARA_CONTROL_WORKFLOW_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.workflow_dir);

        Ok(Self {
            deployment_timeout,
            hook_timeout,
            reaction_delay,
            tcp_port_min,
            control_port_min,
            channel_capacity,
            workflow_dir,
            first_run_number,
        })
    }
}

fn number_var<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key, "expected a non-negative integer")),
        Err(_) => Ok(default),
    }
}

/// Parse a duration such as `250ms`, `30s`, `5m`, `1h` or `1m 30s`.
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).ok()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable holds a value that cannot be used.
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("1m30s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("1m 30s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("42"), Some(Duration::from_secs(42)));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("10x"), None);
        assert_eq!(parse_duration("s10"), None);
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.deployment_timeout, Duration::from_secs(90));
        assert_eq!(config.reaction_delay, Duration::from_millis(500));
        assert_eq!(config.tcp_port_min, 9000);
        assert_eq!(config.control_port_min, 30000);
    }

    #[test]
    fn test_from_env_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("RUNTARA_CONTROL_DEPLOYMENT_TIMEOUT_SECS", "120");
        guard.set("RUNTARA_CONTROL_TCP_PORT_MIN", "10000");
        guard.set("RUNTARA_CONTROL_WORKFLOW_DIR", "/etc/workflows");

        let config = Config::from_env().unwrap();
        assert_eq!(config.deployment_timeout, Duration::from_secs(120));
        assert_eq!(config.tcp_port_min, 10000);
        assert_eq!(config.workflow_dir, PathBuf::from("/etc/workflows"));
        assert_eq!(config.control_port_min, 30000);
    }

    #[test]
    fn test_from_env_invalid_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("RUNTARA_CONTROL_HOOK_TIMEOUT_SECS", "forever");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::InvalidValue("RUNTARA_CONTROL_HOOK_TIMEOUT_SECS", _))
        ));
        drop(guard);

        let mut guard = EnvGuard::new();
        guard.set("RUNTARA_CONTROL_CHANNEL_CAPACITY", "0");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::InvalidValue("RUNTARA_CONTROL_CHANNEL_CAPACITY", _))
        ));
    }
}

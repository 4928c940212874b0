// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, path::PathBuf, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

/// Process-wide options. Parsed once at startup and immutable afterwards;
/// unknown option names are rejected by the deserializer.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Budget subtracted from the per-command timeout when forwarding a bulk
    /// chunk to a peer instance.
    #[serde(with = "serde_secs")]
    pub remote_call_overhead: Duration,
    /// Bulk requests at or above this many devices are split and forwarded.
    pub lb_threshold: usize,
    /// Upper bound on concurrently held local bulk session slots.
    pub bulk_session_limit: usize,
    /// Max retries for one forwarded bulk chunk.
    pub bulk_retry_limit: u32,
    /// Upper bound (seconds) of the random start stagger for bulk devices.
    pub bulk_run_jitter: u64,
    pub bulk_retry_delay_min: u64,
    pub bulk_retry_delay_max: u64,
    /// RPC port of this instance; peers are reached on the same port.
    pub port: u16,
    #[serde(with = "serde_secs")]
    pub session_reap_period: Duration,
    /// Maximal accepted value for a session's own idle timeout.
    #[serde(with = "serde_secs")]
    pub max_session_idle_timeout: Duration,
    /// Max time a session can live since last access.
    #[serde(with = "serde_secs")]
    pub max_session_last_access_timeout: Duration,
    #[serde(with = "serde_secs")]
    pub device_db_update_interval: Duration,
    /// Regex restricting the periodic catalog refresh to matching hostnames.
    pub device_name_filter: Option<String>,
    #[serde(with = "serde_secs")]
    pub console_login_timeout_s: Duration,
    /// Verbose runtime diagnostics.
    pub runtime_debug: bool,
    pub log_level: String,
    /// Max worker threads for blocking calls.
    pub max_default_executor_threads: usize,
    /// Max time to wait for open sessions to drain on shutdown.
    #[serde(with = "serde_secs")]
    pub exit_max_wait: Duration,
    /// Optional JSON file with per-vendor configuration.
    pub device_vendors: Option<PathBuf>,
    /// Optional JSON file backing the default device source.
    pub device_db_file: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            remote_call_overhead: Duration::from_secs(20),
            lb_threshold: 100,
            bulk_session_limit: 200,
            bulk_retry_limit: 5,
            bulk_run_jitter: 5,
            bulk_retry_delay_min: 5,
            bulk_retry_delay_max: 10,
            port: 5000,
            session_reap_period: Duration::from_secs(60),
            max_session_idle_timeout: Duration::from_secs(30 * 60),
            max_session_last_access_timeout: Duration::from_secs(60 * 60),
            device_db_update_interval: Duration::from_secs(30 * 60),
            device_name_filter: None,
            console_login_timeout_s: Duration::from_secs(60),
            runtime_debug: false,
            log_level: "info".to_string(),
            max_default_executor_threads: 10,
            exit_max_wait: Duration::from_secs(300),
            device_vendors: None,
            device_db_file: None,
        }
    }
}

impl ServiceConfig {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let cfg: ServiceConfig =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates invariants across options.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.lb_threshold > 0, "lb_threshold must be > 0");
        ensure!(
            self.bulk_retry_delay_min <= self.bulk_retry_delay_max,
            "bulk_retry_delay_min must not exceed bulk_retry_delay_max"
        );
        ensure!(
            self.max_default_executor_threads > 0,
            "max_default_executor_threads must be > 0"
        );
        if let Some(filter) = &self.device_name_filter {
            regex::Regex::new(filter)
                .with_context(|| format!("invalid device_name_filter {filter:?}"))?;
        }
        Ok(())
    }

    /// Compiled device-name filter, if one is configured.
    pub fn name_filter(&self) -> Option<regex::Regex> {
        self.device_name_filter
            .as_deref()
            .and_then(|f| regex::Regex::new(f).ok())
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

use std::{fs, io, path::Path, time::Duration};

use compact_str::CompactString;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Client settings. Every field has a default, so an empty JSON object is a
/// valid config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Only ever use this link. When unset, any broadcast or point-to-point
    /// link that is not a loopback or dummy device is a candidate.
    pub device: Option<CompactString>,
    pub min_mtu: u32,
    /// Silent rounds across all links before an exchange gives up
    pub send_retries: u32,
    /// Times the links are closed and reopened after an exchange times out
    pub reopen_retries: u32,
    pub base_timeout_ms: u64,
    pub timeout_jitter_ms: u64,
    pub max_timeout_ms: u64,
    pub device_wait_polls: u32,
    pub device_poll_ms: u64,
    pub carrier_timeout_ms: u64,
    pub carrier_poll_ms: u64,
    /// Settle time between bringing links up and the first Solicit
    pub post_open_ms: u64,
    pub ra_interval_secs: u64,
    /// Fixed DUID time instead of the wall clock
    pub duid_time: Option<u32>,
    /// Kernel style build string to derive the DUID time from, used when
    /// `duid_time` is unset
    pub duid_version: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: None,
            min_mtu: 364,
            send_retries: 3,
            reopen_retries: 1,
            base_timeout_ms: 2_000,
            timeout_jitter_ms: 1_000,
            max_timeout_ms: 30_000,
            device_wait_polls: 12,
            device_poll_ms: 1_000,
            carrier_timeout_ms: 120_000,
            carrier_poll_ms: 100,
            post_open_ms: 10,
            ra_interval_secs: 30,
            duid_time: None,
            duid_version: None,
        }
    }
}

impl Config {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn base_timeout(&self) -> Duration {
        Duration::from_millis(self.base_timeout_ms)
    }

    pub fn timeout_jitter(&self) -> Duration {
        Duration::from_millis(self.timeout_jitter_ms)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }

    pub fn device_poll(&self) -> Duration {
        Duration::from_millis(self.device_poll_ms)
    }

    pub fn carrier_timeout(&self) -> Duration {
        Duration::from_millis(self.carrier_timeout_ms)
    }

    pub fn carrier_poll(&self) -> Duration {
        Duration::from_millis(self.carrier_poll_ms)
    }

    pub fn post_open(&self) -> Duration {
        Duration::from_millis(self.post_open_ms)
    }

    pub fn ra_interval(&self) -> Duration {
        Duration::from_secs(self.ra_interval_secs)
    }

    /// The user device, ignoring an empty name
    pub fn user_device(&self) -> Option<&str> {
        self.device.as_deref().filter(|d| !d.is_empty())
    }

    /// DUID time to identify this client with
    pub fn resolve_duid_time(&self) -> u32 {
        self.duid_time
            .or_else(|| {
                self.duid_version
                    .as_deref()
                    .and_then(crate::duid_time_from_version)
            })
            .unwrap_or_else(crate::duid_time_now)
    }
}

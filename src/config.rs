//! Runtime configuration.
//!
//! Loaded once at startup and shared by reference through the dependency
//! container (no module-level state). Unknown options are rejected at
//! parse time.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, ScoutError};

/// Host key trust anchor for new SSH sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KnownHostsPolicy {
    /// Verify server keys against this OpenSSH known_hosts file.
    File(PathBuf),
    /// Accept any host key. Only reachable by configuring the literal
    /// string "none"; logged loudly at startup.
    AcceptAny,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// LRU cap on live SSH sessions.
    pub max_pool_size: usize,
    /// Seconds a session may sit unused before the reaper closes it.
    pub idle_timeout: u64,
    /// Optional hard cap on session age, seconds.
    pub max_lifetime: Option<u64>,
    /// SSH dial timeout, seconds. Covers the whole handshake.
    pub connect_timeout: u64,
    /// Default shell-level timeout for `run_command`, seconds.
    pub command_timeout: u64,
    /// Byte limit for file reads.
    pub max_file_bytes: usize,
    /// Byte limit for listings, command output and service logs.
    pub max_output_bytes: usize,
    /// Path to a known_hosts file, or the literal "none". Required.
    pub known_hosts_path: Option<String>,
    /// Token bucket refill budget per client. 0 disables rate limiting.
    pub rate_limit_per_minute: u32,
    /// Token bucket capacity.
    pub rate_limit_burst: u32,
    /// Accepted API keys. Empty set disables authentication.
    pub api_keys: HashSet<String>,
    /// Method name that bypasses both the limiter and the authenticator.
    pub health_method_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_pool_size: 100,
            idle_timeout: 60,
            max_lifetime: None,
            connect_timeout: 10,
            command_timeout: 30,
            max_file_bytes: 1_048_576,
            max_output_bytes: 10_000_000,
            known_hosts_path: None,
            rate_limit_per_minute: 60,
            rate_limit_burst: 10,
            api_keys: HashSet::new(),
            health_method_name: "health".to_string(),
        }
    }
}

impl Config {
    /// Parse a JSON configuration document. Unknown keys are an error.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| ScoutError::validation(format!("invalid configuration: {e}")))
    }

    pub async fn from_file(path: &std::path::Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            ScoutError::validation(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_json(&text)
    }

    /// Resolve the host key policy. Fails closed: an absent
    /// `known_hosts_path` is a startup error, not a silent accept-any.
    pub fn known_hosts(&self) -> Result<KnownHostsPolicy> {
        match self.known_hosts_path.as_deref() {
            None => Err(ScoutError::validation(
                "known_hosts_path is required; set it to a file path, or to \"none\" to \
                 explicitly disable host key verification",
            )),
            Some("none") => Ok(KnownHostsPolicy::AcceptAny),
            Some(path) => Ok(KnownHostsPolicy::File(PathBuf::from(path))),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        self.max_lifetime.map(Duration::from_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use forge_transport::TlsSettings;
use serde::Deserialize;

use crate::aot::AotConfig;
use crate::health::HealthConfig;
use crate::registry::PurgePolicy;

#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Fixed size of the worker pool; each worker drives one request to
    /// completion before dequeuing the next.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// When set, a stream serves exactly one request and is then destroyed
    /// instead of being recycled for the connection's next request.
    #[serde(default)]
    pub per_request_streams: bool,

    /// Folded into the wire version tag so configuration-incompatible
    /// builds refuse to talk to each other.
    #[serde(default)]
    pub wire_config_hash: u32,

    #[serde(default)]
    pub tls: Option<TlsSettings>,

    #[serde(default = "default_session_old_age_secs")]
    pub session_old_age_secs: u64,

    #[serde(default = "default_session_old_age_low_memory_secs")]
    pub session_old_age_low_memory_secs: u64,

    #[serde(default = "default_time_between_purges_secs")]
    pub time_between_purges_secs: u64,

    #[serde(default = "default_safe_reserve_mb")]
    pub safe_reserve_mb: u64,

    #[serde(default = "default_scratch_lower_bound_mb")]
    pub scratch_lower_bound_mb: u64,

    #[serde(default = "default_high_thread_threshold")]
    pub high_thread_threshold: usize,

    #[serde(default = "default_very_high_thread_threshold")]
    pub very_high_thread_threshold: usize,

    #[serde(default = "default_true")]
    pub aot_cache_enabled: bool,

    #[serde(default)]
    pub aot_cache_dir: Option<PathBuf>,

    #[serde(default = "default_aot_cache_max_mb")]
    pub aot_cache_max_mb: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:38400".to_string()
}
fn default_worker_count() -> usize {
    8
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_session_old_age_secs() -> u64 {
    90 * 60
}
fn default_session_old_age_low_memory_secs() -> u64 {
    5 * 60
}
fn default_time_between_purges_secs() -> u64 {
    60
}
fn default_safe_reserve_mb() -> u64 {
    64
}
fn default_scratch_lower_bound_mb() -> u64 {
    32
}
fn default_high_thread_threshold() -> usize {
    12
}
fn default_very_high_thread_threshold() -> usize {
    16
}
fn default_true() -> bool {
    true
}
fn default_aot_cache_max_mb() -> u64 {
    2048
}

impl Default for ServerConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config must deserialize")
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {:?}", path))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {:?}", path))
    }

    pub fn version_tag(&self) -> u64 {
        forge_model::wire_version(self.wire_config_hash)
    }

    pub fn purge_policy(&self) -> PurgePolicy {
        PurgePolicy {
            time_between_purges: Duration::from_secs(self.time_between_purges_secs),
            old_age: Duration::from_secs(self.session_old_age_secs),
            old_age_under_low_memory: Duration::from_secs(self.session_old_age_low_memory_secs),
        }
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            safe_reserve_bytes: self.safe_reserve_mb * 1024 * 1024,
            scratch_lower_bound_bytes: self.scratch_lower_bound_mb * 1024 * 1024,
            high_thread_threshold: self.high_thread_threshold,
            very_high_thread_threshold: self.very_high_thread_threshold,
            ..HealthConfig::default()
        }
    }

    pub fn aot_config(&self) -> AotConfig {
        AotConfig {
            enabled: self.aot_cache_enabled,
            persist_dir: self.aot_cache_dir.clone(),
            max_bytes: self.aot_cache_max_mb * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = ServerConfig::default();
        assert_eq!(config.worker_count, 8);
        assert!(config.aot_cache_enabled);
        assert!(config.tls.is_none());
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"bind_addr": "127.0.0.1:9", "worker_count": 2}"#).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9");
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.queue_capacity, 1024);
    }
}

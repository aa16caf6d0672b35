// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Daemon configuration surface.
//
// This struct is data-only: it is what a configuration-file parser would
// deserialize into. The legacy directive-grammar parser itself remains an
// external collaborator — here we read plain TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{
    AccessPolicyConfig, ClusterDef, DispatchPolicy, FilterRule, NamingPolicy, Protocol, ShutdownPolicy,
};

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub protocols: Vec<Protocol>,
    /// Remote scheduler URIs to poll on `browse_interval`.
    pub poll_list: Vec<String>,
    pub access: AccessPolicyConfig,
    pub filters: Vec<FilterRule>,
    pub clusters: Vec<ClusterDef>,
    pub naming: NamingPolicy,
    pub shutdown: ShutdownPolicy,
    pub dispatch: DispatchPolicy,

    #[serde(with = "duration_secs")]
    pub browse_interval: Duration,
    #[serde(with = "duration_secs")]
    pub browse_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub http_local_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub http_remote_timeout: Duration,
    pub http_max_retries: u32,
    #[serde(with = "duration_secs")]
    pub notify_lease_duration: Duration,
    pub update_cups_queues_max_per_call: u32,
    #[serde(with = "duration_secs")]
    pub pause_between_cups_queue_updates: Duration,

    pub default_options: String,
    pub cache_dir: PathBuf,
    pub keep_generated_queues_on_shutdown: bool,
    pub allow_resharing_remote_cups_printers: bool,
    pub refresh_capabilities_on_each_discovery: bool,
    pub auto_clustering: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            protocols: vec![Protocol::Ipp, Protocol::Ipps],
            poll_list: Vec::new(),
            access: AccessPolicyConfig::default(),
            filters: Vec::new(),
            clusters: Vec::new(),
            naming: NamingPolicy::IppPrinter,
            shutdown: ShutdownPolicy::default(),
            browse_interval: Duration::from_secs(60),
            browse_timeout: Duration::from_secs(10),
            http_local_timeout: Duration::from_secs(5),
            http_remote_timeout: Duration::from_secs(10),
            http_max_retries: 5,
            notify_lease_duration: Duration::from_secs(1800),
            update_cups_queues_max_per_call: 10,
            pause_between_cups_queue_updates: Duration::from_millis(500),
            default_options: String::new(),
            cache_dir: PathBuf::from("/var/cache/presswerk-browsed"),
            keep_generated_queues_on_shutdown: false,
            allow_resharing_remote_cups_printers: false,
            refresh_capabilities_on_each_discovery: false,
            auto_clustering: true,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from `path`, returning the default configuration
    /// (and writing it out) when the file does not yet exist — mirrors the
    /// load-or-first-run pattern used elsewhere in this codebase's daemons.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let config: Self = toml::from_str(&contents)
                    .map_err(|e| crate::error::CoreError::Configuration(e.to_string()))?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save(path)?;
                Ok(config)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let toml = toml::to_string_pretty(self)
            .map_err(|e| crate::error::CoreError::Configuration(e.to_string()))?;
        std::fs::write(path, toml)?;
        Ok(())
    }

    pub fn local_default_printer_path(&self) -> PathBuf {
        self.cache_dir.join("local-default-printer")
    }

    pub fn remote_default_printer_path(&self) -> PathBuf {
        self.cache_dir.join("remote-default-printer")
    }

    pub fn options_path(&self, queue_name: &str) -> PathBuf {
        self.cache_dir.join(format!("options-{queue_name}"))
    }
}

/// (De)serialize a `Duration` as a whole number of seconds, so the TOML
/// surface reads as plain integers (`browse_interval = 60`) rather than a
/// nested struct.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = DaemonConfig::default();
        let toml = toml::to_string_pretty(&config).expect("serialize");
        let parsed: DaemonConfig = toml::from_str(&toml).expect("parse");
        assert_eq!(parsed.http_max_retries, config.http_max_retries);
        assert_eq!(parsed.browse_interval, config.browse_interval);
    }

    #[test]
    fn load_writes_default_on_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        assert!(!path.exists());

        let loaded = DaemonConfig::load(&path).expect("load");
        assert!(path.exists());
        assert_eq!(loaded.update_cups_queues_max_per_call, 10);
    }

    #[test]
    fn load_round_trips_a_saved_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");

        let mut config = DaemonConfig::default();
        config.http_max_retries = 9;
        config.save(&path).expect("save");

        let loaded = DaemonConfig::load(&path).expect("load");
        assert_eq!(loaded.http_max_retries, 9);
    }
}

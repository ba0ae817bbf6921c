//! TOML configuration shared by every fleet service.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::{Error, Result};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fleet_bus::validate_topic;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Locations searched by [`FleetConfig::load`] when no path is given.
pub const SEARCH_PATHS: [&str; 2] = ["fleet.toml", "/etc/fleet/fleet.toml"];

/// Configuration for every fleet service.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Bus connection settings.
    pub bus: BusConfig,

    /// State manager settings.
    pub lifecycle: LifecycleConfig,

    /// Per-service overrides, keyed by service name.
    pub services: HashMap<String, ServiceConfig>,

    /// Disk service settings.
    pub diskd: DiskdConfig,

    /// Process service settings read by disk consumers.
    pub procd: ProcdConfig,
}

/// Bus connection settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct BusConfig {
    /// Broker host.
    pub host: String,

    /// Broker port.
    pub port: u16,

    /// Root prepended to every topic. Empty for none.
    pub topic_prefix: String,

    /// MQTT keep-alive in seconds.
    pub keep_alive_secs: u64,

    /// Broker username.
    pub username: Option<String>,

    /// Broker password.
    pub password: Option<String>,
}

impl BusConfig {
    /// The keep-alive interval.
    #[must_use]
    pub const fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// Username and password, when both are set.
    #[must_use]
    pub fn credentials(&self) -> Option<(String, String)> {
        self.username.clone().zip(self.password.clone())
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            topic_prefix: String::new(),
            keep_alive_secs: 30,
            username: None,
            password: None,
        }
    }
}

/// State manager settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// How often to log dependencies still being waited on.
    pub dependency_log_interval_secs: u64,
}

impl LifecycleConfig {
    /// The "still waiting" log interval.
    #[must_use]
    pub const fn dependency_log_interval(&self) -> Duration {
        Duration::from_secs(self.dependency_log_interval_secs)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            dependency_log_interval_secs: 10,
        }
    }
}

/// Per-service overrides.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Extra dependencies on top of those the service declares.
    pub dependencies: Vec<String>,
}

/// Disk service settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct DiskdConfig {
    /// Service name, and so the root of its topics.
    pub name: String,

    /// Mount paths never reported.
    pub ignored_mounts: Vec<PathBuf>,

    /// Mount paths always reported.
    pub static_disks: Vec<PathBuf>,

    /// Directory of filesystem UUID symlinks.
    pub by_uuid_dir: PathBuf,

    /// Mount table.
    pub mounts_file: PathBuf,

    /// How often the mount table is re-read without a device event.
    pub poll_interval_ms: u64,
}

impl DiskdConfig {
    /// The mount table poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for DiskdConfig {
    fn default() -> Self {
        Self {
            name: "diskd".to_string(),
            ignored_mounts: vec![PathBuf::from("/"), PathBuf::from("/boot")],
            static_disks: Vec::new(),
            by_uuid_dir: PathBuf::from("/dev/disk/by-uuid"),
            mounts_file: PathBuf::from("/proc/self/mounts"),
            poll_interval_ms: 2000,
        }
    }
}

/// Process service settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct ProcdConfig {
    /// File at a disk's root that marks it as user code.
    pub default_usercode_entrypoint: String,
}

impl Default for ProcdConfig {
    fn default() -> Self {
        Self {
            default_usercode_entrypoint: "robot.py".to_string(),
        }
    }
}

impl FleetConfig {
    /// Load configuration from `path`, or from the first of
    /// [`SEARCH_PATHS`] that exists, or fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a chosen file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        for candidate in SEARCH_PATHS.iter().map(Path::new) {
            if candidate.is_file() {
                return Self::from_file(candidate);
            }
        }

        debug!("no config file found, using defaults");

        Ok(Self::default())
    }

    /// Load configuration from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;

        debug!("loading config from {}", path.display());

        Self::from_toml_str(&contents)
    }

    /// Parse configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid configuration.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first out-of-range value.
    pub fn validate(&self) -> Result<()> {
        if self.bus.port == 0 {
            return Err(Error::Invalid("bus.port must not be 0".to_string()));
        }

        if !self.bus.topic_prefix.is_empty() {
            validate_topic(&self.bus.topic_prefix)
                .map_err(|e| Error::Invalid(format!("bus.topic_prefix: {e}")))?;
        }

        if self.lifecycle.dependency_log_interval_secs == 0 {
            return Err(Error::Invalid(
                "lifecycle.dependency_log_interval_secs must be at least 1".to_string(),
            ));
        }

        if self.diskd.poll_interval_ms == 0 {
            return Err(Error::Invalid(
                "diskd.poll_interval_ms must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Dependencies configured for the service `name`.
    #[must_use]
    pub fn dependencies_for(&self, name: &str) -> &[String] {
        self.services
            .get(name)
            .map_or(&[], |service| service.dependencies.as_slice())
    }
}

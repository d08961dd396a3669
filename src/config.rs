//! Configuration management for Ratewarden.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RatewardenError, Result};
use crate::ratelimit::{GuardConfig, PolicyDocument, PolicyRegistry, DEFAULT_KEY_PREFIX};

/// Environment variables with this prefix override file settings,
/// e.g. `RATEWARDEN__STORE__URL`.
pub const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for the limiter service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RatewardenConfig {
    /// Window store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Fail-open guard configuration
    #[serde(default)]
    pub guard: GuardSettings,

    /// Policy document location and reload cadence
    #[serde(default)]
    pub policies: PoliciesConfig,
}

/// Which window store to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis instance
    #[default]
    Redis,
    /// Process-local memory; limits are per process
    Memory,
}

/// Window store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Namespace for keys in the shared store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1/".to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

/// Fail-open guard configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardSettings {
    /// Deadline for one store call in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Milliseconds the circuit stays open before probing
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    50
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    5_000
}

impl GuardSettings {
    pub fn to_guard_config(&self) -> GuardConfig {
        GuardConfig {
            timeout: Duration::from_millis(self.timeout_ms),
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_millis(self.cooldown_ms),
        }
    }
}

/// Policy document location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoliciesConfig {
    /// Path to the policy YAML; relative paths resolve against the
    /// configuration file's directory. Without one only the built-in
    /// default policy applies.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Seconds between policy reloads; zero disables reloading
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,
}

impl Default for PoliciesConfig {
    fn default() -> Self {
        Self {
            path: None,
            reload_interval_secs: default_reload_interval(),
        }
    }
}

fn default_reload_interval() -> u64 {
    30
}

impl RatewardenConfig {
    /// Load configuration from a YAML file, then apply environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut loaded: RatewardenConfig = settings.try_deserialize()?;
        if let (Some(policies), Some(dir)) = (&loaded.policies.path, path.parent()) {
            if policies.is_relative() {
                loaded.policies.path = Some(dir.join(policies));
            }
        }
        loaded.validate()?;
        Ok(loaded)
    }

    /// Load configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?;
        let loaded: RatewardenConfig = settings.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject settings that would make the guard meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.guard.timeout_ms == 0 {
            return Err(RatewardenError::Config(
                "guard.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.guard.failure_threshold == 0 {
            return Err(RatewardenError::Config(
                "guard.failure_threshold must be greater than zero".to_string(),
            ));
        }
        if self.store.key_prefix.is_empty() {
            return Err(RatewardenError::Config(
                "store.key_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Read and compile the configured policy document.
    ///
    /// The parsed document is returned alongside the registry so a reloader
    /// can tell later whether the file changed.
    pub fn load_policies(&self) -> Result<(PolicyRegistry, Option<PolicyDocument>)> {
        match &self.policies.path {
            Some(path) => {
                let document = PolicyDocument::from_file(path)?;
                let registry = PolicyRegistry::from_document(&document)?;
                Ok((registry, Some(document)))
            }
            None => Ok((PolicyRegistry::with_defaults(), None)),
        }
    }

    /// Reload cadence, if reloading is enabled and there is a file to reload.
    pub fn reload_interval(&self) -> Option<Duration> {
        match (&self.policies.path, self.policies.reload_interval_secs) {
            (Some(_), secs) if secs > 0 => Some(Duration::from_secs(secs)),
            _ => None,
        }
    }
}

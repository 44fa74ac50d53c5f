//! Configuration management for Tollgate.
//!
//! Values come from built-in defaults, then an optional YAML file, then
//! `TOLLGATE__<SECTION>__<FIELD>` environment variables.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::num::NonZeroU64;
use std::time::Duration;

use crate::admission::{
    ControllerOptions, Policy, PolicyTable, DEFAULT_LIMIT, DEFAULT_WINDOW_MS,
};
use crate::error::Result;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Admission control configuration
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 8081))
}

/// Admission control configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Path to the per-route policy file
    #[serde(default)]
    pub policies_path: Option<String>,

    /// Limit for routes without their own policy
    #[serde(default = "default_limit")]
    pub default_limit: u32,

    /// Window for routes without their own policy, in milliseconds
    #[serde(default = "default_window_ms")]
    pub default_window_ms: u64,

    /// Background sweep interval in milliseconds; 0 disables the sweeper
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Also sweep after every N-th check; 0 disables
    #[serde(default)]
    pub sweep_every_calls: u64,

    /// Soft cap on tracked keys; 0 means unbounded
    #[serde(default)]
    pub max_buckets: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            policies_path: None,
            default_limit: default_limit(),
            default_window_ms: default_window_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            sweep_every_calls: 0,
            max_buckets: 0,
        }
    }
}

fn default_limit() -> u32 {
    DEFAULT_LIMIT
}

fn default_window_ms() -> u64 {
    DEFAULT_WINDOW_MS
}

fn default_sweep_interval_ms() -> u64 {
    30_000
}

impl AdmissionConfig {
    /// The validated fallback policy.
    pub fn default_policy(&self) -> Result<Policy> {
        Policy::new(self.default_limit, self.default_window_ms)
    }

    /// Load the policy table, or a default-only table when no file is set.
    pub fn policy_table(&self) -> Result<PolicyTable> {
        let fallback = self.default_policy()?;
        match &self.policies_path {
            Some(path) => PolicyTable::from_file(path, fallback),
            None => Ok(PolicyTable::new(fallback)),
        }
    }

    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            sweep_every: NonZeroU64::new(self.sweep_every_calls),
            max_buckets: (self.max_buckets > 0).then_some(self.max_buckets),
        }
    }

    /// Sweeper period, if the background sweeper is enabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_ms > 0).then(|| Duration::from_millis(self.sweep_interval_ms))
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable text
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<TollgateConfig>()?;

        config.admission.default_policy()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path, ignoring the environment.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| crate::error::TollgateError::Config(e.to_string()))?;
        config.admission.default_policy()?;
        Ok(config)
    }
}

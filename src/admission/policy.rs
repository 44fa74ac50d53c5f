//! Admission policies and per-route policy tables.
//!
//! A policy table is loaded from YAML:
//!
//! ```yaml
//! default:
//!   limit: 20
//!   window_ms: 60000
//! routes:
//!   - route: quote_request
//!     limit: 5
//!     unit: minute
//!   - route: generate_image
//!     limit: 10
//!     window_ms: 3600000
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{Result, TollgateError};

/// Default number of admitted requests per window.
pub const DEFAULT_LIMIT: u32 = 20;
/// Default window length in milliseconds.
pub const DEFAULT_WINDOW_MS: u64 = 60_000;

/// How many requests one key may make per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Maximum admitted requests per window
    pub limit: u32,
    /// Window length in milliseconds
    pub window_ms: u64,
}

impl Policy {
    /// Create a validated policy.
    pub fn new(limit: u32, window_ms: u64) -> Result<Self> {
        let policy = Self { limit, window_ms };
        policy.validate()?;
        Ok(policy)
    }

    /// Reject policies that cannot admit anything.
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(TollgateError::InvalidConfiguration(
                "limit must be positive".to_string(),
            ));
        }
        if self.window_ms == 0 {
            return Err(TollgateError::InvalidConfiguration(
                "window_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            window_ms: DEFAULT_WINDOW_MS,
        }
    }
}

/// Named window lengths accepted in policy files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    pub fn as_millis(&self) -> u64 {
        match self {
            TimeUnit::Second => 1_000,
            TimeUnit::Minute => 60_000,
            TimeUnit::Hour => 3_600_000,
            TimeUnit::Day => 86_400_000,
        }
    }
}

/// A limit as written in a policy file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Maximum admitted requests per window
    pub limit: u32,
    /// Explicit window length in milliseconds
    #[serde(default)]
    pub window_ms: Option<u64>,
    /// Named window length, as an alternative to `window_ms`
    #[serde(default)]
    pub unit: Option<TimeUnit>,
}

impl RuleConfig {
    /// Turn the rule into a validated policy. `fallback_window_ms` applies
    /// when neither `window_ms` nor `unit` is given.
    fn to_policy(&self, name: &str, fallback_window_ms: u64) -> Result<Policy> {
        let window_ms = match (self.window_ms, self.unit) {
            (Some(_), Some(_)) => {
                return Err(TollgateError::InvalidConfiguration(format!(
                    "{}: set either window_ms or unit, not both",
                    name
                )))
            }
            (Some(ms), None) => ms,
            (None, Some(unit)) => unit.as_millis(),
            (None, None) => fallback_window_ms,
        };

        Policy::new(self.limit, window_ms)
            .map_err(|e| TollgateError::InvalidConfiguration(format!("{}: {}", name, e)))
    }
}

/// A rule bound to a route name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    /// Route or endpoint name
    pub route: String,
    #[serde(flatten)]
    pub rule: RuleConfig,
}

/// On-disk shape of a policy table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyFile {
    #[serde(default)]
    pub default: Option<RuleConfig>,
    #[serde(default)]
    pub routes: Vec<RouteRule>,
}

/// Validated policies, looked up by route.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    default: Policy,
    routes: HashMap<String, Policy>,
}

impl PolicyTable {
    /// A table with only a default policy.
    pub fn new(default: Policy) -> Self {
        Self {
            default,
            routes: HashMap::new(),
        }
    }

    /// Add or replace a route's policy.
    pub fn with_route(mut self, route: impl Into<String>, policy: Policy) -> Self {
        self.routes.insert(route.into(), policy);
        self
    }

    /// Load a table from a YAML file. `fallback` is the default policy when
    /// the file has no `default` section.
    pub fn from_file<P: AsRef<Path>>(path: P, fallback: Policy) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading admission policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents, fallback)
    }

    /// Load a table from a YAML string.
    pub fn from_yaml(yaml: &str, fallback: Policy) -> Result<Self> {
        let file: PolicyFile = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse policy file: {}", e)))?;
        Self::from_policy_file(&file, fallback)
    }

    /// Validate a parsed policy file.
    pub fn from_policy_file(file: &PolicyFile, fallback: Policy) -> Result<Self> {
        fallback.validate()?;

        let default = match &file.default {
            Some(rule) => rule.to_policy("default", fallback.window_ms)?,
            None => fallback,
        };

        let mut routes = HashMap::with_capacity(file.routes.len());
        for route_rule in &file.routes {
            if route_rule.route.is_empty() {
                return Err(TollgateError::InvalidConfiguration(
                    "route name must not be empty".to_string(),
                ));
            }
            let policy = route_rule
                .rule
                .to_policy(&route_rule.route, default.window_ms)?;
            if routes.insert(route_rule.route.clone(), policy).is_some() {
                return Err(TollgateError::InvalidConfiguration(format!(
                    "duplicate route: {}",
                    route_rule.route
                )));
            }
            debug!(
                route = %route_rule.route,
                limit = policy.limit,
                window_ms = policy.window_ms,
                "Loaded route policy"
            );
        }

        info!(
            routes = routes.len(),
            default_limit = default.limit,
            default_window_ms = default.window_ms,
            "Admission policies loaded"
        );

        Ok(Self { default, routes })
    }

    /// The policy for `route`, or the default.
    pub fn resolve(&self, route: &str) -> Policy {
        self.routes.get(route).copied().unwrap_or(self.default)
    }

    pub fn default_policy(&self) -> Policy {
        self.default
    }

    /// Number of routes with their own policy.
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

//! Admission key derivation.

use crate::error::{Result, TollgateError};

/// Identifies whose quota a request draws from.
///
/// Combines a route name with a client identifier so the same client gets
/// an independent window on each route.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AdmissionKey {
    /// Route or endpoint name; may be empty
    pub route: String,
    /// Client identifier such as an IP address or account id
    pub client: String,
}

impl AdmissionKey {
    /// Build a key. The client identifier is required.
    pub fn new(route: &str, client: &str) -> Result<Self> {
        if client.is_empty() {
            return Err(TollgateError::InvalidConfiguration(
                "client identifier must not be empty".to_string(),
            ));
        }

        Ok(Self {
            route: route.to_string(),
            client: client.to_string(),
        })
    }

    /// The flat string the controller stores buckets under.
    ///
    /// The route is length-prefixed (`<len>:<route>:<client>`) so distinct
    /// pairs never flatten to the same string, even when either part
    /// contains `:`.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}:{}", self.route.len(), self.route, self.client)
    }
}

impl std::fmt::Display for AdmissionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

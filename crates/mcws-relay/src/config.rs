//! Relay configuration.
//!
//! Defaults can be replaced wholesale by a JSON file named in `MCWS_CONFIG`,
//! then individual settings are overridden from the environment.

use std::{net::SocketAddr, path::Path, str::FromStr, time::Duration};

use mcws_core::ProtocolVersion;
use mcws_transport::ListenerConfig;
use serde::Deserialize;
use serde_json::Value;

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },
}

/// What to do with commands in the legacy structured form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegacyPolicy {
    /// Answer with an error frame so the controller falls back to command lines.
    #[default]
    Reject,
    /// Pass the command to the game unchanged.
    Forward,
}

impl FromStr for LegacyPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "forward" => Ok(Self::Forward),
            _ => Err(()),
        }
    }
}

/// Sets `field` to `value` in the response to `command`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResponsePatch {
    /// Exact command line that marks a request for patching.
    pub command: String,
    pub field: String,
    pub value: Value,
}

impl ResponsePatch {
    /// Report companion protocol 4 so Code Connection keeps talking to newer games.
    #[must_use]
    pub fn edu_client_info() -> Self {
        Self {
            command: "geteduclientinfo".to_string(),
            field: "companionProtocolVersion".to_string(),
            value: Value::from(4),
        }
    }
}

fn default_patches() -> Vec<ResponsePatch> {
    vec![ResponsePatch::edu_client_info()]
}

/// Relay settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RelayConfig {
    /// Address game clients connect to.
    pub listen_addr: SocketAddr,
    /// Upstream controller, `host:port` or a `ws://` URL.
    pub upstream: String,
    /// Protocol version spoken on the upstream leg.
    pub upstream_version: ProtocolVersion,
    pub legacy_policy: LegacyPolicy,
    pub patches: Vec<ResponsePatch>,
    pub handshake_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 19135)),
            upstream: "localhost:19131".to_string(),
            upstream_version: ProtocolVersion::V2,
            legacy_policy: LegacyPolicy::Reject,
            patches: default_patches(),
            handshake_timeout_secs: 10,
        }
    }
}

impl RelayConfig {
    /// Load from the process environment.
    ///
    /// # Errors
    /// Returns error if the config file cannot be read or a variable is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base = match std::env::var("MCWS_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        base.with_overrides(|var| std::env::var(var).ok())
    }

    /// Load from a JSON file. Missing fields keep their defaults.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Apply `MCWS_*` overrides looked up through `lookup`.
    ///
    /// # Errors
    /// Returns error if a variable holds an invalid value.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = lookup("MCWS_LISTEN_ADDR") {
            self.listen_addr = value.parse().map_err(|_| ConfigError::InvalidValue {
                var: "MCWS_LISTEN_ADDR",
                value,
            })?;
        }
        if let Some(value) = lookup("MCWS_UPSTREAM") {
            self.upstream = value;
        }
        if let Some(value) = lookup("MCWS_UPSTREAM_VERSION") {
            self.upstream_version = match value.trim().to_ascii_lowercase().as_str() {
                "v1" | "1" => ProtocolVersion::V1,
                "v2" | "2" => ProtocolVersion::V2,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        var: "MCWS_UPSTREAM_VERSION",
                        value,
                    });
                }
            };
        }
        if let Some(value) = lookup("MCWS_LEGACY_POLICY") {
            self.legacy_policy = value.parse().map_err(|()| ConfigError::InvalidValue {
                var: "MCWS_LEGACY_POLICY",
                value,
            })?;
        }
        Ok(self)
    }

    /// Listener settings derived from this config.
    #[must_use]
    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            bind_addr: self.listen_addr,
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            ..ListenerConfig::default()
        }
    }
}

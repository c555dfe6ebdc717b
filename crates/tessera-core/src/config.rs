//! Client configuration
//!
//! Everything the client needs is passed in explicitly through
//! [`ClientConfig`]; nothing is read from ambient process state unless the
//! caller opts in with [`ClientConfig::merge_with_env`].

use crate::errors::{Result, TesseraError};
use crate::identifiers::NodeId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "TESSERA_";

/// A single quorum endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEndpoint {
    /// Node identity
    pub id: NodeId,
    /// Base URL of the node's RPC interface
    pub url: String,
}

/// Which network to talk to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Network name, used for logging
    pub name: String,
    /// Known endpoints; the transport may discover more
    pub endpoints: Vec<NodeEndpoint>,
    /// Lower bound on the threshold, applied on top of what the network reports
    pub min_threshold: Option<usize>,
    /// Chain identifier embedded in delegation messages
    pub chain_id: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            name: "devnet".to_string(),
            endpoints: Vec::new(),
            min_threshold: None,
            chain_id: 1,
        }
    }
}

/// Where the long-term signing key comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeySource {
    /// Hex seed in an environment variable
    Env {
        /// Variable name
        var: String,
    },
    /// Hex seed in a file
    File {
        /// File path
        path: PathBuf,
    },
    /// Key held by an external custodian (hardware wallet, remote signer)
    External {
        /// Custodian-specific key reference
        reference: String,
    },
}

impl Default for KeySource {
    fn default() -> Self {
        KeySource::Env {
            var: "TESSERA_SIGNING_KEY".to_string(),
        }
    }
}

/// Allowed range for delegation expiry windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryBounds {
    /// Shortest allowed window in seconds
    pub min_secs: u64,
    /// Longest allowed window in seconds
    pub max_secs: u64,
}

impl Default for ExpiryBounds {
    fn default() -> Self {
        Self {
            min_secs: 10 * 60,
            max_secs: 24 * 60 * 60,
        }
    }
}

/// Backoff settings for renegotiating after a failed round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of additional rounds (0 = no retries)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Cap on the delay between retries
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

/// Top-level client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Quorum endpoint set
    pub network: NetworkConfig,
    /// Signer reference
    pub key_source: KeySource,
    /// Expiry window for new delegations, in seconds
    pub default_expiry_secs: u64,
    /// Allowed expiry window range
    pub expiry_bounds: ExpiryBounds,
    /// Deadline for a whole negotiation round
    pub round_deadline_ms: u64,
    /// Timeout for a single node request; must be below the round deadline
    pub node_timeout_ms: u64,
    /// Tolerated clock skew when checking credential expiry
    pub clock_skew_ms: u64,
    /// Requesting domain written into delegation messages
    pub domain: String,
    /// Human statement written into delegation messages
    pub statement: String,
    /// Backoff for retried rounds
    pub retry: RetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            key_source: KeySource::default(),
            default_expiry_secs: 10 * 60,
            expiry_bounds: ExpiryBounds::default(),
            round_deadline_ms: 30_000,
            node_timeout_ms: 10_000,
            clock_skew_ms: 30_000,
            domain: "localhost".to_string(),
            statement: crate::delegation::DEFAULT_STATEMENT.to_string(),
            retry: RetryConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Parse from TOML and validate
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| TesseraError::config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file and validate
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TesseraError::config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| TesseraError::config(format!("TOML encoding: {e}")))
    }

    /// Apply `TESSERA_*` environment overrides, then re-validate
    pub fn merge_with_env(&mut self) -> Result<()> {
        self.merge_with_vars(std::env::vars())
    }

    /// Apply overrides from an explicit variable list
    pub fn merge_with_vars<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "NETWORK" => self.network.name = value,
                "DEFAULT_EXPIRY_SECS" => self.default_expiry_secs = parse_number(&key, &value)?,
                "ROUND_DEADLINE_MS" => self.round_deadline_ms = parse_number(&key, &value)?,
                "NODE_TIMEOUT_MS" => self.node_timeout_ms = parse_number(&key, &value)?,
                "CLOCK_SKEW_MS" => self.clock_skew_ms = parse_number(&key, &value)?,
                _ => tracing::debug!(variable = %key, "ignoring unrecognized override"),
            }
        }
        self.validate()
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        let bounds = self.expiry_bounds;
        if bounds.min_secs == 0 || bounds.min_secs > bounds.max_secs {
            return Err(TesseraError::config(format!(
                "expiry bounds {}..{}s are empty",
                bounds.min_secs, bounds.max_secs
            )));
        }
        if !(bounds.min_secs..=bounds.max_secs).contains(&self.default_expiry_secs) {
            return Err(TesseraError::config(format!(
                "default_expiry_secs {} must be between {} and {}",
                self.default_expiry_secs, bounds.min_secs, bounds.max_secs
            )));
        }
        if self.round_deadline_ms == 0 {
            return Err(TesseraError::config("round_deadline_ms must be positive"));
        }
        if self.node_timeout_ms == 0 || self.node_timeout_ms >= self.round_deadline_ms {
            return Err(TesseraError::config(format!(
                "node_timeout_ms {} must be positive and below round_deadline_ms {}",
                self.node_timeout_ms, self.round_deadline_ms
            )));
        }
        if self.network.min_threshold == Some(0) {
            return Err(TesseraError::config("min_threshold must be positive"));
        }
        if self.domain.is_empty() || self.domain.chars().any(char::is_whitespace) {
            return Err(TesseraError::config("domain must be a bare host name"));
        }
        if self.statement.contains(['\n', '\r']) {
            return Err(TesseraError::config("statement must be a single line"));
        }
        Ok(())
    }

    /// Expiry window for new delegations
    pub fn default_expiry(&self) -> Duration {
        Duration::from_secs(self.default_expiry_secs)
    }

    /// Longest permitted expiry window
    pub fn max_expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_bounds.max_secs)
    }

    /// Round deadline
    pub fn round_deadline(&self) -> Duration {
        Duration::from_millis(self.round_deadline_ms)
    }

    /// Per-node timeout
    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    /// Clock skew tolerance
    pub fn clock_skew(&self) -> Duration {
        Duration::from_millis(self.clock_skew_ms)
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|e| TesseraError::config(format!("{key}={value:?}: {e}")))
}

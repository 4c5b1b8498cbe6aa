//! Cloud-config file for the node-trust integration
//!
//! The file is YAML with a single `global` section:
//!
//! ```yaml
//! global:
//!   clusterName: prod-eu
//!   preferIPv6: false
//!   approveNodeCSR: true
//!   lookupTimeoutSeconds: 10
//!   retry:
//!     maxAttempts: 5
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::retry::RetryConfig;
use crate::{Error, Result};

/// Default timeout for a single node lookup during CSR evaluation
pub const DEFAULT_LOOKUP_TIMEOUT_SECS: u64 = 10;

/// Top-level cloud-config document
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudConfig {
    /// Settings shared by every component
    #[serde(default)]
    pub global: GlobalConfig,
}

/// The `global` section
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalConfig {
    /// Cluster name written to the cluster-name node label
    pub cluster_name: String,
    /// Order IPv6 external addresses before IPv4 ones
    #[serde(rename = "preferIPv6")]
    pub prefer_ipv6: bool,
    /// Review and approve kubelet serving CSRs
    #[serde(rename = "approveNodeCSR")]
    pub approve_node_csr: bool,
    /// Timeout for node lookups during CSR evaluation
    pub lookup_timeout_seconds: u64,
    /// Retry policy for identity label updates
    pub retry: RetryConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            cluster_name: String::new(),
            prefer_ipv6: false,
            approve_node_csr: false,
            lookup_timeout_seconds: DEFAULT_LOOKUP_TIMEOUT_SECS,
            retry: RetryConfig::default(),
        }
    }
}

impl CloudConfig {
    /// Parse and validate a config from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: CloudConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::validation(format!("failed to read config {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "loaded cloud config");
        Self::from_yaml(&content)
    }

    /// Check invariants serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.global.cluster_name.trim().is_empty() {
            return Err(Error::validation("global.clusterName must not be empty"));
        }
        if self.global.lookup_timeout_seconds == 0 {
            return Err(Error::validation(
                "global.lookupTimeoutSeconds must be greater than zero",
            ));
        }
        if self.global.retry.max_attempts == 0 {
            return Err(Error::validation("global.retry.maxAttempts must be at least 1"));
        }
        if self.global.retry.backoff_multiplier < 1.0 {
            return Err(Error::validation(
                "global.retry.backoffMultiplier must be at least 1.0",
            ));
        }
        Ok(())
    }

    /// Node lookup timeout as a Duration
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.global.lookup_timeout_seconds)
    }
}

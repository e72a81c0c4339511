//! Federation configuration
//!
//! Loaded once from a JSON file and immutable afterwards. Every optional field
//! has a default so a minimal file only names the site and its broker.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::{FederationError, FederationResult};
use super::naming;
use crate::transport::BrokerEndpoint;

/// A remote site this site may subscribe to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSiteConfig {
    /// Remote site id
    pub site_id: String,

    /// Remote control queue, defaults to the remote's well-known name
    #[serde(default)]
    pub control_queue_name: Option<String>,

    /// Broker the remote site's queues live on
    pub broker: BrokerEndpoint,
}

impl RemoteSiteConfig {
    /// Effective remote control queue name
    pub fn control_queue(&self) -> String {
        self.control_queue_name
            .clone()
            .unwrap_or_else(|| naming::control_queue_name(&self.site_id))
    }
}

/// Site-wide federation configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationConfig {
    /// This site's id
    pub site_id: String,

    /// Whether the service reacts to leadership at all (default: true)
    #[serde(default = "default_start_service")]
    pub start_service: bool,

    /// Local broker
    pub broker: BrokerEndpoint,

    /// Local control queue, defaults to `<site_id>_FederationControlQueue`
    #[serde(default)]
    pub control_queue_name: Option<String>,

    /// Control queue creation retry interval in seconds (default: 10)
    #[serde(default = "default_retry_secs")]
    pub control_queue_retry_secs: u64,

    /// Ceiling on a plugin abort acknowledgment in seconds (default: 5)
    #[serde(default = "default_abort_timeout_secs")]
    pub abort_timeout_secs: u64,

    /// Known remote sites
    #[serde(default)]
    pub sites: Vec<RemoteSiteConfig>,
}

fn default_start_service() -> bool {
    true
}
fn default_retry_secs() -> u64 {
    10
}
fn default_abort_timeout_secs() -> u64 {
    5
}

impl FederationConfig {
    /// Minimal configuration with every default applied
    pub fn new(site_id: impl Into<String>, broker: BrokerEndpoint) -> Self {
        Self {
            site_id: site_id.into(),
            start_service: default_start_service(),
            broker,
            control_queue_name: None,
            control_queue_retry_secs: default_retry_secs(),
            abort_timeout_secs: default_abort_timeout_secs(),
            sites: Vec::new(),
        }
    }

    /// Add a remote site
    pub fn with_site(mut self, site: RemoteSiteConfig) -> Self {
        self.sites.push(site);
        self
    }

    /// Load and validate a JSON config file
    pub fn load(path: &Path) -> FederationResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| FederationError::Config(format!("Failed to read config: {}", e)))?;

        let config: FederationConfig = serde_json::from_str(&content)
            .map_err(|e| FederationError::Config(format!("Invalid config JSON: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Reject configurations the coordinators cannot run with
    pub fn validate(&self) -> FederationResult<()> {
        if self.site_id.trim().is_empty() {
            return Err(FederationError::Config("site_id must not be empty".into()));
        }
        if self.broker.port == 0 {
            return Err(FederationError::Config("broker.port must be > 0".into()));
        }
        if self.control_queue_retry_secs == 0 {
            return Err(FederationError::Config(
                "control_queue_retry_secs must be > 0".into(),
            ));
        }
        if self.abort_timeout_secs == 0 {
            return Err(FederationError::Config("abort_timeout_secs must be > 0".into()));
        }

        let mut seen = HashSet::new();
        for site in &self.sites {
            if site.site_id == self.site_id {
                return Err(FederationError::Config(format!(
                    "Remote site '{}' has the local site id",
                    site.site_id
                )));
            }
            if !seen.insert(site.site_id.as_str()) {
                return Err(FederationError::Config(format!(
                    "Duplicate remote site '{}'",
                    site.site_id
                )));
            }
            if site.broker.port == 0 {
                return Err(FederationError::Config(format!(
                    "Remote site '{}': broker.port must be > 0",
                    site.site_id
                )));
            }
        }

        Ok(())
    }

    /// Effective local control queue name
    pub fn control_queue(&self) -> String {
        self.control_queue_name
            .clone()
            .unwrap_or_else(|| naming::control_queue_name(&self.site_id))
    }

    /// Control queue creation retry interval
    pub fn control_queue_retry(&self) -> Duration {
        Duration::from_secs(self.control_queue_retry_secs)
    }

    /// Plugin abort ceiling
    pub fn abort_timeout(&self) -> Duration {
        Duration::from_secs(self.abort_timeout_secs)
    }
}

/// Resolves remote site ids to transport addresses
pub trait SiteRegistry: Send + Sync {
    /// Look up a remote site
    fn resolve(&self, site_id: &str) -> Option<RemoteSiteConfig>;
}

/// Site registry backed by the config's `sites` list
#[derive(Debug, Clone, Default)]
pub struct StaticSiteRegistry {
    sites: Vec<RemoteSiteConfig>,
}

impl StaticSiteRegistry {
    /// Registry over an explicit list
    pub fn new(sites: Vec<RemoteSiteConfig>) -> Self {
        Self { sites }
    }

    /// Registry over a config's remote sites
    pub fn from_config(config: &FederationConfig) -> Self {
        Self::new(config.sites.clone())
    }
}

impl SiteRegistry for StaticSiteRegistry {
    fn resolve(&self, site_id: &str) -> Option<RemoteSiteConfig> {
        self.sites.iter().find(|s| s.site_id == site_id).cloned()
    }
}

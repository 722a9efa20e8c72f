//! Controller configuration
//!
//! Configuration is read from an optional YAML file and can be overridden from
//! the command line. Durations are expressed in whole seconds.
//!
//! ```yaml
//! azure:
//!   subscriptionId: 00000000-0000-0000-0000-000000000000
//!   resourceGroup: shoot--dev--test
//! orphanedPublicIPRemedy:
//!   requeueIntervalSeconds: 60
//!   deletionGracePeriodSeconds: 300
//!   maxGetAttempts: 5
//!   maxCleanAttempts: 5
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Default Azure Resource Manager endpoint
pub const DEFAULT_ARM_ENDPOINT: &str = "https://management.azure.com";

/// Retry and timing settings for the orphaned public IP remedy
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RemedyConfig {
    /// Delay before polling again or retrying a failed operation
    #[serde(rename = "requeueIntervalSeconds", with = "seconds")]
    pub requeue_interval: Duration,

    /// Minimum time between a deletion request and the first removal attempt
    #[serde(rename = "deletionGracePeriodSeconds", with = "seconds")]
    pub deletion_grace_period: Duration,

    /// Lookup failures tolerated before giving up on requeueing
    pub max_get_attempts: u32,

    /// Detach/delete failures tolerated before giving up on requeueing
    pub max_clean_attempts: u32,
}

impl Default for RemedyConfig {
    fn default() -> Self {
        Self {
            requeue_interval: Duration::from_secs(60),
            deletion_grace_period: Duration::from_secs(300),
            max_get_attempts: 5,
            max_clean_attempts: 5,
        }
    }
}

impl RemedyConfig {
    /// Validate the settings
    pub fn validate(&self) -> Result<(), Error> {
        if self.requeue_interval.is_zero() {
            return Err(Error::config("requeueIntervalSeconds must be greater than 0"));
        }
        if self.max_get_attempts == 0 {
            return Err(Error::config("maxGetAttempts must be at least 1"));
        }
        if self.max_clean_attempts == 0 {
            return Err(Error::config("maxCleanAttempts must be at least 1"));
        }
        Ok(())
    }
}

/// Azure account settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AzureConfig {
    /// Subscription that owns the resource group
    pub subscription_id: String,

    /// Resource group holding the cluster's public IPs and load balancers
    pub resource_group: String,

    /// Azure Resource Manager endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arm_endpoint: Option<String>,
}

impl AzureConfig {
    /// ARM endpoint, falling back to the public cloud
    pub fn arm_endpoint(&self) -> &str {
        self.arm_endpoint.as_deref().unwrap_or(DEFAULT_ARM_ENDPOINT)
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<(), Error> {
        if self.subscription_id.is_empty() {
            return Err(Error::config("azure.subscriptionId is required"));
        }
        if self.resource_group.is_empty() {
            return Err(Error::config("azure.resourceGroup is required"));
        }
        Ok(())
    }
}

/// Complete controller configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    /// Azure account settings
    pub azure: AzureConfig,

    /// Remedy settings for orphaned public IP addresses
    #[serde(rename = "orphanedPublicIPRemedy")]
    pub orphaned_public_ip_remedy: RemedyConfig,
}

impl ControllerConfig {
    /// Parse configuration from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        serde_yaml::from_str(yaml).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml(&content)
    }

    /// Validate the whole configuration
    pub fn validate(&self) -> Result<(), Error> {
        self.azure.validate()?;
        self.orphaned_public_ip_remedy.validate()
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

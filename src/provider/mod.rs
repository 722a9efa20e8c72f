//! Cloud provider abstraction for public IP addresses
//!
//! The actuator talks to Azure only through the [`PublicIpProvider`] trait, so
//! tests can substitute a mock and the ARM implementation stays swappable.
//!
//! # Implementations
//!
//! - [`ArmPublicIpClient`] - Azure Resource Manager REST API

mod azure;

pub use azure::ArmPublicIpClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// A public IP address as reported by Azure
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzurePublicIp {
    /// Full ARM resource ID
    pub id: String,
    /// Resource name
    pub name: String,
    /// Resource properties
    #[serde(default)]
    pub properties: AzurePublicIpProperties,
}

/// Properties of an Azure public IP address
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzurePublicIpProperties {
    /// The allocated address, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// Provisioning state (e.g. "Succeeded", "Deleting")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_state: Option<String>,
}

impl AzurePublicIp {
    /// The allocated address, if any
    pub fn ip_address(&self) -> Option<&str> {
        self.properties.ip_address.as_deref()
    }

    /// The provisioning state, if reported
    pub fn provisioning_state(&self) -> Option<&str> {
        self.properties.provisioning_state.as_deref()
    }
}

/// Operations on Azure public IP addresses needed by the actuator
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PublicIpProvider: Send + Sync {
    /// Find the public IP address that currently has the given address allocated
    async fn get_by_ip(&self, ip: &str) -> Result<Option<AzurePublicIp>, Error>;

    /// Get a public IP address by resource name
    async fn get_by_name(&self, name: &str) -> Result<Option<AzurePublicIp>, Error>;

    /// Detach the given public IP address IDs from every load balancer frontend
    async fn remove_from_load_balancer(&self, ids: &[String]) -> Result<(), Error>;

    /// Delete a public IP address by resource name
    async fn delete(&self, name: &str) -> Result<(), Error>;
}

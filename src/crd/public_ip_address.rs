//! PublicIPAddress Custom Resource Definition
//!
//! A PublicIPAddress tracks one externally observed Azure public IP address
//! that may have been orphaned by a deleted LoadBalancer service. Its status
//! is a projection of what Azure currently reports for that address.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a PublicIPAddress
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "azure.remedy.dev",
    version = "v1alpha1",
    kind = "PublicIPAddress",
    plural = "publicipaddresses",
    shortname = "pubip",
    status = "PublicIPAddressStatus",
    namespaced,
    printcolumn = r#"{"name":"IP","type":"string","jsonPath":".spec.ipAddress"}"#,
    printcolumn = r#"{"name":"Exists","type":"boolean","jsonPath":".status.exists"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.provisioningState"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PublicIPAddressSpec {
    /// The public IP address as reported by the service's load balancer ingress
    pub ip_address: String,
}

/// Status for a PublicIPAddress
///
/// `exists` implies `id` and `name` are set; when it is false both are cleared.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublicIPAddressStatus {
    /// Whether Azure currently reports a matching public IP address
    #[serde(default)]
    pub exists: bool,

    /// Azure resource ID of the matched public IP address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Azure resource name of the matched public IP address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Last observed Azure provisioning state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_state: Option<String>,

    /// Failed operations, at most one entry per operation type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_operations: Vec<FailedOperation>,
}

impl PublicIPAddressStatus {
    /// Record the identity and state of a matched Azure public IP address
    pub fn found(&mut self, id: String, name: String, provisioning_state: Option<String>) {
        self.exists = true;
        self.id = Some(id);
        self.name = Some(name);
        self.provisioning_state = provisioning_state;
    }

    /// Clear everything learned about the Azure public IP address
    pub fn not_found(&mut self) {
        self.exists = false;
        self.id = None;
        self.name = None;
        self.provisioning_state = None;
    }
}

/// Kind of operation performed against Azure
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum OperationType {
    /// Looking up the public IP address by IP or by name
    GetPublicIPAddress,
    /// Detaching the public IP address from load balancer frontends
    RemoveFromLoadBalancer,
    /// Deleting the public IP address
    DeletePublicIPAddress,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::GetPublicIPAddress => "GetPublicIPAddress",
            Self::RemoveFromLoadBalancer => "RemoveFromLoadBalancer",
            Self::DeletePublicIPAddress => "DeletePublicIPAddress",
        };
        f.write_str(s)
    }
}

/// The last failure of one operation type and how often it failed in a row
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FailedOperation {
    /// Operation type
    #[serde(rename = "type")]
    pub type_: OperationType,

    /// Number of consecutive failed attempts
    pub attempts: u32,

    /// Error message of the last failed attempt
    pub error_message: String,

    /// When the last attempt failed
    pub timestamp: DateTime<Utc>,
}

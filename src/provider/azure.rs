//! Azure Resource Manager implementation of [`PublicIpProvider`]
//!
//! Talks to the `Microsoft.Network` REST API of a single resource group.
//! Acquiring the bearer token is left to the caller.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::{AzurePublicIp, PublicIpProvider};
use crate::config::AzureConfig;
use crate::Error;

const NETWORK_API_VERSION: &str = "2023-09-01";

/// One page of an ARM list response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPage<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(default)]
    next_link: Option<String>,
}

/// Public IP operations against the Azure Resource Manager REST API
pub struct ArmPublicIpClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl ArmPublicIpClient {
    /// Create a client scoped to the configured subscription and resource group
    pub fn new(config: &AzureConfig, access_token: impl Into<String>) -> Result<Self, Error> {
        config.validate()?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self::with_client(http, config, access_token))
    }

    /// Create a client using an existing HTTP client
    pub fn with_client(
        http: reqwest::Client,
        config: &AzureConfig,
        access_token: impl Into<String>,
    ) -> Self {
        let base_url = format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network",
            config.arm_endpoint().trim_end_matches('/'),
            config.subscription_id,
            config.resource_group,
        );
        Self {
            http,
            base_url,
            access_token: access_token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}?api-version={}",
            self.base_url, path, NETWORK_API_VERSION
        )
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, Error> {
        let mut request = self
            .http
            .request(method, url)
            .bearer_auth(&self.access_token);
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, Error> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let url = response.url().to_string();
        let body = response.text().await.unwrap_or_default();
        Err(Error::provider(format!(
            "{} returned {}: {}",
            url, status, body
        )))
    }

    /// Fetch every item of a paginated ARM collection
    async fn list<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>, Error> {
        let mut items = Vec::new();
        let mut next = Some(self.url(collection));

        while let Some(url) = next {
            let response = Self::check(self.send(Method::GET, &url, None).await?).await?;
            let page: ListPage<T> = response.json().await?;
            items.extend(page.value);
            next = page.next_link;
        }

        Ok(items)
    }
}

#[async_trait]
impl PublicIpProvider for ArmPublicIpClient {
    async fn get_by_ip(&self, ip: &str) -> Result<Option<AzurePublicIp>, Error> {
        let ips: Vec<AzurePublicIp> = self.list("publicIPAddresses").await?;
        Ok(ips.into_iter().find(|p| p.ip_address() == Some(ip)))
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<AzurePublicIp>, Error> {
        let url = self.url(&format!("publicIPAddresses/{}", name));
        let response = self.send(Method::GET, &url, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response).await?;
        Ok(Some(response.json().await?))
    }

    async fn remove_from_load_balancer(&self, ids: &[String]) -> Result<(), Error> {
        let load_balancers: Vec<Value> = self.list("loadBalancers").await?;

        for mut lb in load_balancers {
            if !detach_public_ips(&mut lb, ids) {
                continue;
            }

            let name = lb
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::provider("load balancer has no name"))?;

            info!(load_balancer = %name, "removing public IP frontends from load balancer");
            let url = self.url(&format!("loadBalancers/{}", name));
            Self::check(self.send(Method::PUT, &url, Some(&lb)).await?).await?;
        }

        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        let url = self.url(&format!("publicIPAddresses/{}", name));
        let response = self.send(Method::DELETE, &url, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(name = %name, "public IP address already gone");
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }
}

/// Strip frontend IP configurations referencing any of `public_ip_ids` from a
/// load balancer document, along with the rules bound to those frontends.
///
/// Returns true if the load balancer was modified. ARM IDs compare
/// case-insensitively.
fn detach_public_ips(lb: &mut Value, public_ip_ids: &[String]) -> bool {
    let matches_ip = |id: &str| public_ip_ids.iter().any(|p| p.eq_ignore_ascii_case(id));

    let Some(properties) = lb.get_mut("properties").and_then(Value::as_object_mut) else {
        return false;
    };

    let mut removed_frontends: Vec<String> = Vec::new();
    if let Some(frontends) = properties
        .get_mut("frontendIPConfigurations")
        .and_then(Value::as_array_mut)
    {
        frontends.retain(|fe| {
            let public_ip = fe
                .pointer("/properties/publicIPAddress/id")
                .and_then(Value::as_str);
            match public_ip {
                Some(id) if matches_ip(id) => {
                    if let Some(fe_id) = fe.get("id").and_then(Value::as_str) {
                        removed_frontends.push(fe_id.to_string());
                    }
                    false
                }
                _ => true,
            }
        });
    }

    if removed_frontends.is_empty() {
        return false;
    }

    let references_removed = |rule: &Value| {
        let single = rule
            .pointer("/properties/frontendIPConfiguration/id")
            .and_then(Value::as_str)
            .into_iter();
        let many = rule
            .pointer("/properties/frontendIPConfigurations")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|r| r.get("id").and_then(Value::as_str));
        single
            .chain(many)
            .any(|id| removed_frontends.iter().any(|r| r.eq_ignore_ascii_case(id)))
    };

    for rules in [
        "loadBalancingRules",
        "inboundNatRules",
        "inboundNatPools",
        "outboundRules",
    ] {
        if let Some(list) = properties.get_mut(rules).and_then(Value::as_array_mut) {
            list.retain(|rule| !references_removed(rule));
        }
    }

    true
}

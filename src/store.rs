//! Persistence of PublicIPAddress objects
//!
//! The actuator reads and writes PublicIPAddress objects only through
//! [`PublicIpStore`], which allows mocking the Kubernetes API in tests.

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::PublicIPAddress;
use crate::Error;

const FIELD_MANAGER: &str = "remedy-controller";

/// Trait abstracting Kubernetes operations on PublicIPAddress objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PublicIpStore: Send + Sync {
    /// Read the current version of a PublicIPAddress
    async fn get(&self, namespace: &str, name: &str) -> Result<PublicIPAddress, Error>;

    /// Replace the status sub-resource with the status of `pubip`
    ///
    /// The write carries `pubip`'s resource version, so it fails if the
    /// object changed since it was read.
    async fn update_status(&self, pubip: &PublicIPAddress) -> Result<(), Error>;

    /// Add a finalizer if it is not present yet
    async fn add_finalizer(&self, pubip: &PublicIPAddress, finalizer: &str) -> Result<(), Error>;

    /// Remove a finalizer if it is present
    async fn remove_finalizer(&self, pubip: &PublicIPAddress, finalizer: &str)
        -> Result<(), Error>;
}

/// Real Kubernetes implementation of [`PublicIpStore`]
pub struct KubePublicIpStore {
    client: Client,
}

impl KubePublicIpStore {
    /// Create a new store wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, pubip: &PublicIPAddress) -> Api<PublicIPAddress> {
        let namespace = pubip.namespace().unwrap_or_default();
        Api::namespaced(self.client.clone(), &namespace)
    }

    async fn patch_finalizers(
        &self,
        pubip: &PublicIPAddress,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });

        self.api(pubip)
            .patch(
                &pubip.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;

        Ok(())
    }
}

#[async_trait]
impl PublicIpStore for KubePublicIpStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<PublicIPAddress, Error> {
        let api: Api<PublicIPAddress> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn update_status(&self, pubip: &PublicIPAddress) -> Result<(), Error> {
        let data = serde_json::to_vec(pubip).map_err(|e| Error::serialization(e.to_string()))?;

        self.api(pubip)
            .replace_status(&pubip.name_any(), &PostParams::default(), data)
            .await?;

        Ok(())
    }

    async fn add_finalizer(&self, pubip: &PublicIPAddress, finalizer: &str) -> Result<(), Error> {
        // Read the current object so concurrent finalizer edits are kept
        let current = self.api(pubip).get(&pubip.name_any()).await?;
        let mut finalizers = current.metadata.finalizers.unwrap_or_default();

        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }

        finalizers.push(finalizer.to_string());
        self.patch_finalizers(pubip, finalizers).await
    }

    async fn remove_finalizer(
        &self,
        pubip: &PublicIPAddress,
        finalizer: &str,
    ) -> Result<(), Error> {
        let api = self.api(pubip);
        let current = match api.get(&pubip.name_any()).await {
            Ok(current) => current,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(publicipaddress = %pubip.name_any(), "already gone, nothing to finalize");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let existing = current.metadata.finalizers.unwrap_or_default();
        if !existing.iter().any(|f| f == finalizer) {
            return Ok(());
        }

        let finalizers = existing.into_iter().filter(|f| f != finalizer).collect();
        self.patch_finalizers(pubip, finalizers).await
    }
}

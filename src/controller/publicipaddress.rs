//! PublicIPAddress controller
//!
//! Runs the actuator for every PublicIPAddress delivered by the kube-rs
//! controller and maps its outcome onto an [`Action`]. A finalizer keeps the
//! object around until the Azure public IP address has been cleaned up.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument};

use super::actuator::{Actuator, PublicIpActuator, ReconcileOutcome};
use crate::config::RemedyConfig;
use crate::crd::PublicIPAddress;
use crate::metrics::CleanedIpsCounter;
use crate::provider::PublicIpProvider;
use crate::store::PublicIpStore;
use crate::Error;

/// Finalizer holding PublicIPAddress objects until their Azure public IP is gone
pub const FINALIZER: &str = "azure.remedy.dev/publicipaddress";

/// Backoff for errors that carry no requeue delay of their own
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Controller context shared by all reconciliations
pub struct Context {
    /// Reconciles the Azure side of each object
    pub actuator: Arc<dyn Actuator>,
    /// Kubernetes access for finalizer handling
    pub store: Arc<dyn PublicIpStore>,
}

impl Context {
    /// Build a context around a [`PublicIpActuator`]
    pub fn new(
        provider: Arc<dyn PublicIpProvider>,
        store: Arc<dyn PublicIpStore>,
        cleaned_ips: Arc<dyn CleanedIpsCounter>,
        config: RemedyConfig,
    ) -> Self {
        let actuator = PublicIpActuator::new(provider, store.clone(), cleaned_ips, config);
        Self {
            actuator: Arc::new(actuator),
            store,
        }
    }

    /// Create a context for testing with custom mocks
    #[cfg(test)]
    pub fn for_testing(actuator: Arc<dyn Actuator>, store: Arc<dyn PublicIpStore>) -> Self {
        Self { actuator, store }
    }
}

/// Reconcile a PublicIPAddress
#[instrument(
    skip(pubip, ctx),
    fields(publicipaddress = %pubip.name_any(), namespace = %pubip.namespace().unwrap_or_default())
)]
pub async fn reconcile(pubip: Arc<PublicIPAddress>, ctx: Arc<Context>) -> Result<Action, Error> {
    if pubip.metadata.deletion_timestamp.is_some() {
        return reconcile_deletion(&pubip, &ctx).await;
    }

    if !has_finalizer(&pubip) {
        debug!("adding finalizer");
        ctx.store.add_finalizer(&pubip, FINALIZER).await?;
    }

    match ctx.actuator.create_or_update(&pubip).await {
        Ok(ReconcileOutcome {
            requeue_after: Some(delay),
            ..
        }) => Ok(Action::requeue(delay)),
        Ok(_) => Ok(Action::await_change()),
        Err(e) => requeue_or_propagate(e),
    }
}

async fn reconcile_deletion(pubip: &PublicIPAddress, ctx: &Context) -> Result<Action, Error> {
    if let Err(e) = ctx.actuator.delete(pubip).await {
        return requeue_or_propagate(e);
    }

    if has_finalizer(pubip) {
        info!("cleanup finished, removing finalizer");
        ctx.store.remove_finalizer(pubip, FINALIZER).await?;
    }

    Ok(Action::await_change())
}

/// Turn a recoverable actuator error into a requeue and pass anything else on
fn requeue_or_propagate(err: Error) -> Result<Action, Error> {
    match err.requeue_delay() {
        Some(delay) => {
            debug!(cause = %err.cause(), ?delay, "requeueing");
            Ok(Action::requeue(delay))
        }
        None => Err(err),
    }
}

fn has_finalizer(pubip: &PublicIPAddress) -> bool {
    pubip.finalizers().iter().any(|f| f == FINALIZER)
}

/// Error policy for the controller
pub fn error_policy(pubip: Arc<PublicIPAddress>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        publicipaddress = %pubip.name_any(),
        "reconciliation failed"
    );

    Action::requeue(ERROR_BACKOFF)
}

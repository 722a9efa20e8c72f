//! Actuator for PublicIPAddress objects
//!
//! The actuator correlates a PublicIPAddress with the Azure public IP it
//! tracks. `create_or_update` keeps the status in line with what Azure
//! reports; `delete` detaches the Azure public IP from its load balancers and
//! deletes it once the deletion grace period has passed.
//!
//! Failures of Azure calls are recorded in the status' failure history and
//! retried after the requeue interval until the per-type retry budget is
//! spent. Failures to write the status are returned as-is.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::clock::{Clock, SystemClock};
use crate::config::RemedyConfig;
use crate::crd::{OperationType, PublicIPAddress, PublicIPAddressStatus};
use crate::failure;
use crate::metrics::CleanedIpsCounter;
use crate::provider::{AzurePublicIp, PublicIpProvider};
use crate::store::PublicIpStore;
use crate::Error;

const GET_BY_IP_FAILED: &str = "could not get Azure public IP address by IP";
const GET_BY_NAME_FAILED: &str = "could not get Azure public IP address by name";
const REMOVE_FROM_LB_FAILED: &str = "could not remove Azure public IP address from the load balancer";
const DELETE_FAILED: &str = "could not delete Azure public IP address";
const GET_OBJECT_FAILED: &str = "could not get publicipaddress";

/// Result of a successful `create_or_update`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Reconcile again after this delay
    pub requeue_after: Option<Duration>,
    /// Whether the caller should drop its finalizer
    pub remove_finalizer: bool,
}

impl ReconcileOutcome {
    /// Nothing left to do until the object changes
    pub fn done() -> Self {
        Self::default()
    }

    /// Poll again after `delay`
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
            remove_finalizer: false,
        }
    }
}

/// Reconciles the cloud side of a PublicIPAddress
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Bring the status in line with Azure
    ///
    /// Errors carrying a requeue delay are recoverable; anything else comes
    /// from writing the status and is returned unchanged.
    async fn create_or_update(&self, pubip: &PublicIPAddress) -> Result<ReconcileOutcome, Error>;

    /// Remove the Azure public IP once the deletion grace period has passed
    ///
    /// `Ok(())` means the caller may stop tracking the object.
    async fn delete(&self, pubip: &PublicIPAddress) -> Result<(), Error>;
}

/// Outcome of looking up the Azure public IP for a PublicIPAddress
enum Lookup {
    Found(AzurePublicIp),
    NotFound,
    /// The lookup failed and the retry budget is spent
    GaveUp,
}

/// [`Actuator`] for Azure public IP addresses
pub struct PublicIpActuator {
    provider: Arc<dyn PublicIpProvider>,
    store: Arc<dyn PublicIpStore>,
    cleaned_ips: Arc<dyn CleanedIpsCounter>,
    clock: Arc<dyn Clock>,
    config: RemedyConfig,
}

impl PublicIpActuator {
    /// Create an actuator using the wall clock
    pub fn new(
        provider: Arc<dyn PublicIpProvider>,
        store: Arc<dyn PublicIpStore>,
        cleaned_ips: Arc<dyn CleanedIpsCounter>,
        config: RemedyConfig,
    ) -> Self {
        Self {
            provider,
            store,
            cleaned_ips,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Look up the Azure public IP, by name if it was matched before and by
    /// address otherwise
    async fn lookup(&self, pubip: &PublicIPAddress) -> Result<Lookup, Error> {
        let known_name = pubip
            .status
            .as_ref()
            .filter(|s| s.exists)
            .and_then(|s| s.name.as_deref());

        let result = match known_name {
            Some(name) => self
                .provider
                .get_by_name(name)
                .await
                .map_err(|e| Error::operation(GET_BY_NAME_FAILED, e)),
            None => self
                .provider
                .get_by_ip(&pubip.spec.ip_address)
                .await
                .map_err(|e| Error::operation(GET_BY_IP_FAILED, e)),
        };

        match result {
            Ok(Some(azure_ip)) => Ok(Lookup::Found(azure_ip)),
            Ok(None) => Ok(Lookup::NotFound),
            Err(err) => {
                self.record_failure(
                    pubip,
                    OperationType::GetPublicIPAddress,
                    err,
                    self.config.max_get_attempts,
                )
                .await?;
                Ok(Lookup::GaveUp)
            }
        }
    }

    /// Record a failed Azure call in the status
    ///
    /// Returns a requeue error while the attempts stay within `max_attempts`,
    /// and `Ok(())` once the budget is spent.
    async fn record_failure(
        &self,
        pubip: &PublicIPAddress,
        type_: OperationType,
        err: Error,
        max_attempts: u32,
    ) -> Result<(), Error> {
        let message = err.to_string();
        let now = self.clock.now();
        let status = self
            .update_status(pubip, move |status| {
                let history = std::mem::take(&mut status.failed_operations);
                status.failed_operations = failure::record_failure(history, type_, message, now);
            })
            .await?;

        let attempts = failure::attempts(&status.failed_operations, type_);
        if attempts <= max_attempts {
            warn!(
                publicipaddress = %pubip.name_any(),
                operation = %type_,
                attempts,
                error = %err,
                "operation failed, will retry"
            );
            return Err(Error::requeue_after(err, self.config.requeue_interval));
        }

        warn!(
            publicipaddress = %pubip.name_any(),
            operation = %type_,
            attempts,
            max_attempts,
            error = %err,
            "operation failed and no attempts remain"
        );
        Ok(())
    }

    /// Drop the failure history entry for `type_`
    async fn clear_failure(
        &self,
        pubip: &PublicIPAddress,
        type_: OperationType,
    ) -> Result<(), Error> {
        self.update_status(pubip, move |status| {
            let history = std::mem::take(&mut status.failed_operations);
            status.failed_operations = failure::clear_failure(history, type_);
        })
        .await?;
        Ok(())
    }

    /// Project the lookup result onto the status
    async fn sync_status(
        &self,
        pubip: &PublicIPAddress,
        azure_ip: Option<&AzurePublicIp>,
    ) -> Result<(), Error> {
        self.update_status(pubip, move |status| {
            match azure_ip {
                Some(ip) => status.found(
                    ip.id.clone(),
                    ip.name.clone(),
                    ip.provisioning_state().map(str::to_string),
                ),
                None => status.not_found(),
            }
            let history = std::mem::take(&mut status.failed_operations);
            status.failed_operations =
                failure::clear_failure(history, OperationType::GetPublicIPAddress);
        })
        .await?;
        Ok(())
    }

    /// Apply `mutate` to the stored status and write it back if it changed
    ///
    /// Always starts from the object as currently stored, not from the copy
    /// handed to the actuator.
    async fn update_status<F>(
        &self,
        pubip: &PublicIPAddress,
        mutate: F,
    ) -> Result<PublicIPAddressStatus, Error>
    where
        F: FnOnce(&mut PublicIPAddressStatus) + Send,
    {
        let namespace = pubip.namespace().unwrap_or_default();
        let name = pubip.name_any();

        let mut current = self
            .store
            .get(&namespace, &name)
            .await
            .map_err(|e| Error::operation(GET_OBJECT_FAILED, e))?;

        let before = current.status.clone().unwrap_or_default();
        let mut status = before.clone();
        mutate(&mut status);

        if status == before {
            debug!(publicipaddress = %name, "status unchanged, skipping update");
            return Ok(status);
        }

        current.status = Some(status.clone());
        self.store
            .update_status(&current)
            .await
            .map_err(Error::status_update)?;

        debug!(publicipaddress = %name, exists = status.exists, "status updated");
        Ok(status)
    }

    /// Whether the deletion grace period has passed
    ///
    /// An object without a deletion timestamp counts as just requested.
    fn grace_period_elapsed(&self, pubip: &PublicIPAddress) -> bool {
        let Some(requested) = pubip.metadata.deletion_timestamp.as_ref() else {
            return false;
        };

        self.clock
            .now()
            .signed_duration_since(requested.0)
            .to_std()
            .map(|elapsed| elapsed >= self.config.deletion_grace_period)
            .unwrap_or(false)
    }
}

#[async_trait]
impl Actuator for PublicIpActuator {
    async fn create_or_update(&self, pubip: &PublicIPAddress) -> Result<ReconcileOutcome, Error> {
        let azure_ip = match self.lookup(pubip).await? {
            Lookup::Found(azure_ip) => azure_ip,
            Lookup::NotFound => {
                self.sync_status(pubip, None).await?;
                debug!(
                    publicipaddress = %pubip.name_any(),
                    ip = %pubip.spec.ip_address,
                    "Azure public IP address not found, polling"
                );
                return Ok(ReconcileOutcome::requeue_after(self.config.requeue_interval));
            }
            Lookup::GaveUp => return Ok(ReconcileOutcome::done()),
        };

        self.sync_status(pubip, Some(&azure_ip)).await?;
        debug!(
            publicipaddress = %pubip.name_any(),
            azure_name = %azure_ip.name,
            "Azure public IP address found"
        );
        Ok(ReconcileOutcome::done())
    }

    async fn delete(&self, pubip: &PublicIPAddress) -> Result<(), Error> {
        let name = pubip.name_any();

        let azure_ip = match self.lookup(pubip).await? {
            Lookup::Found(azure_ip) => azure_ip,
            Lookup::NotFound => {
                self.sync_status(pubip, None).await?;
                info!(publicipaddress = %name, "Azure public IP address does not exist, nothing to clean");
                return Ok(());
            }
            Lookup::GaveUp => return Ok(()),
        };

        if !self.grace_period_elapsed(pubip) {
            debug!(publicipaddress = %name, "deletion grace period not elapsed yet");
            return Err(Error::requeue_after(
                Error::StillExists,
                self.config.requeue_interval,
            ));
        }

        self.sync_status(pubip, Some(&azure_ip)).await?;

        info!(publicipaddress = %name, azure_name = %azure_ip.name, "removing Azure public IP address from load balancers");
        if let Err(e) = self
            .provider
            .remove_from_load_balancer(std::slice::from_ref(&azure_ip.id))
            .await
        {
            return self
                .record_failure(
                    pubip,
                    OperationType::RemoveFromLoadBalancer,
                    Error::operation(REMOVE_FROM_LB_FAILED, e),
                    self.config.max_clean_attempts,
                )
                .await;
        }
        self.clear_failure(pubip, OperationType::RemoveFromLoadBalancer)
            .await?;

        info!(publicipaddress = %name, azure_name = %azure_ip.name, "deleting Azure public IP address");
        if let Err(e) = self.provider.delete(&azure_ip.name).await {
            return self
                .record_failure(
                    pubip,
                    OperationType::DeletePublicIPAddress,
                    Error::operation(DELETE_FAILED, e),
                    self.config.max_clean_attempts,
                )
                .await;
        }

        self.update_status(pubip, |status| *status = PublicIPAddressStatus::default())
            .await?;
        self.cleaned_ips.inc();

        info!(publicipaddress = %name, azure_name = %azure_ip.name, "Azure public IP address cleaned up");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::{DateTime, TimeZone, Utc};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use crate::clock::FixedClock;
    use crate::crd::{FailedOperation, PublicIPAddressSpec};
    use crate::metrics::MockCleanedIpsCounter;
    use crate::provider::{AzurePublicIpProperties, MockPublicIpProvider};
    use crate::store::MockPublicIpStore;

    const NAMESPACE: &str = "test";
    const PUBIP_NAME: &str = "test-service-1.2.3.4";
    const IP: &str = "1.2.3.4";
    const AZURE_ID: &str = "/subscriptions/xxx/resourceGroups/shoot--dev--test/providers/Microsoft.Network/publicIPAddresses/shoot--dev--test-ip1";
    const AZURE_NAME: &str = "shoot--dev--test-ip1";
    const REQUEUE_INTERVAL: Duration = Duration::from_secs(1);

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn early_deletion() -> DateTime<Utc> {
        now() - chrono::Duration::minutes(10)
    }

    fn config() -> RemedyConfig {
        RemedyConfig {
            requeue_interval: REQUEUE_INTERVAL,
            deletion_grace_period: Duration::from_secs(1),
            max_get_attempts: 2,
            max_clean_attempts: 2,
        }
    }

    fn failed(type_: OperationType, attempts: u32, message: &str) -> FailedOperation {
        FailedOperation {
            type_,
            attempts,
            error_message: message.to_string(),
            timestamp: now(),
        }
    }

    fn status(exists: bool, failed_operations: Vec<FailedOperation>) -> PublicIPAddressStatus {
        let mut status = PublicIPAddressStatus::default();
        if exists {
            status.found(
                AZURE_ID.to_string(),
                AZURE_NAME.to_string(),
                Some("Succeeded".to_string()),
            );
        }
        status.failed_operations = failed_operations;
        status
    }

    fn new_pubip(
        exists: bool,
        failed_operations: Vec<FailedOperation>,
        deletion: Option<DateTime<Utc>>,
    ) -> PublicIPAddress {
        let mut pubip = PublicIPAddress::new(
            PUBIP_NAME,
            PublicIPAddressSpec {
                ip_address: IP.to_string(),
            },
        );
        pubip.metadata.namespace = Some(NAMESPACE.to_string());
        pubip.metadata.deletion_timestamp = deletion.map(Time);
        pubip.status = Some(status(exists, failed_operations));
        pubip
    }

    fn azure_ip() -> AzurePublicIp {
        AzurePublicIp {
            id: AZURE_ID.to_string(),
            name: AZURE_NAME.to_string(),
            properties: AzurePublicIpProperties {
                ip_address: Some(IP.to_string()),
                provisioning_state: Some("Succeeded".to_string()),
            },
        }
    }

    /// Stored copy of the PublicIPAddress, shared with the mock store so
    /// tests can check what was written without matching call arguments.
    #[derive(Clone)]
    struct StoredObject {
        current: Arc<Mutex<PublicIPAddress>>,
        writes: Arc<Mutex<Vec<PublicIPAddressStatus>>>,
    }

    impl StoredObject {
        fn new(pubip: &PublicIPAddress) -> Self {
            Self {
                current: Arc::new(Mutex::new(pubip.clone())),
                writes: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn store(&self) -> MockPublicIpStore {
            let mut store = MockPublicIpStore::new();

            let current = self.current.clone();
            store
                .expect_get()
                .withf(|namespace, name| namespace == NAMESPACE && name == PUBIP_NAME)
                .returning(move |_, _| Ok(current.lock().unwrap().clone()));

            let current = self.current.clone();
            let writes = self.writes.clone();
            store.expect_update_status().returning(move |pubip| {
                writes
                    .lock()
                    .unwrap()
                    .push(pubip.status.clone().unwrap_or_default());
                *current.lock().unwrap() = pubip.clone();
                Ok(())
            });

            store
        }

        fn writes(&self) -> Vec<PublicIPAddressStatus> {
            self.writes.lock().unwrap().clone()
        }

        fn status(&self) -> PublicIPAddressStatus {
            self.current
                .lock()
                .unwrap()
                .status
                .clone()
                .unwrap_or_default()
        }
    }

    /// Store whose reads succeed and whose status writes always fail
    fn failing_store(pubip: &PublicIPAddress) -> MockPublicIpStore {
        let mut store = MockPublicIpStore::new();
        let stored = pubip.clone();
        store
            .expect_get()
            .returning(move |_, _| Ok(stored.clone()));
        store
            .expect_update_status()
            .times(1)
            .returning(|_| Err(Error::provider("test")));
        store
    }

    fn actuator(
        provider: MockPublicIpProvider,
        store: MockPublicIpStore,
        counter: MockCleanedIpsCounter,
    ) -> PublicIpActuator {
        PublicIpActuator::new(
            Arc::new(provider),
            Arc::new(store),
            Arc::new(counter),
            config(),
        )
        .with_clock(Arc::new(FixedClock(now())))
    }

    fn no_cleanup() -> MockCleanedIpsCounter {
        let mut counter = MockCleanedIpsCounter::new();
        counter.expect_inc().never();
        counter
    }

    fn expect_get_by_ip(provider: &mut MockPublicIpProvider, result: Option<AzurePublicIp>) {
        provider
            .expect_get_by_ip()
            .withf(|ip| ip == IP)
            .times(1)
            .returning(move |_| Ok(result.clone()));
    }

    fn expect_get_by_name(provider: &mut MockPublicIpProvider, result: Option<AzurePublicIp>) {
        provider
            .expect_get_by_name()
            .withf(|name| name == AZURE_NAME)
            .times(1)
            .returning(move |_| Ok(result.clone()));
    }

    fn expect_detach(provider: &mut MockPublicIpProvider, result: fn() -> Result<(), Error>) {
        provider
            .expect_remove_from_load_balancer()
            .withf(|ids| ids.len() == 1 && ids[0] == AZURE_ID)
            .times(1)
            .returning(move |_| result());
    }

    fn expect_delete(provider: &mut MockPublicIpProvider, result: fn() -> Result<(), Error>) {
        provider
            .expect_delete()
            .withf(|name| name == AZURE_NAME)
            .times(1)
            .returning(move |_| result());
    }

    mod create_or_update {
        use super::*;

        /// Story: the first time Azure reports the address, the status is
        /// populated and no further polling is needed
        #[tokio::test]
        async fn story_found_ip_populates_status() {
            let pubip = new_pubip(false, vec![], None);
            let stored = StoredObject::new(&pubip);
            let mut provider = MockPublicIpProvider::new();
            expect_get_by_ip(&mut provider, Some(azure_ip()));

            let outcome = actuator(provider, stored.store(), no_cleanup())
                .create_or_update(&pubip)
                .await
                .unwrap();

            assert_eq!(outcome, ReconcileOutcome::done());
            assert!(!outcome.remove_finalizer);
            assert_eq!(stored.writes(), vec![status(true, vec![])]);
        }

        /// Story: an address Azure does not know yet is polled without
        /// touching the status
        #[tokio::test]
        async fn story_missing_ip_polls_without_writing() {
            let pubip = new_pubip(false, vec![], None);
            let stored = StoredObject::new(&pubip);
            let mut provider = MockPublicIpProvider::new();
            expect_get_by_ip(&mut provider, None);

            let outcome = actuator(provider, stored.store(), no_cleanup())
                .create_or_update(&pubip)
                .await
                .unwrap();

            assert_eq!(outcome.requeue_after, Some(REQUEUE_INTERVAL));
            assert!(!outcome.remove_finalizer);
            assert!(stored.writes().is_empty());
        }

        /// Story: once matched, the address is looked up by name and an
        /// unchanged result causes no write
        #[tokio::test]
        async fn story_known_ip_unchanged_skips_write() {
            let pubip = new_pubip(true, vec![], None);
            let stored = StoredObject::new(&pubip);
            let mut provider = MockPublicIpProvider::new();
            expect_get_by_name(&mut provider, Some(azure_ip()));

            let outcome = actuator(provider, stored.store(), no_cleanup())
                .create_or_update(&pubip)
                .await
                .unwrap();

            assert_eq!(outcome, ReconcileOutcome::done());
            assert!(stored.writes().is_empty());
        }

        /// Story: a matched address that disappeared from Azure clears the
        /// status and goes back to polling
        #[tokio::test]
        async fn story_known_ip_gone_clears_status() {
            let pubip = new_pubip(true, vec![], None);
            let stored = StoredObject::new(&pubip);
            let mut provider = MockPublicIpProvider::new();
            expect_get_by_name(&mut provider, None);

            let outcome = actuator(provider, stored.store(), no_cleanup())
                .create_or_update(&pubip)
                .await
                .unwrap();

            assert_eq!(outcome.requeue_after, Some(REQUEUE_INTERVAL));
            assert_eq!(stored.writes(), vec![status(false, vec![])]);
        }

        #[tokio::test]
        async fn test_changed_provisioning_state_is_written() {
            let pubip = new_pubip(true, vec![], None);
            let stored = StoredObject::new(&pubip);
            let mut provider = MockPublicIpProvider::new();
            let mut updating = azure_ip();
            updating.properties.provisioning_state = Some("Updating".to_string());
            expect_get_by_name(&mut provider, Some(updating));

            actuator(provider, stored.store(), no_cleanup())
                .create_or_update(&pubip)
                .await
                .unwrap();

            assert_eq!(
                stored.status().provisioning_state.as_deref(),
                Some("Updating")
            );
            assert_eq!(stored.writes().len(), 1);
        }

        /// Story: a failed lookup is recorded and retried after the requeue
        /// interval
        #[tokio::test]
        async fn story_lookup_failure_is_recorded_and_requeued() {
            let pubip = new_pubip(false, vec![], None);
            let stored = StoredObject::new(&pubip);
            let mut provider = MockPublicIpProvider::new();
            provider
                .expect_get_by_ip()
                .times(1)
                .returning(|_| Err(Error::provider("test")));

            let err = actuator(provider, stored.store(), no_cleanup())
                .create_or_update(&pubip)
                .await
                .unwrap_err();

            let message = "could not get Azure public IP address by IP: test";
            assert_eq!(err.requeue_delay(), Some(REQUEUE_INTERVAL));
            assert_eq!(err.cause().to_string(), message);
            assert_eq!(
                stored.writes(),
                vec![status(
                    false,
                    vec![failed(OperationType::GetPublicIPAddress, 1, message)]
                )]
            );
        }

        #[tokio::test]
        async fn test_repeated_lookup_failure_increments_attempts() {
            let pubip = new_pubip(
                false,
                vec![failed(OperationType::GetPublicIPAddress, 1, "old")],
                None,
            );
            let stored = StoredObject::new(&pubip);
            let mut provider = MockPublicIpProvider::new();
            provider
                .expect_get_by_ip()
                .times(1)
                .returning(|_| Err(Error::provider("test")));

            let err = actuator(provider, stored.store(), no_cleanup())
                .create_or_update(&pubip)
                .await
                .unwrap_err();

            assert!(err.requeue_delay().is_some());
            let history = stored.status().failed_operations;
            assert_eq!(history.len(), 1);
            assert_eq!(history[0].attempts, 2);
            assert_eq!(
                history[0].error_message,
                "could not get Azure public IP address by IP: test"
            );
        }

        /// Story: once lookups failed more often than allowed, the actuator
        /// stops requeueing but keeps the failure visible in the status
        #[tokio::test]
        async fn story_exhausted_lookup_stops_requeueing() {
            let pubip = new_pubip(
                false,
                vec![failed(OperationType::GetPublicIPAddress, 2, "old")],
                None,
            );
            let stored = StoredObject::new(&pubip);
            let mut provider = MockPublicIpProvider::new();
            provider
                .expect_get_by_ip()
                .times(1)
                .returning(|_| Err(Error::provider("test")));

            let outcome = actuator(provider, stored.store(), no_cleanup())
                .create_or_update(&pubip)
                .await
                .unwrap();

            assert_eq!(outcome, ReconcileOutcome::done());
            assert_eq!(
                failure::attempts(
                    &stored.status().failed_operations,
                    OperationType::GetPublicIPAddress
                ),
                3
            );
        }

        #[tokio::test]
        async fn test_successful_lookup_clears_previous_failure() {
            let pubip = new_pubip(
                false,
                vec![failed(OperationType::GetPublicIPAddress, 1, "old")],
                None,
            );
            let stored = StoredObject::new(&pubip);
            let mut provider = MockPublicIpProvider::new();
            expect_get_by_ip(&mut provider, Some(azure_ip()));

            actuator(provider, stored.store(), no_cleanup())
                .create_or_update(&pubip)
                .await
                .unwrap();

            assert_eq!(stored.status(), status(true, vec![]));
        }

        /// Story: a status write failure is not requeue-typed; retrying it is
        /// left to the controller's error policy
        #[tokio::test]
        async fn story_status_write_failure_propagates() {
            let pubip = new_pubip(false, vec![], None);
            let mut provider = MockPublicIpProvider::new();
            expect_get_by_ip(&mut provider, Some(azure_ip()));

            let err = actuator(provider, failing_store(&pubip), no_cleanup())
                .create_or_update(&pubip)
                .await
                .unwrap_err();

            assert_eq!(
                err.to_string(),
                "could not update publicipaddress status: test"
            );
            assert!(err.requeue_delay().is_none());
        }

        #[tokio::test]
        async fn test_store_read_failure_propagates() {
            let pubip = new_pubip(false, vec![], None);
            let mut provider = MockPublicIpProvider::new();
            expect_get_by_ip(&mut provider, Some(azure_ip()));
            let mut store = MockPublicIpStore::new();
            store
                .expect_get()
                .returning(|_, _| Err(Error::provider("unavailable")));

            let err = actuator(provider, store, no_cleanup())
                .create_or_update(&pubip)
                .await
                .unwrap_err();

            assert!(err.requeue_delay().is_none());
            assert!(err.to_string().starts_with("could not get publicipaddress"));
        }
    }

    mod delete {
        use super::*;

        /// Story: nothing to clean if Azure never had the address
        #[tokio::test]
        async fn story_missing_ip_needs_no_cleanup() {
            let pubip = new_pubip(false, vec![], Some(early_deletion()));
            let stored = StoredObject::new(&pubip);
            let mut provider = MockPublicIpProvider::new();
            expect_get_by_ip(&mut provider, None);

            actuator(provider, stored.store(), no_cleanup())
                .delete(&pubip)
                .await
                .unwrap();

            assert!(stored.writes().is_empty());
        }

        /// Story: Azure may still be tearing the address down itself, so the
        /// actuator waits out the grace period before touching it
        #[tokio::test]
        async fn story_grace_period_is_honoured() {
            let pubip = new_pubip(true, vec![], Some(now()));
            let mut provider = MockPublicIpProvider::new();
            expect_get_by_name(&mut provider, Some(azure_ip()));
            provider.expect_remove_from_load_balancer().never();
            provider.expect_delete().never();

            let err = actuator(provider, MockPublicIpStore::new(), no_cleanup())
                .delete(&pubip)
                .await
                .unwrap_err();

            assert_eq!(err.requeue_delay(), Some(REQUEUE_INTERVAL));
            assert_eq!(err.cause().to_string(), "public IP address still exists");
        }

        /// Story: after the grace period the address is detached, deleted,
        /// counted once and the status is cleared
        #[tokio::test]
        async fn story_detach_then_delete_after_grace_period() {
            let pubip = new_pubip(true, vec![], Some(early_deletion()));
            let stored = StoredObject::new(&pubip);
            let mut provider = MockPublicIpProvider::new();
            expect_get_by_name(&mut provider, Some(azure_ip()));
            expect_detach(&mut provider, || Ok(()));
            expect_delete(&mut provider, || Ok(()));
            let mut counter = MockCleanedIpsCounter::new();
            counter.expect_inc().times(1).return_const(());

            actuator(provider, stored.store(), counter)
                .delete(&pubip)
                .await
                .unwrap();

            assert_eq!(stored.writes(), vec![PublicIPAddressStatus::default()]);
        }

        #[tokio::test]
        async fn test_known_ip_gone_clears_status() {
            let pubip = new_pubip(true, vec![], Some(early_deletion()));
            let stored = StoredObject::new(&pubip);
            let mut provider = MockPublicIpProvider::new();
            expect_get_by_name(&mut provider, None);

            actuator(provider, stored.store(), no_cleanup())
                .delete(&pubip)
                .await
                .unwrap();

            assert_eq!(stored.writes(), vec![status(false, vec![])]);
        }

        #[tokio::test]
        async fn test_lookup_failure_requeues() {
            let pubip = new_pubip(true, vec![], None);
            let stored = StoredObject::new(&pubip);
            let mut provider = MockPublicIpProvider::new();
            provider
                .expect_get_by_name()
                .times(1)
                .returning(|_| Err(Error::provider("test")));

            let err = actuator(provider, stored.store(), no_cleanup())
                .delete(&pubip)
                .await
                .unwrap_err();

            assert_eq!(err.requeue_delay(), Some(REQUEUE_INTERVAL));
            assert_eq!(
                err.cause().to_string(),
                "could not get Azure public IP address by name: test"
            );
            assert_eq!(stored.writes().len(), 1);
        }

        /// Story: with the lookup budget already exceeded, a lookup that
        /// finds nothing clears the status and finishes the deletion
        #[tokio::test]
        async fn story_no_attempts_remain_and_ip_is_gone() {
            let pubip = new_pubip(
                true,
                vec![failed(
                    OperationType::GetPublicIPAddress,
                    3,
                    "could not get Azure public IP address by IP: test",
                )],
                None,
            );
            let stored = StoredObject::new(&pubip);
            let mut provider = MockPublicIpProvider::new();
            expect_get_by_name(&mut provider, None);

            actuator(provider, stored.store(), no_cleanup())
                .delete(&pubip)
                .await
                .unwrap();

            assert_eq!(stored.status(), PublicIPAddressStatus::default());
        }

        #[tokio::test]
        async fn test_exhausted_lookup_failure_finishes_deletion() {
            let pubip = new_pubip(
                true,
                vec![failed(OperationType::GetPublicIPAddress, 2, "old")],
                Some(early_deletion()),
            );
            let stored = StoredObject::new(&pubip);
            let mut provider = MockPublicIpProvider::new();
            provider
                .expect_get_by_name()
                .times(1)
                .returning(|_| Err(Error::provider("test")));
            provider.expect_remove_from_load_balancer().never();

            actuator(provider, stored.store(), no_cleanup())
                .delete(&pubip)
                .await
                .unwrap();

            assert_eq!(
                failure::attempts(
                    &stored.status().failed_operations,
                    OperationType::GetPublicIPAddress
                ),
                3
            );
        }

        #[tokio::test]
        async fn test_lookup_failure_with_status_write_failure_propagates() {
            let pubip = new_pubip(true, vec![], Some(early_deletion()));
            let mut provider = MockPublicIpProvider::new();
            provider
                .expect_get_by_name()
                .times(1)
                .returning(|_| Err(Error::provider("test")));

            let err = actuator(provider, failing_store(&pubip), no_cleanup())
                .delete(&pubip)
                .await
                .unwrap_err();

            assert!(matches!(err, Error::StatusUpdate(_)));
        }

        /// Story: a failed detach is recorded and retried while attempts remain
        #[tokio::test]
        async fn story_detach_failure_requeues_while_attempts_remain() {
            let pubip = new_pubip(true, vec![], Some(early_deletion()));
            let stored = StoredObject::new(&pubip);
            let mut provider = MockPublicIpProvider::new();
            expect_get_by_name(&mut provider, Some(azure_ip()));
            expect_detach(&mut provider, || Err(Error::provider("test")));
            provider.expect_delete().never();

            let err = actuator(provider, stored.store(), no_cleanup())
                .delete(&pubip)
                .await
                .unwrap_err();

            let message =
                "could not remove Azure public IP address from the load balancer: test";
            assert_eq!(err.requeue_delay(), Some(REQUEUE_INTERVAL));
            assert_eq!(err.cause().to_string(), message);
            assert_eq!(
                stored.status(),
                status(
                    true,
                    vec![failed(OperationType::RemoveFromLoadBalancer, 1, message)]
                )
            );
        }

        /// Story: once the clean budget is spent, a failing detach no longer
        /// blocks the deletion
        #[tokio::test]
        async fn story_detach_failure_beyond_budget_succeeds() {
            let pubip = new_pubip(
                true,
                vec![failed(OperationType::RemoveFromLoadBalancer, 2, "old")],
                Some(early_deletion()),
            );
            let stored = StoredObject::new(&pubip);
            let mut provider = MockPublicIpProvider::new();
            expect_get_by_name(&mut provider, Some(azure_ip()));
            expect_detach(&mut provider, || Err(Error::provider("test")));
            provider.expect_delete().never();

            actuator(provider, stored.store(), no_cleanup())
                .delete(&pubip)
                .await
                .unwrap();

            assert_eq!(
                failure::attempts(
                    &stored.status().failed_operations,
                    OperationType::RemoveFromLoadBalancer
                ),
                3
            );
        }

        #[tokio::test]
        async fn test_detach_failure_with_status_write_failure_propagates() {
            let pubip = new_pubip(true, vec![], Some(early_deletion()));
            let mut provider = MockPublicIpProvider::new();
            expect_get_by_name(&mut provider, Some(azure_ip()));
            expect_detach(&mut provider, || Err(Error::provider("test")));

            let err = actuator(provider, failing_store(&pubip), no_cleanup())
                .delete(&pubip)
                .await
                .unwrap_err();

            assert!(matches!(err, Error::StatusUpdate(_)));
        }

        /// Story: a failed delete is recorded under its own type, and the
        /// successful detach drops the stale detach failure
        #[tokio::test]
        async fn story_delete_failure_is_recorded_separately() {
            let pubip = new_pubip(
                true,
                vec![failed(OperationType::RemoveFromLoadBalancer, 1, "old")],
                Some(early_deletion()),
            );
            let stored = StoredObject::new(&pubip);
            let mut provider = MockPublicIpProvider::new();
            expect_get_by_name(&mut provider, Some(azure_ip()));
            expect_detach(&mut provider, || Ok(()));
            expect_delete(&mut provider, || Err(Error::provider("test")));

            let err = actuator(provider, stored.store(), no_cleanup())
                .delete(&pubip)
                .await
                .unwrap_err();

            let message = "could not delete Azure public IP address: test";
            assert_eq!(err.cause().to_string(), message);
            assert_eq!(err.requeue_delay(), Some(REQUEUE_INTERVAL));
            assert_eq!(
                stored.status(),
                status(
                    true,
                    vec![failed(OperationType::DeletePublicIPAddress, 1, message)]
                )
            );
            assert_eq!(stored.writes().len(), 2);
        }

        #[tokio::test]
        async fn test_delete_failure_beyond_budget_succeeds() {
            let pubip = new_pubip(
                true,
                vec![failed(OperationType::DeletePublicIPAddress, 2, "old")],
                Some(early_deletion()),
            );
            let stored = StoredObject::new(&pubip);
            let mut provider = MockPublicIpProvider::new();
            expect_get_by_name(&mut provider, Some(azure_ip()));
            expect_detach(&mut provider, || Ok(()));
            expect_delete(&mut provider, || Err(Error::provider("test")));

            actuator(provider, stored.store(), no_cleanup())
                .delete(&pubip)
                .await
                .unwrap();

            assert_eq!(
                failure::attempts(
                    &stored.status().failed_operations,
                    OperationType::DeletePublicIPAddress
                ),
                3
            );
        }

        #[tokio::test]
        async fn test_unmatched_ip_is_found_by_address_before_cleanup() {
            let pubip = new_pubip(false, vec![], Some(early_deletion()));
            let stored = StoredObject::new(&pubip);
            let mut provider = MockPublicIpProvider::new();
            expect_get_by_ip(&mut provider, Some(azure_ip()));
            expect_detach(&mut provider, || Ok(()));
            expect_delete(&mut provider, || Ok(()));
            let mut counter = MockCleanedIpsCounter::new();
            counter.expect_inc().times(1).return_const(());

            actuator(provider, stored.store(), counter)
                .delete(&pubip)
                .await
                .unwrap();

            // Found status first, then the cleared status after deletion
            assert_eq!(
                stored.writes(),
                vec![status(true, vec![]), PublicIPAddressStatus::default()]
            );
        }
    }

    mod grace_period {
        use super::*;
        use rstest::rstest;

        #[rstest]
        #[case::just_requested(Some(0), false)]
        #[case::inside_grace_period(Some(500), false)]
        #[case::exactly_elapsed(Some(1_000), true)]
        #[case::long_ago(Some(600_000), true)]
        #[case::clock_skew(Some(-5_000), false)]
        #[case::no_deletion_timestamp(None, false)]
        fn test_grace_period_elapsed(#[case] requested_ms_ago: Option<i64>, #[case] elapsed: bool) {
            let deletion =
                requested_ms_ago.map(|ms| now() - chrono::Duration::milliseconds(ms));
            let pubip = new_pubip(true, vec![], deletion);
            let actuator = actuator(
                MockPublicIpProvider::new(),
                MockPublicIpStore::new(),
                MockCleanedIpsCounter::new(),
            );

            assert_eq!(actuator.grace_period_elapsed(&pubip), elapsed);
        }
    }
}

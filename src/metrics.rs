//! Metrics for the remedy controller
//!
//! Provides OpenTelemetry metrics for:
//! - Orphaned public IP addresses removed from Azure

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::KeyValue;

#[cfg(test)]
use mockall::automock;

/// Global meter for remedy metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("remedy"));

/// Counter of orphaned public IP addresses that were detached and deleted
///
/// Labels:
/// - `provider`: cloud provider (azure)
pub static CLEANED_PUBLIC_IPS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("remedy_cleaned_public_ips_total")
        .with_description("Total number of orphaned public IP addresses cleaned up")
        .with_unit("{addresses}")
        .build()
});

/// Sink counting successful public IP cleanups
#[cfg_attr(test, automock)]
pub trait CleanedIpsCounter: Send + Sync {
    /// Count one cleaned public IP address
    fn inc(&self);
}

/// [`CleanedIpsCounter`] backed by [`CLEANED_PUBLIC_IPS`]
#[derive(Clone, Copy, Debug, Default)]
pub struct OtelCleanedIpsCounter;

impl CleanedIpsCounter for OtelCleanedIpsCounter {
    fn inc(&self) {
        CLEANED_PUBLIC_IPS.add(1, &[KeyValue::new("provider", "azure")]);
    }
}

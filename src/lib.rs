//! Remedy controller - cleans up orphaned Azure public IP addresses
//!
//! When a LoadBalancer service is deleted, Azure does not always release the
//! public IP address that fronted it. Each such address is tracked by a
//! PublicIPAddress object; the controller keeps its status in line with
//! Azure and, once the object is deleted, detaches the address from its load
//! balancers and deletes it.
//!
//! # Modules
//!
//! - [`crd`] - PublicIPAddress Custom Resource Definition
//! - [`controller`] - Actuator and reconciliation logic
//! - [`failure`] - Per-operation failure history kept in the status
//! - [`provider`] - Azure public IP abstraction and ARM client
//! - [`store`] - Kubernetes persistence of PublicIPAddress objects
//! - [`config`] - Controller configuration
//! - [`telemetry`] - Logging and metrics initialization
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod clock;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod failure;
pub mod metrics;
pub mod provider;
pub mod store;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

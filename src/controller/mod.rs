//! Controller implementation for PublicIPAddress objects
//!
//! [`actuator`] holds the reconcile and delete logic against Azure;
//! [`publicipaddress`] wires it into the kube-rs controller loop.

pub mod actuator;
mod publicipaddress;

pub use actuator::{Actuator, PublicIpActuator, ReconcileOutcome};
pub use publicipaddress::{error_policy, reconcile, Context, FINALIZER};

//! Custom Resource Definitions for the remedy controller

mod public_ip_address;

pub use public_ip_address::{
    FailedOperation, OperationType, PublicIPAddress, PublicIPAddressSpec, PublicIPAddressStatus,
};

//! Failure history kept in a PublicIPAddress status
//!
//! The history holds at most one [`FailedOperation`] per [`OperationType`].
//! Repeated failures of the same type bump `attempts` in place and a success
//! drops the entry. Counts live in the persisted status so retry budgets
//! survive controller restarts.

use chrono::{DateTime, Utc};

use crate::crd::{FailedOperation, OperationType};

/// Record a failure of `type_`, returning the updated history
///
/// An existing entry for the type has its attempts incremented and its message
/// and timestamp replaced; otherwise a new entry with one attempt is appended.
pub fn record_failure(
    mut history: Vec<FailedOperation>,
    type_: OperationType,
    error_message: impl Into<String>,
    timestamp: DateTime<Utc>,
) -> Vec<FailedOperation> {
    let error_message = error_message.into();
    match history.iter_mut().find(|op| op.type_ == type_) {
        Some(op) => {
            op.attempts = op.attempts.saturating_add(1);
            op.error_message = error_message;
            op.timestamp = timestamp;
        }
        None => history.push(FailedOperation {
            type_,
            attempts: 1,
            error_message,
            timestamp,
        }),
    }
    history
}

/// Remove the entry for `type_`, if any, returning the updated history
pub fn clear_failure(mut history: Vec<FailedOperation>, type_: OperationType) -> Vec<FailedOperation> {
    history.retain(|op| op.type_ != type_);
    history
}

/// Look up the entry for `type_`
pub fn find_failure(history: &[FailedOperation], type_: OperationType) -> Option<&FailedOperation> {
    history.iter().find(|op| op.type_ == type_)
}

/// Consecutive failed attempts recorded for `type_` (0 if none)
pub fn attempts(history: &[FailedOperation], type_: OperationType) -> u32 {
    find_failure(history, type_).map(|op| op.attempts).unwrap_or(0)
}

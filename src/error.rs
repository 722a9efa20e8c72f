//! Error types for the remedy controller

use std::time::Duration;

use thiserror::Error;

/// Main error type for remedy operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// HTTP transport error talking to the cloud provider
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Cloud provider returned a failure
    #[error("{0}")]
    Provider(String),

    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A failed operation, prefixed with a stable description of what was attempted
    #[error("{context}: {source}")]
    Operation {
        /// What was being attempted (e.g. "could not get Azure public IP address by IP")
        context: &'static str,
        /// The underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Writing the status sub-resource failed
    #[error("could not update publicipaddress status: {0}")]
    StatusUpdate(#[source] Box<Error>),

    /// The cloud resource is still present and the deletion grace period has not elapsed
    #[error("public IP address still exists")]
    StillExists,

    /// A recoverable failure; the caller should retry after the given delay
    #[error("{cause} (requeue after {requeue_after:?})")]
    RequeueAfter {
        /// Why the operation has to be retried
        #[source]
        cause: Box<Error>,
        /// How long to wait before retrying
        requeue_after: Duration,
    },
}

impl Error {
    /// Create a provider error with the given message
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Wrap an error with a description of the operation that failed
    pub fn operation(context: &'static str, source: Error) -> Self {
        Self::Operation {
            context,
            source: Box::new(source),
        }
    }

    /// Wrap a store failure that happened while persisting status
    pub fn status_update(source: Error) -> Self {
        Self::StatusUpdate(Box::new(source))
    }

    /// Mark an error as recoverable, to be retried after `requeue_after`
    pub fn requeue_after(cause: Error, requeue_after: Duration) -> Self {
        Self::RequeueAfter {
            cause: Box::new(cause),
            requeue_after,
        }
    }

    /// The retry delay, if this is a recoverable error
    pub fn requeue_delay(&self) -> Option<Duration> {
        match self {
            Self::RequeueAfter { requeue_after, .. } => Some(*requeue_after),
            _ => None,
        }
    }

    /// The underlying cause of a recoverable error, or the error itself
    pub fn cause(&self) -> &Error {
        match self {
            Self::RequeueAfter { cause, .. } => cause,
            other => other,
        }
    }
}

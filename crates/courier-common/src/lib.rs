// Shared data types, validation limits, and the error taxonomy used across crates.
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod message;

pub use message::{
    MAX_ATTRIBUTE_KEY_BYTES, MAX_ATTRIBUTE_VALUE_BYTES, MAX_ATTRIBUTES, MAX_DATA_BYTES,
    MAX_ORDERING_KEY_BYTES, Message,
};

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared by the publisher, subscriber, transport and simulation layers.
///
/// Errors are `Clone` so one flush failure can resolve every ticket of a batch, and
/// serializable so recordings can capture them verbatim.
///
/// ```
/// use courier_common::Error;
///
/// let err = Error::ResourceExhausted {
///     message: "quota".into(),
///     retry_after_ms: Some(250),
/// };
/// assert!(err.is_retryable());
/// assert_eq!(err.retry_after(), Some(std::time::Duration::from_millis(250)));
/// assert!(!Error::Validation("bad".into()).is_retryable());
/// ```
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Error {
    #[error("invalid message: {0}")]
    Validation(String),
    #[error("ordering key {ordering_key:?} is paused; call resume before publishing again")]
    OrderingPaused { ordering_key: String },
    #[error("resource exhausted: {message}")]
    ResourceExhausted {
        message: String,
        retry_after_ms: Option<u64>,
    },
    #[error("connection error: {0}")]
    Connection(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error(
        "flow control limit exceeded (outstanding {outstanding_messages} messages, {outstanding_bytes} bytes)"
    )]
    FlowControlExceeded {
        outstanding_messages: u64,
        outstanding_bytes: u64,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("message rejected by broker: {message}")]
    MessageRejected { message: String },
    #[error("publish of a {batch_size}-message batch failed: {source}")]
    BatchFailed {
        batch_size: usize,
        source: Box<Error>,
    },
    #[error("simulation error: {0}")]
    Simulation(String),
    #[error("closed")]
    Closed,
}

impl Error {
    /// Whether the operation may succeed if retried with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ResourceExhausted { .. } | Error::Connection(_) | Error::Timeout(_) => true,
            Error::BatchFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Server-supplied retry hint, when present.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::ResourceExhausted { retry_after_ms, .. } => {
                retry_after_ms.map(Duration::from_millis)
            }
            Error::BatchFailed { source, .. } => source.retry_after(),
            _ => None,
        }
    }

    pub fn batch_failed(batch_size: usize, source: Error) -> Self {
        Error::BatchFailed {
            batch_size,
            source: Box::new(source),
        }
    }
}

pub mod ids {
    // Strongly typed string ids so message ids and lease ids never get mixed up.
    use serde::{Deserialize, Serialize};
    use std::fmt;

    macro_rules! id_type {
        ($(#[$meta:meta])* $name:ident) => {
            $(#[$meta])*
            #[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(String);

            impl $name {
                pub fn new(value: impl Into<String>) -> Self {
                    Self(value.into())
                }

                pub fn as_str(&self) -> &str {
                    &self.0
                }

                pub fn into_inner(self) -> String {
                    self.0
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.0)
                }
            }

            impl From<String> for $name {
                fn from(value: String) -> Self {
                    Self(value)
                }
            }

            impl From<&str> for $name {
                fn from(value: &str) -> Self {
                    Self(value.to_string())
                }
            }
        };
    }

    id_type!(
        /// Broker-assigned identifier of a published message.
        MessageId
    );
    id_type!(
        /// Handle for one delivery of a message; acked or nacked exactly once.
        LeaseId
    );
}

pub use ids::{LeaseId, MessageId};

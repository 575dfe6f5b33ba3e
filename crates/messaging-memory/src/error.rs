use switchyard_messaging::ConnectionError;
use thiserror::Error;

/// Errors that can occur when talking to the in-memory broker.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The connection has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// An exchange was redeclared with a different kind.
    #[error("exchange '{0}' already declared with a different kind")]
    ExchangeKindMismatch(String),

    /// The exchange does not exist.
    #[error("exchange '{0}' not found")]
    ExchangeNotFound(String),

    /// The queue is exclusive to another connection.
    #[error("queue '{0}' is exclusive to another connection")]
    ExclusiveQueue(String),

    /// The queue does not exist.
    #[error("queue '{0}' not found")]
    QueueNotFound(String),
}

impl ConnectionError for Error {}

use switchyard_messaging::ConnectionError;
use thiserror::Error;

/// Errors that can occur when talking to NATS.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection has been closed.
    #[error("connection closed")]
    Closed,

    /// Connecting to the server failed.
    #[error(transparent)]
    Connect(#[from] async_nats::ConnectError),

    /// An exchange was redeclared with a different kind.
    #[error("exchange '{0}' already declared with a different kind")]
    ExchangeKindMismatch(String),

    /// The exchange has not been declared.
    #[error("exchange '{0}' not found")]
    ExchangeNotFound(String),

    /// Flushing pending messages failed.
    #[error("failed to flush: {0}")]
    Flush(String),

    /// Publishing failed.
    #[error("failed to publish: {0}")]
    Publish(String),

    /// The queue has not been declared.
    #[error("queue '{0}' not found")]
    QueueNotFound(String),

    /// Subscribing failed.
    #[error(transparent)]
    Subscribe(#[from] async_nats::SubscribeError),
}

impl ConnectionError for Error {}

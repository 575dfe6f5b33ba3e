use crate::delivery::DeliveryReceiver;
use crate::translator::Translator;

use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;

/// Marker trait for connection errors
pub trait ConnectionError: Error + Send + Sync + 'static {}

/// Routing behaviour of an exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Routes to queues bound with a routing key equal to the published one.
    Direct,

    /// Routes to queues bound with a pattern matching the published key.
    Topic,
}

/// Options used when declaring a queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survives consumer churn.
    pub durable: bool,

    /// Only the declaring connection may consume it.
    pub exclusive: bool,

    /// Deleted once its last consumer is cancelled.
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Options for a long-lived, shared queue.
    #[must_use]
    pub const fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Options for a private, self-cleaning queue.
    #[must_use]
    pub const fn ephemeral() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// A trait representing a connection to a message broker.
///
/// Publishing to the empty exchange name delivers straight to the queue named
/// by the routing key.
#[async_trait]
pub trait Connection
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the connection.
    type Error: ConnectionError;

    /// The transport-native message type.
    type Message: Clone + Debug + Send + Sync + 'static;

    /// The translator between envelopes and native messages.
    type Translator: Translator<Message = Self::Message>;

    /// The receiver handed out by `consume`.
    type Receiver: DeliveryReceiver<Message = Self::Message, Error = Self::Error>;

    /// Gets the translator for this transport.
    fn translator(&self) -> &Self::Translator;

    /// The routing pattern that matches every key on a topic exchange.
    fn wildcard_all(&self) -> &'static str;

    /// Whether the connection is usable.
    fn is_open(&self) -> bool;

    /// Declares an exchange. Declaring an existing exchange is a no-op.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), Self::Error>;

    /// Declares a queue and returns its name.
    ///
    /// An empty name asks the broker to generate a unique one.
    async fn declare_queue(&self, name: &str, options: QueueOptions)
    -> Result<String, Self::Error>;

    /// Deletes a queue, cancelling its consumers.
    async fn delete_queue(&self, name: &str) -> Result<(), Self::Error>;

    /// Binds a queue to an exchange.
    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str)
    -> Result<(), Self::Error>;

    /// Publishes a message.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Self::Message,
    ) -> Result<(), Self::Error>;

    /// Starts consuming a queue.
    async fn consume(&self, queue: &str) -> Result<Self::Receiver, Self::Error>;

    /// Closes the connection.
    async fn close(&self) -> Result<(), Self::Error>;
}

use crate::connection::ConnectionError;

use std::fmt::Debug;

use async_trait::async_trait;

/// A message pulled from a queue, pending acknowledgement.
#[derive(Clone, Debug)]
pub struct Delivery<M> {
    /// Broker-assigned tag used to acknowledge the delivery.
    pub delivery_tag: u64,

    /// The transport-native message.
    pub message: M,
}

/// A trait representing an active consumer on a queue.
#[async_trait]
pub trait DeliveryReceiver
where
    Self: Debug + Send + 'static,
{
    /// The error type for the receiver.
    type Error: ConnectionError;

    /// The transport-native message type.
    type Message: Clone + Debug + Send + Sync + 'static;

    /// Waits for the next delivery. `None` means the queue is gone.
    async fn recv(&mut self) -> Result<Option<Delivery<Self::Message>>, Self::Error>;

    /// Acknowledges a delivery.
    async fn ack(&mut self, delivery: &Delivery<Self::Message>) -> Result<(), Self::Error>;

    /// Cancels the consumer. Safe to call more than once.
    async fn cancel(&mut self) -> Result<(), Self::Error>;
}

use crate::broker::MemoryBroker;
use crate::error::Error;

use async_trait::async_trait;
use switchyard_messaging::{Delivery, DeliveryReceiver, RawMessage};

/// A consumer attached to a queue of a [`MemoryBroker`].
///
/// Several receivers on the same queue compete for its messages. Dropping a
/// receiver without cancelling it releases the consumer slot as well.
#[derive(Debug)]
pub struct MemoryReceiver {
    queue: String,
    receiver: flume::Receiver<Delivery<RawMessage>>,
    broker: MemoryBroker,
    cancelled: bool,
}

impl MemoryReceiver {
    pub(crate) const fn new(
        queue: String,
        receiver: flume::Receiver<Delivery<RawMessage>>,
        broker: MemoryBroker,
    ) -> Self {
        Self {
            queue,
            receiver,
            broker,
            cancelled: false,
        }
    }

    /// The queue this receiver consumes.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }
}

#[async_trait]
impl DeliveryReceiver for MemoryReceiver {
    type Error = Error;
    type Message = RawMessage;

    async fn recv(&mut self) -> Result<Option<Delivery<RawMessage>>, Error> {
        if self.cancelled {
            return Ok(None);
        }

        // Disconnected means the queue was deleted and drained.
        Ok(self.receiver.recv_async().await.ok())
    }

    async fn ack(&mut self, delivery: &Delivery<RawMessage>) -> Result<(), Error> {
        self.broker.ack(&self.queue, delivery.delivery_tag);
        Ok(())
    }

    async fn cancel(&mut self) -> Result<(), Error> {
        if !self.cancelled {
            self.cancelled = true;
            self.broker.release_consumer(&self.queue);
        }
        Ok(())
    }
}

impl Drop for MemoryReceiver {
    fn drop(&mut self) {
        if !self.cancelled {
            self.broker.release_consumer(&self.queue);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use bytes::Bytes;
    use switchyard_messaging::{Connection, ExchangeKind, QueueOptions};

    fn message(payload: &'static [u8]) -> RawMessage {
        RawMessage {
            payload: Bytes::from_static(payload),
            ..RawMessage::default()
        }
    }

    #[tokio::test]
    async fn test_competing_consumers_share_messages() {
        let broker = MemoryBroker::new();
        let connection = broker.connect();
        connection
            .declare_queue("work", QueueOptions::durable())
            .await
            .unwrap();

        let mut first = connection.consume("work").await.unwrap();
        let mut second = connection.consume("work").await.unwrap();
        assert_eq!(broker.consumer_count("work"), 2);

        connection.publish("", "work", message(b"a")).await.unwrap();
        connection.publish("", "work", message(b"b")).await.unwrap();

        let a = first.recv().await.unwrap().unwrap();
        let b = second.recv().await.unwrap().unwrap();
        assert_ne!(a.delivery_tag, b.delivery_tag);
        assert_eq!(broker.message_count("work"), 0);
    }

    #[tokio::test]
    async fn test_ack_is_counted() {
        let broker = MemoryBroker::new();
        let connection = broker.connect();
        connection
            .declare_queue("work", QueueOptions::durable())
            .await
            .unwrap();
        let mut receiver = connection.consume("work").await.unwrap();

        connection.publish("", "work", message(b"a")).await.unwrap();
        let delivery = receiver.recv().await.unwrap().unwrap();
        receiver.ack(&delivery).await.unwrap();

        assert_eq!(broker.acked_count("work"), 1);
    }

    #[tokio::test]
    async fn test_cancel_auto_deletes_queue_and_is_idempotent() {
        let broker = MemoryBroker::new();
        let connection = broker.connect();
        let queue = connection
            .declare_queue("", QueueOptions::ephemeral())
            .await
            .unwrap();

        let mut receiver = connection.consume(&queue).await.unwrap();
        receiver.cancel().await.unwrap();
        receiver.cancel().await.unwrap();

        assert!(!broker.queue_exists(&queue));
        assert!(receiver.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dropping_receiver_releases_consumer() {
        let broker = MemoryBroker::new();
        let connection = broker.connect();
        connection
            .declare_queue("work", QueueOptions::durable())
            .await
            .unwrap();

        drop(connection.consume("work").await.unwrap());

        assert_eq!(broker.consumer_count("work"), 0);
        assert!(broker.queue_exists("work"));
    }

    #[tokio::test]
    async fn test_deleting_queue_ends_receiver() {
        let broker = MemoryBroker::new();
        let connection = broker.connect();
        connection
            .declare_queue("work", QueueOptions::durable())
            .await
            .unwrap();
        let mut receiver = connection.consume("work").await.unwrap();

        connection.delete_queue("work").await.unwrap();

        let next = tokio::time::timeout(Duration::from_secs(1), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_topic_subscribers_each_get_a_copy() {
        let broker = MemoryBroker::new();
        let connection = broker.connect();
        connection
            .declare_exchange("prices", ExchangeKind::Topic)
            .await
            .unwrap();

        let all = connection
            .declare_queue("", QueueOptions::ephemeral())
            .await
            .unwrap();
        let eur = connection
            .declare_queue("", QueueOptions::ephemeral())
            .await
            .unwrap();
        connection.bind(&all, "prices", "#").await.unwrap();
        connection.bind(&eur, "prices", "fx.eur").await.unwrap();

        let mut all_receiver = connection.consume(&all).await.unwrap();
        let mut eur_receiver = connection.consume(&eur).await.unwrap();

        connection
            .publish("prices", "fx.eur", message(b"1.08"))
            .await
            .unwrap();
        connection
            .publish("prices", "fx.usd", message(b"1.00"))
            .await
            .unwrap();

        assert_eq!(
            all_receiver.recv().await.unwrap().unwrap().message.payload,
            Bytes::from_static(b"1.08")
        );
        assert_eq!(
            all_receiver.recv().await.unwrap().unwrap().message.payload,
            Bytes::from_static(b"1.00")
        );
        assert_eq!(
            eur_receiver.recv().await.unwrap().unwrap().message.payload,
            Bytes::from_static(b"1.08")
        );
        assert_eq!(broker.message_count(&eur), 0);
    }
}

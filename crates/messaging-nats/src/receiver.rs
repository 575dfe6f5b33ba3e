use crate::connection::{Error, QueueRegistry};
use crate::translator::NatsMessage;

use async_nats::Subscriber;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::SelectAll;
use switchyard_messaging::{Delivery, DeliveryReceiver};
use tracing::debug;

/// A consumer of a NATS-backed queue.
///
/// Core NATS has no acknowledgements, so acking is a no-op.
#[derive(Debug)]
pub struct NatsReceiver {
    queue: String,
    subscribers: SelectAll<Subscriber>,
    auto_delete_from: Option<QueueRegistry>,
    next_delivery_tag: u64,
    cancelled: bool,
}

impl NatsReceiver {
    pub(crate) fn new(
        queue: String,
        subscribers: SelectAll<Subscriber>,
        auto_delete_from: Option<QueueRegistry>,
    ) -> Self {
        Self {
            queue,
            subscribers,
            auto_delete_from,
            next_delivery_tag: 0,
            cancelled: false,
        }
    }
}

#[async_trait]
impl DeliveryReceiver for NatsReceiver {
    type Error = Error;
    type Message = NatsMessage;

    async fn recv(&mut self) -> Result<Option<Delivery<NatsMessage>>, Error> {
        if self.cancelled {
            return Ok(None);
        }

        let Some(message) = self.subscribers.next().await else {
            return Ok(None);
        };

        self.next_delivery_tag += 1;
        Ok(Some(Delivery {
            delivery_tag: self.next_delivery_tag,
            message: NatsMessage {
                headers: message.headers.unwrap_or_default(),
                payload: message.payload,
            },
        }))
    }

    async fn ack(&mut self, _delivery: &Delivery<NatsMessage>) -> Result<(), Error> {
        Ok(())
    }

    async fn cancel(&mut self) -> Result<(), Error> {
        if self.cancelled {
            return Ok(());
        }
        self.cancelled = true;

        for mut subscriber in std::mem::take(&mut self.subscribers) {
            if let Err(e) = subscriber.unsubscribe().await {
                debug!(queue = %self.queue, "failed to unsubscribe: {e}");
            }
        }

        if let Some(queues) = &self.auto_delete_from {
            queues.remove(&self.queue);
        }

        Ok(())
    }
}

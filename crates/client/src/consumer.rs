use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use switchyard_messaging::{DeliveryReceiver, Envelope, Translator};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

/// Receives the envelopes decoded by a [`Consumer`].
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    /// Handles one decoded envelope.
    async fn dispatch(&self, message: Envelope);
}

/// A cancellable loop pulling deliveries from a queue.
///
/// Every delivery is acknowledged, including those that fail to decode, so a
/// malformed message is dropped instead of being redelivered forever.
#[derive(Debug)]
pub struct Consumer {
    name: String,
    grace: Duration,
    shutdown_token: CancellationToken,
    stopped: AtomicBool,
    task_tracker: TaskTracker,
}

impl Consumer {
    /// Starts consuming `receiver`, handing every decoded envelope to
    /// `dispatch`.
    pub fn start<R, T>(
        name: impl Into<String>,
        mut receiver: R,
        translator: T,
        dispatch: Arc<dyn Dispatch>,
        grace: Duration,
    ) -> Self
    where
        R: DeliveryReceiver,
        T: Translator<Message = R::Message>,
    {
        let name = name.into();
        let shutdown_token = CancellationToken::new();
        let task_tracker = TaskTracker::new();

        let loop_name = name.clone();
        let loop_token = shutdown_token.clone();
        task_tracker.spawn(async move {
            loop {
                let delivery = tokio::select! {
                    biased;
                    () = loop_token.cancelled() => break,
                    delivery = receiver.recv() => delivery,
                };

                match delivery {
                    Ok(Some(delivery)) => {
                        if let Err(e) = receiver.ack(&delivery).await {
                            warn!(consumer = %loop_name, "failed to ack delivery: {e}");
                        }

                        match translator.decode(&delivery.message) {
                            Ok(envelope) => dispatch.dispatch(envelope).await,
                            Err(e) => {
                                warn!(consumer = %loop_name, "dropping undecodable delivery: {e}");
                            }
                        }
                    }
                    Ok(None) => {
                        debug!(consumer = %loop_name, "queue closed");
                        break;
                    }
                    Err(e) => {
                        error!(consumer = %loop_name, "receive failed: {e}");
                        break;
                    }
                }
            }

            if let Err(e) = receiver.cancel().await {
                warn!(consumer = %loop_name, "failed to cancel receiver: {e}");
            }
        });
        task_tracker.close();

        debug!(consumer = %name, "started consumer");

        Self {
            name,
            grace,
            shutdown_token,
            stopped: AtomicBool::new(false),
            task_tracker,
        }
    }

    /// The consumer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the consume loop is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task_tracker.is_empty()
    }

    /// Stops the loop and cancels the receiver, waiting up to the grace
    /// period. Returns `false` if the consumer was already stopped.
    pub async fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.shutdown_token.cancel();
        if tokio::time::timeout(self.grace, self.task_tracker.wait())
            .await
            .is_err()
        {
            warn!(consumer = %self.name, grace = ?self.grace, "consumer still busy after grace period");
        }

        debug!(consumer = %self.name, "stopped consumer");
        true
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use switchyard_messaging::{Connection, QueueOptions, RawMessage};
    use switchyard_messaging_memory::MemoryBroker;
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<Envelope>);

    #[async_trait]
    impl Dispatch for Forward {
        async fn dispatch(&self, message: Envelope) {
            let _ = self.0.send(message);
        }
    }

    const GRACE: Duration = Duration::from_millis(100);

    #[tokio::test]
    async fn test_decoded_envelopes_are_dispatched_and_acked() {
        let broker = MemoryBroker::new();
        let connection = broker.connect();
        connection
            .declare_queue("Q1", QueueOptions::durable())
            .await
            .unwrap();
        let receiver = connection.consume("Q1").await.unwrap();

        let (sender, mut received) = mpsc::unbounded_channel();
        let consumer = Consumer::start(
            "Q1",
            receiver,
            *connection.translator(),
            Arc::new(Forward(sender)),
            GRACE,
        );

        let message = connection
            .translator()
            .encode(&Envelope::text("Hello"))
            .unwrap();
        connection.publish("", "Q1", message).await.unwrap();

        let envelope = received.recv().await.unwrap();
        assert_eq!(envelope.body_text(), Some("Hello"));
        assert_eq!(broker.acked_count("Q1"), 1);

        assert!(consumer.stop().await);
    }

    #[tokio::test]
    async fn test_undecodable_delivery_is_acked_and_dropped() {
        let broker = MemoryBroker::new();
        let connection = broker.connect();
        connection
            .declare_queue("Q1", QueueOptions::durable())
            .await
            .unwrap();
        let receiver = connection.consume("Q1").await.unwrap();

        let (sender, mut received) = mpsc::unbounded_channel();
        let consumer = Consumer::start(
            "Q1",
            receiver,
            *connection.translator(),
            Arc::new(Forward(sender)),
            GRACE,
        );

        let mut poison = RawMessage::default();
        poison
            .headers
            .insert("retry-count".to_string(), "many".to_string());
        connection.publish("", "Q1", poison).await.unwrap();

        let valid = connection
            .translator()
            .encode(&Envelope::text("after"))
            .unwrap();
        connection.publish("", "Q1", valid).await.unwrap();

        let envelope = received.recv().await.unwrap();
        assert_eq!(envelope.body_text(), Some("after"));
        assert_eq!(broker.acked_count("Q1"), 2);

        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_releases_the_receiver() {
        let broker = MemoryBroker::new();
        let connection = broker.connect();
        connection
            .declare_queue("Q1", QueueOptions::durable())
            .await
            .unwrap();
        let receiver = connection.consume("Q1").await.unwrap();

        let (sender, _received) = mpsc::unbounded_channel();
        let consumer = Consumer::start(
            "Q1",
            receiver,
            *connection.translator(),
            Arc::new(Forward(sender)),
            GRACE,
        );
        assert_eq!(broker.consumer_count("Q1"), 1);

        assert!(consumer.stop().await);
        assert!(!consumer.stop().await);
        assert!(!consumer.is_running());
        assert_eq!(broker.consumer_count("Q1"), 0);
    }

    #[tokio::test]
    async fn test_loop_ends_when_queue_is_deleted() {
        let broker = MemoryBroker::new();
        let connection = broker.connect();
        connection
            .declare_queue("Q1", QueueOptions::durable())
            .await
            .unwrap();
        let receiver = connection.consume("Q1").await.unwrap();

        let (sender, _received) = mpsc::unbounded_channel();
        let consumer = Consumer::start(
            "Q1",
            receiver,
            *connection.translator(),
            Arc::new(Forward(sender)),
            GRACE,
        );

        connection.delete_queue("Q1").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while consumer.is_running() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert!(consumer.stop().await);
    }

    #[tokio::test]
    async fn test_dropping_a_consumer_releases_its_receiver() {
        let broker = MemoryBroker::new();
        let connection = broker.connect();
        connection
            .declare_queue("Q1", QueueOptions::durable())
            .await
            .unwrap();
        let receiver = connection.consume("Q1").await.unwrap();

        let (sender, _received) = mpsc::unbounded_channel();
        let consumer = Consumer::start(
            "Q1",
            receiver,
            *connection.translator(),
            Arc::new(Forward(sender)),
            GRACE,
        );
        assert_eq!(broker.consumer_count("Q1"), 1);

        drop(consumer);
        tokio::time::timeout(Duration::from_secs(1), async {
            while broker.consumer_count("Q1") > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}

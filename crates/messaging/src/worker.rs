use crate::envelope::Envelope;

use std::future::Future;

use async_trait::async_trait;

/// Application callback handling inbound requests and feeds.
///
/// Returning `None` from a request service means no reply is sent, even when
/// the request carried a reply destination.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Handles one envelope.
    async fn apply(&self, message: Envelope) -> Option<Envelope>;
}

#[async_trait]
impl<F, Fut> Worker for F
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Envelope>> + Send + 'static,
{
    async fn apply(&self, message: Envelope) -> Option<Envelope> {
        self(message).await
    }
}

/// Application callback producing envelopes for a recurring publisher.
#[async_trait]
pub trait Feeder: Send + Sync + 'static {
    /// Produces the next envelope to publish.
    async fn apply(&self) -> Envelope;
}

#[async_trait]
impl<F, Fut> Feeder for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Envelope> + Send + 'static,
{
    async fn apply(&self) -> Envelope {
        self().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closure_is_a_worker() {
        let worker = |message: Envelope| async move {
            let mut reply = Envelope::text(format!("echo: {}", message.body_text()?));
            reply.insert("handled", true);
            Some(reply)
        };

        let reply = worker.apply(Envelope::text("hi")).await.unwrap();
        assert_eq!(reply.body_text(), Some("echo: hi"));

        assert!(worker.apply(Envelope::new()).await.is_none());
    }
}

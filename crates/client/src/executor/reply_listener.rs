use crate::consumer::{Consumer, Dispatch};
use crate::error::Error;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use switchyard_messaging::{Connection, Envelope};
use tokio::sync::oneshot;
use tracing::warn;

type PendingReplies = Arc<DashMap<String, oneshot::Sender<Envelope>>>;

struct ReplyDispatch {
    queue: String,
    pending: PendingReplies,
}

#[async_trait]
impl Dispatch for ReplyDispatch {
    async fn dispatch(&self, message: Envelope) {
        let Some(correlation_id) = message.correlation_id() else {
            warn!(queue = %self.queue, "discarding reply without correlation id");
            return;
        };

        match self.pending.remove(correlation_id) {
            Some((_, waiter)) => {
                let _ = waiter.send(message);
            }
            None => {
                warn!(
                    queue = %self.queue,
                    correlation_id,
                    "discarding reply with no waiting caller"
                );
            }
        }
    }
}

/// Consumer of one reply queue, resolving waiting callers by correlation ID.
#[derive(Debug)]
pub(crate) struct ReplyListener {
    queue: String,
    pending: PendingReplies,
    consumer: Consumer,
}

impl ReplyListener {
    pub(crate) async fn start<C: Connection>(
        connection: &C,
        queue: String,
        grace: Duration,
    ) -> Result<Self, Error> {
        let receiver = connection
            .consume(&queue)
            .await
            .map_err(Error::transport)?;

        let pending: PendingReplies = Arc::new(DashMap::new());
        let dispatch = Arc::new(ReplyDispatch {
            queue: queue.clone(),
            pending: pending.clone(),
        });
        let consumer = Consumer::start(
            queue.clone(),
            receiver,
            connection.translator().clone(),
            dispatch,
            grace,
        );

        Ok(Self {
            queue,
            pending,
            consumer,
        })
    }

    pub(crate) fn queue(&self) -> &str {
        &self.queue
    }

    /// Registers a caller waiting for `correlation_id`. The registration is
    /// dropped with the returned future.
    pub(crate) fn expect(&self, correlation_id: &str) -> PendingReply {
        let (waiter, reply) = oneshot::channel();
        self.pending.insert(correlation_id.to_string(), waiter);
        PendingReply {
            correlation_id: correlation_id.to_string(),
            pending: self.pending.clone(),
            reply,
        }
    }

    #[cfg(test)]
    pub(crate) fn waiting(&self) -> usize {
        self.pending.len()
    }

    /// Stops the consumer. Waiting callers observe a closed channel.
    pub(crate) async fn stop(&self) -> bool {
        let stopped = self.consumer.stop().await;
        self.pending.clear();
        stopped
    }
}

/// A caller's registration for one correlation ID, resolving to the reply.
#[derive(Debug)]
pub(crate) struct PendingReply {
    correlation_id: String,
    pending: PendingReplies,
    reply: oneshot::Receiver<Envelope>,
}

impl Future for PendingReply {
    type Output = Result<Envelope, oneshot::error::RecvError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.reply).poll(cx)
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.reply.close();
        self.pending
            .remove_if(&self.correlation_id, |_, waiter| waiter.is_closed());
    }
}

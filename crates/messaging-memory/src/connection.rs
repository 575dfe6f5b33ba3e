use crate::broker::MemoryBroker;
use crate::error::Error;
use crate::receiver::MemoryReceiver;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use switchyard_messaging::{
    Connection, ExchangeKind, HeaderTranslator, QueueOptions, RawMessage,
};

/// A connection to a [`MemoryBroker`].
///
/// Clones share the same connection; closing one closes all of them and
/// deletes the exclusive queues it declared.
#[derive(Clone, Debug)]
pub struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
    open: Arc<AtomicBool>,
    translator: HeaderTranslator,
}

impl MemoryConnection {
    pub(crate) fn new(broker: MemoryBroker, id: u64) -> Self {
        Self {
            id,
            broker,
            open: Arc::new(AtomicBool::new(true)),
            translator: HeaderTranslator,
        }
    }

    /// The broker this connection talks to.
    #[must_use]
    pub const fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::ConnectionClosed)
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    type Error = Error;
    type Message = RawMessage;
    type Translator = HeaderTranslator;
    type Receiver = MemoryReceiver;

    fn translator(&self) -> &HeaderTranslator {
        &self.translator
    }

    fn wildcard_all(&self) -> &'static str {
        "#"
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), Error> {
        self.ensure_open()?;
        self.broker.declare_exchange(name, kind)
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String, Error> {
        self.ensure_open()?;
        self.broker.declare_queue(self.id, name, options)
    }

    async fn delete_queue(&self, name: &str) -> Result<(), Error> {
        self.ensure_open()?;
        self.broker.delete_queue(name);
        Ok(())
    }

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), Error> {
        self.ensure_open()?;
        self.broker.bind(queue, exchange, routing_key)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: RawMessage,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        self.broker.publish(exchange, routing_key, message)
    }

    async fn consume(&self, queue: &str) -> Result<MemoryReceiver, Error> {
        self.ensure_open()?;
        let receiver = self.broker.consume(self.id, queue)?;
        Ok(MemoryReceiver::new(
            queue.to_string(),
            receiver,
            self.broker.clone(),
        ))
    }

    async fn close(&self) -> Result<(), Error> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.broker.drop_connection(self.id);
        }
        Ok(())
    }
}

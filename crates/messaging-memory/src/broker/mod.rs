mod pattern;

use crate::connection::MemoryConnection;
use crate::error::Error;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use switchyard_messaging::{Delivery, ExchangeKind, QueueOptions, RawMessage};
use tracing::{debug, trace};
use uuid::Uuid;

use pattern::topic_matches;

const SERVER_NAMED_PREFIX: &str = "amq.gen-";

#[derive(Debug, PartialEq, Eq)]
struct Binding {
    queue: String,
    routing_key: String,
}

#[derive(Debug)]
struct ExchangeState {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

#[derive(Debug)]
struct QueueState {
    sender: flume::Sender<Delivery<RawMessage>>,
    receiver: flume::Receiver<Delivery<RawMessage>>,
    options: QueueOptions,
    owner: u64,
    consumers: usize,
    acked: u64,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    next_delivery_tag: u64,
}

impl BrokerState {
    fn remove_queue(&mut self, name: &str) -> bool {
        let removed = self.queues.remove(name).is_some();
        if removed {
            for exchange in self.exchanges.values_mut() {
                exchange.bindings.retain(|binding| binding.queue != name);
            }
        }
        removed
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, Error> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default());
        }

        let exchange_state = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| Error::ExchangeNotFound(exchange.to_string()))?;

        let mut targets: Vec<String> = Vec::new();
        for binding in &exchange_state.bindings {
            let matched = match exchange_state.kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
            };
            if matched && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }

        Ok(targets)
    }
}

/// An in-process broker shared by every connection created from it.
#[derive(Clone, Debug, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    next_connection_id: Arc<AtomicU64>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new connection to this broker.
    #[must_use]
    pub fn connect(&self) -> MemoryConnection {
        let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
        MemoryConnection::new(self.clone(), id)
    }

    /// Whether a queue with this name exists.
    #[must_use]
    pub fn queue_exists(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    /// Whether an exchange with this name exists.
    #[must_use]
    pub fn exchange_exists(&self, name: &str) -> bool {
        self.state.lock().exchanges.contains_key(name)
    }

    /// Number of active consumers on a queue, zero if it does not exist.
    #[must_use]
    pub fn consumer_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(name)
            .map_or(0, |queue| queue.consumers)
    }

    /// Number of messages waiting in a queue, zero if it does not exist.
    #[must_use]
    pub fn message_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(name)
            .map_or(0, |queue| queue.receiver.len())
    }

    /// Number of deliveries acknowledged on a queue.
    #[must_use]
    pub fn acked_count(&self, name: &str) -> u64 {
        self.state
            .lock()
            .queues
            .get(name)
            .map_or(0, |queue| queue.acked)
    }

    /// Names of all queues, sorted.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), Error> {
        let mut state = self.state.lock();

        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => {
                Err(Error::ExchangeKindMismatch(name.to_string()))
            }
            Some(_) => Ok(()),
            None => {
                debug!(exchange = name, ?kind, "declared exchange");
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    pub(crate) fn declare_queue(
        &self,
        owner: u64,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, Error> {
        let mut state = self.state.lock();

        let name = if name.is_empty() {
            format!("{SERVER_NAMED_PREFIX}{}", Uuid::new_v4())
        } else {
            name.to_string()
        };

        if let Some(existing) = state.queues.get(&name) {
            if existing.options.exclusive && existing.owner != owner {
                return Err(Error::ExclusiveQueue(name));
            }
            return Ok(name);
        }

        let (sender, receiver) = flume::unbounded();
        debug!(queue = %name, ?options, "declared queue");
        state.queues.insert(
            name.clone(),
            QueueState {
                sender,
                receiver,
                options,
                owner,
                consumers: 0,
                acked: 0,
            },
        );

        Ok(name)
    }

    pub(crate) fn delete_queue(&self, name: &str) {
        if self.state.lock().remove_queue(name) {
            debug!(queue = name, "deleted queue");
        }
    }

    pub(crate) fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), Error> {
        let mut state = self.state.lock();

        if !state.queues.contains_key(queue) {
            return Err(Error::QueueNotFound(queue.to_string()));
        }

        let exchange_state = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| Error::ExchangeNotFound(exchange.to_string()))?;

        let binding = Binding {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !exchange_state.bindings.contains(&binding) {
            debug!(queue, exchange, routing_key, "bound queue");
            exchange_state.bindings.push(binding);
        }

        Ok(())
    }

    pub(crate) fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: RawMessage,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        let targets = state.route(exchange, routing_key)?;

        if targets.is_empty() {
            trace!(exchange, routing_key, "dropped unroutable message");
            return Ok(());
        }

        for queue in targets {
            state.next_delivery_tag += 1;
            let delivery = Delivery {
                delivery_tag: state.next_delivery_tag,
                message: message.clone(),
            };
            if let Some(queue_state) = state.queues.get(&queue) {
                // The queue keeps its own receiver, so the channel cannot be disconnected.
                let _ = queue_state.sender.send(delivery);
            }
        }

        Ok(())
    }

    pub(crate) fn consume(
        &self,
        owner: u64,
        queue: &str,
    ) -> Result<flume::Receiver<Delivery<RawMessage>>, Error> {
        let mut state = self.state.lock();

        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;

        if queue_state.options.exclusive && queue_state.owner != owner {
            return Err(Error::ExclusiveQueue(queue.to_string()));
        }

        queue_state.consumers += 1;
        Ok(queue_state.receiver.clone())
    }

    pub(crate) fn release_consumer(&self, queue: &str) {
        let mut state = self.state.lock();

        let Some(queue_state) = state.queues.get_mut(queue) else {
            return;
        };

        queue_state.consumers = queue_state.consumers.saturating_sub(1);
        if queue_state.consumers == 0 && queue_state.options.auto_delete {
            state.remove_queue(queue);
            debug!(queue, "auto-deleted queue");
        }
    }

    pub(crate) fn ack(&self, queue: &str, delivery_tag: u64) {
        if let Some(queue_state) = self.state.lock().queues.get_mut(queue) {
            queue_state.acked += 1;
            trace!(queue, delivery_tag, "acked delivery");
        }
    }

    pub(crate) fn drop_connection(&self, owner: u64) {
        let mut state = self.state.lock();

        let exclusive: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, queue)| queue.options.exclusive && queue.owner == owner)
            .map(|(name, _)| name.clone())
            .collect();

        for queue in exclusive {
            state.remove_queue(&queue);
            debug!(queue = %queue, "deleted exclusive queue of closed connection");
        }
    }
}

mod error;

use crate::receiver::NatsReceiver;
use crate::translator::{NatsMessage, NatsTranslator};
pub use error::Error;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_nats::Client;
use async_nats::connection::State;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::select_all;
use switchyard_messaging::{Connection, ExchangeKind, QueueOptions};
use tracing::debug;

/// Options for connecting to a NATS server.
#[derive(Clone, Debug)]
pub struct NatsConnectionOptions {
    /// Server address, e.g. `nats://localhost:4222`.
    pub url: String,

    /// Client name reported to the server.
    pub name: Option<String>,

    /// Username and password, if the server requires them.
    pub credentials: Option<(String, String)>,
}

#[derive(Debug)]
pub(crate) struct QueueEntry {
    options: QueueOptions,
    subjects: Vec<String>,
}

pub(crate) type QueueRegistry = Arc<DashMap<String, QueueEntry>>;

/// A connection to a NATS server.
///
/// Publishing to exchange `E` with key `K` goes to subject `E.K`; the default
/// exchange publishes to subject `K`. Bindings must be in place before
/// `consume` is called.
#[derive(Clone, Debug)]
pub struct NatsConnection {
    client: Client,
    exchanges: Arc<DashMap<String, ExchangeKind>>,
    queues: QueueRegistry,
    closed: Arc<AtomicBool>,
    translator: NatsTranslator,
}

impl NatsConnection {
    /// Wraps an existing NATS client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            exchanges: Arc::new(DashMap::new()),
            queues: Arc::new(DashMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
            translator: NatsTranslator,
        }
    }

    /// Connects to a NATS server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be reached.
    pub async fn connect(options: NatsConnectionOptions) -> Result<Self, Error> {
        let mut connect_options = async_nats::ConnectOptions::new();
        if let Some(name) = options.name {
            connect_options = connect_options.name(name);
        }
        if let Some((user, password)) = options.credentials {
            connect_options = connect_options.user_and_password(user, password);
        }

        let client = connect_options.connect(options.url).await?;
        Ok(Self::new(client))
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    fn subject(exchange: &str, routing_key: &str) -> String {
        if exchange.is_empty() {
            routing_key.to_string()
        } else {
            format!("{exchange}.{routing_key}")
        }
    }

    fn binding_subject(exchange: &str, kind: ExchangeKind, routing_key: &str) -> String {
        match kind {
            ExchangeKind::Direct => Self::subject(exchange, routing_key),
            ExchangeKind::Topic => {
                let pattern = routing_key
                    .split('.')
                    .map(|word| if word == "#" { ">" } else { word })
                    .collect::<Vec<_>>()
                    .join(".");
                Self::subject(exchange, &pattern)
            }
        }
    }
}

#[async_trait]
impl Connection for NatsConnection {
    type Error = Error;
    type Message = NatsMessage;
    type Translator = NatsTranslator;
    type Receiver = NatsReceiver;

    fn translator(&self) -> &NatsTranslator {
        &self.translator
    }

    fn wildcard_all(&self) -> &'static str {
        ">"
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && matches!(self.client.connection_state(), State::Connected)
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), Error> {
        self.ensure_open()?;

        let existing = *self.exchanges.entry(name.to_string()).or_insert(kind);
        if existing == kind {
            Ok(())
        } else {
            Err(Error::ExchangeKindMismatch(name.to_string()))
        }
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String, Error> {
        self.ensure_open()?;

        let name = if name.is_empty() {
            self.client.new_inbox()
        } else {
            name.to_string()
        };

        self.queues
            .entry(name.clone())
            .or_insert_with(|| QueueEntry {
                options,
                subjects: vec![name.clone()],
            });

        Ok(name)
    }

    async fn delete_queue(&self, name: &str) -> Result<(), Error> {
        self.ensure_open()?;
        self.queues.remove(name);
        Ok(())
    }

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), Error> {
        self.ensure_open()?;

        let kind = *self
            .exchanges
            .get(exchange)
            .ok_or_else(|| Error::ExchangeNotFound(exchange.to_string()))?;
        let subject = Self::binding_subject(exchange, kind, routing_key);

        let mut entry = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;
        if !entry.subjects.contains(&subject) {
            debug!(queue, %subject, "bound queue");
            entry.subjects.push(subject);
        }

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: NatsMessage,
    ) -> Result<(), Error> {
        self.ensure_open()?;

        if !exchange.is_empty() && !self.exchanges.contains_key(exchange) {
            return Err(Error::ExchangeNotFound(exchange.to_string()));
        }

        self.client
            .publish_with_headers(
                Self::subject(exchange, routing_key),
                message.headers,
                message.payload,
            )
            .await
            .map_err(|e| Error::Publish(e.to_string()))
    }

    async fn consume(&self, queue: &str) -> Result<NatsReceiver, Error> {
        self.ensure_open()?;

        let (subjects, auto_delete) = {
            let entry = self
                .queues
                .get(queue)
                .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;
            (entry.subjects.clone(), entry.options.auto_delete)
        };

        let mut subscribers = Vec::with_capacity(subjects.len());
        for subject in subjects {
            subscribers.push(
                self.client
                    .queue_subscribe(subject, queue.to_string())
                    .await?,
            );
        }

        Ok(NatsReceiver::new(
            queue.to_string(),
            select_all(subscribers),
            auto_delete.then(|| self.queues.clone()),
        ))
    }

    async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.client
            .flush()
            .await
            .map_err(|e| Error::Flush(e.to_string()))
    }
}

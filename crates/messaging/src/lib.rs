//! Abstract interface for broker-agnostic messaging.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Connections publish to, declare and consume from a broker.
pub mod connection;

/// Deliveries are transport messages pulled from a consumed queue.
pub mod delivery;

/// Envelopes are the transport-independent representation of a message.
pub mod envelope;

/// Translators convert envelopes to and from transport-native messages.
pub mod translator;

/// Workers and feeders are the application callbacks driven by services.
pub mod worker;

pub use connection::{Connection, ConnectionError, ExchangeKind, QueueOptions};
pub use delivery::{Delivery, DeliveryReceiver};
pub use envelope::{Envelope, FieldValue, ReturnCode};
pub use translator::{
    HeaderTranslator, HeaderTranslatorError, RawMessage, Translator, TranslatorError,
};
pub use worker::{Feeder, Worker};

//! NATS implementation of the messaging crate.
//!
//! Exchanges and queues are mapped onto core NATS subjects: a queue consumes
//! every subject it is bound to as a queue group named after itself, so
//! several consumers of the same queue compete for messages while distinct
//! queues each receive a copy.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod connection;
mod receiver;
mod translator;

pub use connection::{Error, NatsConnection, NatsConnectionOptions};
pub use receiver::NatsReceiver;
pub use translator::{NatsMessage, NatsTranslator};

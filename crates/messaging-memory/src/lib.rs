//! In-memory implementation of the messaging crate.
//!
//! Emulates an AMQP-style broker inside the process: direct and topic
//! exchanges, named and server-named queues, competing consumers,
//! auto-delete and acknowledgements. Every [`MemoryBroker`] is an isolated
//! broker, so tests can run in parallel without shared state.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod broker;
mod connection;
mod error;
mod receiver;

pub use broker::MemoryBroker;
pub use connection::MemoryConnection;
pub use error::Error;
pub use receiver::MemoryReceiver;

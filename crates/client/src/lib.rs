//! Request/reply correlation and routing over any messaging transport.
//!
//! A [`Client`] wraps a [`Connection`](switchyard_messaging::Connection) and
//! hands out a [`RequestExecutor`] for fire-and-forget and RPC calls, and a
//! [`ServiceFactory`] for request, grouped-request, feeder and subscriber
//! services.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

mod client;
mod config;
mod consumer;
mod error;
mod executor;
mod group;
mod reply_cache;
mod router;
mod service;

pub use client::Client;
pub use config::{ClientConfig, ConfigError};
pub use consumer::{Consumer, Dispatch};
pub use error::Error;
pub use executor::RequestExecutor;
pub use group::{MsgGroupServiceMgr, MsgGroupStatus};
pub use reply_cache::ReplyCache;
pub use router::{RequestRouter, RouteeHandler, RouteeInfo};
pub use service::{Service, ServiceFactory, ServiceKind, ServiceState};

/// Direct exchange carrying fire-and-forget requests.
pub const FAF_EXCHANGE: &str = "mom-faf";

/// Direct exchange carrying RPC requests.
pub const RPC_EXCHANGE: &str = "mom-rpc";

/// Operation opening a message group on a grouped request service.
pub const OPEN_MSG_GROUP: &str = "OPEN_MSG_GROUP";

/// Operation closing a message group on a grouped request service.
pub const CLOSE_MSG_GROUP: &str = "CLOSE_MSG_GROUP";

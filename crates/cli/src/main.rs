//! Command line front end sending requests and running services over a broker.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use switchyard_client::{Client, ClientConfig};
use switchyard_messaging::Connection;
use switchyard_messaging_memory::MemoryBroker;
use switchyard_messaging_nats::{NatsConnection, NatsConnectionOptions};
use tokio_util::sync::CancellationToken;
use tracing::{Level, info};

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Client error
    #[error(transparent)]
    Client(#[from] switchyard_client::Error),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] switchyard_client::ConfigError),

    /// NATS connection error
    #[error(transparent)]
    Nats(#[from] switchyard_messaging_nats::Error),

    /// A reply came back with an error return code
    #[error("request failed with code {code}: {message}")]
    Remote {
        /// The return code.
        code: i64,

        /// The error message, if any.
        message: String,
    },
}

/// Broker transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    /// In-process broker; only useful with `demo`.
    Memory,

    /// NATS server.
    Nats,
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Broker transport
    #[arg(long, value_enum, default_value_t = TransportKind::Nats, env = "SWITCHYARD_TRANSPORT")]
    transport: TransportKind,

    /// Broker host
    #[arg(long, default_value = "localhost", env = "SWITCHYARD_HOST")]
    host: String,

    /// Broker port
    #[arg(long, default_value_t = 4222, env = "SWITCHYARD_PORT")]
    port: u16,

    /// Broker user
    #[arg(long, env = "SWITCHYARD_USER")]
    user: Option<String>,

    /// Broker password
    #[arg(long, env = "SWITCHYARD_PASSWORD")]
    password: Option<String>,

    /// Broker virtual host
    #[arg(long, default_value = "/", env = "SWITCHYARD_VHOST")]
    vhost: String,

    /// Application id stamped on outgoing requests
    #[arg(long, default_value = "switchyard-cli", env = "SWITCHYARD_CLIENT_ID")]
    client_id: String,

    /// Per-attempt RPC timeout in seconds; 0 waits forever
    #[arg(long, default_value_t = 10, env = "SWITCHYARD_RPC_TIMEOUT")]
    rpc_timeout: u64,

    /// RPC retries after the first attempt times out
    #[arg(long, default_value_t = 2, env = "SWITCHYARD_RPC_RETRY")]
    rpc_retry: u32,

    /// Routees per request service
    #[arg(long, default_value_t = 5, env = "SWITCHYARD_NB_ROUTEES")]
    nb_routees: usize,

    /// Log at debug level
    #[arg(long, env = "SWITCHYARD_DEBUG")]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Fire-and-forget a text message
    Send {
        /// Destination queue
        destination: String,

        /// Message body
        body: String,
    },

    /// Send a text request and print the reply
    Call {
        /// Destination queue
        destination: String,

        /// Request body
        body: String,

        /// Operation header
        #[arg(long)]
        operation: Option<String>,

        /// Send within this message group
        #[arg(long)]
        group: Option<String>,
    },

    /// Serve a queue, echoing every request back
    Echo {
        /// Queue to serve
        source: String,

        /// Accept message group control operations
        #[arg(long)]
        groups: bool,
    },

    /// Print publications on a topic
    Subscribe {
        /// Topic exchange
        source: String,

        /// Routing pattern; every publication when empty
        #[arg(long, default_value = "")]
        selector: String,
    },

    /// Publish a text message on a topic at a fixed interval
    Feed {
        /// Topic exchange
        destination: String,

        /// Routing key
        selector: String,

        /// Message body
        body: String,

        /// Publishing interval in milliseconds
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },

    /// Run an echo service, a feeder and a subscriber in-process and exercise them
    Demo,
}

impl Args {
    fn client_config(&self) -> Result<ClientConfig, Error> {
        let config = ClientConfig {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            vhost: self.vhost.clone(),
            client_id: self.client_id.clone(),
            rpc_timeout_secs: self.rpc_timeout,
            rpc_retries: self.rpc_retry,
            nb_routees: self.nb_routees,
            ..ClientConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    fn nats_options(&self) -> NatsConnectionOptions {
        NatsConnectionOptions {
            url: format!("nats://{}:{}", self.host, self.port),
            name: Some(self.client_id.clone()),
            credentials: self.user.clone().zip(self.password.clone()),
        }
    }
}

async fn run<C: Connection>(
    connection: C,
    config: ClientConfig,
    command: Command,
    shutdown_token: CancellationToken,
) -> Result<(), Error> {
    let client = Client::new(connection, config)?;
    let outcome = commands::execute(&client, command, shutdown_token).await;
    client.close().await?;
    outcome
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.debug { Level::DEBUG } else { Level::INFO })
        .init();

    let config = args.client_config()?;
    let shutdown_token = CancellationToken::new();

    let signal_shutdown_token = shutdown_token.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received interrupt signal");
        signal_shutdown_token.cancel();
    });

    match args.transport {
        TransportKind::Memory => {
            let broker = MemoryBroker::new();
            run(broker.connect(), config, args.command, shutdown_token).await
        }
        TransportKind::Nats => {
            let connection = NatsConnection::connect(args.nats_options()).await?;
            info!(host = %args.host, port = args.port, "connected to NATS");
            run(connection, config, args.command, shutdown_token).await
        }
    }
}

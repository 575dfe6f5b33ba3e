use crate::config::ClientConfig;
use crate::error::Error;
use crate::executor::RequestExecutor;
use crate::reply_cache::ReplyCache;
use crate::service::ServiceFactory;

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use switchyard_messaging::Connection;
use tracing::info;

/// Entry point bundling one connection with its request executor, service
/// factory and reply cache.
pub struct Client<C: Connection> {
    connection: C,
    config: Arc<ClientConfig>,
    reply_cache: ReplyCache,
    executor: RequestExecutor<C>,
    factory: ServiceFactory<C>,
    closed: AtomicBool,
}

impl<C: Connection> Debug for Client<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.config.client_id)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Client<C> {
    /// Creates a client over an open connection. Must be called inside a
    /// Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid.
    pub fn new(connection: C, config: ClientConfig) -> Result<Self, Error> {
        config.validate()?;

        let config = Arc::new(config);
        let reply_cache =
            ReplyCache::new(config.reply_cache_retention(), config.reply_cache_sweep());
        let executor = RequestExecutor::new(connection.clone(), &config);
        let factory = ServiceFactory::new(connection.clone(), config.clone(), reply_cache.clone());

        info!(client_id = %config.client_id, "created client");

        Ok(Self {
            connection,
            config,
            reply_cache,
            executor,
            factory,
            closed: AtomicBool::new(false),
        })
    }

    /// The shared request executor.
    #[must_use]
    pub const fn request_executor(&self) -> &RequestExecutor<C> {
        &self.executor
    }

    /// The shared service factory.
    #[must_use]
    pub const fn service_factory(&self) -> &ServiceFactory<C> {
        &self.factory
    }

    /// The client settings.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The underlying connection.
    #[must_use]
    pub const fn connection(&self) -> &C {
        &self.connection
    }

    /// The reply cache shared by the request services.
    #[must_use]
    pub const fn reply_cache(&self) -> &ReplyCache {
        &self.reply_cache
    }

    /// Whether the client is open and its connection usable.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.connection.is_open()
    }

    /// Stops every service, then the executor and the reply cache, and closes
    /// the connection. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails to close.
    pub async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let services = self.factory.services();
        for service in &services {
            service.will_stop_soon();
        }
        for service in &services {
            service.stop().await;
        }

        self.executor.stop().await;
        self.reply_cache.stop().await;
        self.connection.close().await.map_err(Error::transport)?;

        info!(client_id = %self.config.client_id, services = services.len(), "closed client");
        Ok(())
    }
}

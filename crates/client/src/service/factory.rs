use super::handler::{GroupedRequestHandler, RequestHandler, SubscriberHandler};
use super::{FeederHandle, Service, ServiceKind};
use crate::config::ClientConfig;
use crate::consumer::Consumer;
use crate::error::Error;
use crate::group::{GroupServiceSpawner, MsgGroupServiceMgr};
use crate::reply_cache::ReplyCache;
use crate::router::{RequestRouter, RouteeHandler};
use crate::{FAF_EXCHANGE, RPC_EXCHANGE};

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use switchyard_messaging::{Connection, Envelope, ExchangeKind, Feeder, QueueOptions, Worker};
use tracing::{info, warn};

struct ServiceContext<C: Connection> {
    connection: C,
    config: Arc<ClientConfig>,
    reply_cache: ReplyCache,
}

impl<C: Connection> Clone for ServiceContext<C> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            config: self.config.clone(),
            reply_cache: self.reply_cache.clone(),
        }
    }
}

impl<C: Connection> ServiceContext<C> {
    async fn declare_request_queue(&self, source: &str) -> Result<(), Error> {
        for exchange in [FAF_EXCHANGE, RPC_EXCHANGE] {
            self.connection
                .declare_exchange(exchange, ExchangeKind::Direct)
                .await
                .map_err(Error::transport)?;
        }

        self.connection
            .declare_queue(source, QueueOptions::durable())
            .await
            .map_err(Error::transport)?;

        for exchange in [FAF_EXCHANGE, RPC_EXCHANGE] {
            self.connection
                .bind(source, exchange, source)
                .await
                .map_err(Error::transport)?;
        }

        Ok(())
    }

    async fn start_routed<H>(
        &self,
        service: &Service,
        queue: &str,
        nb_routees: usize,
        handler: H,
    ) -> Result<(), Error>
    where
        H: RouteeHandler<Message = Envelope>,
    {
        let receiver = self
            .connection
            .consume(queue)
            .await
            .map_err(Error::transport)?;

        let router = RequestRouter::new(service.name(), nb_routees, handler);
        let consumer = Consumer::start(
            queue,
            receiver,
            self.connection.translator().clone(),
            Arc::new(router.clone()),
            self.config.consumer_stop_grace(),
        );

        service.attach_worker(Arc::new(router));
        service.attach_consumer(consumer);

        Ok(())
    }

    fn request_handler(&self, source: &str, worker: Arc<dyn Worker>) -> RequestHandler<C> {
        RequestHandler {
            service: source.to_string(),
            connection: self.connection.clone(),
            worker,
            reply_cache: self.reply_cache.clone(),
        }
    }

    async fn request_service(&self, source: &str, worker: Arc<dyn Worker>) -> Result<Service, Error> {
        self.declare_request_queue(source).await?;

        let service = Service::new(source, ServiceKind::Request);
        self.start_routed(
            &service,
            source,
            self.config.nb_routees,
            self.request_handler(source, worker),
        )
        .await?;

        info!(service = source, "started request service");
        Ok(service)
    }
}

struct GroupSpawner<C: Connection> {
    context: ServiceContext<C>,
    source: String,
    worker: Arc<dyn Worker>,
}

impl<C: Connection> GroupSpawner<C> {
    fn group_source(&self, group_id: &str) -> String {
        format!("{group_id}-{}", self.source)
    }
}

#[async_trait]
impl<C: Connection> GroupServiceSpawner for GroupSpawner<C> {
    async fn spawn(&self, group_id: &str) -> Result<Service, Error> {
        self.context
            .request_service(&self.group_source(group_id), self.worker.clone())
            .await
    }

    async fn release(&self, group_id: &str) {
        let queue = self.group_source(group_id);
        if let Err(e) = self.context.connection.delete_queue(&queue).await {
            warn!(queue = %queue, "failed to delete group queue: {e}");
        }
    }
}

/// Builds request, grouped-request, feeder and subscriber services and keeps
/// every one of them in a registry for shutdown.
pub struct ServiceFactory<C: Connection> {
    context: ServiceContext<C>,
    services: Arc<Mutex<Vec<Service>>>,
}

impl<C: Connection> Clone for ServiceFactory<C> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            services: self.services.clone(),
        }
    }
}

impl<C: Connection> Debug for ServiceFactory<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceFactory")
            .field("services", &self.services.lock().len())
            .finish_non_exhaustive()
    }
}

impl<C: Connection> ServiceFactory<C> {
    /// Creates a factory whose services share `reply_cache`.
    #[must_use]
    pub fn new(connection: C, config: Arc<ClientConfig>, reply_cache: ReplyCache) -> Self {
        Self {
            context: ServiceContext {
                connection,
                config,
                reply_cache,
            },
            services: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn track(&self, service: Service) -> Service {
        self.services.lock().push(service.clone());
        service
    }

    /// Serves requests arriving on `source` with a pool of routees running
    /// `worker`.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be declared, bound or consumed.
    pub async fn request_service<W: Worker>(&self, source: &str, worker: W) -> Result<Service, Error> {
        let service = self.context.request_service(source, Arc::new(worker)).await?;
        Ok(self.track(service))
    }

    /// Serves requests on `source` and answers `OPEN_MSG_GROUP` /
    /// `CLOSE_MSG_GROUP` operations by starting and stopping a request
    /// service on `<group>-<source>` running the same worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be declared, bound or consumed.
    pub async fn msg_group_request_service<W: Worker>(
        &self,
        source: &str,
        worker: W,
    ) -> Result<Service, Error> {
        let worker: Arc<dyn Worker> = Arc::new(worker);
        self.context.declare_request_queue(source).await?;

        let groups = MsgGroupServiceMgr::new(
            source,
            Arc::new(GroupSpawner {
                context: self.context.clone(),
                source: source.to_string(),
                worker: worker.clone(),
            }),
        );
        let handler = GroupedRequestHandler {
            requests: self.context.request_handler(source, worker),
            groups: groups.clone(),
        };

        let service = Service::new(source, ServiceKind::MsgGroupRequest);
        service.attach_group_manager(groups);
        self.context
            .start_routed(&service, source, self.context.config.nb_routees, handler)
            .await?;

        info!(service = source, "started message group request service");
        Ok(self.track(service))
    }

    /// Publishes an envelope from `feeder` to topic `base_destination` with
    /// routing key `selector`, immediately and then every `interval`.
    ///
    /// # Errors
    ///
    /// Returns an error if `interval` is zero or the exchange cannot be
    /// declared.
    pub async fn feeder_service<F: Feeder>(
        &self,
        base_destination: &str,
        selector: &str,
        interval: Duration,
        feeder: F,
    ) -> Result<Service, Error> {
        if interval.is_zero() {
            return Err(Error::InvalidArgument(
                "feeder interval must be positive".to_string(),
            ));
        }

        self.context
            .connection
            .declare_exchange(base_destination, ExchangeKind::Topic)
            .await
            .map_err(Error::transport)?;

        let service = Service::new(base_destination, ServiceKind::Feeder);
        service.attach_feeder(FeederHandle::start(
            self.context.connection.clone(),
            base_destination.to_string(),
            selector.to_string(),
            interval,
            Arc::new(feeder),
        ));

        info!(service = base_destination, selector, ?interval, "started feeder service");
        Ok(self.track(service))
    }

    /// Receives publications on topic `source` matching `selector` (every
    /// publication when empty) through a private, auto-deleted queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange or queue cannot be declared, bound or
    /// consumed.
    pub async fn subscriber_service<W: Worker>(
        &self,
        source: &str,
        selector: &str,
        worker: W,
    ) -> Result<Service, Error> {
        let connection = &self.context.connection;
        connection
            .declare_exchange(source, ExchangeKind::Topic)
            .await
            .map_err(Error::transport)?;

        let queue = connection
            .declare_queue("", QueueOptions::ephemeral())
            .await
            .map_err(Error::transport)?;
        let pattern = if selector.is_empty() {
            connection.wildcard_all()
        } else {
            selector
        };
        connection
            .bind(&queue, source, pattern)
            .await
            .map_err(Error::transport)?;

        let service = Service::new(source, ServiceKind::Subscriber);
        self.context
            .start_routed(
                &service,
                &queue,
                1,
                SubscriberHandler {
                    service: source.to_string(),
                    worker: Arc::new(worker),
                },
            )
            .await?;

        info!(service = source, pattern, queue = %queue, "started subscriber service");
        Ok(self.track(service))
    }

    /// Every service created by this factory, in creation order.
    #[must_use]
    pub fn services(&self) -> Vec<Service> {
        self.services.lock().clone()
    }
}

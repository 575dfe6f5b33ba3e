mod reply_listener;

use crate::config::ClientConfig;
use crate::error::Error;
use crate::{FAF_EXCHANGE, RPC_EXCHANGE};
use reply_listener::ReplyListener;

use std::collections::HashSet;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use switchyard_messaging::{Connection, Envelope, ExchangeKind, QueueOptions, Translator, Worker};
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type DeclaredOnce = DashMap<String, Arc<OnceCell<()>>>;

struct ExecutorShared<C: Connection> {
    connection: C,
    application_id: String,
    rpc_timeout: Duration,
    rpc_retries: u32,
    consumer_grace: Duration,
    faf_exchange: OnceCell<()>,
    rpc_exchange: OnceCell<()>,
    faf_destinations: DeclaredOnce,
    rpc_destinations: DeclaredOnce,
    reply_listeners: DashMap<String, Arc<OnceCell<Arc<ReplyListener>>>>,
    groups: DashMap<String, HashSet<String>>,
}

impl<C: Connection> ExecutorShared<C> {
    async fn ensure_exchange(&self, cell: &OnceCell<()>, exchange: &str) -> Result<(), Error> {
        cell.get_or_try_init(|| async {
            self.connection
                .declare_exchange(exchange, ExchangeKind::Direct)
                .await
                .map_err(Error::transport)?;
            debug!(exchange, "declared exchange");
            Ok::<(), Error>(())
        })
        .await
        .map(|_| ())
    }

    async fn ensure_destination(
        &self,
        declared: &DeclaredOnce,
        exchange: &str,
        destination: &str,
    ) -> Result<(), Error> {
        let cell = declared.entry(destination.to_string()).or_default().clone();

        cell.get_or_try_init(|| async {
            self.connection
                .declare_queue(destination, QueueOptions::durable())
                .await
                .map_err(Error::transport)?;
            self.connection
                .bind(destination, exchange, destination)
                .await
                .map_err(Error::transport)?;
            debug!(exchange, destination, "bound destination");
            Ok::<(), Error>(())
        })
        .await
        .map(|_| ())
    }

    async fn publish(
        &self,
        exchange: &str,
        destination: &str,
        envelope: &Envelope,
    ) -> Result<(), Error> {
        let message = self
            .connection
            .translator()
            .encode(envelope)
            .map_err(Error::translation)?;

        self.connection
            .publish(exchange, destination, message)
            .await
            .map_err(Error::transport)
    }

    async fn named_listener(&self, queue: &str) -> Result<Arc<ReplyListener>, Error> {
        let cell = self
            .reply_listeners
            .entry(queue.to_string())
            .or_default()
            .clone();

        cell.get_or_try_init(|| async {
            self.connection
                .declare_queue(queue, QueueOptions::durable())
                .await
                .map_err(Error::transport)?;
            let listener =
                ReplyListener::start(&self.connection, queue.to_string(), self.consumer_grace)
                    .await?;
            debug!(queue, "started reply listener");
            Ok::<_, Error>(Arc::new(listener))
        })
        .await
        .cloned()
    }

    async fn ephemeral_listener(&self) -> Result<ReplyListener, Error> {
        let queue = self
            .connection
            .declare_queue("", QueueOptions::ephemeral())
            .await
            .map_err(Error::transport)?;

        ReplyListener::start(&self.connection, queue, self.consumer_grace).await
    }

    async fn release_ephemeral(&self, listener: &ReplyListener) {
        listener.stop().await;
        if let Err(e) = self.connection.delete_queue(listener.queue()).await {
            warn!(queue = listener.queue(), "failed to delete reply queue: {e}");
        }
    }

    async fn release_named(&self, queue: &str, delete: bool) {
        if let Some((_, cell)) = self.reply_listeners.remove(queue) {
            if let Some(listener) = cell.get() {
                listener.stop().await;
            }
        }

        if delete {
            if let Err(e) = self.connection.delete_queue(queue).await {
                warn!(queue, "failed to delete reply queue: {e}");
            }
        }
    }
}

/// Per-call reply queue, released when the call ends or its future is
/// dropped.
struct EphemeralReply<C: Connection> {
    shared: Arc<ExecutorShared<C>>,
    listener: Option<Arc<ReplyListener>>,
}

impl<C: Connection> EphemeralReply<C> {
    async fn release(mut self) {
        if let Some(listener) = self.listener.take() {
            self.shared.release_ephemeral(&listener).await;
        }
    }
}

impl<C: Connection> Drop for EphemeralReply<C> {
    fn drop(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };

        debug!(queue = listener.queue(), "rpc abandoned, releasing reply queue");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let shared = self.shared.clone();
                handle.spawn(async move {
                    shared.release_ephemeral(&listener).await;
                });
            }
            Err(_) => warn!(queue = listener.queue(), "no runtime left to delete reply queue"),
        }
    }
}

/// Issues fire-and-forget and RPC requests.
///
/// Handles are cheap to clone and share their declarations and reply
/// listeners. A handle returned by [`open_msg_group_request`] prefixes every
/// destination with `<group>-` while its group is open.
///
/// [`open_msg_group_request`]: RequestExecutor::open_msg_group_request
pub struct RequestExecutor<C: Connection> {
    shared: Arc<ExecutorShared<C>>,
    group: Option<String>,
}

impl<C: Connection> Clone for RequestExecutor<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            group: self.group.clone(),
        }
    }
}

impl<C: Connection> Debug for RequestExecutor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("application_id", &self.shared.application_id)
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

impl<C: Connection> RequestExecutor<C> {
    /// Creates an executor publishing over `connection`.
    #[must_use]
    pub fn new(connection: C, config: &ClientConfig) -> Self {
        Self {
            shared: Arc::new(ExecutorShared {
                connection,
                application_id: config.client_id.clone(),
                rpc_timeout: config.rpc_timeout(),
                rpc_retries: config.rpc_retries,
                consumer_grace: config.consumer_stop_grace(),
                faf_exchange: OnceCell::new(),
                rpc_exchange: OnceCell::new(),
                faf_destinations: DashMap::new(),
                rpc_destinations: DashMap::new(),
                reply_listeners: DashMap::new(),
                groups: DashMap::new(),
            }),
            group: None,
        }
    }

    /// The group this handle is scoped to, if any.
    #[must_use]
    pub fn group_id(&self) -> Option<&str> {
        self.group.as_deref()
    }

    fn active_group(&self) -> Option<&str> {
        self.group
            .as_deref()
            .filter(|group| self.shared.groups.contains_key(*group))
    }

    /// Applies the group prefix when a group is open on this handle.
    #[must_use]
    pub fn effective_destination(&self, destination: &str) -> String {
        match self.active_group() {
            Some(group) => {
                let prefix = format!("{group}-");
                if destination.starts_with(&prefix) {
                    destination.to_string()
                } else {
                    format!("{prefix}{destination}")
                }
            }
            None => destination.to_string(),
        }
    }

    /// Publishes `request` without waiting for a reply and returns it,
    /// stamped with the application id. Transport failures are logged.
    pub async fn fire_and_forget(&self, mut request: Envelope, destination: &str) -> Envelope {
        let destination = self.effective_destination(destination);
        request.set_application_id(self.shared.application_id.as_str());

        let outcome = async {
            self.shared
                .ensure_exchange(&self.shared.faf_exchange, FAF_EXCHANGE)
                .await?;
            self.shared
                .ensure_destination(&self.shared.faf_destinations, FAF_EXCHANGE, &destination)
                .await?;
            self.shared
                .publish(FAF_EXCHANGE, &destination, &request)
                .await
        }
        .await;

        if let Err(e) = outcome {
            error!(destination = %destination, "fire and forget failed: {e}");
        }

        request
    }

    /// Sends `request` and waits for the correlated reply on a reply queue
    /// chosen for the call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] once the retries are exhausted, or an error
    /// if the request cannot be published.
    pub async fn rpc(
        &self,
        request: Envelope,
        destination: &str,
        answer_worker: Option<&dyn Worker>,
    ) -> Result<Envelope, Error> {
        self.rpc_with_answer_source(request, destination, None, answer_worker)
            .await
    }

    /// Like [`rpc`](Self::rpc), with replies delivered to the named queue
    /// `answer_source`, which is declared once and reused.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] once the retries are exhausted,
    /// [`Error::GroupClosed`] if the handle's group closes while its reply
    /// queue is being set up, or an error if the request cannot be published.
    pub async fn rpc_with_answer_source(
        &self,
        mut request: Envelope,
        destination: &str,
        answer_source: Option<&str>,
        answer_worker: Option<&dyn Worker>,
    ) -> Result<Envelope, Error> {
        let destination = self.effective_destination(destination);

        let group = self.active_group();
        let group_source = match (answer_source, group) {
            (None, Some(group)) => self.shared.groups.get_mut(group).map(|mut queues| {
                let source = format!("{destination}-RET");
                queues.insert(source.clone());
                source
            }),
            _ => None,
        };
        let answer_source = answer_source.map(str::to_string).or(group_source.clone());

        self.shared
            .ensure_exchange(&self.shared.rpc_exchange, RPC_EXCHANGE)
            .await?;
        self.shared
            .ensure_destination(&self.shared.rpc_destinations, RPC_EXCHANGE, &destination)
            .await?;

        let correlation_id = request
            .correlation_id()
            .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
        request.set_correlation_id(correlation_id.as_str());
        request.set_application_id(self.shared.application_id.as_str());

        let reply = match &answer_source {
            Some(source) => {
                let listener = self.shared.named_listener(source).await?;
                if let (Some(group), Some(group_source)) = (group, &group_source) {
                    let still_open = self
                        .shared
                        .groups
                        .get(group)
                        .is_some_and(|queues| queues.contains(group_source));
                    if !still_open {
                        listener.stop().await;
                        self.shared.release_named(group_source, true).await;
                        return Err(Error::GroupClosed(group.to_string()));
                    }
                }
                request.set_reply_to(listener.queue());
                self.await_reply(&mut request, &destination, &correlation_id, &listener)
                    .await
            }
            None => {
                let listener = Arc::new(self.shared.ephemeral_listener().await?);
                let reply_queue = EphemeralReply {
                    shared: self.shared.clone(),
                    listener: Some(listener.clone()),
                };
                request.set_reply_to(listener.queue());
                let reply = self
                    .await_reply(&mut request, &destination, &correlation_id, &listener)
                    .await;
                reply_queue.release().await;
                reply
            }
        }?;

        match answer_worker {
            Some(worker) => Ok(worker.apply(reply.clone()).await.unwrap_or(reply)),
            None => Ok(reply),
        }
    }

    async fn await_reply(
        &self,
        request: &mut Envelope,
        destination: &str,
        correlation_id: &str,
        listener: &ReplyListener,
    ) -> Result<Envelope, Error> {
        let timeout = self.shared.rpc_timeout;
        let mut pending = listener.expect(correlation_id);

        loop {
            let attempt = request.retry_count();
            if request.trace() {
                info!(destination, correlation_id, attempt, "traced rpc attempt");
            }

            self.shared
                .publish(RPC_EXCHANGE, destination, request)
                .await?;
            let started = Instant::now();

            let outcome = if timeout.is_zero() {
                Ok((&mut pending).await)
            } else {
                tokio::time::timeout(timeout, &mut pending).await
            };

            match outcome {
                Ok(Ok(reply)) => {
                    let elapsed = started.elapsed();
                    if !timeout.is_zero() && elapsed * 5 > timeout * 3 {
                        warn!(destination, correlation_id, ?elapsed, ?timeout, "slow rpc");
                    }
                    return Ok(reply);
                }
                Ok(Err(_)) => {
                    return Err(Error::ReplyListenerClosed(listener.queue().to_string()));
                }
                Err(_) => {
                    let retries = u32::try_from(attempt.max(0)).unwrap_or(u32::MAX);
                    if retries >= self.shared.rpc_retries {
                        warn!(destination, correlation_id, retries, "rpc timed out");
                        return Err(Error::Timeout {
                            destination: destination.to_string(),
                            timeout,
                            retries,
                        });
                    }

                    warn!(destination, correlation_id, attempt, "rpc attempt timed out, retrying");
                    request.set_retry_count(attempt.max(0) + 1);
                    request.set_trace(true);
                }
            }
        }
    }

    /// Registers `group_id` and returns a handle scoped to it.
    #[must_use]
    pub fn open_msg_group_request(&self, group_id: &str) -> Self {
        self.shared.groups.entry(group_id.to_string()).or_default();
        info!(group_id, "opened message group");

        Self {
            shared: self.shared.clone(),
            group: Some(group_id.to_string()),
        }
    }

    /// Closes `group_id`, releasing its reply queues. Returns `false` if the
    /// group was not open.
    pub async fn close_msg_group_request(&self, group_id: &str) -> bool {
        let closed = self.clean_group_req_resources(group_id).await;
        if closed {
            info!(group_id, "closed message group");
        } else {
            debug!(group_id, "closing unknown message group");
        }
        closed
    }

    /// Deletes every reply queue registered under `group_id` and stops their
    /// listeners. Returns `false` if the group was not open.
    pub async fn clean_group_req_resources(&self, group_id: &str) -> bool {
        let Some((_, queues)) = self.shared.groups.remove(group_id) else {
            return false;
        };

        for queue in queues {
            self.shared.release_named(&queue, true).await;
        }

        let prefix = format!("{group_id}-");
        self.shared
            .faf_destinations
            .retain(|destination, _| !destination.starts_with(&prefix));
        self.shared
            .rpc_destinations
            .retain(|destination, _| !destination.starts_with(&prefix));

        true
    }

    /// Reply queues currently owned by `group_id`, sorted.
    #[must_use]
    pub fn group_reply_queues(&self, group_id: &str) -> Vec<String> {
        let mut queues: Vec<String> = self
            .shared
            .groups
            .get(group_id)
            .map(|queues| queues.iter().cloned().collect())
            .unwrap_or_default();
        queues.sort();
        queues
    }

    /// Number of cached reply listeners.
    #[must_use]
    pub fn reply_listener_count(&self) -> usize {
        self.shared.reply_listeners.len()
    }

    /// Closes every group and stops every cached reply listener.
    pub async fn stop(&self) {
        let groups: Vec<String> = self
            .shared
            .groups
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for group in groups {
            self.clean_group_req_resources(&group).await;
        }

        let queues: Vec<String> = self
            .shared
            .reply_listeners
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for queue in queues {
            self.shared.release_named(&queue, false).await;
        }

        debug!(application_id = %self.shared.application_id, "stopped request executor");
    }
}

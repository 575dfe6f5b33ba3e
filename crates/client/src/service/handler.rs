use crate::group::{MsgGroupServiceMgr, MsgGroupStatus};
use crate::reply_cache::ReplyCache;
use crate::router::RouteeHandler;
use crate::{CLOSE_MSG_GROUP, OPEN_MSG_GROUP};

use std::sync::Arc;

use async_trait::async_trait;
use switchyard_messaging::{Connection, Envelope, ReturnCode, Translator, Worker};
use tracing::{debug, error, warn};

/// Answers requests with a worker, caching replies for retried requests.
pub(crate) struct RequestHandler<C: Connection> {
    pub(crate) service: String,
    pub(crate) connection: C,
    pub(crate) worker: Arc<dyn Worker>,
    pub(crate) reply_cache: ReplyCache,
}

impl<C: Connection> RequestHandler<C> {
    async fn send_reply(&self, reply_to: &str, reply: &Envelope) {
        let outcome = match self.connection.translator().encode(reply) {
            Ok(message) => self
                .connection
                .publish("", reply_to, message)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        if let Err(e) = outcome {
            error!(service = %self.service, reply_to, "failed to send reply: {e}");
        }
    }

    async fn answer(&self, routee_index: usize, request: Envelope) {
        let correlation_id = request.correlation_id().map(str::to_string);
        let reply_to = request.reply_to().map(str::to_string);

        if request.retry_count() > 0 {
            if let (Some(correlation_id), Some(reply_to)) = (&correlation_id, &reply_to) {
                if let Some(cached) = self.reply_cache.get(correlation_id) {
                    debug!(
                        service = %self.service,
                        correlation_id = %correlation_id,
                        "answering retried request from reply cache"
                    );
                    self.send_reply(reply_to, &cached).await;
                    return;
                }
            }
        }

        if request.trace() {
            debug!(
                service = %self.service,
                routee_index,
                correlation_id = ?correlation_id,
                retry_count = request.retry_count(),
                "handling traced request"
            );
        }

        let Some(mut reply) = self.worker.apply(request).await else {
            return;
        };
        let Some(reply_to) = reply_to else {
            debug!(service = %self.service, "worker replied to a request without reply-to");
            return;
        };

        if let Some(correlation_id) = correlation_id {
            reply.set_correlation_id(correlation_id.as_str());
            self.reply_cache.put(correlation_id, reply.clone());
        }
        self.send_reply(&reply_to, &reply).await;
    }
}

#[async_trait]
impl<C: Connection> RouteeHandler for RequestHandler<C> {
    type Message = Envelope;

    async fn handle(&self, routee_index: usize, request: Envelope) {
        self.answer(routee_index, request).await;
    }
}

/// A request handler that also answers group control operations.
pub(crate) struct GroupedRequestHandler<C: Connection> {
    pub(crate) requests: RequestHandler<C>,
    pub(crate) groups: MsgGroupServiceMgr,
}

impl<C: Connection> GroupedRequestHandler<C> {
    async fn control(&self, request: &Envelope, open: bool) {
        let reply = match request.msg_group_id() {
            None => {
                warn!(service = %self.requests.service, "group control message without msg-group-id");
                let mut reply = request.reply(ReturnCode::BadRequest);
                reply.set_error_message("missing msg-group-id");
                reply
            }
            Some(group_id) => {
                let status = if open {
                    self.groups.open_msg_group_service(group_id).await
                } else {
                    Ok(self.groups.close_msg_group_service(group_id).await)
                };

                let mut reply = match status {
                    Ok(MsgGroupStatus::NotFound) => {
                        let mut reply = request.reply(ReturnCode::NotFound);
                        reply.set_error_message(format!("unknown message group '{group_id}'"));
                        reply
                    }
                    Ok(_) => request.reply(ReturnCode::Success),
                    Err(e) => {
                        let mut reply = request.reply(ReturnCode::ServerError);
                        reply.set_error_message(e.to_string());
                        reply
                    }
                };
                reply.set_msg_group_id(group_id);
                reply
            }
        };

        if let Some(reply_to) = request.reply_to() {
            self.requests.send_reply(reply_to, &reply).await;
        }
    }
}

#[async_trait]
impl<C: Connection> RouteeHandler for GroupedRequestHandler<C> {
    type Message = Envelope;

    async fn handle(&self, routee_index: usize, request: Envelope) {
        match request.operation() {
            Some(OPEN_MSG_GROUP) => self.control(&request, true).await,
            Some(CLOSE_MSG_GROUP) => self.control(&request, false).await,
            _ => self.requests.answer(routee_index, request).await,
        }
    }
}

/// Hands topic publications to a worker, ignoring its output.
pub(crate) struct SubscriberHandler {
    pub(crate) service: String,
    pub(crate) worker: Arc<dyn Worker>,
}

#[async_trait]
impl RouteeHandler for SubscriberHandler {
    type Message = Envelope;

    async fn handle(&self, _routee_index: usize, message: Envelope) {
        if self.worker.apply(message).await.is_some() {
            debug!(service = %self.service, "subscriber worker output discarded");
        }
    }
}

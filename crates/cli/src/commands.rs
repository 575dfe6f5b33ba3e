use crate::{Command, Error};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use switchyard_client::{Client, RequestExecutor};
use switchyard_messaging::{Connection, Envelope, ReturnCode, Worker};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEMO_QUEUE: &str = "switchyard-demo";
const DEMO_TOPIC: &str = "switchyard-demo-feed";
const DEMO_FEED_INTERVAL: Duration = Duration::from_millis(200);

fn echo_worker(service: String) -> impl Worker {
    move |request: Envelope| {
        let service = service.clone();
        async move {
            info!(
                service = %service,
                body = ?request.body_text(),
                correlation_id = ?request.correlation_id(),
                "request received"
            );
            let mut reply = Envelope::text(format!("echo: {}", request.body_text().unwrap_or("")));
            reply.set_return_code(ReturnCode::Success);
            Some(reply)
        }
    }
}

fn print_worker(source: String) -> impl Worker {
    move |feed: Envelope| {
        let source = source.clone();
        async move {
            info!(source = %source, body = ?feed.body_text(), "publication received");
            None::<Envelope>
        }
    }
}

fn check_reply(reply: &Envelope) -> Result<(), Error> {
    match reply.return_code() {
        Some(code) if code != ReturnCode::Success.code() => Err(Error::Remote {
            code,
            message: reply.error_message().unwrap_or_default().to_string(),
        }),
        _ => Ok(()),
    }
}

async fn call<C: Connection>(
    executor: &RequestExecutor<C>,
    destination: &str,
    body: String,
    operation: Option<String>,
) -> Result<Envelope, Error> {
    let mut request = Envelope::text(body);
    if let Some(operation) = operation {
        request.set_operation(operation);
    }

    let reply = executor.rpc(request, destination, None).await?;
    check_reply(&reply)?;
    Ok(reply)
}

pub(crate) async fn execute<C: Connection>(
    client: &Client<C>,
    command: Command,
    shutdown_token: CancellationToken,
) -> Result<(), Error> {
    let executor = client.request_executor();
    let factory = client.service_factory();

    match command {
        Command::Send { destination, body } => {
            let sent = executor
                .fire_and_forget(Envelope::text(body), &destination)
                .await;
            info!(destination = %destination, application_id = ?sent.application_id(), "sent");
        }
        Command::Call {
            destination,
            body,
            operation,
            group,
        } => {
            let reply = match group {
                Some(group) => {
                    let grouped = executor.open_msg_group_request(&group);
                    let reply = call(&grouped, &destination, body, operation).await;
                    grouped.close_msg_group_request(&group).await;
                    reply?
                }
                None => call(executor, &destination, body, operation).await?,
            };
            info!(destination = %destination, body = ?reply.body_text(), "reply");
        }
        Command::Echo { source, groups } => {
            let worker = echo_worker(source.clone());
            if groups {
                factory.msg_group_request_service(&source, worker).await?;
            } else {
                factory.request_service(&source, worker).await?;
            }
            info!(source = %source, "serving until interrupted");
            shutdown_token.cancelled().await;
        }
        Command::Subscribe { source, selector } => {
            factory
                .subscriber_service(&source, &selector, print_worker(source.clone()))
                .await?;
            info!(source = %source, selector = %selector, "subscribed until interrupted");
            shutdown_token.cancelled().await;
        }
        Command::Feed {
            destination,
            selector,
            body,
            interval_ms,
        } => {
            let body = Arc::new(body);
            factory
                .feeder_service(
                    &destination,
                    &selector,
                    Duration::from_millis(interval_ms),
                    move || {
                        let body = body.clone();
                        async move { Envelope::text(body.as_str()) }
                    },
                )
                .await?;
            info!(destination = %destination, selector = %selector, "feeding until interrupted");
            shutdown_token.cancelled().await;
        }
        Command::Demo => demo(client).await?,
    }

    Ok(())
}

async fn demo<C: Connection>(client: &Client<C>) -> Result<(), Error> {
    let executor = client.request_executor();
    let factory = client.service_factory();

    factory
        .msg_group_request_service(DEMO_QUEUE, echo_worker(DEMO_QUEUE.to_string()))
        .await?;
    factory
        .subscriber_service(DEMO_TOPIC, "", print_worker(DEMO_TOPIC.to_string()))
        .await?;

    let sequence = Arc::new(AtomicU64::new(0));
    factory
        .feeder_service(DEMO_TOPIC, "demo.tick", DEMO_FEED_INTERVAL, move || {
            let n = sequence.fetch_add(1, Ordering::SeqCst);
            async move { Envelope::text(format!("tick {n}")) }
        })
        .await?;

    executor
        .fire_and_forget(Envelope::text("Hello"), DEMO_QUEUE)
        .await;

    let reply = call(executor, DEMO_QUEUE, "ping".to_string(), None).await?;
    info!(body = ?reply.body_text(), "rpc reply");

    let mut open = Envelope::new();
    open.set_operation(switchyard_client::OPEN_MSG_GROUP);
    open.set_msg_group_id("demo-group");
    check_reply(&executor.rpc(open, DEMO_QUEUE, None).await?)?;

    let grouped = executor.open_msg_group_request("demo-group");
    for i in 0..3 {
        let reply = call(&grouped, DEMO_QUEUE, format!("grouped {i}"), None).await?;
        info!(body = ?reply.body_text(), "grouped rpc reply");
    }
    grouped.close_msg_group_request("demo-group").await;

    let mut close = Envelope::new();
    close.set_operation(switchyard_client::CLOSE_MSG_GROUP);
    close.set_msg_group_id("demo-group");
    if let Err(e) = check_reply(&executor.rpc(close, DEMO_QUEUE, None).await?) {
        warn!("closing the demo group failed: {e}");
    }

    tokio::time::sleep(DEMO_FEED_INTERVAL * 3).await;
    Ok(())
}

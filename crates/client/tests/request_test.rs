mod common;

use common::{eventually, memory_client, test_config};

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use switchyard_client::{ClientConfig, Error, ServiceState};
use switchyard_messaging::{Envelope, ReturnCode, Worker};
use tokio::sync::mpsc;
use tokio::time::Instant;

fn pong_worker(calls: Arc<AtomicUsize>) -> impl Worker {
    move |request: Envelope| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            let body = if request.body_text() == Some("ping") {
                "pong"
            } else {
                "unknown"
            };
            let mut reply = Envelope::text(body);
            reply.set_return_code(ReturnCode::Success);
            Some(reply)
        }
    }
}

#[tokio::test]
async fn test_fire_and_forget_reaches_the_service() {
    let (broker, client) = memory_client(test_config());
    let (seen, mut seen_receiver) = mpsc::unbounded_channel();

    client
        .service_factory()
        .request_service("Q1", move |request: Envelope| {
            let seen = seen.clone();
            async move {
                seen.send(request).unwrap();
                None::<Envelope>
            }
        })
        .await
        .unwrap();

    let sent = client
        .request_executor()
        .fire_and_forget(Envelope::text("Hello"), "Q1")
        .await;
    assert_eq!(sent.application_id(), Some("test-client"));

    let received = tokio::time::timeout(Duration::from_secs(1), seen_receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.body_text(), Some("Hello"));
    assert_eq!(received.application_id(), Some("test-client"));
    assert_eq!(received.reply_to(), None);

    assert!(broker.exchange_exists(switchyard_client::FAF_EXCHANGE));
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_rpc_ping_pong() {
    let (broker, client) = memory_client(test_config());
    let calls = Arc::new(AtomicUsize::new(0));

    client
        .service_factory()
        .request_service("Q2", pong_worker(calls.clone()))
        .await
        .unwrap();

    let mut request = Envelope::text("ping");
    request.set_correlation_id("cid-1");
    let reply = client
        .request_executor()
        .rpc(request, "Q2", None)
        .await
        .unwrap();

    assert_eq!(reply.body_text(), Some("pong"));
    assert_eq!(reply.correlation_id(), Some("cid-1"));
    assert_eq!(reply.return_code(), Some(ReturnCode::Success.code()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // the per-call reply queue is gone once the call returns
    assert!(
        broker
            .queue_names()
            .iter()
            .all(|queue| !queue.starts_with("amq.gen-"))
    );

    client.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_rpc_without_service_times_out_after_retries() {
    let (_broker, client) = memory_client(test_config());

    let started = Instant::now();
    let outcome = client
        .request_executor()
        .rpc(Envelope::text("ping"), "Q3", None)
        .await;
    let elapsed = started.elapsed();

    match outcome {
        Err(Error::Timeout {
            destination,
            timeout,
            retries,
        }) => {
            assert_eq!(destination, "Q3");
            assert_eq!(timeout, Duration::from_secs(1));
            assert_eq!(retries, 2);
        }
        other => panic!("expected a timeout, got {other:?}"),
    }

    assert!(elapsed >= Duration::from_secs(3));
    assert!(elapsed < Duration::from_secs(4));

    client.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_zero_timeout_waits_for_a_late_reply() {
    let config = ClientConfig {
        rpc_timeout_secs: 0,
        ..test_config()
    };
    let (_broker, client) = memory_client(config);

    client
        .service_factory()
        .request_service("Q4", |request: Envelope| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Some(Envelope::text(format!("late {}", request.body_text()?)))
        })
        .await
        .unwrap();

    let reply = client
        .request_executor()
        .rpc(Envelope::text("ping"), "Q4", None)
        .await
        .unwrap();

    assert_eq!(reply.body_text(), Some("late ping"));
    assert_eq!(reply.retry_count(), 0);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_retried_request_is_answered_from_the_reply_cache() {
    let (_broker, client) = memory_client(test_config());
    let calls = Arc::new(AtomicUsize::new(0));

    client
        .service_factory()
        .request_service("Q5", pong_worker(calls.clone()))
        .await
        .unwrap();

    let mut first = Envelope::text("ping");
    first.set_correlation_id("retried-cid");
    let first_reply = client
        .request_executor()
        .rpc(first, "Q5", None)
        .await
        .unwrap();

    let mut retry = Envelope::text("ping");
    retry.set_correlation_id("retried-cid");
    retry.set_retry_count(1);
    let retry_reply = client
        .request_executor()
        .rpc(retry, "Q5", None)
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(retry_reply.body_text(), first_reply.body_text());
    assert_eq!(retry_reply.correlation_id(), Some("retried-cid"));
    assert_eq!(client.reply_cache().len(), 1);

    client.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_slow_reply_arrives_after_a_retry() {
    let (_broker, client) = memory_client(test_config());
    let attempts = Arc::new(Mutex::new(Vec::new()));

    let seen = attempts.clone();
    client
        .service_factory()
        .request_service("Q11", move |request: Envelope| {
            let seen = seen.clone();
            async move {
                seen.lock().push((
                    request.correlation_id().map(str::to_string),
                    request.retry_count(),
                    request.trace(),
                ));
                tokio::time::sleep(Duration::from_millis(1500)).await;
                Some(Envelope::text("pong"))
            }
        })
        .await
        .unwrap();

    let mut request = Envelope::text("ping");
    request.set_correlation_id("slow-cid");
    let reply = client
        .request_executor()
        .rpc(request, "Q11", None)
        .await
        .unwrap();

    assert_eq!(reply.body_text(), Some("pong"));
    assert_eq!(reply.correlation_id(), Some("slow-cid"));
    let cid = Some("slow-cid".to_string());
    assert_eq!(
        *attempts.lock(),
        vec![(cid.clone(), 0, false), (cid, 1, true)]
    );

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_abandoned_rpc_releases_its_reply_queue() {
    let (broker, client) = memory_client(test_config());

    client
        .service_factory()
        .request_service("Q12", |_request: Envelope| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            None::<Envelope>
        })
        .await
        .unwrap();

    let executor = client.request_executor();
    let abandoned = tokio::time::timeout(
        Duration::from_millis(200),
        executor.rpc(Envelope::text("ping"), "Q12", None),
    )
    .await;
    assert!(abandoned.is_err());

    assert!(
        eventually(Duration::from_secs(1), || {
            broker
                .queue_names()
                .iter()
                .all(|queue| !queue.starts_with("amq.gen-"))
        })
        .await
    );

    let named = tokio::time::timeout(
        Duration::from_millis(200),
        executor.rpc_with_answer_source(Envelope::text("ping"), "Q12", Some("Q12-answers"), None),
    )
    .await;
    assert!(named.is_err());
    assert!(broker.queue_exists("Q12-answers"));
    assert_eq!(executor.reply_listener_count(), 1);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_answer_worker_post_processes_the_reply() {
    let (_broker, client) = memory_client(test_config());

    client
        .service_factory()
        .request_service("Q6", pong_worker(Arc::new(AtomicUsize::new(0))))
        .await
        .unwrap();

    let shout = |reply: Envelope| async move {
        Some(Envelope::text(reply.body_text()?.to_uppercase()))
    };
    let shout: &dyn Worker = &shout;
    let reply = client
        .request_executor()
        .rpc(Envelope::text("ping"), "Q6", Some(shout))
        .await
        .unwrap();
    assert_eq!(reply.body_text(), Some("PONG"));

    let ignore = |_reply: Envelope| async move { None::<Envelope> };
    let ignore: &dyn Worker = &ignore;
    let reply = client
        .request_executor()
        .rpc(Envelope::text("ping"), "Q6", Some(ignore))
        .await
        .unwrap();
    assert_eq!(reply.body_text(), Some("pong"));

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_named_answer_source_is_reused() {
    let (broker, client) = memory_client(test_config());

    client
        .service_factory()
        .request_service("Q7", pong_worker(Arc::new(AtomicUsize::new(0))))
        .await
        .unwrap();

    let executor = client.request_executor();
    for _ in 0..3 {
        let reply = executor
            .rpc_with_answer_source(Envelope::text("ping"), "Q7", Some("Q7-answers"), None)
            .await
            .unwrap();
        assert_eq!(reply.body_text(), Some("pong"));
    }

    assert_eq!(executor.reply_listener_count(), 1);
    assert!(broker.queue_exists("Q7-answers"));
    assert_eq!(broker.acked_count("Q7-answers"), 3);

    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_rpcs_get_their_own_replies() {
    let (_broker, client) = memory_client(test_config());

    client
        .service_factory()
        .request_service("Q8", |request: Envelope| async move {
            Some(Envelope::text(format!("echo {}", request.body_text()?)))
        })
        .await
        .unwrap();

    let mut calls = Vec::new();
    for i in 0..20 {
        let executor = client.request_executor().clone();
        calls.push(tokio::spawn(async move {
            let reply = executor
                .rpc(Envelope::text(i.to_string()), "Q8", None)
                .await
                .unwrap();
            (i, reply)
        }));
    }

    for call in calls {
        let (i, reply) = call.await.unwrap();
        assert_eq!(reply.body_text(), Some(format!("echo {i}").as_str()));
    }

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_stopped_service_releases_its_queue() {
    let (broker, client) = memory_client(test_config());

    let service = client
        .service_factory()
        .request_service("Q9", pong_worker(Arc::new(AtomicUsize::new(0))))
        .await
        .unwrap();
    assert_eq!(service.state(), ServiceState::Running);
    assert_eq!(broker.consumer_count("Q9"), 1);

    service.will_stop_soon();
    assert!(service.stop().await);
    assert!(!service.stop().await);
    assert_eq!(service.state(), ServiceState::Stopped);

    assert!(eventually(Duration::from_secs(1), || broker.consumer_count("Q9") == 0).await);
    assert!(broker.queue_exists("Q9"));

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (broker, client) = memory_client(test_config());

    client
        .service_factory()
        .request_service("Q10", pong_worker(Arc::new(AtomicUsize::new(0))))
        .await
        .unwrap();
    assert!(client.is_connected());

    client.close().await.unwrap();
    client.close().await.unwrap();

    assert!(!client.is_connected());
    assert!(
        client
            .service_factory()
            .services()
            .iter()
            .all(|service| service.state() == ServiceState::Stopped)
    );
    assert_eq!(broker.consumer_count("Q10"), 0);
}

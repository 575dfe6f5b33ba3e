mod common;

use common::{memory_client, test_config};

use switchyard_client::{CLOSE_MSG_GROUP, Error, OPEN_MSG_GROUP, ServiceKind};
use switchyard_messaging::{Envelope, ReturnCode, Worker};

fn echo_worker() -> impl Worker {
    |request: Envelope| async move { Some(Envelope::text(format!("echo {}", request.body_text()?))) }
}

fn control(operation: &str, group_id: Option<&str>) -> Envelope {
    let mut request = Envelope::new();
    request.set_operation(operation);
    if let Some(group_id) = group_id {
        request.set_msg_group_id(group_id);
    }
    request
}

#[tokio::test]
async fn test_group_traffic_is_isolated_from_the_base_queue() {
    let (broker, client) = memory_client(test_config());
    let service = client
        .service_factory()
        .msg_group_request_service("QG", echo_worker())
        .await
        .unwrap();
    assert_eq!(service.kind(), ServiceKind::MsgGroupRequest);

    let executor = client.request_executor();
    let opened = executor
        .rpc(control(OPEN_MSG_GROUP, Some("g1")), "QG", None)
        .await
        .unwrap();
    assert_eq!(opened.return_code(), Some(ReturnCode::Success.code()));
    assert_eq!(opened.msg_group_id(), Some("g1"));
    assert!(broker.queue_exists("g1-QG"));

    let manager = service.group_manager().unwrap();
    assert_eq!(manager.open_groups().await, vec!["g1".to_string()]);

    let grouped = executor.open_msg_group_request("g1");
    assert_eq!(grouped.effective_destination("QG"), "g1-QG");
    assert_eq!(grouped.effective_destination("g1-QG"), "g1-QG");

    let base_before = broker.acked_count("QG");
    for _ in 0..3 {
        let reply = grouped
            .rpc(Envelope::text("in group"), "QG", None)
            .await
            .unwrap();
        assert_eq!(reply.body_text(), Some("echo in group"));
    }
    assert_eq!(broker.acked_count("g1-QG"), 3);
    assert_eq!(broker.acked_count("QG"), base_before);
    assert_eq!(grouped.group_reply_queues("g1"), vec!["g1-QG-RET".to_string()]);
    assert!(broker.queue_exists("g1-QG-RET"));

    assert!(grouped.close_msg_group_request("g1").await);
    assert!(!grouped.close_msg_group_request("g1").await);
    assert!(!broker.queue_exists("g1-QG-RET"));
    assert_eq!(grouped.effective_destination("QG"), "QG");

    let closed = executor
        .rpc(control(CLOSE_MSG_GROUP, Some("g1")), "QG", None)
        .await
        .unwrap();
    assert_eq!(closed.return_code(), Some(ReturnCode::Success.code()));
    assert!(!broker.queue_exists("g1-QG"));
    assert!(manager.open_groups().await.is_empty());

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_group_control_errors() {
    let (_broker, client) = memory_client(test_config());
    client
        .service_factory()
        .msg_group_request_service("QH", echo_worker())
        .await
        .unwrap();

    let executor = client.request_executor();

    let missing_id = executor
        .rpc(control(OPEN_MSG_GROUP, None), "QH", None)
        .await
        .unwrap();
    assert_eq!(missing_id.return_code(), Some(ReturnCode::BadRequest.code()));
    assert!(missing_id.error_message().is_some());

    let unknown = executor
        .rpc(control(CLOSE_MSG_GROUP, Some("nope")), "QH", None)
        .await
        .unwrap();
    assert_eq!(unknown.return_code(), Some(ReturnCode::NotFound.code()));
    assert_eq!(unknown.msg_group_id(), Some("nope"));

    let reopened = executor
        .rpc(control(OPEN_MSG_GROUP, Some("g2")), "QH", None)
        .await
        .unwrap();
    assert_eq!(reopened.return_code(), Some(ReturnCode::Success.code()));
    let again = executor
        .rpc(control(OPEN_MSG_GROUP, Some("g2")), "QH", None)
        .await
        .unwrap();
    assert_eq!(again.return_code(), Some(ReturnCode::Success.code()));

    let plain = executor
        .rpc(Envelope::text("outside"), "QH", None)
        .await
        .unwrap();
    assert_eq!(plain.body_text(), Some("echo outside"));

    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_closing_a_group_under_load_leaves_no_reply_queue() {
    let (broker, client) = memory_client(test_config());
    client
        .service_factory()
        .msg_group_request_service("QJ", echo_worker())
        .await
        .unwrap();

    let executor = client.request_executor();
    executor
        .rpc(control(OPEN_MSG_GROUP, Some("g3")), "QJ", None)
        .await
        .unwrap();

    let grouped = executor.open_msg_group_request("g3");
    let mut calls = Vec::new();
    for i in 0..20 {
        let grouped = grouped.clone();
        calls.push(tokio::spawn(async move {
            grouped.rpc(Envelope::text(i.to_string()), "QJ", None).await
        }));
    }
    tokio::task::yield_now().await;
    grouped.close_msg_group_request("g3").await;

    for call in calls {
        match call.await.unwrap() {
            Ok(reply) => assert!(reply.body_text().unwrap().starts_with("echo ")),
            Err(Error::GroupClosed(group)) => assert_eq!(group, "g3"),
            Err(Error::ReplyListenerClosed(queue)) => assert_eq!(queue, "g3-QJ-RET"),
            Err(Error::Timeout { destination, .. }) => assert_eq!(destination, "g3-QJ"),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert!(!broker.queue_exists("g3-QJ-RET"));
    assert_eq!(executor.reply_listener_count(), 0);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_stopping_the_service_closes_its_groups() {
    let (broker, client) = memory_client(test_config());
    let service = client
        .service_factory()
        .msg_group_request_service("QI", echo_worker())
        .await
        .unwrap();

    let executor = client.request_executor();
    for group in ["a", "b"] {
        executor
            .rpc(control(OPEN_MSG_GROUP, Some(group)), "QI", None)
            .await
            .unwrap();
    }
    assert!(broker.queue_exists("a-QI"));
    assert!(broker.queue_exists("b-QI"));

    assert!(service.stop().await);
    assert!(!broker.queue_exists("a-QI"));
    assert!(!broker.queue_exists("b-QI"));
    assert_eq!(broker.consumer_count("QI"), 0);

    client.close().await.unwrap();
}

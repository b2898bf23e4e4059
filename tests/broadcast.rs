mod common;

use common::{next_text, TestServer};
use futures::{SinkExt, StreamExt};
use kubeowl::hub::Frame;
use kubeowl::server;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn test_broadcast_reaches_every_connected_client() {
    let server = TestServer::start().await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;
    server.wait_for_clients(2).await;

    server.hub.broadcast(Frame::from("hello".to_string())).await.unwrap();
    assert_eq!(next_text(&mut a).await, "hello");
    assert_eq!(next_text(&mut b).await, "hello");

    a.close(None).await.unwrap();
    server.wait_for_clients(1).await;

    server.hub.broadcast(Frame::from("world".to_string())).await.unwrap();
    assert_eq!(next_text(&mut b).await, "world");
}

#[tokio::test]
async fn test_late_client_gets_no_replay() {
    let server = TestServer::start().await;
    let mut early = server.connect().await;
    server.wait_for_clients(1).await;

    server.hub.broadcast(Frame::from("first".to_string())).await.unwrap();
    assert_eq!(next_text(&mut early).await, "first");

    let mut late = server.connect().await;
    server.wait_for_clients(2).await;
    server.hub.broadcast(Frame::from("second".to_string())).await.unwrap();

    assert_eq!(next_text(&mut late).await, "second");
    assert_eq!(next_text(&mut early).await, "second");
}

#[tokio::test]
async fn test_plain_get_is_rejected_without_registering() {
    let server = TestServer::start().await;

    let response = server.get("/ws").await;
    assert!(
        response.starts_with("HTTP/1.1 4"),
        "unexpected response: {response}"
    );

    let stats = server.hub.stats().await.unwrap();
    assert!(stats.clients.is_empty());
}

#[tokio::test]
async fn test_healthz_and_status() {
    let server = TestServer::start().await;
    let _client = server.connect().await;
    server.wait_for_clients(1).await;

    let health = server.get("/healthz").await;
    assert!(health.starts_with("HTTP/1.1 200"));
    assert!(health.ends_with("ok"));

    let status = server.get("/api/status").await;
    assert!(status.starts_with("HTTP/1.1 200"));
    assert!(status.contains("\"isRunningInCluster\":false"));
    assert!(status.contains("\"droppedClients\":0"));
}

#[tokio::test]
async fn test_shutdown_closes_clients_before_drain_returns() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;
    server.wait_for_clients(1).await;

    server.shutdown.cancel();
    assert!(server::drain(&server.connections, Duration::from_secs(5)).await);

    // the close frame was written before the connection task finished
    let message = timeout(Duration::from_secs(1), client.next())
        .await
        .expect("socket stayed silent after drain");
    assert!(
        matches!(&message, Some(Ok(msg)) if msg.is_close()),
        "expected a close frame, got {message:?}"
    );
}

#[tokio::test]
async fn test_oversized_inbound_message_closes_connection() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;
    server.wait_for_clients(1).await;

    let oversized = "x".repeat(2048);
    // the server may already be gone by the time the send completes
    let _ = client.send(Message::text(oversized)).await;

    let closed = timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                None | Some(Err(_)) => return,
                Some(Ok(msg)) if msg.is_close() => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "oversized message did not close the socket");
    server.wait_for_clients(0).await;
}

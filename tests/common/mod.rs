#![allow(dead_code)]

use futures::StreamExt;
use kubeowl::config::HubConfig;
use kubeowl::hub::{Hub, HubHandle};
use kubeowl::server::{self, AppState};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use kubeowl::k8s::WatchStats;

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const PATIENCE: Duration = Duration::from_secs(5);

/// A hub and http server bound to an ephemeral local port
pub struct TestServer {
    pub addr: SocketAddr,
    pub hub: HubHandle,
    pub shutdown: CancellationToken,
    pub connections: TaskTracker,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with_watchers(Vec::new()).await
    }

    pub async fn start_with_watchers(watchers: Vec<watch::Receiver<WatchStats>>) -> Self {
        let shutdown = CancellationToken::new();
        let config = HubConfig::default();
        let (hub, _task) = Hub::spawn(&config, shutdown.clone());
        Self::start_with_hub(hub, watchers, shutdown).await
    }

    pub async fn start_with_hub(
        hub: HubHandle,
        watchers: Vec<watch::Receiver<WatchStats>>,
        shutdown: CancellationToken,
    ) -> Self {
        let state = AppState::new(hub.clone(), HubConfig::default().client_queue_capacity)
            .with_watchers(watchers);
        let connections = state.connections.clone();
        let app = server::router(state, std::env::temp_dir());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server::serve(listener, app, shutdown.clone()));

        Self {
            addr,
            hub,
            shutdown,
            connections,
        }
    }

    pub async fn connect(&self) -> WsClient {
        let url = format!("ws://{}/ws", self.addr);
        let (client, _response) = tokio_tungstenite::connect_async(url).await.unwrap();
        client
    }

    /// Poll the hub until it reports `count` registered clients
    pub async fn wait_for_clients(&self, count: usize) {
        let waiting = async {
            loop {
                let stats = self.hub.stats().await.unwrap();
                if stats.clients.len() == count {
                    return;
                }
                sleep(Duration::from_millis(10)).await;
            }
        };
        timeout(PATIENCE, waiting)
            .await
            .unwrap_or_else(|_| panic!("hub never reached {count} clients"));
    }

    /// Send a raw http/1.1 GET and return the whole response as text
    pub async fn get(&self, path: &str) -> String {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        let request =
            format!("GET {path} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", self.addr);
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        timeout(PATIENCE, stream.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Next text frame, skipping control frames
pub async fn next_text(client: &mut WsClient) -> String {
    let reading = async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => return text.as_str().to_owned(),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                other => panic!("expected a text frame, got {other:?}"),
            }
        }
    };
    timeout(PATIENCE, reading)
        .await
        .expect("no text frame arrived in time")
}

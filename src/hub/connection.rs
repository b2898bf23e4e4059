/**
 * Client connections
 *
 * Bridges the hub's outbound queue for one client to one websocket. The send
 * pump runs on its own task and writes queued frames; the receive pump only
 * reads to notice the peer going away. Whichever stops first takes the other
 * down through a shared cancellation token.
 */
use super::{ClientHandle, ClientId, Frame, HubHandle};
use crate::config::ConnectionConfig;
use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Lifecycle of a client connection. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Move to `next` if it lies ahead of the current state
    pub fn advance(&mut self, next: Self) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }
}

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client sent a close frame or the stream ended
    PeerClosed,
    ReadFailed(String),
    /// Nothing, not even a pong, arrived within the pong wait
    ReadTimeout,
    WriteFailed(String),
    WriteTimeout,
    /// The hub closed the outbound queue (backpressure drop or shutdown)
    DroppedByHub,
    /// The hub was not running, so the client was never registered
    HubUnavailable,
}

pub struct ClientConnection {
    id: ClientId,
    hub: HubHandle,
    config: ConnectionConfig,
    state: ConnectionState,
    handle: ClientHandle,
    queue: mpsc::Receiver<Frame>,
}

impl ClientConnection {
    #[must_use]
    pub fn new(hub: HubHandle, config: ConnectionConfig, queue_capacity: usize) -> Self {
        let (handle, queue) = ClientHandle::new(queue_capacity);
        Self {
            id: handle.id,
            hub,
            config,
            state: ConnectionState::Connecting,
            handle,
            queue,
        }
    }

    #[must_use]
    pub const fn id(&self) -> ClientId {
        self.id
    }

    /// Serve an upgraded websocket until either side gives up
    pub async fn serve(self, socket: WebSocket) -> DisconnectReason {
        let (sink, stream) = socket.split();
        self.run(sink, stream).await
    }

    /// Register with the hub, then pump frames out through `sink` while
    /// watching `stream` for the peer going away.
    pub async fn run<Tx, Rx, E>(self, sink: Tx, stream: Rx) -> DisconnectReason
    where
        Tx: Sink<Message> + Send + Unpin + 'static,
        Tx::Error: Display + Send,
        Rx: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let Self {
            id,
            hub,
            config,
            mut state,
            handle,
            queue,
        } = self;

        if let Err(e) = hub.register(handle).await {
            warn!("Client {} rejected: {}", id, e);
            state.advance(ConnectionState::Closed);
            debug!("Client {} is {:?}", id, state);
            return DisconnectReason::HubUnavailable;
        }
        state.advance(ConnectionState::Open);
        debug!("Client {} is {:?}", id, state);
        info!("🔌 Client {} connected", id);

        let closing = CancellationToken::new();
        let sender = tokio::spawn(send_pump(queue, sink, closing.clone(), config));

        let read_reason = recv_pump(stream, &closing, &config).await;
        state.advance(ConnectionState::Closing);
        debug!("Client {} is {:?}", id, state);
        hub.unregister(id).await;
        closing.cancel();

        let write_reason = match sender.await {
            Ok(reason) => reason,
            Err(e) => Some(DisconnectReason::WriteFailed(e.to_string())),
        };
        state.advance(ConnectionState::Closed);
        debug!("Client {} is {:?}", id, state);

        let reason = read_reason
            .or(write_reason)
            .unwrap_or(DisconnectReason::PeerClosed);
        info!("🔌 Client {} disconnected: {:?}", id, reason);
        reason
    }
}

async fn write<Tx>(sink: &mut Tx, message: Message, limit: std::time::Duration) -> Result<(), DisconnectReason>
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: Display,
{
    match timeout(limit, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(DisconnectReason::WriteFailed(e.to_string())),
        Err(_) => Err(DisconnectReason::WriteTimeout),
    }
}

/// Write queued frames in order, pinging the peer periodically.
///
/// Returns `None` when stopped by `closing`, otherwise the cause.
async fn send_pump<Tx>(
    mut queue: mpsc::Receiver<Frame>,
    mut sink: Tx,
    closing: CancellationToken,
    config: ConnectionConfig,
) -> Option<DisconnectReason>
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: Display,
{
    let mut ping = interval_at(Instant::now() + config.ping_period, config.ping_period);

    let reason = loop {
        tokio::select! {
            biased;
            () = closing.cancelled() => break None,
            frame = queue.recv() => {
                let Some(frame) = frame else {
                    break Some(DisconnectReason::DroppedByHub);
                };
                if let Err(reason) = write(&mut sink, Message::Text(frame), config.write_timeout).await {
                    break Some(reason);
                }
            }
            _ = ping.tick() => {
                trace!("Sending ping");
                if let Err(reason) = write(&mut sink, Message::Ping(Default::default()), config.write_timeout).await {
                    break Some(reason);
                }
            }
        }
    };

    if !matches!(
        reason,
        Some(DisconnectReason::WriteFailed(_) | DisconnectReason::WriteTimeout)
    ) {
        let _ = write(&mut sink, Message::Close(None), config.write_timeout).await;
    }
    let _ = timeout(config.write_timeout, sink.close()).await;
    closing.cancel();

    if let Some(reason) = &reason {
        debug!("Send pump stopped: {:?}", reason);
    }
    reason
}

/// Read until the peer goes away. Inbound application messages are ignored.
///
/// Returns `None` when stopped by `closing`, otherwise the cause.
async fn recv_pump<Rx, E>(
    mut stream: Rx,
    closing: &CancellationToken,
    config: &ConnectionConfig,
) -> Option<DisconnectReason>
where
    Rx: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let next = tokio::select! {
            biased;
            () = closing.cancelled() => return None,
            next = timeout(config.pong_wait, stream.next()) => next,
        };

        match next {
            Err(_) => return Some(DisconnectReason::ReadTimeout),
            Ok(None | Some(Ok(Message::Close(_)))) => return Some(DisconnectReason::PeerClosed),
            Ok(Some(Err(e))) => return Some(DisconnectReason::ReadFailed(e.to_string())),
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => trace!("Heartbeat from peer"),
            Ok(Some(Ok(_))) => debug!("Ignoring application message from client"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::hub::Hub;
    use futures::channel::mpsc as fmpsc;
    use std::time::Duration;

    type Outbound = fmpsc::Receiver<Message>;
    type Inbound = fmpsc::UnboundedSender<Result<Message, String>>;

    struct Harness {
        hub: HubHandle,
        id: ClientId,
        outbound: Outbound,
        inbound: Inbound,
        task: tokio::task::JoinHandle<DisconnectReason>,
        _shutdown: CancellationToken,
    }

    async fn connect(config: ConnectionConfig, queue_capacity: usize, sink_buffer: usize) -> Harness {
        let shutdown = CancellationToken::new();
        let (hub, _task) = Hub::spawn(&HubConfig::default(), shutdown.clone());
        let (out_tx, outbound) = fmpsc::channel(sink_buffer);
        let (inbound, in_rx) = fmpsc::unbounded();

        let connection = ClientConnection::new(hub.clone(), config, queue_capacity);
        let id = connection.id();
        let task = tokio::spawn(connection.run(out_tx, in_rx));

        wait_for(&hub, |clients| clients.contains(&id)).await;
        Harness {
            hub,
            id,
            outbound,
            inbound,
            task,
            _shutdown: shutdown,
        }
    }

    async fn wait_for(hub: &HubHandle, check: impl Fn(&[ClientId]) -> bool) {
        for _ in 0..200 {
            if check(&hub.stats().await.unwrap().clients) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("hub membership never reached the expected state");
    }

    async fn next_text(outbound: &mut Outbound) -> String {
        loop {
            match outbound.next().await {
                Some(Message::Text(text)) => return text.as_str().to_string(),
                Some(Message::Ping(_)) => {}
                other => panic!("unexpected outbound message {other:?}"),
            }
        }
    }

    #[test]
    fn test_state_only_moves_forward() {
        let mut state = ConnectionState::Connecting;
        assert!(state.advance(ConnectionState::Open));
        assert!(state.advance(ConnectionState::Closing));
        assert!(!state.advance(ConnectionState::Open));
        assert!(state.advance(ConnectionState::Closed));
        assert!(!state.advance(ConnectionState::Closing));
        assert_eq!(state, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_frames_delivered_until_peer_closes() {
        let mut h = connect(ConnectionConfig::default(), 8, 8).await;

        h.hub.broadcast(Frame::from("hello".to_string())).await.unwrap();
        h.hub.broadcast(Frame::from("world".to_string())).await.unwrap();
        assert_eq!(next_text(&mut h.outbound).await, "hello");
        assert_eq!(next_text(&mut h.outbound).await, "world");

        // client chatter is ignored
        h.inbound.unbounded_send(Ok(Message::Text("hi".to_string().into()))).unwrap();
        h.inbound.unbounded_send(Ok(Message::Close(None))).unwrap();

        assert_eq!(h.task.await.unwrap(), DisconnectReason::PeerClosed);
        wait_for(&h.hub, |clients| clients.is_empty()).await;
    }

    #[tokio::test]
    async fn test_read_error_unregisters() {
        let h = connect(ConnectionConfig::default(), 8, 8).await;

        h.inbound.unbounded_send(Err("connection reset".to_string())).unwrap();

        assert_eq!(
            h.task.await.unwrap(),
            DisconnectReason::ReadFailed("connection reset".to_string())
        );
        wait_for(&h.hub, |clients| !clients.contains(&h.id)).await;
    }

    #[tokio::test]
    async fn test_write_error_unregisters() {
        let h = connect(ConnectionConfig::default(), 8, 8).await;
        drop(h.outbound);

        h.hub.broadcast(Frame::from("lost".to_string())).await.unwrap();

        assert!(matches!(h.task.await.unwrap(), DisconnectReason::WriteFailed(_)));
        wait_for(&h.hub, |clients| !clients.contains(&h.id)).await;
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let config = ConnectionConfig {
            pong_wait: Duration::from_millis(100),
            ..ConnectionConfig::default()
        };
        let h = connect(config, 8, 8).await;

        assert_eq!(h.task.await.unwrap(), DisconnectReason::ReadTimeout);
        wait_for(&h.hub, |clients| !clients.contains(&h.id)).await;
    }

    #[tokio::test]
    async fn test_pings_are_sent() {
        let config = ConnectionConfig {
            ping_period: Duration::from_millis(30),
            ..ConnectionConfig::default()
        };
        let mut h = connect(config, 8, 8).await;

        let first = tokio::time::timeout(Duration::from_secs(2), h.outbound.next())
            .await
            .unwrap();
        assert!(matches!(first, Some(Message::Ping(_))));
        drop(h.inbound);
        assert_eq!(h.task.await.unwrap(), DisconnectReason::PeerClosed);
    }

    #[tokio::test]
    async fn test_stalled_socket_gets_dropped_by_hub() {
        let config = ConnectionConfig {
            write_timeout: Duration::from_secs(30),
            ..ConnectionConfig::default()
        };
        // the sink accepts one message and then stalls because nobody reads it
        let h = connect(config, 1, 0).await;

        for i in 0..6 {
            h.hub.broadcast(Frame::from(format!("m{i}"))).await.unwrap();
        }

        wait_for(&h.hub, |clients| !clients.contains(&h.id)).await;
        assert!(h.hub.stats().await.unwrap().dropped_clients >= 1);
        drop(h.inbound);
        h.task.abort();
    }
}

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use slipstream_core::protocol::{ClientEvent, ServerEvent};

use slipstream_server::config::{ServerConfig, SessionsConfig};
use slipstream_server::{build_app, spawn_session_reaper};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    _shutdown: tokio::task::JoinHandle<()>,
}

impl TestServer {
    /// Start a test server with default config.
    pub async fn new() -> Self {
        Self::from_config(ServerConfig::default()).await
    }

    /// Start a test server with one-second timers, for tests that cross
    /// the countdown or a grace window.
    pub async fn fast() -> Self {
        let config = ServerConfig {
            sessions: SessionsConfig {
                countdown_secs: 1,
                controller_grace_secs: 1,
                host_grace_secs: 1,
                ..SessionsConfig::default()
            },
            ..ServerConfig::default()
        };
        Self::from_config(config).await
    }

    pub async fn from_config(config: ServerConfig) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (app, state) = build_app(config);
        spawn_session_reaper(state);

        let handle = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        // Give the server a moment to start accepting
        tokio::time::sleep(Duration::from_millis(20)).await;

        Self {
            addr,
            _shutdown: handle,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }
}

/// Connect a WebSocket client to the given URL.
pub async fn ws_connect(url: &str) -> WsStream {
    let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

/// Send a client event as a JSON text frame.
pub async fn send_event(stream: &mut WsStream, event: &ClientEvent) {
    let text = serde_json::to_string(event).unwrap();
    stream.send(Message::Text(text.into())).await.unwrap();
}

/// Read the next server event (5s timeout).
pub async fn read_event(stream: &mut WsStream) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(text.as_str()).unwrap();
                },
                Some(Ok(Message::Close(_))) => panic!("WebSocket closed unexpectedly"),
                Some(Err(e)) => panic!("WebSocket error: {e}"),
                None => panic!("WebSocket stream ended"),
                _ => continue,
            }
        }
    })
    .await
    .expect("Timed out waiting for WebSocket message")
}

/// Read events until one matches the predicate, returning it. Broadcast
/// streams interleave roster updates, so most assertions want this rather
/// than a positional read.
pub async fn read_until<F>(stream: &mut WsStream, mut pred: F) -> ServerEvent
where
    F: FnMut(&ServerEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = read_event(stream).await;
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("Timed out waiting for matching event")
}

/// Try to read the next server event, returning None on timeout.
pub async fn try_read_event(stream: &mut WsStream, timeout_ms: u64) -> Option<ServerEvent> {
    tokio::time::timeout(Duration::from_millis(timeout_ms), async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Some(serde_json::from_str(text.as_str()).unwrap());
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                _ => continue,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Open a host connection and create a session. Returns (stream, code).
pub async fn create_session(server: &TestServer) -> (WsStream, String) {
    let mut host = ws_connect(&server.ws_url()).await;
    send_event(&mut host, &ClientEvent::CreateSession {}).await;
    match read_event(&mut host).await {
        ServerEvent::SessionCreated { session_code } => (host, session_code),
        other => panic!("Expected session_created, got: {other:?}"),
    }
}

/// Open a controller connection and join a session. Returns (stream, player_id).
pub async fn join_session(server: &TestServer, code: &str) -> (WsStream, String) {
    let mut controller = ws_connect(&server.ws_url()).await;
    send_event(&mut controller, &ClientEvent::JoinSession {
        session_code: code.to_string(),
        player_id: None,
    })
    .await;
    match read_event(&mut controller).await {
        ServerEvent::LobbyJoined { player_id } => (controller, player_id),
        other => panic!("Expected lobby_joined, got: {other:?}"),
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::protocol::{valid_device_code, ClientFrame, ServerFrame};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// One registered device. A device code maps to exactly one live socket;
/// a newer registration replaces the older one.
#[derive(Clone)]
struct RegisteredDevice {
    conn_id: u64,
    device_code: String,
    tx: mpsc::UnboundedSender<ServerFrame>,
    registered_at: DateTime<Utc>,
    last_seen: Arc<RwLock<Instant>>,
}

#[derive(Clone)]
pub struct RelayState {
    devices: Arc<DashMap<String, RegisteredDevice>>,
    conn_seq: Arc<AtomicU64>,
    stale_after: Duration,
}

impl RelayState {
    pub fn new(config: &RelayConfig) -> Self {
        let state = Self {
            devices: Arc::new(DashMap::new()),
            conn_seq: Arc::new(AtomicU64::new(1)),
            stale_after: Duration::from_secs(config.stale_after_seconds),
        };
        let monitor = state.clone();
        tokio::spawn(async move {
            monitor.sweep_stale().await;
        });
        state
    }

    fn next_conn_id(&self) -> u64 {
        self.conn_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the displaced registration, if any.
    fn register(&self, device: RegisteredDevice) -> Option<RegisteredDevice> {
        self.devices.insert(device.device_code.clone(), device)
    }

    /// Remove a registration, but only if it still belongs to this socket;
    /// a replacement registration must survive the old socket's cleanup.
    fn unregister(&self, device_code: &str, conn_id: u64) -> bool {
        self.devices
            .remove_if(device_code, |_, device| device.conn_id == conn_id)
            .is_some()
    }

    fn send_to(&self, device_code: &str, frame: ServerFrame) -> bool {
        match self.devices.get(device_code) {
            Some(device) => device.tx.send(frame).is_ok(),
            None => false,
        }
    }

    fn broadcast_presence(&self, frame: ServerFrame, except: &str) {
        for device in self.devices.iter() {
            if device.device_code != except {
                let _ = device.tx.send(frame.clone());
            }
        }
    }

    async fn touch(&self, device_code: &str) {
        let last_seen = self
            .devices
            .get(device_code)
            .map(|device| device.last_seen.clone());
        if let Some(last_seen) = last_seen {
            *last_seen.write().await = Instant::now();
        }
    }

    async fn sweep_stale(&self) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;

            // Collect heartbeat locks first; holding DashMap guards across
            // an await invites deadlock.
            let mut checks = Vec::new();
            for device in self.devices.iter() {
                checks.push((
                    device.device_code.clone(),
                    device.conn_id,
                    device.last_seen.clone(),
                ));
            }

            let mut stale = Vec::new();
            for (code, conn_id, last_seen) in checks {
                if last_seen.read().await.elapsed() > self.stale_after {
                    stale.push((code, conn_id));
                }
            }

            for (code, conn_id) in stale {
                if self.unregister(&code, conn_id) {
                    info!("removing stale device {} (heartbeat timeout)", code);
                    self.broadcast_presence(
                        ServerFrame::DeviceOffline {
                            device_code: code.clone(),
                        },
                        &code,
                    );
                }
            }
        }
    }
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&frame) {
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
    });

    let conn_id = state.next_conn_id();
    let mut registered: Option<String> = None;

    while let Some(result) = receiver.next().await {
        let message = match result {
            Ok(message) => message,
            Err(err) => {
                debug!("websocket error: {}", err);
                break;
            }
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    debug!("ignoring non-utf8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => break,
            _ => continue,
        };

        match serde_json::from_str::<ClientFrame>(&text) {
            Ok(frame) => {
                if let Err(err) =
                    handle_client_frame(frame, conn_id, &mut registered, &state, &tx).await
                {
                    debug!("peer send path closed: {}", err);
                    break;
                }
            }
            Err(err) => {
                warn!("failed to parse client frame: {}", err);
                let _ = tx.send(ServerFrame::Error {
                    message: format!("invalid message format: {}", err),
                });
            }
        }
    }

    if let Some(code) = registered {
        if state.unregister(&code, conn_id) {
            info!("device {} disconnected", code);
            state.broadcast_presence(
                ServerFrame::DeviceOffline {
                    device_code: code.clone(),
                },
                &code,
            );
        }
    }
}

async fn handle_client_frame(
    frame: ClientFrame,
    conn_id: u64,
    registered: &mut Option<String>,
    state: &RelayState,
    tx: &mpsc::UnboundedSender<ServerFrame>,
) -> Result<()> {
    match frame {
        ClientFrame::Register { device_code } => {
            if !valid_device_code(&device_code) {
                tx.send(ServerFrame::Error {
                    message: format!("invalid device code '{}'", device_code),
                })?;
                return Ok(());
            }
            let device = RegisteredDevice {
                conn_id,
                device_code: device_code.clone(),
                tx: tx.clone(),
                registered_at: Utc::now(),
                last_seen: Arc::new(RwLock::new(Instant::now())),
            };
            if let Some(previous) = state.register(device) {
                debug!(
                    "device {} re-registered (previous from {})",
                    device_code, previous.registered_at
                );
                let _ = previous.tx.send(ServerFrame::Error {
                    message: "registration replaced by a new connection".into(),
                });
            }
            *registered = Some(device_code.clone());
            info!("device {} registered", device_code);
            tx.send(ServerFrame::Registered {
                device_code: device_code.clone(),
            })?;
            state.broadcast_presence(
                ServerFrame::DeviceOnline {
                    device_code: device_code.clone(),
                },
                &device_code,
            );
        }

        ClientFrame::Signal { to, data } => {
            let Some(from) = registered.clone() else {
                tx.send(ServerFrame::Error {
                    message: "register before signaling".into(),
                })?;
                return Ok(());
            };
            debug!("routing signal {} -> {}", from, to);
            if !state.send_to(&to, ServerFrame::Signal { from, data }) {
                tx.send(ServerFrame::Error {
                    message: format!("device {} is not online", to),
                })?;
            }
        }

        ClientFrame::Ping => {
            if let Some(code) = registered.as_deref() {
                state.touch(code).await;
            }
            tx.send(ServerFrame::Pong)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream::{SplitSink, SplitStream};
    use std::net::SocketAddr;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = (
        SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>,
        SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    );

    async fn start_relay() -> SocketAddr {
        let state = RelayState::new(&RelayConfig::default());
        let app = router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn connect_client(addr: SocketAddr) -> Client {
        let (stream, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        stream.split()
    }

    async fn send_frame(client: &mut Client, frame: &ClientFrame) {
        let text = serde_json::to_string(frame).unwrap();
        client.0.send(WsMessage::Text(text.into())).await.unwrap();
    }

    async fn next_frame(client: &mut Client) -> ServerFrame {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), client.1.next())
                .await
                .expect("timed out waiting for frame")
                .expect("socket closed")
                .expect("socket error");
            if let WsMessage::Text(text) = message {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn register(client: &mut Client, code: &str) {
        send_frame(
            client,
            &ClientFrame::Register {
                device_code: code.into(),
            },
        )
        .await;
        match next_frame(client).await {
            ServerFrame::Registered { device_code } => assert_eq!(device_code, code),
            other => panic!("expected registered ack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn register_route_and_presence_round_trip() {
        let addr = start_relay().await;
        let mut alpha = connect_client(addr).await;
        let mut beta = connect_client(addr).await;

        register(&mut alpha, "11111111").await;
        register(&mut beta, "22222222").await;

        // Alpha was online first, so it sees beta appear.
        match next_frame(&mut alpha).await {
            ServerFrame::DeviceOnline { device_code } => assert_eq!(device_code, "22222222"),
            other => panic!("expected presence, got {other:?}"),
        }

        send_frame(
            &mut beta,
            &ClientFrame::Signal {
                to: "11111111".into(),
                data: serde_json::json!({"type": "offer", "sdp": "v=0"}),
            },
        )
        .await;
        match next_frame(&mut alpha).await {
            ServerFrame::Signal { from, data } => {
                assert_eq!(from, "22222222");
                assert_eq!(data["type"], "offer");
            }
            other => panic!("expected routed signal, got {other:?}"),
        }

        send_frame(&mut beta, &ClientFrame::Ping).await;
        assert!(matches!(next_frame(&mut beta).await, ServerFrame::Pong));
    }

    #[tokio::test]
    async fn signaling_unknown_target_reports_error() {
        let addr = start_relay().await;
        let mut client = connect_client(addr).await;
        register(&mut client, "33333333").await;

        send_frame(
            &mut client,
            &ClientFrame::Signal {
                to: "44444444".into(),
                data: serde_json::json!({}),
            },
        )
        .await;
        match next_frame(&mut client).await {
            ServerFrame::Error { message } => assert!(message.contains("not online")),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn signaling_before_registration_is_rejected() {
        let addr = start_relay().await;
        let mut client = connect_client(addr).await;
        send_frame(
            &mut client,
            &ClientFrame::Signal {
                to: "44444444".into(),
                data: serde_json::json!({}),
            },
        )
        .await;
        match next_frame(&mut client).await {
            ServerFrame::Error { message } => assert!(message.contains("register")),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn replacement_registration_wins() {
        let addr = start_relay().await;
        let mut old = connect_client(addr).await;
        let mut new = connect_client(addr).await;
        let mut sender = connect_client(addr).await;

        register(&mut old, "55555555").await;
        register(&mut new, "55555555").await;

        // The displaced socket is told why it went dark.
        match next_frame(&mut old).await {
            ServerFrame::Error { message } => assert!(message.contains("replaced")),
            other => panic!("expected replacement notice, got {other:?}"),
        }

        register(&mut sender, "66666666").await;
        send_frame(
            &mut sender,
            &ClientFrame::Signal {
                to: "55555555".into(),
                data: serde_json::json!({"n": 1}),
            },
        )
        .await;
        // The new socket may see sender's presence frame first.
        loop {
            match next_frame(&mut new).await {
                ServerFrame::Signal { from, .. } => {
                    assert_eq!(from, "66666666");
                    break;
                }
                ServerFrame::DeviceOnline { .. } => continue,
                other => panic!("expected signal at the new socket, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn link_clients_negotiate_through_the_relay() {
        use std::sync::Arc as StdArc;
        use tandem_link::identity::DeviceCode;
        use tandem_link::signaling::relay::RelaySignaling;
        use tandem_link::signaling::{
            SignalKind, SignalingChannel, SignalingEvent, SignalingMessage,
        };

        let addr = start_relay().await;
        let url = format!("ws://{}/ws", addr);

        let code_a: DeviceCode = "77770001".parse().unwrap();
        let code_b: DeviceCode = "77770002".parse().unwrap();
        let client_a = StdArc::new(
            RelaySignaling::new(&url, code_a.clone(), Duration::from_secs(5)).unwrap(),
        );
        let client_b = StdArc::new(
            RelaySignaling::new(&url, code_b.clone(), Duration::from_secs(5)).unwrap(),
        );
        client_a.connect().await.unwrap();
        client_b.connect().await.unwrap();
        let mut events_b = client_b.events().await.unwrap();

        client_a
            .send(SignalingMessage {
                from: code_a.clone(),
                to: code_b.clone(),
                kind: SignalKind::Offer,
                data: serde_json::json!({"type": "offer", "sdp": "v=0"}),
            })
            .await
            .unwrap();

        loop {
            match tokio::time::timeout(Duration::from_secs(5), events_b.recv())
                .await
                .expect("timed out waiting for signal")
            {
                Some(SignalingEvent::Message(message)) => {
                    assert_eq!(message.from, code_a);
                    assert_eq!(message.kind, SignalKind::Offer);
                    break;
                }
                Some(_) => continue,
                None => panic!("event stream ended early"),
            }
        }
    }
}

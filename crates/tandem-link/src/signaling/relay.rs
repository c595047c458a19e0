//! WebSocket client for the rendezvous relay.
//!
//! Registers the local device code, routes [`SignalingMessage`]s addressed to
//! other codes, probes liveness every 30 s, and reconnects with capped
//! exponential backoff when the relay drops the connection out from under us.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::time::{interval, sleep, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use url::Url;

use super::{SignalingChannel, SignalingError, SignalingEvent, SignalingMessage};
use crate::identity::DeviceCode;

const PROBE_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
enum ClientFrame {
    Register { device_code: String },
    Signal { to: String, data: SignalingMessage },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
enum ServerFrame {
    Registered { device_code: String },
    Signal { from: String, data: SignalingMessage },
    Pong,
    Error { message: String },
    DeviceOnline { device_code: String },
    DeviceOffline { device_code: String },
}

enum SessionEnd {
    /// The websocket closed or errored; the supervisor should reconnect.
    Closed,
    /// The owning handle went away; stop for good.
    SenderGone,
}

pub struct RelaySignaling {
    url: Url,
    local: DeviceCode,
    connect_timeout: Duration,
    out_tx: mpsc::UnboundedSender<ClientFrame>,
    out_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<ClientFrame>>>,
    events_tx: mpsc::UnboundedSender<SignalingEvent>,
    events_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<SignalingEvent>>>,
    registered_tx: watch::Sender<bool>,
    registered_rx: watch::Receiver<bool>,
    shutting_down: Arc<AtomicBool>,
    tasks: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl RelaySignaling {
    pub fn new(
        url: &str,
        local: DeviceCode,
        connect_timeout: Duration,
    ) -> Result<Self, SignalingError> {
        let parsed = Url::parse(url).map_err(|err| SignalingError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(SignalingError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme {}", parsed.scheme()),
            });
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (registered_tx, registered_rx) = watch::channel(false);
        Ok(Self {
            url: parsed,
            local,
            connect_timeout,
            out_tx,
            out_rx: AsyncMutex::new(Some(out_rx)),
            events_tx,
            events_rx: AsyncMutex::new(Some(events_rx)),
            registered_tx,
            registered_rx,
            shutting_down: Arc::new(AtomicBool::new(false)),
            tasks: StdMutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl SignalingChannel for RelaySignaling {
    async fn connect(&self) -> Result<(), SignalingError> {
        let out_rx = self
            .out_rx
            .lock()
            .await
            .take()
            .ok_or(SignalingError::ChannelClosed)?;

        let ws = timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| SignalingError::ConnectTimeout)?
            .map_err(|err| SignalingError::Transport(format!("websocket connect failed: {err}")))?
            .0;

        let supervisor = tokio::spawn(supervise(
            ws,
            out_rx,
            self.events_tx.clone(),
            self.registered_tx.clone(),
            self.url.clone(),
            self.local.clone(),
            Arc::clone(&self.shutting_down),
        ));
        self.tasks.lock().unwrap().push(supervisor);

        let mut registered = self.registered_rx.clone();
        let wait = async move {
            registered
                .wait_for(|ready| *ready)
                .await
                .map(|_| ())
                .map_err(|_| SignalingError::ChannelClosed)
        };
        timeout(self.connect_timeout, wait)
            .await
            .map_err(|_| SignalingError::ConnectTimeout)?
    }

    async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        self.out_tx
            .send(ClientFrame::Signal {
                to: message.to.to_string(),
                data: message,
            })
            .map_err(|_| SignalingError::ChannelClosed)
    }

    async fn events(&self) -> Result<mpsc::UnboundedReceiver<SignalingEvent>, SignalingError> {
        self.events_rx
            .lock()
            .await
            .take()
            .ok_or(SignalingError::EventsTaken)
    }

    fn local_code(&self) -> &DeviceCode {
        &self.local
    }
}

impl Drop for RelaySignaling {
    fn drop(&mut self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Ok(mut tasks) = self.tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }
}

async fn supervise(
    ws: WsStream,
    mut out_rx: mpsc::UnboundedReceiver<ClientFrame>,
    events_tx: mpsc::UnboundedSender<SignalingEvent>,
    registered_tx: watch::Sender<bool>,
    url: Url,
    local: DeviceCode,
    shutting_down: Arc<AtomicBool>,
) {
    let mut current = Some(ws);
    loop {
        let Some(stream) = current.take() else { return };
        let end = run_session(stream, &mut out_rx, &events_tx, &registered_tx, &local).await;
        let _ = registered_tx.send(false);
        if matches!(end, SessionEnd::SenderGone) || shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let mut attempts = 0u32;
        while current.is_none() {
            attempts += 1;
            if attempts > MAX_RECONNECT_ATTEMPTS {
                let _ = events_tx.send(SignalingEvent::Error(
                    "signaling relay unreachable: reconnect attempts exhausted".into(),
                ));
                return;
            }
            let delay = reconnect_delay(attempts);
            tracing::debug!(
                target = "tandem::signaling",
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "scheduling relay reconnect"
            );
            sleep(delay).await;
            if shutting_down.load(Ordering::SeqCst) {
                return;
            }
            match connect_async(url.as_str()).await {
                Ok((stream, _)) => current = Some(stream),
                Err(err) => {
                    tracing::warn!(
                        target = "tandem::signaling",
                        error = %err,
                        "relay reconnect attempt failed"
                    );
                }
            }
        }
    }
}

async fn run_session(
    ws: WsStream,
    out_rx: &mut mpsc::UnboundedReceiver<ClientFrame>,
    events_tx: &mpsc::UnboundedSender<SignalingEvent>,
    registered_tx: &watch::Sender<bool>,
    local: &DeviceCode,
) -> SessionEnd {
    let (mut write, mut read) = ws.split();

    let register = ClientFrame::Register {
        device_code: local.to_string(),
    };
    match serde_json::to_string(&register) {
        Ok(text) => {
            if write.send(Message::Text(text)).await.is_err() {
                return SessionEnd::Closed;
            }
        }
        Err(_) => return SessionEnd::Closed,
    }

    let mut probe = interval(PROBE_INTERVAL);
    // The first tick fires immediately; registration just went out.
    probe.tick().await;

    loop {
        tokio::select! {
            frame = out_rx.recv() => {
                let Some(frame) = frame else { return SessionEnd::SenderGone };
                let Ok(text) = serde_json::to_string(&frame) else { continue };
                if write.send(Message::Text(text)).await.is_err() {
                    return SessionEnd::Closed;
                }
            }
            _ = probe.tick() => {
                let Ok(text) = serde_json::to_string(&ClientFrame::Ping) else { continue };
                if write.send(Message::Text(text)).await.is_err() {
                    return SessionEnd::Closed;
                }
            }
            message = read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        handle_server_frame(&text, events_tx, registered_tx);
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if let Ok(text) = String::from_utf8(data) {
                            handle_server_frame(&text, events_tx, registered_tx);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Closed,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::warn!(
                            target = "tandem::signaling",
                            error = %err,
                            "relay websocket error"
                        );
                        return SessionEnd::Closed;
                    }
                }
            }
        }
    }
}

fn handle_server_frame(
    text: &str,
    events_tx: &mpsc::UnboundedSender<SignalingEvent>,
    registered_tx: &watch::Sender<bool>,
) {
    let frame = match serde_json::from_str::<ServerFrame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::debug!(
                target = "tandem::signaling",
                error = %err,
                "ignoring malformed relay frame"
            );
            return;
        }
    };
    match frame {
        ServerFrame::Registered { device_code } => {
            tracing::debug!(
                target = "tandem::signaling",
                device_code = %device_code,
                "registered with relay"
            );
            let _ = registered_tx.send(true);
            let _ = events_tx.send(SignalingEvent::Connected);
        }
        ServerFrame::Signal { data, .. } => {
            let _ = events_tx.send(SignalingEvent::Message(data));
        }
        // Probe loss is never fatal by itself, so the pong is purely
        // informational.
        ServerFrame::Pong => {
            tracing::trace!(target = "tandem::signaling", "relay probe answered");
        }
        ServerFrame::Error { message } => {
            tracing::warn!(
                target = "tandem::signaling",
                message = %message,
                "relay reported error"
            );
        }
        ServerFrame::DeviceOnline { device_code } => {
            if let Ok(code) = device_code.parse() {
                let _ = events_tx.send(SignalingEvent::PeerOnline(code));
            }
        }
        ServerFrame::DeviceOffline { device_code } => {
            if let Ok(code) = device_code.parse() {
                let _ = events_tx.send(SignalingEvent::PeerOffline(code));
            }
        }
    }
}

fn reconnect_delay(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(10);
    RECONNECT_BASE
        .saturating_mul(1u32 << shift)
        .min(RECONNECT_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::SignalKind;

    #[test]
    fn reconnect_delay_doubles_up_to_cap() {
        assert_eq!(reconnect_delay(1), Duration::from_secs(1));
        assert_eq!(reconnect_delay(2), Duration::from_secs(2));
        assert_eq!(reconnect_delay(3), Duration::from_secs(4));
        assert_eq!(reconnect_delay(5), Duration::from_secs(16));
        assert_eq!(reconnect_delay(6), Duration::from_secs(30));
        assert_eq!(reconnect_delay(12), Duration::from_secs(30));
    }

    #[test]
    fn client_frames_match_relay_wire_shape() {
        let register = ClientFrame::Register {
            device_code: "12345678".into(),
        };
        let text = serde_json::to_string(&register).unwrap();
        assert_eq!(text, "{\"type\":\"register\",\"deviceCode\":\"12345678\"}");

        let signal = ClientFrame::Signal {
            to: "87654321".into(),
            data: SignalingMessage {
                from: "12345678".parse().unwrap(),
                to: "87654321".parse().unwrap(),
                kind: SignalKind::IceCandidate,
                data: serde_json::json!({"candidate": "candidate:0"}),
            },
        };
        let text = serde_json::to_string(&signal).unwrap();
        assert!(text.starts_with("{\"type\":\"signal\",\"to\":\"87654321\""));
        assert!(text.contains("\"type\":\"ice-candidate\""));
    }

    #[test]
    fn server_frames_parse_from_relay_wire_shape() {
        let frame: ServerFrame =
            serde_json::from_str("{\"type\":\"device_online\",\"deviceCode\":\"11112222\"}")
                .unwrap();
        assert!(matches!(frame, ServerFrame::DeviceOnline { device_code } if device_code == "11112222"));

        let frame: ServerFrame = serde_json::from_str("{\"type\":\"pong\"}").unwrap();
        assert!(matches!(frame, ServerFrame::Pong));
    }

    #[test]
    fn rejects_non_websocket_urls() {
        let code: DeviceCode = "12345678".parse().unwrap();
        assert!(RelaySignaling::new("http://example.com", code, Duration::from_secs(1)).is_err());
    }
}

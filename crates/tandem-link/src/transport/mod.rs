//! Framed message transport over a peer data channel.
//!
//! Adds three things the raw channel does not give us: send-side
//! backpressure against the channel's buffered bytes, chunking for payloads
//! the channel cannot carry in one frame, and reassembly of inbound chunks
//! back into whole protocol messages. Sends are best-effort; liveness is
//! judged from connection state, never from send results.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::{Instant, interval};
use uuid::Uuid;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;

use crate::protocol::{ProtocolMessage, decode_message, encode_message};

/// Serialized payloads above this many bytes get the `__chunked` envelope.
pub const CHUNK_THRESHOLD: usize = 60_000;
/// Buffered bytes at which sends start queueing instead.
pub const HIGH_WATER: usize = 1024 * 1024;
/// Buffered bytes below which the queue drains again.
pub const LOW_WATER: usize = 512 * 1024;
const DRAIN_INTERVAL: Duration = Duration::from_millis(50);
/// Incomplete reassembly buffers are dropped after this long without a new
/// piece. The source design kept them forever, which leaks.
const REASSEMBLY_TTL: Duration = Duration::from_secs(60);
/// Upper bound on pieces per series; bounds reassembly memory against a
/// misbehaving peer.
const MAX_CHUNKS: u32 = 4096;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel closed")]
    ChannelClosed,
    #[error("send failed: {0}")]
    Send(String),
}

/// Seam between framing logic and the underlying data channel, so the
/// framing layer is testable without a negotiated peer connection.
#[async_trait]
pub trait FrameChannel: Send + Sync {
    fn label(&self) -> String;
    fn is_open(&self) -> bool;
    async fn buffered_amount(&self) -> usize;
    async fn send_text(&self, text: &str) -> Result<(), TransportError>;
}

pub struct RtcFrameChannel {
    dc: Arc<RTCDataChannel>,
}

impl RtcFrameChannel {
    pub fn new(dc: Arc<RTCDataChannel>) -> Self {
        Self { dc }
    }
}

#[async_trait]
impl FrameChannel for RtcFrameChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.dc
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(|err| TransportError::Send(err.to_string()))
    }
}

struct Reassembly {
    total: u32,
    pieces: Vec<Option<String>>,
    received: u32,
    last_update: Instant,
}

pub struct FramedTransport {
    channel: Arc<dyn FrameChannel>,
    queue: StdMutex<VecDeque<String>>,
    draining: AtomicBool,
    reassembly: StdMutex<HashMap<String, Reassembly>>,
}

impl FramedTransport {
    pub fn new(channel: Arc<dyn FrameChannel>) -> Self {
        Self {
            channel,
            queue: StdMutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            reassembly: StdMutex::new(HashMap::new()),
        }
    }

    /// Serialize and send one message, chunking when oversized. Best-effort.
    pub async fn send(self: &Arc<Self>, message: &ProtocolMessage) {
        match encode_message(message) {
            Ok(text) => self.send_encoded(text).await,
            Err(err) => {
                tracing::warn!(
                    target = "tandem::transport",
                    channel = %self.channel.label(),
                    error = %err,
                    "failed to encode outbound message"
                );
            }
        }
    }

    /// Send pre-encoded bytes. Broadcast paths serialize once and hand the
    /// same text to every peer's transport.
    pub async fn send_encoded(self: &Arc<Self>, text: String) {
        if text.len() <= CHUNK_THRESHOLD {
            self.dispatch(text).await;
            return;
        }

        let pieces = split_utf8(&text, CHUNK_THRESHOLD);
        let total = pieces.len() as u32;
        let id = Uuid::new_v4().to_string();
        for (index, piece) in pieces.into_iter().enumerate() {
            let envelope = ProtocolMessage::Chunked {
                id: id.clone(),
                index: index as u32,
                total,
                data: piece,
            };
            match encode_message(&envelope) {
                Ok(frame) => self.dispatch(frame).await,
                Err(err) => {
                    tracing::warn!(
                        target = "tandem::transport",
                        channel = %self.channel.label(),
                        error = %err,
                        "failed to encode chunk envelope"
                    );
                    return;
                }
            }
            // Let other work interleave between pieces.
            tokio::task::yield_now().await;
        }
    }

    async fn dispatch(self: &Arc<Self>, frame: String) {
        let queue_empty = self.queue.lock().unwrap().is_empty();
        if queue_empty && self.channel.buffered_amount().await < HIGH_WATER {
            if let Err(err) = self.channel.send_text(&frame).await {
                tracing::warn!(
                    target = "tandem::transport",
                    channel = %self.channel.label(),
                    error = %err,
                    "frame send failed"
                );
            }
            return;
        }
        self.queue.lock().unwrap().push_back(frame);
        self.ensure_drain();
    }

    fn ensure_drain(self: &Arc<Self>) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(DRAIN_INTERVAL);
            loop {
                ticker.tick().await;
                if !this.channel.is_open() {
                    this.clear();
                    break;
                }
                while this.channel.buffered_amount().await < LOW_WATER {
                    let frame = this.queue.lock().unwrap().pop_front();
                    let Some(frame) = frame else { break };
                    if let Err(err) = this.channel.send_text(&frame).await {
                        tracing::warn!(
                            target = "tandem::transport",
                            channel = %this.channel.label(),
                            error = %err,
                            "queued frame send failed"
                        );
                        this.clear();
                        break;
                    }
                }
                if this.queue.lock().unwrap().is_empty() {
                    break;
                }
            }
            this.draining.store(false, Ordering::SeqCst);
            // A send may have queued between the final check and the flag
            // store; restart rather than strand it.
            if !this.queue.lock().unwrap().is_empty() {
                this.ensure_drain();
            }
        });
    }

    /// Drop anything not yet on the wire. Called on teardown.
    pub fn clear(&self) {
        self.queue.lock().unwrap().clear();
    }

    pub fn queued_frames(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Feed one inbound frame. Returns a complete protocol message once the
    /// frame (or the chunk series it belongs to) is whole.
    pub fn accept_frame(&self, text: &str) -> Option<ProtocolMessage> {
        let message = match decode_message(text) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(
                    target = "tandem::transport",
                    channel = %self.channel.label(),
                    error = %err,
                    "dropping undecodable frame"
                );
                return None;
            }
        };
        match message {
            ProtocolMessage::Chunked {
                id,
                index,
                total,
                data,
            } => self.accept_chunk(id, index, total, data),
            whole => Some(whole),
        }
    }

    fn accept_chunk(
        &self,
        id: String,
        index: u32,
        total: u32,
        data: String,
    ) -> Option<ProtocolMessage> {
        if total == 0 || total > MAX_CHUNKS || index >= total {
            tracing::warn!(
                target = "tandem::transport",
                id = %id,
                index,
                total,
                "dropping chunk with invalid envelope"
            );
            return None;
        }

        let now = Instant::now();
        let complete = {
            let mut map = self.reassembly.lock().unwrap();
            map.retain(|_, entry| now.duration_since(entry.last_update) < REASSEMBLY_TTL);

            let entry = map.entry(id.clone()).or_insert_with(|| Reassembly {
                total,
                pieces: vec![None; total as usize],
                received: 0,
                last_update: now,
            });
            if entry.total != total {
                tracing::warn!(
                    target = "tandem::transport",
                    id = %id,
                    "chunk series restarted with different total; resetting"
                );
                *entry = Reassembly {
                    total,
                    pieces: vec![None; total as usize],
                    received: 0,
                    last_update: now,
                };
            }
            entry.last_update = now;
            let slot = &mut entry.pieces[index as usize];
            if slot.is_none() {
                *slot = Some(data);
                entry.received += 1;
            }
            if entry.received == entry.total {
                map.remove(&id)
            } else {
                None
            }
        };

        let entry = complete?;
        let mut text = String::new();
        for piece in entry.pieces {
            text.push_str(&piece.expect("complete reassembly has every piece"));
        }
        match decode_message(&text) {
            Ok(message) => Some(message),
            Err(err) => {
                tracing::warn!(
                    target = "tandem::transport",
                    id = %id,
                    error = %err,
                    "reassembled payload failed to decode"
                );
                None
            }
        }
    }

    #[cfg(test)]
    fn pending_reassemblies(&self) -> usize {
        self.reassembly.lock().unwrap().len()
    }
}

/// Split on char boundaries so every piece stays valid UTF-8.
fn split_utf8(text: &str, max_bytes: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut rest = text;
    while rest.len() > max_bytes {
        let mut cut = max_bytes;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (head, tail) = rest.split_at(cut);
        pieces.push(head.to_string());
        rest = tail;
    }
    pieces.push(rest.to_string());
    pieces
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::protocol::{MessageRole, RemoteChatMessage, RemoteStreamState};

    #[derive(Default)]
    struct MockFrameChannel {
        buffered: Mutex<usize>,
        sent: Mutex<Vec<String>>,
        open: AtomicBool,
    }

    impl MockFrameChannel {
        fn new() -> Arc<Self> {
            let channel = Self::default();
            channel.open.store(true, Ordering::SeqCst);
            Arc::new(channel)
        }

        fn set_buffered(&self, amount: usize) {
            *self.buffered.lock().unwrap() = amount;
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FrameChannel for MockFrameChannel {
        fn label(&self) -> String {
            "mock".into()
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn buffered_amount(&self) -> usize {
            *self.buffered.lock().unwrap()
        }

        async fn send_text(&self, text: &str) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn big_message() -> ProtocolMessage {
        ProtocolMessage::ChatStateFull {
            thread_id: "t1".into(),
            messages: vec![
                RemoteChatMessage {
                    role: MessageRole::Assistant,
                    content: "x".repeat(3 * CHUNK_THRESHOLD),
                    display_content: None,
                    reasoning: Some("thinking…".into()),
                    tool_name: None,
                    is_remote: false,
                };
                2
            ],
            stream_state: RemoteStreamState::default(),
            total_messages: 2,
        }
    }

    #[tokio::test]
    async fn small_messages_pass_through_unchunked() {
        let channel = MockFrameChannel::new();
        let transport = Arc::new(FramedTransport::new(channel.clone()));
        transport
            .send(&ProtocolMessage::Ping { timestamp_ms: 7 })
            .await;
        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("\"type\":\"ping\""));
    }

    #[tokio::test]
    async fn chunk_then_reassemble_is_identity() {
        let channel = MockFrameChannel::new();
        let sender = Arc::new(FramedTransport::new(channel.clone()));
        let receiver = Arc::new(FramedTransport::new(MockFrameChannel::new()));

        let original = big_message();
        sender.send(&original).await;

        let frames = channel.sent();
        assert!(frames.len() > 1, "oversized payload must chunk");
        for frame in &frames {
            assert!(frame.len() <= CHUNK_THRESHOLD + 256, "envelope overhead only");
            assert!(frame.contains("\"type\":\"__chunked\""));
        }

        let mut decoded = None;
        for frame in &frames {
            let result = receiver.accept_frame(frame);
            if frame != frames.last().unwrap() {
                assert!(result.is_none(), "partial series must not forward");
            }
            decoded = result;
        }
        assert_eq!(decoded, Some(original));
        assert_eq!(receiver.pending_reassemblies(), 0);
    }

    #[tokio::test]
    async fn chunks_tolerate_out_of_order_arrival() {
        let channel = MockFrameChannel::new();
        let sender = Arc::new(FramedTransport::new(channel.clone()));
        let receiver = Arc::new(FramedTransport::new(MockFrameChannel::new()));

        let original = big_message();
        sender.send(&original).await;
        let mut frames = channel.sent();
        frames.reverse();

        let mut decoded = None;
        for frame in &frames {
            decoded = receiver.accept_frame(frame);
        }
        assert_eq!(decoded, Some(original));
    }

    #[tokio::test(start_paused = true)]
    async fn backpressure_holds_frames_until_low_water() {
        let channel = MockFrameChannel::new();
        let transport = Arc::new(FramedTransport::new(channel.clone()));

        channel.set_buffered(HIGH_WATER);
        transport
            .send(&ProtocolMessage::Ping { timestamp_ms: 1 })
            .await;
        transport
            .send(&ProtocolMessage::Pong { timestamp_ms: 2 })
            .await;
        assert!(channel.sent().is_empty(), "nothing may reach the wire yet");
        assert_eq!(transport.queued_frames(), 2);

        // Still above the low-water mark: the drain must keep waiting.
        channel.set_buffered(LOW_WATER);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(channel.sent().is_empty());

        channel.set_buffered(LOW_WATER - 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let sent = channel.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains("\"type\":\"ping\""), "FIFO order preserved");
        assert!(sent[1].contains("\"type\":\"pong\""));
        assert_eq!(transport.queued_frames(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sends_after_queueing_keep_fifo_order() {
        let channel = MockFrameChannel::new();
        let transport = Arc::new(FramedTransport::new(channel.clone()));

        channel.set_buffered(HIGH_WATER);
        transport
            .send(&ProtocolMessage::Ping { timestamp_ms: 1 })
            .await;
        channel.set_buffered(0);
        // Queue is non-empty, so this must line up behind the first frame.
        transport
            .send(&ProtocolMessage::Pong { timestamp_ms: 2 })
            .await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        let sent = channel.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains("\"type\":\"ping\""));
        assert!(sent[1].contains("\"type\":\"pong\""));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_reassembly_is_evicted() {
        let receiver = Arc::new(FramedTransport::new(MockFrameChannel::new()));
        assert!(
            receiver
                .accept_frame(
                    "{\"type\":\"__chunked\",\"id\":\"a\",\"index\":0,\"total\":2,\"data\":\"x\"}"
                )
                .is_none()
        );
        assert_eq!(receiver.pending_reassemblies(), 1);

        tokio::time::sleep(REASSEMBLY_TTL + Duration::from_secs(1)).await;
        // An unrelated chunk triggers the opportunistic sweep.
        assert!(
            receiver
                .accept_frame(
                    "{\"type\":\"__chunked\",\"id\":\"b\",\"index\":0,\"total\":2,\"data\":\"y\"}"
                )
                .is_none()
        );
        assert_eq!(receiver.pending_reassemblies(), 1);
    }

    #[test]
    fn split_utf8_respects_char_boundaries() {
        let text = "é".repeat(10); // two bytes per char
        let pieces = split_utf8(&text, 3);
        assert!(pieces.iter().all(|piece| piece.len() <= 3));
        assert_eq!(pieces.concat(), text);
    }
}

//! Decides what a store change turns into on the wire: a full snapshot, an
//! incremental delta anchored at the per-thread watermark, or a throttled
//! stream chunk. Conversion happens in bounded batches with a cooperative
//! yield between them so a long history never monopolizes the executor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::{MessageRole, ProtocolMessage, RemoteChatMessage, RemoteStreamState};
use crate::store::{SessionStore, StoredMessage, StreamSnapshot, ThreadId};

/// At most one `chat_stream_chunk` per window; changes inside the window
/// coalesce into exactly one trailing update.
pub const STREAM_THROTTLE: Duration = Duration::from_millis(150);
const CONVERT_BATCH: usize = 100;

/// What the coordinator should do after a store change.
#[derive(Debug)]
pub enum SyncOutcome {
    /// Broadcast this message now.
    Broadcast(ProtocolMessage),
    /// A stream update is throttled; flush once `delay` has elapsed.
    ScheduleFlush { delay: Duration },
    Idle,
}

pub struct StateSynchronizer {
    store: Arc<dyn SessionStore>,
    /// Messages already synchronized to peers, per thread.
    watermarks: HashMap<ThreadId, usize>,
    /// Messages applied from the remote side, per thread (observer role).
    applied: HashMap<ThreadId, usize>,
    last_stream_chunk: Option<Instant>,
    flush_pending: bool,
}

impl StateSynchronizer {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            watermarks: HashMap::new(),
            applied: HashMap::new(),
            last_stream_chunk: None,
            flush_pending: false,
        }
    }

    /// React to a change notification for `thread`.
    pub async fn on_change(&mut self, thread: &str) -> SyncOutcome {
        let messages = self.store.messages(thread).await;
        let total = messages.len();
        let watermark = self.watermarks.get(thread).copied().unwrap_or(0);

        if total > watermark {
            let new_messages = convert_batched(&messages[watermark..]).await;
            self.watermarks.insert(thread.to_string(), total);
            let stream_state = to_remote_stream(&self.store.stream_state(thread).await);
            return SyncOutcome::Broadcast(ProtocolMessage::ChatStateDelta {
                thread_id: thread.to_string(),
                new_messages,
                stream_state,
                from_index: watermark,
            });
        }

        let snapshot = self.store.stream_state(thread).await;
        if !snapshot.is_running {
            return SyncOutcome::Idle;
        }

        let now = Instant::now();
        match self.last_stream_chunk {
            Some(last) if now.duration_since(last) < STREAM_THROTTLE => {
                if self.flush_pending {
                    return SyncOutcome::Idle;
                }
                self.flush_pending = true;
                SyncOutcome::ScheduleFlush {
                    delay: STREAM_THROTTLE - now.duration_since(last),
                }
            }
            _ => {
                self.last_stream_chunk = Some(now);
                SyncOutcome::Broadcast(ProtocolMessage::ChatStreamChunk {
                    thread_id: thread.to_string(),
                    stream_state: to_remote_stream(&snapshot),
                })
            }
        }
    }

    /// The trailing update at the end of a throttle window. Sent even if the
    /// generation just stopped so peers see the final partial state.
    pub async fn flush_stream(&mut self, thread: &str) -> Option<ProtocolMessage> {
        if !self.flush_pending {
            return None;
        }
        self.flush_pending = false;
        self.last_stream_chunk = Some(Instant::now());
        let snapshot = self.store.stream_state(thread).await;
        Some(ProtocolMessage::ChatStreamChunk {
            thread_id: thread.to_string(),
            stream_state: to_remote_stream(&snapshot),
        })
    }

    /// Whole-thread snapshot, used on first contact and thread switches.
    /// Advances the watermark to the full message count.
    pub async fn full_state(&mut self, thread: &str) -> ProtocolMessage {
        let messages = self.store.messages(thread).await;
        let total = messages.len();
        let converted = convert_batched(&messages).await;
        self.watermarks.insert(thread.to_string(), total);
        let stream_state = to_remote_stream(&self.store.stream_state(thread).await);
        ProtocolMessage::ChatStateFull {
            thread_id: thread.to_string(),
            messages: converted,
            stream_state,
            total_messages: total,
        }
    }

    pub fn watermark(&self, thread: &str) -> usize {
        self.watermarks.get(thread).copied().unwrap_or(0)
    }

    /// Observer side: a full state replaces whatever we had.
    pub fn apply_full(&mut self, thread: &str, total: usize) -> usize {
        self.applied.insert(thread.to_string(), total);
        total
    }

    /// Observer side: account for a delta. A gap means the sender and this
    /// side disagree; adopt the sender's anchor rather than guessing.
    pub fn apply_delta(&mut self, thread: &str, from_index: usize, count: usize) -> usize {
        let applied = self.applied.entry(thread.to_string()).or_insert(0);
        if from_index != *applied {
            tracing::warn!(
                target = "tandem::sync",
                thread,
                expected = *applied,
                from_index,
                "delta anchor mismatch; adopting sender count"
            );
        }
        *applied = from_index + count;
        *applied
    }

    pub fn applied_count(&self, thread: &str) -> usize {
        self.applied.get(thread).copied().unwrap_or(0)
    }
}

async fn convert_batched(messages: &[StoredMessage]) -> Vec<RemoteChatMessage> {
    let mut out = Vec::with_capacity(messages.len());
    for batch in messages.chunks(CONVERT_BATCH) {
        out.extend(batch.iter().map(convert_message));
        tokio::task::yield_now().await;
    }
    out
}

/// Total projection: anything the mapping cannot make sense of becomes a
/// placeholder instead of an error.
pub fn convert_message(message: &StoredMessage) -> RemoteChatMessage {
    try_convert(message).unwrap_or_else(placeholder)
}

fn try_convert(message: &StoredMessage) -> Option<RemoteChatMessage> {
    let role = match message.role.as_str() {
        "user" => MessageRole::User,
        "assistant" => MessageRole::Assistant,
        "tool" => MessageRole::Tool,
        _ => return None,
    };
    let content = match &message.content {
        serde_json::Value::String(text) => text.clone(),
        serde_json::Value::Null => return None,
        structured => serde_json::to_string(structured).ok()?,
    };
    Some(RemoteChatMessage {
        role,
        content,
        display_content: message.display_content.clone(),
        reasoning: message.reasoning.clone(),
        tool_name: message.tool_name.clone(),
        is_remote: false,
    })
}

fn placeholder() -> RemoteChatMessage {
    RemoteChatMessage {
        role: MessageRole::Assistant,
        content: "[message unavailable]".to_string(),
        display_content: None,
        reasoning: None,
        tool_name: None,
        is_remote: false,
    }
}

pub fn to_remote_stream(snapshot: &StreamSnapshot) -> RemoteStreamState {
    RemoteStreamState {
        is_running: snapshot.is_running,
        partial_text: snapshot.partial_text.clone(),
        partial_reasoning: snapshot.partial_reasoning.clone(),
        active_tool_name: snapshot.active_tool_name.clone(),
        active_tool_content: snapshot.active_tool_content.clone(),
        error: snapshot.error.clone(),
    }
}

//! Boundary to the external conversational store whose contents get
//! mirrored. The link layer only ever reads thread state and stream
//! snapshots; its sole mutations are submitting a remote user turn and
//! requesting cancellation of a running generation.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

pub type ThreadId = String;

/// A message as the external store represents it. Deliberately loose:
/// the role is free-form and the content may be structured, so the
/// sanitizing projection in [`crate::sync`] is a real boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub role: String,
    pub content: Value,
    pub display_content: Option<String>,
    pub reasoning: Option<String>,
    pub tool_name: Option<String>,
}

impl StoredMessage {
    pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Value::String(content.into()),
            display_content: None,
            reasoning: None,
            tool_name: None,
        }
    }
}

/// Point-in-time generation snapshot, rebuilt on every read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSnapshot {
    pub is_running: bool,
    pub partial_text: String,
    pub partial_reasoning: String,
    pub active_tool_name: Option<String>,
    pub active_tool_content: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// The message list or stream state of a thread changed.
    ThreadChanged(ThreadId),
    /// The current thread itself changed.
    ThreadSwitched(ThreadId),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store rejected command: {0}")]
    Rejected(String),
    #[error("unknown thread {0}")]
    UnknownThread(ThreadId),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn current_thread_id(&self) -> ThreadId;

    /// Full ordered message list for a thread. Unknown threads read as empty.
    async fn messages(&self, thread: &str) -> Vec<StoredMessage>;

    async fn stream_state(&self, thread: &str) -> StreamSnapshot;

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;

    /// Submit remotely-issued text as a new user turn.
    async fn submit_user_turn(&self, text: &str) -> Result<(), StoreError>;

    /// Ask a running generation to stop. Cooperative: the store may take a
    /// while to settle, callers bound their own wait.
    async fn request_cancellation(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    struct Inner {
        current_thread: ThreadId,
        threads: HashMap<ThreadId, Vec<StoredMessage>>,
        stream: StreamSnapshot,
        submitted: Vec<String>,
        cancel_requests: usize,
        submit_delay: Duration,
        fail_submissions: bool,
    }

    /// In-memory store used by synchronizer and coordinator tests.
    pub(crate) struct MemoryStore {
        inner: Mutex<Inner>,
        events: broadcast::Sender<StoreEvent>,
    }

    impl MemoryStore {
        pub(crate) fn new(current_thread: &str) -> Self {
            let (events, _) = broadcast::channel(64);
            Self {
                inner: Mutex::new(Inner {
                    current_thread: current_thread.to_string(),
                    threads: HashMap::new(),
                    stream: StreamSnapshot::default(),
                    submitted: Vec::new(),
                    cancel_requests: 0,
                    submit_delay: Duration::ZERO,
                    fail_submissions: false,
                }),
                events,
            }
        }

        pub(crate) fn push_message(&self, thread: &str, message: StoredMessage) {
            self.inner
                .lock()
                .unwrap()
                .threads
                .entry(thread.to_string())
                .or_default()
                .push(message);
            let _ = self.events.send(StoreEvent::ThreadChanged(thread.to_string()));
        }

        pub(crate) fn set_stream(&self, stream: StreamSnapshot) {
            let thread = {
                let mut inner = self.inner.lock().unwrap();
                inner.stream = stream;
                inner.current_thread.clone()
            };
            let _ = self.events.send(StoreEvent::ThreadChanged(thread));
        }

        pub(crate) fn switch_thread(&self, thread: &str) {
            self.inner.lock().unwrap().current_thread = thread.to_string();
            let _ = self
                .events
                .send(StoreEvent::ThreadSwitched(thread.to_string()));
        }

        pub(crate) fn set_submit_delay(&self, delay: Duration) {
            self.inner.lock().unwrap().submit_delay = delay;
        }

        pub(crate) fn fail_submissions(&self) {
            self.inner.lock().unwrap().fail_submissions = true;
        }

        pub(crate) fn submitted(&self) -> Vec<String> {
            self.inner.lock().unwrap().submitted.clone()
        }

        pub(crate) fn cancel_requests(&self) -> usize {
            self.inner.lock().unwrap().cancel_requests
        }
    }

    #[async_trait]
    impl SessionStore for MemoryStore {
        async fn current_thread_id(&self) -> ThreadId {
            self.inner.lock().unwrap().current_thread.clone()
        }

        async fn messages(&self, thread: &str) -> Vec<StoredMessage> {
            self.inner
                .lock()
                .unwrap()
                .threads
                .get(thread)
                .cloned()
                .unwrap_or_default()
        }

        async fn stream_state(&self, _thread: &str) -> StreamSnapshot {
            self.inner.lock().unwrap().stream.clone()
        }

        fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
            self.events.subscribe()
        }

        async fn submit_user_turn(&self, text: &str) -> Result<(), StoreError> {
            let (delay, fail) = {
                let inner = self.inner.lock().unwrap();
                (inner.submit_delay, inner.fail_submissions)
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if fail {
                return Err(StoreError::Rejected("submission disabled".into()));
            }
            let mut inner = self.inner.lock().unwrap();
            inner.submitted.push(text.to_string());
            let thread = inner.current_thread.clone();
            inner
                .threads
                .entry(thread.clone())
                .or_default()
                .push(StoredMessage::text("user", text));
            drop(inner);
            let _ = self.events.send(StoreEvent::ThreadChanged(thread));
            Ok(())
        }

        async fn request_cancellation(&self) -> Result<(), StoreError> {
            let mut inner = self.inner.lock().unwrap();
            inner.cancel_requests += 1;
            inner.stream.is_running = false;
            Ok(())
        }
    }
}

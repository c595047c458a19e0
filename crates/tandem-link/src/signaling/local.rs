//! Same-process fallback signaling: a broadcast bus keyed by device code.
//!
//! Only activated when the relay reports a terminal error. Both sides of a
//! negotiation must sit on the same bus; the process-wide default bus covers
//! the host/companion-in-one-process case, tests inject their own.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc};

use super::{SignalingChannel, SignalingError, SignalingEvent, SignalingMessage};
use crate::identity::DeviceCode;

const TOPIC_CAPACITY: usize = 64;

static DEFAULT_BUS: Lazy<Arc<SignalBus>> = Lazy::new(|| Arc::new(SignalBus::new()));

/// In-memory bus with one broadcast topic per device code.
#[derive(Debug, Default)]
pub struct SignalBus {
    topics: RwLock<HashMap<String, broadcast::Sender<SignalingMessage>>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, code: &DeviceCode) -> broadcast::Sender<SignalingMessage> {
        let mut guard = self.topics.write();
        guard
            .entry(code.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    pub fn subscribe(&self, code: &DeviceCode) -> broadcast::Receiver<SignalingMessage> {
        self.sender_for(code).subscribe()
    }

    pub fn publish(&self, message: SignalingMessage) -> usize {
        self.sender_for(&message.to).send(message).unwrap_or(0)
    }
}

pub struct LocalSignaling {
    bus: Arc<SignalBus>,
    local: DeviceCode,
    events_tx: mpsc::UnboundedSender<SignalingEvent>,
    events_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<SignalingEvent>>>,
    task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl LocalSignaling {
    /// Channel on the process-wide default bus.
    pub fn shared(local: DeviceCode) -> Self {
        Self::with_bus(Arc::clone(&DEFAULT_BUS), local)
    }

    pub fn with_bus(bus: Arc<SignalBus>, local: DeviceCode) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            bus,
            local,
            events_tx,
            events_rx: AsyncMutex::new(Some(events_rx)),
            task: StdMutex::new(None),
        }
    }
}

#[async_trait]
impl SignalingChannel for LocalSignaling {
    async fn connect(&self) -> Result<(), SignalingError> {
        let mut rx = self.bus.subscribe(&self.local);
        let events_tx = self.events_tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        if events_tx.send(SignalingEvent::Message(message)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            target = "tandem::signaling",
                            skipped,
                            "local signaling lagged, dropped messages"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.task.lock().unwrap() = Some(handle);
        let _ = self.events_tx.send(SignalingEvent::Connected);
        Ok(())
    }

    async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        let delivered = self.bus.publish(message);
        if delivered == 0 {
            tracing::debug!(
                target = "tandem::signaling",
                "local signal had no listener; dropping"
            );
        }
        Ok(())
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

impl Drop for LocalSignaling {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::SignalKind;

    fn message(from: &DeviceCode, to: &DeviceCode) -> SignalingMessage {
        SignalingMessage {
            from: from.clone(),
            to: to.clone(),
            kind: SignalKind::Offer,
            data: serde_json::json!({"sdp": "v=0"}),
        }
    }

    #[tokio::test]
    async fn routes_between_two_channels_on_one_bus() {
        let bus = Arc::new(SignalBus::new());
        let code_a: DeviceCode = "11111111".parse().unwrap();
        let code_b: DeviceCode = "22222222".parse().unwrap();
        let a = LocalSignaling::with_bus(Arc::clone(&bus), code_a.clone());
        let b = LocalSignaling::with_bus(Arc::clone(&bus), code_b.clone());
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        let mut b_events = b.events().await.unwrap();
        assert!(matches!(b_events.recv().await, Some(SignalingEvent::Connected)));

        a.send(message(&code_a, &code_b)).await.unwrap();
        match b_events.recv().await {
            Some(SignalingEvent::Message(received)) => {
                assert_eq!(received.from, code_a);
                assert_eq!(received.kind, SignalKind::Offer);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_without_listener_is_best_effort() {
        let bus = Arc::new(SignalBus::new());
        let code_a: DeviceCode = "11111111".parse().unwrap();
        let code_b: DeviceCode = "22222222".parse().unwrap();
        let a = LocalSignaling::with_bus(bus, code_a.clone());
        a.connect().await.unwrap();
        assert!(a.send(message(&code_a, &code_b)).await.is_ok());
    }

    #[tokio::test]
    async fn event_stream_is_take_once() {
        let bus = Arc::new(SignalBus::new());
        let code: DeviceCode = "33333333".parse().unwrap();
        let channel = LocalSignaling::with_bus(bus, code);
        channel.connect().await.unwrap();
        assert!(channel.events().await.is_ok());
        assert!(matches!(
            channel.events().await,
            Err(SignalingError::EventsTaken)
        ));
    }
}

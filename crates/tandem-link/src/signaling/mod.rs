//! Out-of-band delivery of connection-setup messages between device codes.
//!
//! Two implementations share the same message shape so the peer layer never
//! cares which one carried a signal: [`relay::RelaySignaling`] talks to the
//! rendezvous server, [`local::LocalSignaling`] is the same-process fallback
//! used when the relay is unreachable.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::LinkConfig;
use crate::identity::DeviceCode;

pub mod local;
pub mod relay;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// Transient routing envelope for one negotiation step. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    pub from: DeviceCode,
    pub to: DeviceCode,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub data: Value,
}

#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// The channel finished registering the local device code.
    Connected,
    Message(SignalingMessage),
    PeerOnline(DeviceCode),
    PeerOffline(DeviceCode),
    /// Terminal failure: reconnect attempts exhausted or the channel is
    /// otherwise unusable. Callers switch to the fallback on this.
    Error(String),
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling connect timed out")]
    ConnectTimeout,
    #[error("signaling transport error: {0}")]
    Transport(String),
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error("event stream already taken")]
    EventsTaken,
    #[error("invalid signaling url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Register the local device code. Resolves once the channel is ready to
    /// route; a 10 s timeout on the relay implementation rejects instead.
    async fn connect(&self) -> Result<(), SignalingError>;

    /// Route one message to `message.to`. Best-effort: an offline target is
    /// not an error the caller can act on beyond its own negotiation timeout.
    async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError>;

    /// Take the inbound event stream. May be called once.
    async fn events(&self) -> Result<mpsc::UnboundedReceiver<SignalingEvent>, SignalingError>;

    fn local_code(&self) -> &DeviceCode;
}

/// Connect to the configured relay, falling back to the in-process channel
/// when the relay rejects or times out.
pub async fn connect_with_fallback(
    config: &LinkConfig,
    code: &DeviceCode,
) -> Result<
    (
        Arc<dyn SignalingChannel>,
        mpsc::UnboundedReceiver<SignalingEvent>,
    ),
    SignalingError,
> {
    let relay = Arc::new(relay::RelaySignaling::new(
        &config.signaling_url,
        code.clone(),
        config.connect_timeout,
    )?);
    match relay.connect().await {
        Ok(()) => {
            let events = relay.events().await?;
            let channel: Arc<dyn SignalingChannel> = relay;
            Ok((channel, events))
        }
        Err(err) => {
            tracing::warn!(
                target = "tandem::signaling",
                error = %err,
                "relay unreachable, activating local fallback"
            );
            let fallback = Arc::new(local::LocalSignaling::shared(code.clone()));
            fallback.connect().await?;
            let events = fallback.events().await?;
            let channel: Arc<dyn SignalingChannel> = fallback;
            Ok((channel, events))
        }
    }
}

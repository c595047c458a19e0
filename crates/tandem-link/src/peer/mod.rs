//! Negotiation state machine for a single logical connection to one remote
//! device code.
//!
//! A torn-down connection is never reused; reconnection allocates a fresh
//! one. Signals go out through the signaling channel as they are produced,
//! and everything the remote side sends us after the channel opens surfaces
//! as [`PeerEvent`]s on one ordered queue.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::identity::DeviceCode;
use crate::protocol::ProtocolMessage;
use crate::signaling::{SignalKind, SignalingChannel, SignalingMessage};
use crate::transport::{FramedTransport, RtcFrameChannel};

const DATA_CHANNEL_LABEL: &str = "tandem";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Offering,
    Answering,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Offering => "offering",
            Self::Answering => "answering",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum PeerEvent {
    StateChanged {
        peer: DeviceCode,
        state: ConnectionState,
    },
    Frame {
        peer: DeviceCode,
        message: ProtocolMessage,
    },
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("invalid remote description: {0}")]
    InvalidDescription(String),
    #[error(transparent)]
    Signaling(#[from] crate::signaling::SignalingError),
}

pub struct Connection {
    local: DeviceCode,
    remote: DeviceCode,
    state: StdMutex<ConnectionState>,
    pc: Arc<RTCPeerConnection>,
    transport: StdMutex<Option<Arc<FramedTransport>>>,
    signaling: Arc<dyn SignalingChannel>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    destroyed: AtomicBool,
}

impl Connection {
    pub async fn new(
        local: DeviceCode,
        remote: DeviceCode,
        signaling: Arc<dyn SignalingChannel>,
        events_tx: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<Self>, PeerError> {
        let api = build_api()?;
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .map_err(negotiation)?,
        );

        let connection = Arc::new(Self {
            local,
            remote,
            state: StdMutex::new(ConnectionState::New),
            pc,
            transport: StdMutex::new(None),
            signaling,
            events_tx,
            destroyed: AtomicBool::new(false),
        });
        connection.install_hooks();
        Ok(connection)
    }

    fn install_hooks(self: &Arc<Self>) {
        // Candidates stream out as they are gathered; batching them would
        // slow connection setup.
        let signaling = Arc::clone(&self.signaling);
        let from = self.local.clone();
        let to = self.remote.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let signaling = Arc::clone(&signaling);
            let from = from.clone();
            let to = to.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(err) => {
                        tracing::warn!(
                            target = "tandem::peer",
                            error = %err,
                            "failed to serialize local candidate"
                        );
                        return;
                    }
                };
                let data = serde_json::to_value(&init).unwrap_or_default();
                let message = SignalingMessage {
                    from,
                    to,
                    kind: SignalKind::IceCandidate,
                    data,
                };
                if let Err(err) = signaling.send(message).await {
                    tracing::warn!(
                        target = "tandem::peer",
                        error = %err,
                        "candidate send error"
                    );
                }
            })
        }));

        let weak = Arc::downgrade(self);
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(connection) = weak.upgrade() else { return };
                    tracing::debug!(
                        target = "tandem::peer",
                        peer = %connection.remote,
                        ?state,
                        "peer connection state changed"
                    );
                    // `Connected` is reported by the data channel instead;
                    // only terminal transport states matter here.
                    match state {
                        RTCPeerConnectionState::Disconnected => {
                            connection.transition(ConnectionState::Disconnected);
                        }
                        RTCPeerConnectionState::Failed => {
                            connection.transition(ConnectionState::Failed);
                        }
                        RTCPeerConnectionState::Closed => {
                            connection.transition(ConnectionState::Closed);
                        }
                        _ => {}
                    }
                })
            }));
    }

    /// Initiator path: allocate the data channel, produce an offer, emit it
    /// via signaling.
    pub async fn create_offer(self: &Arc<Self>) -> Result<(), PeerError> {
        self.transition(ConnectionState::Offering);
        let result = self.offer_inner().await;
        if let Err(err) = &result {
            tracing::warn!(
                target = "tandem::peer",
                peer = %self.remote,
                error = %err,
                "offer failed"
            );
            self.transition(ConnectionState::Failed);
        }
        result
    }

    async fn offer_inner(self: &Arc<Self>) -> Result<(), PeerError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
            .await
            .map_err(negotiation)?;
        self.attach_data_channel(dc);

        let offer = self.pc.create_offer(None).await.map_err(negotiation)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(negotiation)?;
        let payload = json!({ "type": offer.sdp_type.to_string(), "sdp": offer.sdp });
        self.signaling
            .send(SignalingMessage {
                from: self.local.clone(),
                to: self.remote.clone(),
                kind: SignalKind::Offer,
                data: payload,
            })
            .await?;
        Ok(())
    }

    /// Responder path: accept a remote offer and answer it.
    pub async fn handle_offer(self: &Arc<Self>, data: &Value) -> Result<(), PeerError> {
        self.transition(ConnectionState::Answering);
        let result = self.answer_inner(data).await;
        if let Err(err) = &result {
            tracing::warn!(
                target = "tandem::peer",
                peer = %self.remote,
                error = %err,
                "answer failed"
            );
            self.transition(ConnectionState::Failed);
        }
        result
    }

    async fn answer_inner(self: &Arc<Self>, data: &Value) -> Result<(), PeerError> {
        let sdp = data
            .get("sdp")
            .and_then(Value::as_str)
            .ok_or_else(|| PeerError::InvalidDescription("offer missing sdp".into()))?;
        let desc = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|err| PeerError::InvalidDescription(err.to_string()))?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(negotiation)?;

        let weak = Arc::downgrade(self);
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(connection) = weak.upgrade() {
                        tracing::debug!(
                            target = "tandem::peer",
                            peer = %connection.remote,
                            label = dc.label(),
                            "received data channel"
                        );
                        connection.attach_data_channel(dc);
                    }
                })
            }));

        let answer = self.pc.create_answer(None).await.map_err(negotiation)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(negotiation)?;
        let payload = json!({ "type": answer.sdp_type.to_string(), "sdp": answer.sdp });
        self.signaling
            .send(SignalingMessage {
                from: self.local.clone(),
                to: self.remote.clone(),
                kind: SignalKind::Answer,
                data: payload,
            })
            .await?;
        Ok(())
    }

    pub async fn handle_answer(self: &Arc<Self>, data: &Value) -> Result<(), PeerError> {
        {
            let state = *self.state.lock().unwrap();
            if state != ConnectionState::Offering {
                tracing::debug!(
                    target = "tandem::peer",
                    peer = %self.remote,
                    %state,
                    "ignoring answer in current state"
                );
                return Ok(());
            }
        }
        let sdp = data
            .get("sdp")
            .and_then(Value::as_str)
            .ok_or_else(|| PeerError::InvalidDescription("answer missing sdp".into()))?;
        let desc = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|err| PeerError::InvalidDescription(err.to_string()))?;
        if let Err(err) = self.pc.set_remote_description(desc).await {
            self.transition(ConnectionState::Failed);
            return Err(negotiation(err));
        }
        Ok(())
    }

    /// Best-effort: late or malformed candidates are logged and dropped.
    pub async fn handle_ice_candidate(&self, data: &Value) {
        {
            let state = *self.state.lock().unwrap();
            if state == ConnectionState::Connected || state.is_terminal() {
                tracing::trace!(
                    target = "tandem::peer",
                    peer = %self.remote,
                    %state,
                    "ignoring late candidate"
                );
                return;
            }
        }
        match serde_json::from_value::<RTCIceCandidateInit>(data.clone()) {
            Ok(init) => {
                if let Err(err) = self.pc.add_ice_candidate(init).await {
                    tracing::warn!(
                        target = "tandem::peer",
                        peer = %self.remote,
                        error = %err,
                        "failed to add remote candidate"
                    );
                }
            }
            Err(err) => {
                tracing::warn!(
                    target = "tandem::peer",
                    peer = %self.remote,
                    error = %err,
                    "malformed remote candidate"
                );
            }
        }
    }

    fn attach_data_channel(self: &Arc<Self>, dc: Arc<RTCDataChannel>) {
        let transport = Arc::new(FramedTransport::new(Arc::new(RtcFrameChannel::new(
            dc.clone(),
        ))));
        *self.transport.lock().unwrap() = Some(Arc::clone(&transport));

        let weak = Arc::downgrade(self);
        dc.on_open(Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(connection) = weak.upgrade() {
                    tracing::debug!(
                        target = "tandem::peer",
                        peer = %connection.remote,
                        "data channel open"
                    );
                    connection.transition(ConnectionState::Connected);
                }
            })
        }));

        let events_tx = self.events_tx.clone();
        let remote = self.remote.clone();
        dc.on_message(Box::new(move |message: DataChannelMessage| {
            let events_tx = events_tx.clone();
            let remote = remote.clone();
            let transport = Arc::clone(&transport);
            Box::pin(async move {
                let text = match String::from_utf8(message.data.to_vec()) {
                    Ok(text) => text,
                    Err(_) => {
                        tracing::warn!(
                            target = "tandem::peer",
                            peer = %remote,
                            "dropping non-utf8 frame"
                        );
                        return;
                    }
                };
                if let Some(decoded) = transport.accept_frame(&text) {
                    let _ = events_tx.send(PeerEvent::Frame {
                        peer: remote.clone(),
                        message: decoded,
                    });
                }
            })
        }));

        let remote = self.remote.clone();
        dc.on_close(Box::new(move || {
            let remote = remote.clone();
            Box::pin(async move {
                tracing::debug!(target = "tandem::peer", peer = %remote, "data channel closed");
            })
        }));

        let remote = self.remote.clone();
        dc.on_error(Box::new(move |err| {
            let remote = remote.clone();
            Box::pin(async move {
                tracing::warn!(
                    target = "tandem::peer",
                    peer = %remote,
                    error = %err,
                    "data channel error"
                );
            })
        }));
    }

    fn transition(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap();
        if *state == next || state.is_terminal() {
            return;
        }
        tracing::debug!(
            target = "tandem::peer",
            peer = %self.remote,
            from = %*state,
            to = %next,
            "connection state change"
        );
        *state = next;
        drop(state);
        let _ = self.events_tx.send(PeerEvent::StateChanged {
            peer: self.remote.clone(),
            state: next,
        });
    }

    /// Tear down negotiation and transport resources. Safe to call any
    /// number of times; only the first call has effects.
    pub async fn destroy(&self, terminal: ConnectionState) {
        debug_assert!(terminal.is_terminal());
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(transport) = self.transport.lock().unwrap().take() {
            transport.clear();
        }
        self.transition(terminal);
        if let Err(err) = self.pc.close().await {
            tracing::debug!(
                target = "tandem::peer",
                peer = %self.remote,
                error = %err,
                "peer connection close error"
            );
        }
    }

    pub async fn send(&self, message: &ProtocolMessage) {
        match self.transport() {
            Some(transport) => transport.send(message).await,
            None => {
                tracing::debug!(
                    target = "tandem::peer",
                    peer = %self.remote,
                    "no transport yet; dropping outbound message"
                );
            }
        }
    }

    pub fn transport(&self) -> Option<Arc<FramedTransport>> {
        self.transport.lock().unwrap().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn remote(&self) -> &DeviceCode {
        &self.remote
    }
}

fn build_api() -> Result<API, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().map_err(negotiation)?;
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(negotiation)?;
    let mut setting = SettingEngine::default();
    setting.set_ice_timeouts(
        Some(Duration::from_secs(3)),
        Some(Duration::from_secs(10)),
        Some(Duration::from_millis(500)),
    );
    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn negotiation<E: fmt::Display>(err: E) -> PeerError {
    PeerError::Negotiation(err.to_string())
}

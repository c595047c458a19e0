//! The coordinator that owns everything stateful about one peer session:
//! the single-entry connection table, the peer list, heartbeats, the
//! ordered command lane, and the bridge between store changes and wire
//! messages.
//!
//! All shared state lives inside one event-loop task; callers talk to it
//! through control messages, so nothing here needs a lock.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::time::{interval, sleep, Instant};
use uuid::Uuid;

use crate::config::LinkConfig;
use crate::identity::{DeviceCode, DeviceIdentity};
use crate::peer::{Connection, ConnectionState, PeerError, PeerEvent};
use crate::protocol::{
    encode_message, CommandStatus, ProtocolMessage, RemoteChatMessage, RemoteStreamState,
};
use crate::signaling::{
    self, SignalKind, SignalingChannel, SignalingError, SignalingEvent, SignalingMessage,
};
use crate::store::{SessionStore, StoreEvent, ThreadId};
use crate::sync::{StateSynchronizer, SyncOutcome};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CANCEL_GRACE: Duration = Duration::from_millis(500);
const CANCEL_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Remote peer bookkeeping; exists only while its connection does.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub device_code: DeviceCode,
    pub device_name: String,
    pub connected_at: Instant,
}

#[derive(Debug)]
pub enum SessionEvent {
    StatusChanged(LinkStatus),
    PeerConnected {
        device_code: DeviceCode,
        device_name: String,
    },
    PeerDisconnected {
        device_code: DeviceCode,
        reason: String,
    },
    ConnectionFailed {
        device_code: DeviceCode,
        reason: String,
    },
    /// The signaling channel died for good (reconnects exhausted).
    SignalingLost {
        reason: String,
    },
    RemoteThreadSwitch {
        thread_id: ThreadId,
    },
    RemoteStateFull {
        thread_id: ThreadId,
        messages: Vec<RemoteChatMessage>,
        stream_state: RemoteStreamState,
        total_messages: usize,
    },
    RemoteStateDelta {
        thread_id: ThreadId,
        new_messages: Vec<RemoteChatMessage>,
        stream_state: RemoteStreamState,
        from_index: usize,
    },
    RemoteStreamChunk {
        thread_id: ThreadId,
        stream_state: RemoteStreamState,
    },
    CommandAck {
        command_id: String,
        status: CommandStatus,
        detail: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct LinkSnapshot {
    pub status: LinkStatus,
    pub peers: Vec<PeerInfo>,
    pub connections: Vec<(DeviceCode, ConnectionState)>,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot connect to our own device code")]
    SelfConnection,
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error("coordinator is not running")]
    NotRunning,
    #[error("event stream already taken")]
    EventsTaken,
}

enum Control {
    Connect(DeviceCode, oneshot::Sender<Result<(), SessionError>>),
    SetAccepting(bool),
    SendCommand(String, oneshot::Sender<String>),
    PushFullState(DeviceCode),
    AckOut(DeviceCode, ProtocolMessage),
    StreamFlushDue(ThreadId),
    HeartbeatTick,
    Snapshot(oneshot::Sender<LinkSnapshot>),
    Shutdown,
}

struct CommandJob {
    peer: DeviceCode,
    command_id: String,
    message: String,
}

pub struct SessionCoordinator {
    identity: DeviceIdentity,
    control_tx: mpsc::UnboundedSender<Control>,
    events_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    status_rx: watch::Receiver<LinkStatus>,
    tasks: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SessionCoordinator {
    /// Connect signaling (relay first, local fallback) and start the
    /// coordinator loop.
    pub async fn start(
        config: LinkConfig,
        identity: DeviceIdentity,
        store: Arc<dyn SessionStore>,
    ) -> Result<Self, SessionError> {
        let (channel, signaling_rx) =
            signaling::connect_with_fallback(&config, identity.device_code()).await?;
        Ok(Self::with_signaling(
            config,
            identity,
            store,
            channel,
            signaling_rx,
        ))
    }

    /// Start on an already-connected signaling channel.
    pub fn with_signaling(
        config: LinkConfig,
        identity: DeviceIdentity,
        store: Arc<dyn SessionStore>,
        channel: Arc<dyn SignalingChannel>,
        signaling_rx: mpsc::UnboundedReceiver<SignalingEvent>,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(LinkStatus::Disconnected);

        let (store_tx, store_rx) = mpsc::unbounded_channel();
        let mut store_events = store.subscribe();
        let forwarder = tokio::spawn(async move {
            loop {
                match store_events.recv().await {
                    Ok(event) => {
                        if store_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            target = "tandem::session",
                            skipped,
                            "store event stream lagged"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let worker = tokio::spawn(command_worker(
            command_rx,
            Arc::clone(&store),
            control_tx.clone(),
        ));

        let heartbeat = tokio::spawn({
            let control_tx = control_tx.clone();
            async move {
                let mut ticker = interval(HEARTBEAT_INTERVAL);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if control_tx.send(Control::HeartbeatTick).is_err() {
                        break;
                    }
                }
            }
        });

        let state = CoordinatorState {
            identity: identity.clone(),
            signaling: channel,
            store: Arc::clone(&store),
            sync: StateSynchronizer::new(store),
            connections: HashMap::new(),
            peers: HashMap::new(),
            accepting: config.accept_inbound,
            peer_events_tx,
            events_tx,
            status_tx,
            command_tx,
            control_tx: control_tx.clone(),
        };
        let main = tokio::spawn(run_loop(
            state,
            control_rx,
            signaling_rx,
            peer_events_rx,
            store_rx,
        ));

        Self {
            identity,
            control_tx,
            events_rx: AsyncMutex::new(Some(events_rx)),
            status_rx,
            tasks: StdMutex::new(vec![forwarder, worker, heartbeat, main]),
        }
    }

    pub fn device_code(&self) -> &DeviceCode {
        self.identity.device_code()
    }

    pub fn status(&self) -> LinkStatus {
        *self.status_rx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<LinkStatus> {
        self.status_rx.clone()
    }

    /// Take the UI-facing event stream. May be called once.
    pub async fn events(&self) -> Result<mpsc::UnboundedReceiver<SessionEvent>, SessionError> {
        self.events_rx
            .lock()
            .await
            .take()
            .ok_or(SessionError::EventsTaken)
    }

    /// Dial a remote device. Any existing connection is torn down first.
    pub async fn connect_to_device(&self, code: DeviceCode) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.control_tx
            .send(Control::Connect(code, tx))
            .map_err(|_| SessionError::NotRunning)?;
        rx.await.map_err(|_| SessionError::NotRunning)?
    }

    pub fn set_accepting(&self, accepting: bool) -> Result<(), SessionError> {
        self.control_tx
            .send(Control::SetAccepting(accepting))
            .map_err(|_| SessionError::NotRunning)
    }

    /// Companion side: push a command into the remote session. Returns the
    /// command id acks will reference.
    pub async fn send_command(&self, message: impl Into<String>) -> Result<String, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.control_tx
            .send(Control::SendCommand(message.into(), tx))
            .map_err(|_| SessionError::NotRunning)?;
        rx.await.map_err(|_| SessionError::NotRunning)
    }

    pub async fn snapshot(&self) -> Result<LinkSnapshot, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.control_tx
            .send(Control::Snapshot(tx))
            .map_err(|_| SessionError::NotRunning)?;
        rx.await.map_err(|_| SessionError::NotRunning)
    }

    pub fn shutdown(&self) {
        let _ = self.control_tx.send(Control::Shutdown);
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }
}

struct CoordinatorState {
    identity: DeviceIdentity,
    signaling: Arc<dyn SignalingChannel>,
    store: Arc<dyn SessionStore>,
    sync: StateSynchronizer,
    /// Invariant: at most one entry. Inserting requires tearing down every
    /// existing entry first.
    connections: HashMap<DeviceCode, Arc<Connection>>,
    peers: HashMap<DeviceCode, PeerInfo>,
    accepting: bool,
    peer_events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    status_tx: watch::Sender<LinkStatus>,
    command_tx: mpsc::UnboundedSender<CommandJob>,
    control_tx: mpsc::UnboundedSender<Control>,
}

async fn run_loop(
    mut state: CoordinatorState,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    mut signaling_rx: mpsc::UnboundedReceiver<SignalingEvent>,
    mut peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    mut store_rx: mpsc::UnboundedReceiver<StoreEvent>,
) {
    loop {
        tokio::select! {
            Some(control) = control_rx.recv() => {
                if state.handle_control(control).await {
                    break;
                }
            }
            Some(event) = signaling_rx.recv() => state.handle_signaling(event).await,
            Some(event) = peer_rx.recv() => state.handle_peer_event(event).await,
            Some(event) = store_rx.recv() => state.handle_store_event(event).await,
            else => break,
        }
    }
    state
        .teardown_all("Disconnected: coordinator shutting down")
        .await;
}

impl CoordinatorState {
    async fn handle_control(&mut self, control: Control) -> bool {
        match control {
            Control::Connect(code, reply) => {
                let result = self.connect(code).await;
                let _ = reply.send(result);
            }
            Control::SetAccepting(accepting) => {
                self.accepting = accepting;
            }
            Control::SendCommand(message, reply) => {
                let command_id = Uuid::new_v4().to_string();
                self.broadcast(ProtocolMessage::ChatCommand {
                    message,
                    command_id: command_id.clone(),
                })
                .await;
                let _ = reply.send(command_id);
            }
            Control::PushFullState(code) => {
                let thread = self.store.current_thread_id().await;
                let full = self.sync.full_state(&thread).await;
                if let Some(connection) = self.connections.get(&code) {
                    connection.send(&full).await;
                }
            }
            Control::AckOut(code, message) => {
                if let Some(connection) = self.connections.get(&code) {
                    connection.send(&message).await;
                }
            }
            Control::StreamFlushDue(thread) => {
                if let Some(chunk) = self.sync.flush_stream(&thread).await {
                    self.broadcast(chunk).await;
                }
            }
            Control::HeartbeatTick => {
                if !self.connections.is_empty() {
                    self.broadcast(ProtocolMessage::Ping {
                        timestamp_ms: now_ms(),
                    })
                    .await;
                }
            }
            Control::Snapshot(reply) => {
                let _ = reply.send(LinkSnapshot {
                    status: *self.status_tx.borrow(),
                    peers: self.peers.values().cloned().collect(),
                    connections: self
                        .connections
                        .iter()
                        .map(|(code, connection)| (code.clone(), connection.state()))
                        .collect(),
                });
            }
            Control::Shutdown => return true,
        }
        false
    }

    async fn connect(&mut self, code: DeviceCode) -> Result<(), SessionError> {
        if code == *self.identity.device_code() {
            return Err(SessionError::SelfConnection);
        }
        self.teardown_all("Disconnected: connecting to a new device")
            .await;

        let connection = Connection::new(
            self.identity.device_code().clone(),
            code.clone(),
            Arc::clone(&self.signaling),
            self.peer_events_tx.clone(),
        )
        .await?;
        self.connections.insert(code.clone(), Arc::clone(&connection));
        self.update_status();

        if let Err(err) = connection.create_offer().await {
            self.connections.remove(&code);
            connection.destroy(ConnectionState::Failed).await;
            self.update_status();
            let _ = self.events_tx.send(SessionEvent::ConnectionFailed {
                device_code: code,
                reason: err.to_string(),
            });
            return Err(err.into());
        }
        Ok(())
    }

    async fn handle_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected => {
                tracing::debug!(target = "tandem::session", "signaling channel ready");
            }
            SignalingEvent::Message(message) => self.handle_signal(message).await,
            SignalingEvent::PeerOnline(code) => {
                tracing::debug!(target = "tandem::session", device = %code, "device online");
            }
            SignalingEvent::PeerOffline(code) => {
                tracing::debug!(target = "tandem::session", device = %code, "device offline");
            }
            SignalingEvent::Error(reason) => {
                tracing::error!(
                    target = "tandem::session",
                    reason = %reason,
                    "signaling channel failed"
                );
                let _ = self.events_tx.send(SessionEvent::SignalingLost { reason });
            }
        }
    }

    async fn handle_signal(&mut self, message: SignalingMessage) {
        match message.kind {
            SignalKind::Offer => {
                if !self.accepting {
                    // No reply at all: the initiator times out instead of
                    // learning this device exists.
                    tracing::debug!(
                        target = "tandem::session",
                        from = %message.from,
                        "ignoring inbound offer while not accepting"
                    );
                    return;
                }
                self.teardown_all("Disconnected: a new device connected")
                    .await;
                let connection = match Connection::new(
                    self.identity.device_code().clone(),
                    message.from.clone(),
                    Arc::clone(&self.signaling),
                    self.peer_events_tx.clone(),
                )
                .await
                {
                    Ok(connection) => connection,
                    Err(err) => {
                        tracing::warn!(
                            target = "tandem::session",
                            from = %message.from,
                            error = %err,
                            "failed to allocate inbound connection"
                        );
                        return;
                    }
                };
                self.connections
                    .insert(message.from.clone(), Arc::clone(&connection));
                self.update_status();
                if let Err(err) = connection.handle_offer(&message.data).await {
                    tracing::warn!(
                        target = "tandem::session",
                        from = %message.from,
                        error = %err,
                        "inbound offer failed"
                    );
                    self.connections.remove(&message.from);
                    connection.destroy(ConnectionState::Failed).await;
                    self.update_status();
                }
            }
            SignalKind::Answer => match self.connections.get(&message.from) {
                Some(connection) => {
                    if let Err(err) = connection.handle_answer(&message.data).await {
                        tracing::warn!(
                            target = "tandem::session",
                            from = %message.from,
                            error = %err,
                            "answer handling failed"
                        );
                    }
                }
                None => {
                    tracing::debug!(
                        target = "tandem::session",
                        from = %message.from,
                        "answer for unknown connection"
                    );
                }
            },
            SignalKind::IceCandidate => {
                if let Some(connection) = self.connections.get(&message.from) {
                    connection.handle_ice_candidate(&message.data).await;
                }
            }
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::StateChanged { peer, state } => match state {
                ConnectionState::Connected => {
                    tracing::info!(
                        target = "tandem::session",
                        peer = %peer,
                        "peer link established"
                    );
                    self.update_status();
                    if let Some(connection) = self.connections.get(&peer) {
                        connection
                            .send(&ProtocolMessage::Handshake {
                                device_code: self.identity.device_code().to_string(),
                                device_name: self.identity.device_name.clone(),
                            })
                            .await;
                    }
                }
                state if state.is_terminal() => {
                    if let Some(connection) = self.connections.remove(&peer) {
                        connection.destroy(state).await;
                        if self.peers.remove(&peer).is_some() {
                            let _ = self.events_tx.send(SessionEvent::PeerDisconnected {
                                device_code: peer.clone(),
                                reason: state.to_string(),
                            });
                        }
                        self.update_status();
                    }
                }
                _ => self.update_status(),
            },
            PeerEvent::Frame { peer, message } => self.handle_frame(peer, message).await,
        }
    }

    async fn handle_frame(&mut self, peer: DeviceCode, message: ProtocolMessage) {
        match message {
            ProtocolMessage::Ping { timestamp_ms } => {
                if let Some(connection) = self.connections.get(&peer) {
                    connection
                        .send(&ProtocolMessage::Pong { timestamp_ms })
                        .await;
                }
            }
            ProtocolMessage::Pong { timestamp_ms } => {
                // Latency bookkeeping only; liveness always comes from
                // connection state, so a slow link never looks dead.
                let rtt = now_ms().saturating_sub(timestamp_ms);
                tracing::debug!(
                    target = "tandem::session",
                    peer = %peer,
                    rtt_ms = rtt,
                    "heartbeat pong"
                );
            }
            ProtocolMessage::Handshake {
                device_code,
                device_name,
            } => {
                self.record_peer(&peer, device_code, device_name);
                if let Some(connection) = self.connections.get(&peer) {
                    connection
                        .send(&ProtocolMessage::HandshakeAck {
                            device_code: self.identity.device_code().to_string(),
                            device_name: self.identity.device_name.clone(),
                        })
                        .await;
                }
                let _ = self.control_tx.send(Control::PushFullState(peer));
            }
            ProtocolMessage::HandshakeAck {
                device_code,
                device_name,
            } => {
                self.record_peer(&peer, device_code, device_name);
                let _ = self.control_tx.send(Control::PushFullState(peer));
            }
            ProtocolMessage::ChatThreadSwitch { thread_id } => {
                let _ = self
                    .events_tx
                    .send(SessionEvent::RemoteThreadSwitch { thread_id });
            }
            ProtocolMessage::ChatStateFull {
                thread_id,
                messages,
                stream_state,
                total_messages,
            } => {
                self.sync.apply_full(&thread_id, total_messages);
                let _ = self.events_tx.send(SessionEvent::RemoteStateFull {
                    thread_id,
                    messages,
                    stream_state,
                    total_messages,
                });
            }
            ProtocolMessage::ChatStateDelta {
                thread_id,
                new_messages,
                stream_state,
                from_index,
            } => {
                self.sync
                    .apply_delta(&thread_id, from_index, new_messages.len());
                let _ = self.events_tx.send(SessionEvent::RemoteStateDelta {
                    thread_id,
                    new_messages,
                    stream_state,
                    from_index,
                });
            }
            ProtocolMessage::ChatStreamChunk {
                thread_id,
                stream_state,
            } => {
                let _ = self.events_tx.send(SessionEvent::RemoteStreamChunk {
                    thread_id,
                    stream_state,
                });
            }
            ProtocolMessage::ChatCommand {
                message,
                command_id,
            } => {
                if let Some(connection) = self.connections.get(&peer) {
                    connection
                        .send(&command_ack(&command_id, CommandStatus::Received, None))
                        .await;
                }
                let _ = self.command_tx.send(CommandJob {
                    peer,
                    command_id,
                    message,
                });
            }
            ProtocolMessage::ChatCommandAck {
                command_id,
                status,
                detail,
            } => {
                let _ = self.events_tx.send(SessionEvent::CommandAck {
                    command_id,
                    status,
                    detail,
                });
            }
            ProtocolMessage::Disconnect { reason } => {
                if let Some(connection) = self.connections.remove(&peer) {
                    connection.destroy(ConnectionState::Disconnected).await;
                }
                if self.peers.remove(&peer).is_some() {
                    let _ = self.events_tx.send(SessionEvent::PeerDisconnected {
                        device_code: peer,
                        reason,
                    });
                }
                self.update_status();
            }
            ProtocolMessage::Chunked { .. } => {
                tracing::debug!(
                    target = "tandem::session",
                    peer = %peer,
                    "chunk envelope escaped the transport; dropping"
                );
            }
        }
    }

    async fn handle_store_event(&mut self, event: StoreEvent) {
        if self.connections.is_empty() {
            return;
        }
        match event {
            StoreEvent::ThreadChanged(thread) => match self.sync.on_change(&thread).await {
                SyncOutcome::Broadcast(message) => self.broadcast(message).await,
                SyncOutcome::ScheduleFlush { delay } => {
                    let control_tx = self.control_tx.clone();
                    tokio::spawn(async move {
                        sleep(delay).await;
                        let _ = control_tx.send(Control::StreamFlushDue(thread));
                    });
                }
                SyncOutcome::Idle => {}
            },
            StoreEvent::ThreadSwitched(thread) => {
                self.broadcast(ProtocolMessage::ChatThreadSwitch {
                    thread_id: thread.clone(),
                })
                .await;
                let full = self.sync.full_state(&thread).await;
                self.broadcast(full).await;
            }
        }
    }

    fn record_peer(&mut self, peer: &DeviceCode, device_code: String, device_name: String) {
        let code = device_code.parse().unwrap_or_else(|_| peer.clone());
        let info = PeerInfo {
            device_code: code,
            device_name: device_name.clone(),
            connected_at: Instant::now(),
        };
        if self.peers.insert(peer.clone(), info).is_none() {
            let _ = self.events_tx.send(SessionEvent::PeerConnected {
                device_code: peer.clone(),
                device_name,
            });
        }
    }

    /// Serialize once, hand the same encoded text to every peer transport.
    async fn broadcast(&self, message: ProtocolMessage) {
        if self.connections.is_empty() {
            return;
        }
        let encoded = match encode_message(&message) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(
                    target = "tandem::session",
                    error = %err,
                    "failed to encode broadcast"
                );
                return;
            }
        };
        for connection in self.connections.values() {
            if let Some(transport) = connection.transport() {
                transport.send_encoded(encoded.clone()).await;
            }
        }
    }

    async fn teardown_all(&mut self, reason: &str) {
        let drained: Vec<_> = self.connections.drain().collect();
        for (code, connection) in drained {
            connection
                .send(&ProtocolMessage::Disconnect {
                    reason: reason.to_string(),
                })
                .await;
            connection.destroy(ConnectionState::Closed).await;
            if self.peers.remove(&code).is_some() {
                let _ = self.events_tx.send(SessionEvent::PeerDisconnected {
                    device_code: code,
                    reason: reason.to_string(),
                });
            }
        }
        self.update_status();
    }

    fn update_status(&mut self) {
        let status = if self.connections.is_empty() {
            LinkStatus::Disconnected
        } else if self
            .connections
            .values()
            .any(|connection| connection.state() == ConnectionState::Connected)
        {
            LinkStatus::Connected
        } else {
            LinkStatus::Connecting
        };
        if *self.status_tx.borrow() != status {
            let _ = self.status_tx.send(status);
            let _ = self.events_tx.send(SessionEvent::StatusChanged(status));
        }
    }
}

/// Single-consumer lane: commands run strictly one after another even
/// though each is internally asynchronous.
async fn command_worker(
    mut jobs: mpsc::UnboundedReceiver<CommandJob>,
    store: Arc<dyn SessionStore>,
    control_tx: mpsc::UnboundedSender<Control>,
) {
    while let Some(job) = jobs.recv().await {
        let (acks_tx, mut acks_rx) = mpsc::unbounded_channel();
        let forward = tokio::spawn({
            let control_tx = control_tx.clone();
            let peer = job.peer.clone();
            async move {
                while let Some(ack) = acks_rx.recv().await {
                    if control_tx.send(Control::AckOut(peer.clone(), ack)).is_err() {
                        break;
                    }
                }
            }
        });
        run_command(&store, &job.command_id, &job.message, &acks_tx).await;
        drop(acks_tx);
        let _ = forward.await;
    }
}

/// Drive one remote command against the local session: cancel a running
/// generation (bounded grace), then submit the text as a new user turn.
async fn run_command(
    store: &Arc<dyn SessionStore>,
    command_id: &str,
    message: &str,
    acks: &mpsc::UnboundedSender<ProtocolMessage>,
) {
    let thread = store.current_thread_id().await;
    if store.stream_state(&thread).await.is_running {
        if let Err(err) = store.request_cancellation().await {
            tracing::warn!(
                target = "tandem::session",
                error = %err,
                "cancellation request failed"
            );
        }
        let deadline = Instant::now() + CANCEL_GRACE;
        while store.stream_state(&thread).await.is_running && Instant::now() < deadline {
            sleep(CANCEL_POLL).await;
        }
    }

    let _ = acks.send(command_ack(command_id, CommandStatus::Executing, None));
    match store.submit_user_turn(message).await {
        Ok(()) => {
            let _ = acks.send(command_ack(command_id, CommandStatus::Completed, None));
        }
        Err(err) => {
            let _ = acks.send(command_ack(
                command_id,
                CommandStatus::Error,
                Some(err.to_string()),
            ));
        }
    }
}

fn command_ack(command_id: &str, status: CommandStatus, detail: Option<String>) -> ProtocolMessage {
    ProtocolMessage::ChatCommandAck {
        command_id: command_id.to_string(),
        status,
        detail,
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

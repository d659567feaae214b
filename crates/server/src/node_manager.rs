//! Owns every live node-agent session: upgrade authentication, the
//! registration handshake, protocol-version negotiation, heartbeat
//! supervision, per-node inbound demultiplexing and outbound command
//! delivery.
//!
//! Grounded on the teacher's `session.rs` (`RwLock<HashMap<...>>` session
//! table, short critical sections, locks dropped before awaiting slow
//! operations) and `signaling.rs`'s `handle_agent_ws` (a single
//! `tokio::select!` loop driving one socket directly, no split sink/stream;
//! ping/pong keepalive folded into the same loop). Generalized from the
//! teacher's one-channel-per-connection shape to one dedicated outbound
//! `mpsc` per node session, fed by `send_command` from any task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use cnc_protocol::{CncCommand, NodeMessage, SessionTokenConfig, redact_json};
use serde_json::Value;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::auth::{self, Claims};
use crate::error::CoreError;
use crate::metrics::RuntimeMetrics;
use crate::stores::{HostAggregator, NodeStore};

/// Interval between WebSocket ping frames sent to a node.
const WS_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum time to wait for a pong before considering a node connection dead.
const WS_PONG_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Online,
    Offline,
}

/// Identifies the credential an upgrade request authenticated with.
#[derive(Debug, Clone)]
pub enum UpgradeAuthContext {
    StaticToken { token: String },
    SessionToken { node_id: String },
}

/// Emitted once a `command-result` message arrives on any session, for the
/// command router to consume. The one-subscriber typed channel standing in
/// for the source's in-process event emitter.
#[derive(Debug, Clone)]
pub struct CommandResultEvent {
    pub command_id: String,
    pub success: bool,
    pub error: Option<String>,
    pub correlation_id: Option<String>,
    pub host_ping: Option<cnc_protocol::HostPingResult>,
    pub host_port_scan: Option<Value>,
}

struct NodeSession {
    outbound: mpsc::UnboundedSender<Message>,
}

/// What the session loop should do after `handle_inbound_text` processes one
/// message. A second `Register` on a session that already completed the
/// handshake can't be handled inline, since `handle_inbound_text` doesn't
/// own the socket; it signals the loop to close instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InboundOutcome {
    Continue,
    CloseDuplicateRegistration,
}

pub struct NodeManagerConfig {
    pub heartbeat_interval: Duration,
    pub node_timeout: Duration,
    pub supported_protocol_versions: Vec<u32>,
    pub node_auth_tokens: Vec<String>,
    pub session_token: SessionTokenConfig,
}

pub struct NodeManager {
    sessions: RwLock<HashMap<String, NodeSession>>,
    node_store: Arc<dyn NodeStore>,
    host_aggregator: Arc<dyn HostAggregator>,
    metrics: Arc<RuntimeMetrics>,
    config: NodeManagerConfig,
    result_tx: broadcast::Sender<CommandResultEvent>,
    heartbeat_task: RwLock<Option<JoinHandle<()>>>,
}

impl NodeManager {
    pub fn new(node_store: Arc<dyn NodeStore>, host_aggregator: Arc<dyn HostAggregator>, metrics: Arc<RuntimeMetrics>, config: NodeManagerConfig) -> Arc<Self> {
        let (result_tx, _rx) = broadcast::channel(1024);
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            node_store,
            host_aggregator,
            metrics,
            config,
            result_tx,
            heartbeat_task: RwLock::new(None),
        })
    }

    /// Subscribe to `command-result` events. Intended for exactly one
    /// subscriber (the command router).
    pub fn subscribe_results(&self) -> broadcast::Receiver<CommandResultEvent> {
        self.result_tx.subscribe()
    }

    /// Validates a connection-upgrade request. A session token, if present,
    /// always wins over a static token.
    pub fn authenticate_upgrade(&self, static_token: Option<&str>, session_token: Option<&str>) -> Result<UpgradeAuthContext, CoreError> {
        if let Some(token) = session_token {
            let claims: Claims = auth::verify_session_token(token, &self.config.session_token).map_err(|_| CoreError::UpgradeUnauthorized)?;
            return Ok(UpgradeAuthContext::SessionToken { node_id: claims.sub });
        }
        if let Some(token) = static_token {
            if auth::check_static_node_token(token, &self.config.node_auth_tokens) {
                return Ok(UpgradeAuthContext::StaticToken { token: token.to_string() });
            }
        }
        Err(CoreError::UpgradeUnauthorized)
    }

    pub async fn get_node_status(&self, node_id: &str) -> NodeStatus {
        if self.sessions.read().await.contains_key(node_id) {
            NodeStatus::Online
        } else {
            NodeStatus::Offline
        }
    }

    /// Writes `command` to the node's dedicated outbound channel. The
    /// command is already a typed `CncCommand`, so the only way outbound
    /// validation can fail here is a serialization bug, not a bad input.
    pub async fn send_command(&self, node_id: &str, command: &CncCommand) -> Result<(), CoreError> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(node_id).ok_or_else(|| CoreError::NodeOffline(node_id.to_string()))?;

        let text = serde_json::to_string(command).map_err(|_| CoreError::InvalidOutboundCommand)?;

        session
            .outbound
            .send(Message::Text(Utf8Bytes::from(text)))
            .map_err(|_| CoreError::SendFailed(format!("node {node_id} writer task is gone")))
    }

    /// Drives a single accepted connection end to end: the registration
    /// handshake, then the inbound/outbound/ping select loop, until the
    /// transport closes or the node is kicked by shutdown.
    pub async fn run_session(self: Arc<Self>, mut socket: WebSocket, auth_context: UpgradeAuthContext) {
        let node_id = match self.handshake(&mut socket, &auth_context).await {
            Ok(node_id) => node_id,
            Err(reason) => {
                tracing::debug!(%reason, "session ended during registration handshake");
                return;
            }
        };

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&node_id) {
                tracing::warn!(%node_id, "replacing an existing live session for the same node id");
            }
            sessions.insert(node_id.clone(), NodeSession { outbound: outbound_tx });
        }
        self.node_store.upsert_registered(&node_id, SystemTime::now()).await;
        self.metrics.node_connected();
        tracing::info!(target: "audit", %node_id, "node registered");

        let mut ping_interval = interval(WS_PING_INTERVAL);
        ping_interval.tick().await;
        let mut last_pong = Instant::now();

        loop {
            tokio::select! {
                _ = ping_interval.tick() => {
                    if last_pong.elapsed() > WS_PONG_TIMEOUT {
                        tracing::debug!(%node_id, "ping timeout, closing session");
                        break;
                    }
                    if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                outgoing = outbound_rx.recv() => {
                    let Some(message) = outgoing else { break };
                    let is_close = matches!(message, Message::Close(_));
                    if socket.send(message).await.is_err() || is_close {
                        break;
                    }
                }
                incoming = socket.recv() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => match self.handle_inbound_text(&node_id, &text).await {
                            InboundOutcome::Continue => {}
                            InboundOutcome::CloseDuplicateRegistration => {
                                close_with(&mut socket, 4409, "Already registered").await;
                                break;
                            }
                        },
                        Some(Ok(Message::Pong(_))) => last_pong = Instant::now(),
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(_)) => break,
                    }
                }
            }
        }

        self.sessions.write().await.remove(&node_id);
        self.metrics.node_disconnected();
        self.host_aggregator.mark_node_hosts_unreachable(&node_id).await;
        tracing::info!(target: "audit", %node_id, "node session closed");
    }

    async fn handshake(&self, socket: &mut WebSocket, auth_context: &UpgradeAuthContext) -> Result<String, &'static str> {
        let raw = loop {
            match socket.recv().await {
                Some(Ok(Message::Text(text))) => break text,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Err("transport closed before registration"),
                Some(Ok(_)) => {
                    close_with(socket, 4401, "Registration required").await;
                    return Err("non-text message before registration");
                }
                Some(Err(_)) => return Err("transport error before registration"),
            }
        };

        let message: NodeMessage = match serde_json::from_str(&raw) {
            Ok(message) => message,
            Err(err) => {
                self.metrics.record_protocol_validation_failure("inbound:unknown").await;
                tracing::warn!(error = %err, "failed to parse registration message");
                close_with(socket, 4000, "Registration failed").await;
                return Err("unparseable registration message");
            }
        };

        let (node_id, auth_token, protocol_version) = match message {
            NodeMessage::Register { node_id, metadata, auth_token, .. } => (node_id, auth_token, metadata.protocol_version),
            _ => {
                close_with(socket, 4401, "Registration required").await;
                return Err("first message was not register");
            }
        };

        if let UpgradeAuthContext::SessionToken { node_id: bound_node_id } = auth_context {
            if *bound_node_id != node_id {
                close_with(socket, 4401, "Registration required").await;
                return Err("session token node id mismatch");
            }
        }

        if let UpgradeAuthContext::StaticToken { token } = auth_context {
            if let Some(presented) = &auth_token {
                if !auth::constant_time_eq(presented, token) {
                    close_with(socket, 4001, "Invalid auth").await;
                    return Err("legacy authToken mismatch");
                }
            }
        }

        if let Some(version) = protocol_version {
            if !self.config.supported_protocol_versions.contains(&version) {
                close_with(socket, 4406, "Unsupported protocol version").await;
                return Err("unsupported protocol version");
            }
        }

        if self.sessions.read().await.contains_key(&node_id) {
            close_with(socket, 4409, "Already registered").await;
            return Err("duplicate registration");
        }

        let heartbeat_interval_ms = self.config.heartbeat_interval.as_millis() as u64;
        let protocol_version = protocol_version.unwrap_or_else(|| *self.config.supported_protocol_versions.iter().max().unwrap_or(&1));
        let (session_token, session_expires_at) =
            auth::mint_session_token(&node_id, &self.config.session_token).map_err(|_| "failed to mint session token")?;

        let response = cnc_protocol::ServerMessage::Registered {
            node_id: node_id.clone(),
            heartbeat_interval: heartbeat_interval_ms,
            protocol_version,
            session_token,
            session_expires_at,
        };
        let payload = serde_json::to_string(&response).expect("ServerMessage always serializes");
        if socket.send(Message::Text(Utf8Bytes::from(payload))).await.is_err() {
            return Err("failed to send registered response");
        }

        Ok(node_id)
    }

    async fn handle_inbound_text(&self, node_id: &str, text: &str) -> InboundOutcome {
        let message: NodeMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(err) => {
                let raw_value: Value = serde_json::from_str(text).unwrap_or(Value::Null);
                self.metrics.record_protocol_validation_failure("inbound:unknown").await;
                tracing::warn!(error = %err, %node_id, payload = %redact_json(&raw_value), "inbound message failed schema validation");
                return InboundOutcome::Continue;
            }
        };

        match message {
            NodeMessage::Heartbeat {} => {
                self.node_store.mark_heartbeat(node_id, SystemTime::now()).await;
            }
            NodeMessage::HostDiscovered { .. } | NodeMessage::HostUpdated { .. } | NodeMessage::ScanComplete { .. } => {
                // Host-record content is owned by the external aggregator;
                // this manager's job ends at a correctly bound nodeId.
            }
            NodeMessage::HostRemoved { name } => {
                self.host_aggregator.on_host_removed(node_id, &name).await;
            }
            NodeMessage::CommandResult(result) => {
                let _ = self.result_tx.send(CommandResultEvent {
                    command_id: result.command_id,
                    success: result.success,
                    error: result.error,
                    correlation_id: result.correlation_id,
                    host_ping: result.host_ping,
                    host_port_scan: result.host_port_scan,
                });
            }
            NodeMessage::Register { .. } => {
                tracing::warn!(%node_id, "rejecting duplicate register on an already-registered session");
                return InboundOutcome::CloseDuplicateRegistration;
            }
        }
        InboundOutcome::Continue
    }

    /// Spawns the single heartbeat-supervision timer. Idempotent: calling
    /// twice replaces the previous task.
    pub async fn start_heartbeat_supervisor(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let tick_interval = self.config.heartbeat_interval;
        let node_timeout = self.config.node_timeout;
        let handle = tokio::spawn(async move {
            let mut ticker = interval(tick_interval);
            loop {
                ticker.tick().await;
                let newly_offline = manager.node_store.sweep_stale(node_timeout, SystemTime::now()).await;
                for node_id in newly_offline {
                    let is_live = manager.sessions.read().await.contains_key(&node_id);
                    if !is_live {
                        manager.host_aggregator.mark_node_hosts_unreachable(&node_id).await;
                    }
                }
            }
        });
        *self.heartbeat_task.write().await = Some(handle);
    }

    /// Closes every live session with close code `1000 "Server shutdown"`
    /// and stops the heartbeat supervisor.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.heartbeat_task.write().await.take() {
            handle.abort();
        }
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            let _ = session.outbound.send(Message::Close(Some(CloseFrame { code: 1000, reason: Utf8Bytes::from_static("Server shutdown") })));
        }
    }
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket.send(Message::Close(Some(CloseFrame { code, reason: Utf8Bytes::from_static(reason) }))).await;
}

#[cfg(test)]
impl NodeManager {
    /// Registers a live session for `node_id` without going through a real
    /// WebSocket upgrade, for router/router-router integration tests. Returns
    /// the receiving half of the session's outbound channel so a test can
    /// observe what was sent and simulate the node's side of the protocol.
    pub async fn insert_test_session(&self, node_id: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.write().await.insert(node_id.to_string(), NodeSession { outbound: tx });
        rx
    }

    /// Publishes a `command-result` event directly onto the broadcast
    /// channel, standing in for a node's `CommandResult` message arriving
    /// over the wire.
    pub fn emit_result_for_test(&self, event: CommandResultEvent) {
        let _ = self.result_tx.send(event);
    }
}

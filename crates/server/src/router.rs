//! Routes fleet-management operations (wake, ping, scan, host mutation) down
//! to the node that owns the target host, and turns the asynchronous
//! `command-result` event stream back into a single awaited outcome per
//! caller.
//!
//! Grounded on the teacher's `SignalingChannel` for the event-subscription
//! shape (a broadcast channel fanned into per-caller waiters) and on
//! `session.rs`'s short-critical-section locking discipline: the waiters
//! table is locked only long enough to insert or drain, never across an
//! await on the node or on the clock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cnc_protocol::{
    CncCommand, DeleteHostData, HostPingResult, PingHostData, ScanData, ScanHostPortsData, SleepHostData, ShutdownHostData, UpdateHostData,
    UpdateHostRequest, WakeData, build_fqn, parse_fqn,
};
use rand::Rng;
use serde_json::Value;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::CoreError;
use crate::metrics::RuntimeMetrics;
use crate::node_manager::{CommandResultEvent, NodeManager, NodeStatus};
use crate::stores::{CommandState, CommandStore, EnqueueRequest, HostAggregator, HostRecord};

pub struct CommandRouterConfig {
    pub command_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

/// Pre-typed resolution of a command's terminal state, independent of which
/// caller's waiter produced it. Every `route_*` method maps this into its
/// own response shape; `correlation_id` is the *calling* waiter's own
/// correlation id, not necessarily the one the node echoed back.
#[derive(Debug, Clone)]
struct RawOutcome {
    id: String,
    success: bool,
    error: Option<String>,
    timestamp: SystemTime,
    correlation_id: Option<String>,
    host_ping: Option<HostPingResult>,
    host_port_scan: Option<Value>,
}

/// The generic acknowledged/failed/timed-out shape, returned by every
/// `route_*` method that has no bespoke response shape of its own.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub id: String,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: SystemTime,
    pub correlation_id: Option<String>,
    pub host_port_scan: Option<Value>,
}

impl CommandOutcome {
    fn from_raw(raw: RawOutcome) -> Self {
        Self { id: raw.id, success: raw.success, error: raw.error, timestamp: raw.timestamp, correlation_id: raw.correlation_id, host_port_scan: raw.host_port_scan }
    }
}

/// `routeWake`'s bespoke response shape.
#[derive(Debug, Clone)]
pub struct WakeOutcome {
    pub success: bool,
    pub message: Option<String>,
    pub error: Option<String>,
    pub node_id: String,
    pub location: String,
    pub correlation_id: Option<String>,
}

/// `routePingHost`'s bespoke response shape. `success` here is the ping
/// result itself (host reachable), not whether the command round-tripped.
#[derive(Debug, Clone)]
pub struct PingOutcome {
    pub target: String,
    pub checked_at: u64,
    pub latency_ms: u64,
    pub success: bool,
    pub status: String,
    pub source: &'static str,
    pub correlation_id: Option<String>,
}

pub struct CommandRouter {
    node_manager: Arc<NodeManager>,
    command_store: Arc<dyn CommandStore>,
    host_aggregator: Arc<dyn HostAggregator>,
    metrics: Arc<RuntimeMetrics>,
    config: CommandRouterConfig,
    waiters: Mutex<HashMap<String, Vec<(oneshot::Sender<RawOutcome>, Option<String>)>>>,
}

impl CommandRouter {
    /// Builds the router and spawns the background task that drains
    /// `command-result` events from the node manager's broadcast channel.
    /// Returns the router and the listener task's handle so the caller can
    /// abort it during shutdown.
    pub fn new(
        node_manager: Arc<NodeManager>,
        command_store: Arc<dyn CommandStore>,
        host_aggregator: Arc<dyn HostAggregator>,
        metrics: Arc<RuntimeMetrics>,
        config: CommandRouterConfig,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let router = Arc::new(Self { node_manager, command_store, host_aggregator, metrics, config, waiters: Mutex::new(HashMap::new()) });

        let mut result_rx = router.node_manager.subscribe_results();
        let listener_router = Arc::clone(&router);
        let listener = tokio::spawn(async move {
            loop {
                match result_rx.recv().await {
                    Ok(event) => listener_router.handle_command_result(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "command router lagged behind the node manager's result stream");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        (router, listener)
    }

    /// Promotes any command left `sent` from a prior process lifetime to
    /// `timed_out`. Intended to run once at startup before any route method
    /// is called.
    pub async fn reconcile_stale_in_flight(&self) -> usize {
        self.command_store.reconcile_stale_in_flight(self.config.command_timeout).await
    }

    async fn resolve_host(&self, fqn_raw: &str) -> Result<HostRecord, CoreError> {
        let fqn = parse_fqn(fqn_raw).map_err(|_| CoreError::InvalidFqnFormat)?;
        let rebuilt = build_fqn(&fqn.hostname, &fqn.location);
        let host = self.host_aggregator.get_host_by_fqn(&rebuilt).await.ok_or(CoreError::HostNotFound)?;
        if self.node_manager.get_node_status(&host.node_id).await == NodeStatus::Offline {
            return Err(CoreError::NodeOffline(host.node_id.clone()));
        }
        Ok(host)
    }

    pub async fn route_wake(&self, fqn_raw: &str, idempotency_key: Option<String>, correlation_id: Option<String>) -> Result<WakeOutcome, CoreError> {
        let host = self.resolve_host(fqn_raw).await?;
        let location = parse_fqn(&host.fqn).map(|fqn| fqn.location).unwrap_or_default();
        let command_id = new_command_id();
        let command = CncCommand::Wake { command_id: command_id.clone(), data: WakeData { host_name: host.name.clone(), mac: host.mac.clone() } };
        let raw = self.execute_command(&host.node_id, command, "wake", idempotency_key, correlation_id).await?;

        Ok(WakeOutcome {
            success: raw.success,
            message: raw.success.then(|| format!("Wake-on-LAN packet sent to {}", host.fqn)),
            error: if raw.success { None } else { Some(raw.error.unwrap_or_else(|| "Command failed".to_string())) },
            node_id: host.node_id,
            location,
            correlation_id: raw.correlation_id,
        })
    }

    /// If the command round-trips successfully but carries no `hostPing`
    /// payload, the node violated its own contract; surfaced as
    /// `MalformedResult` rather than silently fabricating a ping result.
    pub async fn route_ping_host(&self, fqn_raw: &str, idempotency_key: Option<String>, correlation_id: Option<String>) -> Result<PingOutcome, CoreError> {
        let host = self.resolve_host(fqn_raw).await?;
        let command_id = new_command_id();
        let command = CncCommand::PingHost {
            command_id: command_id.clone(),
            data: PingHostData { host_name: host.name.clone(), mac: host.mac.clone(), ip: host.ip.clone() },
        };
        let raw = self.execute_command(&host.node_id, command, "ping-host", idempotency_key, correlation_id).await?;

        if raw.success {
            let host_ping = raw.host_ping.ok_or(CoreError::MalformedResult)?;
            Ok(PingOutcome {
                target: host.fqn,
                checked_at: host_ping.checked_at,
                latency_ms: host_ping.latency_ms,
                success: host_ping.reachable,
                status: host_ping.status,
                source: "node-agent",
                correlation_id: raw.correlation_id,
            })
        } else {
            Ok(PingOutcome {
                target: host.fqn,
                checked_at: system_time_to_unix_ms(raw.timestamp),
                latency_ms: 0,
                success: false,
                status: raw.error.unwrap_or_else(|| "ping command failed".to_string()),
                source: "node-agent",
                correlation_id: raw.correlation_id,
            })
        }
    }

    pub async fn route_scan(&self, node_id: &str, immediate: bool, idempotency_key: Option<String>, correlation_id: Option<String>) -> Result<CommandOutcome, CoreError> {
        if self.node_manager.get_node_status(node_id).await == NodeStatus::Offline {
            return Err(CoreError::NodeOffline(node_id.to_string()));
        }
        let command_id = new_command_id();
        let command = CncCommand::Scan { command_id: command_id.clone(), data: ScanData { immediate } };
        let raw = self.execute_command(node_id, command, "scan", idempotency_key, correlation_id).await?;
        Ok(CommandOutcome::from_raw(raw))
    }

    pub async fn route_scan_host_ports(
        &self,
        fqn_raw: &str,
        ports: Option<Vec<u16>>,
        timeout_ms: Option<u64>,
        idempotency_key: Option<String>,
        correlation_id: Option<String>,
    ) -> Result<CommandOutcome, CoreError> {
        let host = self.resolve_host(fqn_raw).await?;
        let command_id = new_command_id();
        let command = CncCommand::ScanHostPorts {
            command_id: command_id.clone(),
            data: ScanHostPortsData { host_name: host.name.clone(), mac: host.mac.clone(), ip: host.ip.clone(), ports, timeout_ms },
        };
        let raw = self.execute_command(&host.node_id, command, "scan-host-ports", idempotency_key, correlation_id).await?;
        Ok(CommandOutcome::from_raw(raw))
    }

    /// Merges `request` against the stored host using absent-inherits,
    /// null-clears, present-overwrites semantics before dispatching the
    /// fully-resolved update to the node.
    pub async fn route_update_host(
        &self,
        fqn_raw: &str,
        request: UpdateHostRequest,
        idempotency_key: Option<String>,
        correlation_id: Option<String>,
    ) -> Result<CommandOutcome, CoreError> {
        let host = self.resolve_host(fqn_raw).await?;

        let name = request.name.unwrap_or_else(|| host.name.clone());
        let mac = request.mac.unwrap_or_else(|| host.mac.clone());
        let ip = request.ip.unwrap_or_else(|| host.ip.clone());
        let status = request.status.unwrap_or_else(|| host.status.clone());
        let notes = match request.notes {
            Some(value) => value,
            None => host.notes.clone(),
        };
        let tags = match request.tags {
            Some(Some(value)) => Some(value),
            Some(None) => None,
            None => Some(host.tags.clone()),
        };

        let command_id = new_command_id();
        let command = CncCommand::UpdateHost {
            command_id: command_id.clone(),
            data: UpdateHostData { current_name: host.name.clone(), name, mac, ip, status, notes, tags },
        };
        let raw = self.execute_command(&host.node_id, command, "update-host", idempotency_key, correlation_id).await?;
        Ok(CommandOutcome::from_raw(raw))
    }

    pub async fn route_delete_host(&self, fqn_raw: &str, idempotency_key: Option<String>, correlation_id: Option<String>) -> Result<CommandOutcome, CoreError> {
        let host = self.resolve_host(fqn_raw).await?;
        let command_id = new_command_id();
        let command = CncCommand::DeleteHost { command_id: command_id.clone(), data: DeleteHostData { name: host.name.clone() } };
        let raw = self.execute_command(&host.node_id, command, "delete-host", idempotency_key, correlation_id).await?;
        let outcome = CommandOutcome::from_raw(raw);
        if outcome.success {
            self.host_aggregator.on_host_removed(&host.node_id, &host.name).await;
        }
        Ok(outcome)
    }

    pub async fn route_sleep_host(&self, fqn_raw: &str, idempotency_key: Option<String>, correlation_id: Option<String>) -> Result<CommandOutcome, CoreError> {
        let host = self.resolve_host(fqn_raw).await?;
        let command_id = new_command_id();
        let command = CncCommand::SleepHost { command_id: command_id.clone(), data: SleepHostData { host_name: host.name.clone() } };
        let raw = self.execute_command(&host.node_id, command, "sleep-host", idempotency_key, correlation_id).await?;
        Ok(CommandOutcome::from_raw(raw))
    }

    pub async fn route_shutdown_host(&self, fqn_raw: &str, idempotency_key: Option<String>, correlation_id: Option<String>) -> Result<CommandOutcome, CoreError> {
        let host = self.resolve_host(fqn_raw).await?;
        let command_id = new_command_id();
        let command = CncCommand::ShutdownHost { command_id: command_id.clone(), data: ShutdownHostData { host_name: host.name.clone() } };
        let raw = self.execute_command(&host.node_id, command, "shutdown-host", idempotency_key, correlation_id).await?;
        Ok(CommandOutcome::from_raw(raw))
    }

    /// Enqueues, dispatches once, and awaits a terminal result for
    /// `command`. Idempotency-key coalescing means two callers racing on
    /// the same key share one in-flight dispatch; each still gets its own
    /// `correlation_id` attached to the outcome it receives.
    async fn execute_command(
        &self,
        node_id: &str,
        command: CncCommand,
        command_type: &'static str,
        idempotency_key: Option<String>,
        correlation_id: Option<String>,
    ) -> Result<RawOutcome, CoreError> {
        let command_id = command.command_id().to_string();
        let scoped_key = idempotency_key.map(|key| format!("{command_type}:{}", collapse_whitespace(&key)));

        let payload = serde_json::to_value(&command).map_err(|_| CoreError::InvalidOutboundCommand)?;
        let record = self
            .command_store
            .enqueue(EnqueueRequest {
                id: command_id.clone(),
                node_id: node_id.to_string(),
                command_type: command_type.to_string(),
                payload,
                idempotency_key: scoped_key,
                correlation_id: correlation_id.clone(),
            })
            .await?;

        if record.state.is_terminal() {
            return Ok(RawOutcome {
                id: record.id.clone(),
                success: record.state == CommandState::Acknowledged,
                error: record.error.clone(),
                timestamp: record.completed_at.unwrap_or(record.updated_at),
                correlation_id,
                host_ping: None,
                host_port_scan: None,
            });
        }

        if record.id != command_id {
            // Coalesced onto an existing in-flight command: don't resend,
            // just wait on the same id's terminal result.
            return self.await_result(&record.id, correlation_id).await;
        }

        self.dispatch_and_await(node_id, &command, &record, command_type, correlation_id).await
    }

    /// Installs exactly one waiter, sends the command once and awaits its
    /// terminal result under exactly one `command_timeout` timer — the sole
    /// timeout source for a dispatch. Retries are a store-level concern:
    /// a `failed`/`timed_out` record may be re-enqueued with an incremented
    /// `retry_count`, which this function reads to decide whether to sleep
    /// a backoff delay before sending and which attempt number to report.
    async fn dispatch_and_await(
        &self,
        node_id: &str,
        command: &CncCommand,
        record: &crate::stores::CommandRecord,
        command_type: &'static str,
        correlation_id: Option<String>,
    ) -> Result<RawOutcome, CoreError> {
        let attempt = record.retry_count + 1;
        if record.retry_count > 0 {
            let delay = calculate_backoff_delay(self.config.retry_base_delay_ms, record.retry_count - 1, self.config.command_timeout);
            tokio::time::sleep(delay).await;
        }

        let waiter = self.install_waiter(&record.id, correlation_id.clone()).await;

        if let Err(err) = self.node_manager.send_command(node_id, command).await {
            self.fail_all_waiters(&record.id, err.to_string()).await;
            let _ = self.command_store.mark_failed(&record.id, &err.to_string()).await;
            self.metrics.record_command_result(&record.id, false, command_type).await;
            return Err(err);
        }

        let _ = self.command_store.mark_sent(&record.id).await;
        self.metrics.record_command_dispatched(&record.id, command_type, correlation_id).await;

        match tokio::time::timeout(self.config.command_timeout, waiter).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) | Err(_) => {
                let reason = format!("no result after attempt {attempt}");
                self.fail_all_waiters(&record.id, reason.clone()).await;
                let _ = self.command_store.mark_timed_out(&record.id, &reason).await;
                self.metrics.record_command_timeout(&record.id, command_type).await;
                Err(CoreError::Timeout {
                    command_id: record.id.clone(),
                    attempt,
                    max_retries: self.config.max_retries,
                    deadline_ms: self.config.command_timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn install_waiter(&self, command_id: &str, correlation_id: Option<String>) -> oneshot::Receiver<RawOutcome> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.entry(command_id.to_string()).or_default().push((tx, correlation_id));
        rx
    }

    /// Resolves every waiter registered for `command_id` — not just the one
    /// belonging to this dispatch attempt — with a synthetic failure
    /// outcome. A coalesced caller that joined via `await_result` shares this
    /// command id and must see the same terminal disposition rather than
    /// being silently dropped when the original dispatcher's send fails or
    /// its timeout elapses.
    async fn fail_all_waiters(&self, command_id: &str, error: String) {
        let Some(entries) = self.waiters.lock().await.remove(command_id) else { return };
        let timestamp = SystemTime::now();
        for (sender, correlation_id) in entries {
            let _ = sender.send(RawOutcome { id: command_id.to_string(), success: false, error: Some(error.clone()), timestamp, correlation_id, host_ping: None, host_port_scan: None });
        }
    }

    /// Used for coalesced callers that didn't install the original dispatch
    /// attempt's waiter: waits indefinitely on the command's terminal
    /// result, bounded only by the original dispatcher's own timeout path
    /// eventually resolving every waiter for this id.
    async fn await_result(&self, command_id: &str, correlation_id: Option<String>) -> Result<RawOutcome, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.entry(command_id.to_string()).or_default().push((tx, correlation_id));
        rx.await.map_err(|_| CoreError::CommandFailed("command result channel closed before a terminal outcome arrived".to_string()))
    }

    async fn handle_command_result(&self, event: CommandResultEvent) {
        let record = self.command_store.find_by_id(&event.command_id).await;
        let command_type = record.as_ref().map(|r| r.command_type.clone()).unwrap_or_else(|| "unknown".to_string());

        if event.success {
            let _ = self.command_store.mark_acknowledged(&event.command_id).await;
        } else {
            let _ = self.command_store.mark_failed(&event.command_id, event.error.as_deref().unwrap_or("command failed")).await;
        }
        self.metrics.record_command_result(&event.command_id, event.success, &command_type).await;

        let waiters = self.waiters.lock().await.remove(&event.command_id);
        match waiters {
            Some(entries) => {
                let timestamp = SystemTime::now();
                for (sender, correlation_id) in entries {
                    // Each waiter keeps its own caller's correlation id;
                    // fall back to the node-echoed one only if the caller
                    // didn't supply one.
                    let effective_correlation = correlation_id.or_else(|| event.correlation_id.clone());
                    let outcome = RawOutcome {
                        id: event.command_id.clone(),
                        success: event.success,
                        error: event.error.clone(),
                        timestamp,
                        correlation_id: effective_correlation,
                        host_ping: event.host_ping.clone(),
                        host_port_scan: event.host_port_scan.clone(),
                    };
                    let _ = sender.send(outcome);
                }
            }
            None => {
                let correlation_id = self.metrics.lookup_correlation_id(&event.command_id).await;
                tracing::debug!(command_id = %event.command_id, ?correlation_id, "command result arrived with no waiter registered");
            }
        }
    }
}

fn new_command_id() -> String {
    format!("cmd_{}", Uuid::new_v4())
}

fn collapse_whitespace(raw: &str) -> String {
    raw.trim().split_whitespace().collect::<Vec<_>>().join(" ")
}

fn system_time_to_unix_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// `clamp(base * 2^attempt * (1 +/- uniform(0, 0.25)), 0, commandTimeout / 2)`.
fn calculate_backoff_delay(base_delay_ms: u64, attempt: u32, command_timeout: Duration) -> Duration {
    let exponential = base_delay_ms as f64 * 2f64.powi(attempt as i32);
    let jitter = rand::thread_rng().gen_range(-0.25..=0.25);
    let jittered = exponential * (1.0 + jitter);
    let max_delay_ms = command_timeout.as_millis() as f64 / 2.0;
    let clamped = jittered.clamp(0.0, max_delay_ms);
    Duration::from_millis(clamped.round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RuntimeMetrics;
    use crate::node_manager::{NodeManagerConfig, NodeManager};
    use crate::stores::{InMemoryCommandStore, InMemoryHostAggregator, InMemoryNodeStore};
    use cnc_protocol::SessionTokenConfig;
    use tokio::sync::mpsc;

    fn router_config() -> CommandRouterConfig {
        CommandRouterConfig { command_timeout: Duration::from_millis(300), max_retries: 2, retry_base_delay_ms: 5 }
    }

    fn node_manager() -> Arc<NodeManager> {
        let config = NodeManagerConfig {
            heartbeat_interval: Duration::from_secs(30),
            node_timeout: Duration::from_secs(90),
            supported_protocol_versions: vec![1, 2],
            node_auth_tokens: vec!["static-token".to_string()],
            session_token: SessionTokenConfig { secrets: vec!["secret".to_string()], issuer: "cnc-control-plane".to_string(), audience: "cnc-node".to_string(), ttl_seconds: 3600 },
        };
        NodeManager::new(Arc::new(InMemoryNodeStore::new()), Arc::new(InMemoryHostAggregator::new()), Arc::new(RuntimeMetrics::new()), config)
    }

    async fn seeded_host(aggregator: &InMemoryHostAggregator, node_id: &str) -> HostRecord {
        let host = HostRecord {
            fqn: build_fqn("desk-pc", "Home"),
            node_id: node_id.to_string(),
            name: "desk-pc".to_string(),
            mac: "AA:BB:CC:DD:EE:FF".to_string(),
            ip: "10.0.0.5".to_string(),
            status: "online".to_string(),
            notes: None,
            tags: Vec::new(),
        };
        aggregator.seed(host.clone()).await;
        host
    }

    /// Reads a command off a test session's outbound channel, extracts the
    /// `commandId` an agent would echo back, and simulates an immediate
    /// successful acknowledgment.
    async fn auto_acknowledge(node_manager: Arc<NodeManager>, mut outbound: mpsc::UnboundedReceiver<axum::extract::ws::Message>) {
        tokio::spawn(async move {
            while let Some(axum::extract::ws::Message::Text(text)) = outbound.recv().await {
                let value: Value = serde_json::from_str(&text).unwrap();
                let command_id = value["commandId"].as_str().unwrap().to_string();
                node_manager.emit_result_for_test(CommandResultEvent {
                    command_id,
                    success: true,
                    error: None,
                    correlation_id: None,
                    host_ping: None,
                    host_port_scan: None,
                });
            }
        });
    }

    #[tokio::test]
    async fn wake_dispatches_and_resolves_on_acknowledgment() {
        let node_manager = node_manager();
        let host_aggregator = Arc::new(InMemoryHostAggregator::new());
        let host = seeded_host(&host_aggregator, "node-1").await;
        let outbound = node_manager.insert_test_session(&host.node_id).await;
        auto_acknowledge(Arc::clone(&node_manager), outbound).await;

        let (router, _listener) = CommandRouter::new(
            Arc::clone(&node_manager),
            Arc::new(InMemoryCommandStore::new()),
            host_aggregator,
            Arc::new(RuntimeMetrics::new()),
            router_config(),
        );

        let outcome = router.route_wake(&host.fqn, None, Some("corr-123".to_string())).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.node_id, "node-1");
        assert_eq!(outcome.location, "Home");
        assert_eq!(outcome.correlation_id, Some("corr-123".to_string()));
        assert_eq!(outcome.message.as_deref(), Some("Wake-on-LAN packet sent to desk-pc@Home"));
    }

    #[tokio::test]
    async fn wake_fails_fast_when_node_is_offline() {
        let node_manager = node_manager();
        let host_aggregator = Arc::new(InMemoryHostAggregator::new());
        let host = seeded_host(&host_aggregator, "node-1").await;
        // No test session inserted: node-1 is offline.

        let (router, _listener) =
            CommandRouter::new(node_manager, Arc::new(InMemoryCommandStore::new()), host_aggregator, Arc::new(RuntimeMetrics::new()), router_config());

        let result = router.route_wake(&host.fqn, None, None).await;
        assert!(matches!(result, Err(CoreError::NodeOffline(_))));
    }

    #[tokio::test]
    async fn ping_host_on_unknown_fqn_returns_host_not_found() {
        let node_manager = node_manager();
        let host_aggregator = Arc::new(InMemoryHostAggregator::new());
        let (router, _listener) =
            CommandRouter::new(node_manager, Arc::new(InMemoryCommandStore::new()), host_aggregator, Arc::new(RuntimeMetrics::new()), router_config());

        let result = router.route_ping_host(&build_fqn("ghost-pc", "Nowhere"), None, None).await;
        assert!(matches!(result, Err(CoreError::HostNotFound)));
    }

    #[tokio::test]
    async fn ping_host_raises_malformed_result_when_success_has_no_host_ping() {
        let node_manager = node_manager();
        let host_aggregator = Arc::new(InMemoryHostAggregator::new());
        let host = seeded_host(&host_aggregator, "node-1").await;
        let outbound = node_manager.insert_test_session(&host.node_id).await;

        let nm_for_ack = Arc::clone(&node_manager);
        tokio::spawn(async move {
            let mut outbound = outbound;
            if let Some(axum::extract::ws::Message::Text(text)) = outbound.recv().await {
                let value: Value = serde_json::from_str(&text).unwrap();
                let command_id = value["commandId"].as_str().unwrap().to_string();
                nm_for_ack.emit_result_for_test(CommandResultEvent {
                    command_id,
                    success: true,
                    error: None,
                    correlation_id: None,
                    host_ping: None,
                    host_port_scan: None,
                });
            }
        });

        let (router, _listener) =
            CommandRouter::new(node_manager, Arc::new(InMemoryCommandStore::new()), host_aggregator, Arc::new(RuntimeMetrics::new()), router_config());

        let result = router.route_ping_host(&host.fqn, None, None).await;
        assert!(matches!(result, Err(CoreError::MalformedResult)));
    }

    #[tokio::test]
    async fn dispatch_times_out_on_first_attempt_when_node_never_responds() {
        let node_manager = node_manager();
        let host_aggregator = Arc::new(InMemoryHostAggregator::new());
        let host = seeded_host(&host_aggregator, "node-1").await;
        let _outbound = node_manager.insert_test_session(&host.node_id).await; // never drained, never acknowledged

        let mut config = router_config();
        config.command_timeout = Duration::from_millis(25);
        config.max_retries = 3;
        config.retry_base_delay_ms = 2;

        let (router, _listener) = CommandRouter::new(node_manager, Arc::new(InMemoryCommandStore::new()), host_aggregator, Arc::new(RuntimeMetrics::new()), config);

        let started = std::time::Instant::now();
        let result = router.route_ping_host(&host.fqn, None, None).await;
        // A single 25ms timer, not (max_retries+1) * command_timeout.
        assert!(started.elapsed() < Duration::from_millis(100));
        match result {
            Err(CoreError::Timeout { attempt, max_retries, .. }) => {
                assert_eq!(attempt, 1);
                assert_eq!(max_retries, 3);
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn coalesced_caller_is_resolved_not_stranded_when_original_dispatch_times_out() {
        let node_manager = node_manager();
        let host_aggregator = Arc::new(InMemoryHostAggregator::new());
        let host = seeded_host(&host_aggregator, "node-1").await;
        let _outbound = node_manager.insert_test_session(&host.node_id).await; // never drained, never acknowledged

        let mut config = router_config();
        config.command_timeout = Duration::from_millis(25);
        config.max_retries = 3;
        config.retry_base_delay_ms = 2;

        let (router, _listener) = CommandRouter::new(node_manager, Arc::new(InMemoryCommandStore::new()), host_aggregator, Arc::new(RuntimeMetrics::new()), config);

        let (first, second) = tokio::join!(
            router.route_wake(&host.fqn, Some("wake-desk-pc".to_string()), Some("corr-a".to_string())),
            router.route_wake(&host.fqn, Some("wake-desk-pc".to_string()), Some("corr-b".to_string()))
        );

        // Both callers must come back rather than one of them hanging
        // forever on a dropped oneshot sender. The original dispatcher sees
        // its own Timeout error; the coalesced caller sees the synthetic
        // failure outcome fanned out to every waiter on the same command id.
        match first {
            Err(CoreError::Timeout { .. }) => {}
            other => panic!("expected the original dispatcher to time out, got {other:?}"),
        }

        let second = second.unwrap();
        assert!(!second.success);
        assert_eq!(second.correlation_id, Some("corr-b".to_string()));
    }

    #[tokio::test]
    async fn update_host_inherits_absent_fields_and_clears_explicit_nulls() {
        let node_manager = node_manager();
        let host_aggregator = Arc::new(InMemoryHostAggregator::new());
        let mut host = seeded_host(&host_aggregator, "node-1").await;
        host.notes = Some("existing note".to_string());
        host.tags = vec!["lab".to_string()];
        host_aggregator.seed(host.clone()).await;

        let outbound = node_manager.insert_test_session(&host.node_id).await;
        auto_acknowledge(Arc::clone(&node_manager), outbound).await;

        let (router, _listener) =
            CommandRouter::new(node_manager, Arc::new(InMemoryCommandStore::new()), host_aggregator, Arc::new(RuntimeMetrics::new()), router_config());

        let request: UpdateHostRequest = serde_json::from_value(serde_json::json!({ "notes": null })).unwrap();
        let outcome = router.route_update_host(&host.fqn, request, None, None).await.unwrap();
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn delete_host_removes_host_record_only_on_success() {
        let node_manager = node_manager();
        let host_aggregator = Arc::new(InMemoryHostAggregator::new());
        let host = seeded_host(&host_aggregator, "node-1").await;
        let outbound = node_manager.insert_test_session(&host.node_id).await;
        auto_acknowledge(Arc::clone(&node_manager), outbound).await;

        let (router, _listener) = CommandRouter::new(
            Arc::clone(&node_manager),
            Arc::new(InMemoryCommandStore::new()),
            Arc::clone(&host_aggregator),
            Arc::new(RuntimeMetrics::new()),
            router_config(),
        );

        router.route_delete_host(&host.fqn, None, None).await.unwrap();
        assert!(host_aggregator.get_host_by_fqn(&host.fqn).await.is_none());
    }

    #[tokio::test]
    async fn concurrent_callers_with_same_idempotency_key_coalesce_onto_one_dispatch() {
        let node_manager = node_manager();
        let host_aggregator = Arc::new(InMemoryHostAggregator::new());
        let host = seeded_host(&host_aggregator, "node-1").await;
        let outbound = node_manager.insert_test_session(&host.node_id).await;

        // Only acknowledge the first command it sees; a coalesced caller
        // must not trigger a second dispatch at all.
        let nm_for_ack = Arc::clone(&node_manager);
        tokio::spawn(async move {
            let mut outbound = outbound;
            if let Some(axum::extract::ws::Message::Text(text)) = outbound.recv().await {
                let value: Value = serde_json::from_str(&text).unwrap();
                let command_id = value["commandId"].as_str().unwrap().to_string();
                tokio::time::sleep(Duration::from_millis(20)).await;
                nm_for_ack.emit_result_for_test(CommandResultEvent {
                    command_id,
                    success: true,
                    error: None,
                    correlation_id: None,
                    host_ping: None,
                    host_port_scan: None,
                });
            }
        });

        let (router, _listener) = CommandRouter::new(
            Arc::clone(&node_manager),
            Arc::new(InMemoryCommandStore::new()),
            host_aggregator,
            Arc::new(RuntimeMetrics::new()),
            router_config(),
        );

        let (first, second) = tokio::join!(
            router.route_wake(&host.fqn, Some("wake-desk-pc".to_string()), Some("corr-a".to_string())),
            router.route_wake(&host.fqn, Some("wake-desk-pc".to_string()), Some("corr-b".to_string()))
        );
        let first = first.unwrap();
        let second = second.unwrap();
        assert!(first.success);
        assert!(second.success);
        // Each caller keeps its own correlation id even though both
        // coalesced onto the same underlying dispatch.
        assert_eq!(first.correlation_id, Some("corr-a".to_string()));
        assert_eq!(second.correlation_id, Some("corr-b".to_string()));
    }

    #[test]
    fn collapse_whitespace_normalizes_idempotency_keys() {
        assert_eq!(collapse_whitespace("  desk-pc   wake  "), "desk-pc wake");
    }

    #[test]
    fn backoff_delay_is_clamped_to_half_the_command_timeout() {
        let timeout = Duration::from_millis(1000);
        for attempt in 0..10 {
            let delay = calculate_backoff_delay(1000, attempt, timeout);
            assert!(delay <= Duration::from_millis(500));
        }
    }

    #[test]
    fn backoff_delay_grows_with_attempt_on_average() {
        let timeout = Duration::from_secs(3600);
        let first = calculate_backoff_delay(100, 0, timeout).as_millis();
        let third = calculate_backoff_delay(100, 3, timeout).as_millis();
        assert!(third > first);
    }
}

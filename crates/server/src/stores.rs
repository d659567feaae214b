//! Contracts for the stores this core depends on but does not own:
//! `HostAggregator`, `NodeModel`, `CommandModel` and `WakeScheduleModel`.
//!
//! Production deployments back these with whatever persistence layer the
//! rest of the fleet-management service already uses. The in-memory
//! implementations here exist so the core compiles, runs, and is testable
//! standalone; they are reference implementations, not the production
//! store, and keep state only for the lifetime of the process — mirroring
//! the teacher's own `SessionManager`'s `RwLock<HashMap<...>>` plus
//! secondary-index pattern rather than any particular database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::CoreError;

pub type NodeId = String;
pub type CommandId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Queued,
    Sent,
    Acknowledged,
    Failed,
    TimedOut,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CommandState::Acknowledged | CommandState::Failed | CommandState::TimedOut)
    }
}

#[derive(Debug, Clone)]
pub struct CommandRecord {
    pub id: CommandId,
    pub node_id: NodeId,
    pub command_type: String,
    pub payload: Value,
    pub idempotency_key: Option<String>,
    /// The correlation id the first caller to create this record supplied.
    /// Later callers coalescing onto the same record keep their own
    /// correlation id in the router's in-memory waiter, not here.
    pub correlation_id: Option<String>,
    pub state: CommandState,
    pub error: Option<String>,
    pub retry_count: u32,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    pub sent_at: Option<SystemTime>,
    pub completed_at: Option<SystemTime>,
}

pub struct EnqueueRequest {
    pub id: CommandId,
    pub node_id: NodeId,
    pub command_type: String,
    pub payload: Value,
    /// Already scoped as `"<type>:<key>"` by the caller.
    pub idempotency_key: Option<String>,
    pub correlation_id: Option<String>,
}

/// External `CommandModel`: persists command lifecycle, owns idempotency.
#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Returns the existing record sharing `idempotency_key`, if any still
    /// lives in the index; otherwise creates and returns a new `queued`
    /// record for `req.id`. Any time-based expiry of the idempotency index
    /// is a policy decision left to the concrete store; `InMemoryCommandStore`
    /// keeps entries for the process lifetime and never expires them.
    async fn enqueue(&self, req: EnqueueRequest) -> Result<CommandRecord, CoreError>;
    async fn mark_sent(&self, id: &str) -> Result<(), CoreError>;
    async fn mark_acknowledged(&self, id: &str) -> Result<(), CoreError>;
    async fn mark_failed(&self, id: &str, error: &str) -> Result<(), CoreError>;
    async fn mark_timed_out(&self, id: &str, reason: &str) -> Result<(), CoreError>;
    async fn find_by_id(&self, id: &str) -> Option<CommandRecord>;
    /// Promotes `sent` records older than `command_timeout` to `timed_out`;
    /// returns how many were reconciled.
    async fn reconcile_stale_in_flight(&self, command_timeout: Duration) -> usize;
}

/// External `NodeModel`: persisted node liveness, independent of whether a
/// session happens to be live right now.
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn upsert_registered(&self, node_id: &str, now: SystemTime);
    async fn mark_heartbeat(&self, node_id: &str, now: SystemTime);
    /// Marks every node whose last heartbeat predates `now - node_timeout`
    /// offline; returns the ids that transitioned this call.
    async fn sweep_stale(&self, node_timeout: Duration, now: SystemTime) -> Vec<NodeId>;
}

#[derive(Debug, Clone)]
pub struct HostRecord {
    pub fqn: String,
    pub node_id: NodeId,
    pub name: String,
    pub mac: String,
    pub ip: String,
    pub status: String,
    pub notes: Option<String>,
    pub tags: Vec<String>,
}

/// External `HostAggregator`: the denormalised, FQN-keyed host store.
#[async_trait]
pub trait HostAggregator: Send + Sync {
    async fn get_host_by_fqn(&self, fqn: &str) -> Option<HostRecord>;
    async fn mark_node_hosts_unreachable(&self, node_id: &str);
    async fn on_host_removed(&self, node_id: &str, name: &str);
}

#[derive(Debug, Clone)]
pub struct WakeSchedule {
    pub id: String,
    pub host_fqn: String,
}

/// External `WakeScheduleModel`.
#[async_trait]
pub trait WakeScheduleStore: Send + Sync {
    async fn list_due(&self, batch_size: usize) -> Vec<WakeSchedule>;
    async fn record_execution_attempt(&self, schedule_id: &str, now: SystemTime);
}

// --- In-memory reference implementations -----------------------------------

#[derive(Default)]
pub struct InMemoryCommandStore {
    records: RwLock<HashMap<CommandId, CommandRecord>>,
    by_idempotency_key: RwLock<HashMap<String, CommandId>>,
}

impl InMemoryCommandStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommandStore for InMemoryCommandStore {
    async fn enqueue(&self, req: EnqueueRequest) -> Result<CommandRecord, CoreError> {
        if let Some(key) = &req.idempotency_key {
            let index = self.by_idempotency_key.read().await;
            if let Some(existing_id) = index.get(key) {
                let records = self.records.read().await;
                if let Some(existing) = records.get(existing_id) {
                    return Ok(existing.clone());
                }
            }
        }

        let now = SystemTime::now();
        let record = CommandRecord {
            id: req.id.clone(),
            node_id: req.node_id,
            command_type: req.command_type,
            payload: req.payload,
            idempotency_key: req.idempotency_key.clone(),
            correlation_id: req.correlation_id,
            state: CommandState::Queued,
            error: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            sent_at: None,
            completed_at: None,
        };

        let mut records = self.records.write().await;
        let mut index = self.by_idempotency_key.write().await;
        if let Some(key) = &req.idempotency_key {
            // Lost the race with a concurrent enqueue of the same key between
            // our read-lock check above and taking the write lock now.
            if let Some(existing_id) = index.get(key) {
                if let Some(existing) = records.get(existing_id) {
                    return Ok(existing.clone());
                }
            }
            index.insert(key.clone(), req.id.clone());
        }
        records.insert(req.id.clone(), record.clone());
        Ok(record)
    }

    async fn mark_sent(&self, id: &str) -> Result<(), CoreError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(id).ok_or_else(|| CoreError::StoreError(format!("no command record {id}")))?;
        record.state = CommandState::Sent;
        record.sent_at = Some(SystemTime::now());
        record.retry_count += 1;
        record.updated_at = SystemTime::now();
        Ok(())
    }

    async fn mark_acknowledged(&self, id: &str) -> Result<(), CoreError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(id).ok_or_else(|| CoreError::StoreError(format!("no command record {id}")))?;
        record.state = CommandState::Acknowledged;
        let now = SystemTime::now();
        record.completed_at = Some(now);
        record.updated_at = now;
        Ok(())
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<(), CoreError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(id).ok_or_else(|| CoreError::StoreError(format!("no command record {id}")))?;
        record.state = CommandState::Failed;
        record.error = Some(error.to_string());
        let now = SystemTime::now();
        record.completed_at = Some(now);
        record.updated_at = now;
        Ok(())
    }

    async fn mark_timed_out(&self, id: &str, reason: &str) -> Result<(), CoreError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(id).ok_or_else(|| CoreError::StoreError(format!("no command record {id}")))?;
        record.state = CommandState::TimedOut;
        record.error = Some(reason.to_string());
        let now = SystemTime::now();
        record.completed_at = Some(now);
        record.updated_at = now;
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Option<CommandRecord> {
        self.records.read().await.get(id).cloned()
    }

    async fn reconcile_stale_in_flight(&self, command_timeout: Duration) -> usize {
        let mut records = self.records.write().await;
        let now = SystemTime::now();
        let mut reconciled = 0;
        for record in records.values_mut() {
            if record.state == CommandState::Sent {
                let age = record.sent_at.and_then(|sent| now.duration_since(sent).ok()).unwrap_or_default();
                if age > command_timeout {
                    record.state = CommandState::TimedOut;
                    record.error = Some("reconciled: abandoned in-flight command found stale at startup".to_string());
                    record.completed_at = Some(now);
                    record.updated_at = now;
                    reconciled += 1;
                }
            }
        }
        reconciled
    }
}

struct NodeLiveness {
    last_heartbeat: SystemTime,
    offline: bool,
}

#[derive(Default)]
pub struct InMemoryNodeStore {
    nodes: RwLock<HashMap<NodeId, NodeLiveness>>,
}

impl InMemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeStore for InMemoryNodeStore {
    async fn upsert_registered(&self, node_id: &str, now: SystemTime) {
        self.nodes.write().await.insert(node_id.to_string(), NodeLiveness { last_heartbeat: now, offline: false });
    }

    async fn mark_heartbeat(&self, node_id: &str, now: SystemTime) {
        let mut nodes = self.nodes.write().await;
        let entry = nodes.entry(node_id.to_string()).or_insert(NodeLiveness { last_heartbeat: now, offline: false });
        entry.last_heartbeat = now;
        entry.offline = false;
    }

    async fn sweep_stale(&self, node_timeout: Duration, now: SystemTime) -> Vec<NodeId> {
        let mut nodes = self.nodes.write().await;
        let mut newly_offline = Vec::new();
        for (node_id, liveness) in nodes.iter_mut() {
            if liveness.offline {
                continue;
            }
            let age = now.duration_since(liveness.last_heartbeat).unwrap_or_default();
            if age > node_timeout {
                liveness.offline = true;
                newly_offline.push(node_id.clone());
            }
        }
        newly_offline
    }
}

#[derive(Default)]
pub struct InMemoryHostAggregator {
    hosts: RwLock<HashMap<String, HostRecord>>,
}

impl InMemoryHostAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a host record, for wiring demos and tests; production deployments
    /// populate this store from the real aggregator, not from this method.
    pub async fn seed(&self, host: HostRecord) {
        self.hosts.write().await.insert(host.fqn.clone(), host);
    }
}

#[async_trait]
impl HostAggregator for InMemoryHostAggregator {
    async fn get_host_by_fqn(&self, fqn: &str) -> Option<HostRecord> {
        self.hosts.read().await.get(fqn).cloned()
    }

    async fn mark_node_hosts_unreachable(&self, node_id: &str) {
        let mut hosts = self.hosts.write().await;
        for host in hosts.values_mut().filter(|h| h.node_id == node_id) {
            host.status = "unreachable".to_string();
        }
    }

    async fn on_host_removed(&self, node_id: &str, name: &str) {
        let mut hosts = self.hosts.write().await;
        hosts.retain(|_, host| !(host.node_id == node_id && host.name == name));
    }
}

#[derive(Default)]
pub struct InMemoryWakeScheduleStore {
    schedules: RwLock<Vec<WakeSchedule>>,
    attempts: AtomicU64,
}

impl InMemoryWakeScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, schedule: WakeSchedule) {
        self.schedules.write().await.push(schedule);
    }

    pub fn attempt_count(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl WakeScheduleStore for InMemoryWakeScheduleStore {
    async fn list_due(&self, batch_size: usize) -> Vec<WakeSchedule> {
        self.schedules.read().await.iter().take(batch_size).cloned().collect()
    }

    async fn record_execution_attempt(&self, _schedule_id: &str, _now: SystemTime) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn enqueue_req(id: &str, idempotency_key: Option<&str>) -> EnqueueRequest {
        EnqueueRequest {
            id: id.to_string(),
            node_id: "node-1".to_string(),
            command_type: "wake".to_string(),
            payload: json!({ "hostName": "desk-pc", "mac": "AA:BB:CC:DD:EE:FF" }),
            idempotency_key: idempotency_key.map(|k| format!("wake:{k}")),
            correlation_id: None,
        }
    }

    #[tokio::test]
    async fn enqueue_with_same_idempotency_key_returns_same_record() {
        let store = InMemoryCommandStore::new();
        let first = store.enqueue(enqueue_req("cmd_1", Some("idem-1"))).await.unwrap();
        let second = store.enqueue(enqueue_req("cmd_2", Some("idem-1"))).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.id, "cmd_1");
    }

    #[tokio::test]
    async fn enqueue_without_idempotency_key_always_creates_new_record() {
        let store = InMemoryCommandStore::new();
        let first = store.enqueue(enqueue_req("cmd_1", None)).await.unwrap();
        let second = store.enqueue(enqueue_req("cmd_2", None)).await.unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn mark_sent_increments_retry_count_each_time() {
        let store = InMemoryCommandStore::new();
        store.enqueue(enqueue_req("cmd_1", None)).await.unwrap();
        store.mark_sent("cmd_1").await.unwrap();
        store.mark_sent("cmd_1").await.unwrap();
        let record = store.find_by_id("cmd_1").await.unwrap();
        assert_eq!(record.retry_count, 2);
        assert_eq!(record.state, CommandState::Sent);
    }

    #[tokio::test]
    async fn reconcile_promotes_stale_sent_records_to_timed_out() {
        let store = InMemoryCommandStore::new();
        store.enqueue(enqueue_req("cmd_1", None)).await.unwrap();
        store.mark_sent("cmd_1").await.unwrap();
        // sent_at is "now", so any positive duration makes it immediately stale.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let reconciled = store.reconcile_stale_in_flight(Duration::from_millis(1)).await;
        assert_eq!(reconciled, 1);
        let record = store.find_by_id("cmd_1").await.unwrap();
        assert_eq!(record.state, CommandState::TimedOut);
    }

    #[tokio::test]
    async fn node_store_sweep_reports_only_newly_stale_nodes() {
        let store = InMemoryNodeStore::new();
        let stale_time = SystemTime::now() - Duration::from_secs(120);
        store.mark_heartbeat("node-1", stale_time).await;
        let newly_offline = store.sweep_stale(Duration::from_secs(60), SystemTime::now()).await;
        assert_eq!(newly_offline, vec!["node-1".to_string()]);
        // Second sweep finds nothing new; node-1 is already marked offline.
        let second_sweep = store.sweep_stale(Duration::from_secs(60), SystemTime::now()).await;
        assert!(second_sweep.is_empty());
    }

    #[tokio::test]
    async fn host_aggregator_marks_hosts_unreachable_by_node() {
        let aggregator = InMemoryHostAggregator::new();
        aggregator
            .seed(HostRecord {
                fqn: "desk-pc@Home".to_string(),
                node_id: "node-1".to_string(),
                name: "desk-pc".to_string(),
                mac: "AA:BB:CC:DD:EE:FF".to_string(),
                ip: "10.0.0.5".to_string(),
                status: "online".to_string(),
                notes: None,
                tags: Vec::new(),
            })
            .await;
        aggregator.mark_node_hosts_unreachable("node-1").await;
        let host = aggregator.get_host_by_fqn("desk-pc@Home").await.unwrap();
        assert_eq!(host.status, "unreachable");
    }

    #[tokio::test]
    async fn host_aggregator_removes_host_on_delete() {
        let aggregator = InMemoryHostAggregator::new();
        aggregator
            .seed(HostRecord {
                fqn: "media-pc@Lab".to_string(),
                node_id: "node-3".to_string(),
                name: "media-pc".to_string(),
                mac: "11:22:33:44:55:66".to_string(),
                ip: "10.0.0.9".to_string(),
                status: "online".to_string(),
                notes: None,
                tags: Vec::new(),
            })
            .await;
        aggregator.on_host_removed("node-3", "media-pc").await;
        assert!(aggregator.get_host_by_fqn("media-pc@Lab").await.is_none());
    }

    #[tokio::test]
    async fn wake_schedule_store_lists_at_most_batch_size() {
        let store = InMemoryWakeScheduleStore::new();
        for i in 0..5 {
            store.add(WakeSchedule { id: format!("sched-{i}"), host_fqn: "desk-pc@Home".to_string() }).await;
        }
        let due = store.list_due(3).await;
        assert_eq!(due.len(), 3);
    }
}

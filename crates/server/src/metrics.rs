//! Process-wide metrics object, constructed once at startup and shared by
//! reference into every component — the systems-language replacement for a
//! global `runtimeMetrics` singleton.
//!
//! Two kinds of state live here: ephemeral per-command-id correlation
//! bookkeeping (cleared once a command reaches a terminal state, so this
//! map never grows unbounded in steady state) and long-lived aggregate
//! counters rendered by the `/metrics` endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::RwLock;

struct DispatchInfo {
    correlation_id: Option<String>,
}

#[derive(Default, Clone, Copy)]
struct CommandCounters {
    dispatched: u64,
    acknowledged: u64,
    failed: u64,
    timed_out: u64,
}

#[derive(Default)]
pub struct RuntimeMetrics {
    dispatch_info: RwLock<HashMap<String, DispatchInfo>>,
    counters_by_type: RwLock<HashMap<String, CommandCounters>>,
    protocol_validation_total: RwLock<u64>,
    protocol_validation_by_key: RwLock<HashMap<String, u64>>,
    connected_nodes: AtomicI64,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_command_dispatched(&self, command_id: &str, command_type: &str, correlation_id: Option<String>) {
        self.dispatch_info.write().await.insert(command_id.to_string(), DispatchInfo { correlation_id });
        self.counters_by_type.write().await.entry(command_type.to_string()).or_default().dispatched += 1;
    }

    /// Records a terminal success/failure result and clears the command's
    /// ephemeral dispatch bookkeeping.
    pub async fn record_command_result(&self, command_id: &str, success: bool, command_type: &str) {
        let mut counters = self.counters_by_type.write().await;
        let entry = counters.entry(command_type.to_string()).or_default();
        if success {
            entry.acknowledged += 1;
        } else {
            entry.failed += 1;
        }
        drop(counters);
        self.dispatch_info.write().await.remove(command_id);
    }

    pub async fn record_command_timeout(&self, command_id: &str, command_type: &str) {
        self.counters_by_type.write().await.entry(command_type.to_string()).or_default().timed_out += 1;
        self.dispatch_info.write().await.remove(command_id);
    }

    /// `"inbound|outbound:<messageType>"`, e.g. `"inbound:unknown"`.
    pub async fn record_protocol_validation_failure(&self, key: &str) {
        *self.protocol_validation_total.write().await += 1;
        let mut by_key = self.protocol_validation_by_key.write().await;
        *by_key.entry(key.to_string()).or_insert(0) += 1;
    }

    /// Observability fallback for a result that arrives after the caller's
    /// waiter is already gone.
    pub async fn lookup_correlation_id(&self, command_id: &str) -> Option<String> {
        self.dispatch_info.read().await.get(command_id).and_then(|info| info.correlation_id.clone())
    }

    pub fn node_connected(&self) {
        self.connected_nodes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn node_disconnected(&self) {
        self.connected_nodes.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connected_node_count(&self) -> i64 {
        self.connected_nodes.load(Ordering::Relaxed)
    }

    /// Render the hand-rolled Prometheus text-format exposition, matching
    /// the shape of `web::metrics` rather than pulling in a `prometheus`
    /// client crate.
    pub async fn render_prometheus(&self) -> String {
        let mut out = String::new();
        out.push_str("# HELP cnc_connected_nodes Number of nodes with a live session.\n");
        out.push_str("# TYPE cnc_connected_nodes gauge\n");
        out.push_str(&format!("cnc_connected_nodes {}\n", self.connected_node_count()));

        out.push_str("# HELP cnc_commands_total Commands by type and terminal outcome.\n");
        out.push_str("# TYPE cnc_commands_total counter\n");
        let counters = self.counters_by_type.read().await;
        for (command_type, counters) in counters.iter() {
            out.push_str(&format!("cnc_commands_total{{type=\"{command_type}\",outcome=\"dispatched\"}} {}\n", counters.dispatched));
            out.push_str(&format!("cnc_commands_total{{type=\"{command_type}\",outcome=\"acknowledged\"}} {}\n", counters.acknowledged));
            out.push_str(&format!("cnc_commands_total{{type=\"{command_type}\",outcome=\"failed\"}} {}\n", counters.failed));
            out.push_str(&format!("cnc_commands_total{{type=\"{command_type}\",outcome=\"timed_out\"}} {}\n", counters.timed_out));
        }
        drop(counters);

        out.push_str("# HELP cnc_protocol_validation_failures_total Inbound/outbound messages that failed schema validation.\n");
        out.push_str("# TYPE cnc_protocol_validation_failures_total counter\n");
        out.push_str(&format!("cnc_protocol_validation_failures_total {}\n", self.protocol_validation_total.read().await));
        let by_key = self.protocol_validation_by_key.read().await;
        for (key, count) in by_key.iter() {
            out.push_str(&format!("cnc_protocol_validation_failures_total{{key=\"{key}\"}} {count}\n"));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_then_result_clears_correlation_and_increments_counters() {
        let metrics = RuntimeMetrics::new();
        metrics.record_command_dispatched("cmd_1", "wake", Some("corr-1".to_string())).await;
        assert_eq!(metrics.lookup_correlation_id("cmd_1").await, Some("corr-1".to_string()));

        metrics.record_command_result("cmd_1", true, "wake").await;
        assert_eq!(metrics.lookup_correlation_id("cmd_1").await, None);

        let rendered = metrics.render_prometheus().await;
        assert!(rendered.contains("type=\"wake\",outcome=\"acknowledged\"} 1"));
    }

    #[tokio::test]
    async fn timeout_increments_timed_out_counter() {
        let metrics = RuntimeMetrics::new();
        metrics.record_command_dispatched("cmd_1", "ping-host", None).await;
        metrics.record_command_timeout("cmd_1", "ping-host").await;
        let rendered = metrics.render_prometheus().await;
        assert!(rendered.contains("type=\"ping-host\",outcome=\"timed_out\"} 1"));
    }

    #[tokio::test]
    async fn protocol_validation_failures_tracked_by_key() {
        let metrics = RuntimeMetrics::new();
        metrics.record_protocol_validation_failure("inbound:unknown").await;
        metrics.record_protocol_validation_failure("inbound:unknown").await;
        metrics.record_protocol_validation_failure("outbound:wake").await;
        let rendered = metrics.render_prometheus().await;
        assert!(rendered.contains("cnc_protocol_validation_failures_total 3"));
        assert!(rendered.contains("key=\"inbound:unknown\"} 2"));
        assert!(rendered.contains("key=\"outbound:wake\"} 1"));
    }

    #[tokio::test]
    async fn connected_node_count_tracks_connect_and_disconnect() {
        let metrics = RuntimeMetrics::new();
        metrics.node_connected();
        metrics.node_connected();
        metrics.node_disconnected();
        assert_eq!(metrics.connected_node_count(), 1);
    }
}

//! Wire messages exchanged over the node WebSocket transport.
//!
//! Everything here is deliberately message-shaped rather than
//! domain-shaped: host records, schedules and accounts live behind the
//! external store contracts and are treated as opaque JSON where this
//! crate doesn't need to interpret them.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A command dispatched from the control plane down to a node.
///
/// Internally tagged on `type` with `commandId` and `data` alongside it,
/// matching the shape nodes are expected to parse: `{ "type": ..., "commandId": ..., "data": {...} }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CncCommand {
    Wake {
        #[serde(rename = "commandId")]
        command_id: String,
        data: WakeData,
    },
    PingHost {
        #[serde(rename = "commandId")]
        command_id: String,
        data: PingHostData,
    },
    Scan {
        #[serde(rename = "commandId")]
        command_id: String,
        data: ScanData,
    },
    ScanHostPorts {
        #[serde(rename = "commandId")]
        command_id: String,
        data: ScanHostPortsData,
    },
    UpdateHost {
        #[serde(rename = "commandId")]
        command_id: String,
        data: UpdateHostData,
    },
    DeleteHost {
        #[serde(rename = "commandId")]
        command_id: String,
        data: DeleteHostData,
    },
    SleepHost {
        #[serde(rename = "commandId")]
        command_id: String,
        data: SleepHostData,
    },
    ShutdownHost {
        #[serde(rename = "commandId")]
        command_id: String,
        data: ShutdownHostData,
    },
}

impl CncCommand {
    pub fn command_id(&self) -> &str {
        match self {
            CncCommand::Wake { command_id, .. }
            | CncCommand::PingHost { command_id, .. }
            | CncCommand::Scan { command_id, .. }
            | CncCommand::ScanHostPorts { command_id, .. }
            | CncCommand::UpdateHost { command_id, .. }
            | CncCommand::DeleteHost { command_id, .. }
            | CncCommand::SleepHost { command_id, .. }
            | CncCommand::ShutdownHost { command_id, .. } => command_id,
        }
    }

    /// The `type` discriminant as sent on the wire, e.g. `"ping-host"`.
    pub fn command_type(&self) -> &'static str {
        match self {
            CncCommand::Wake { .. } => "wake",
            CncCommand::PingHost { .. } => "ping-host",
            CncCommand::Scan { .. } => "scan",
            CncCommand::ScanHostPorts { .. } => "scan-host-ports",
            CncCommand::UpdateHost { .. } => "update-host",
            CncCommand::DeleteHost { .. } => "delete-host",
            CncCommand::SleepHost { .. } => "sleep-host",
            CncCommand::ShutdownHost { .. } => "shutdown-host",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WakeData {
    pub host_name: String,
    pub mac: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingHostData {
    pub host_name: String,
    pub mac: String,
    pub ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanData {
    pub immediate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanHostPortsData {
    pub host_name: String,
    pub mac: String,
    pub ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<u16>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Fully resolved update, as sent to the node: inherited fields have
/// already been merged against the stored host by the router, so there is
/// no absent/null/present distinction left at this point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateHostData {
    pub current_name: String,
    pub name: String,
    pub mac: String,
    pub ip: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteHostData {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SleepHostData {
    pub host_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownHostData {
    pub host_name: String,
}

/// An update request as received from a caller, before the router merges
/// it against the stored host.
///
/// `notes` and `tags` use the `Option<Option<T>>` wire shape: the key
/// absent means "leave as-is", present with `null` means "clear", present
/// with a value means "overwrite". `name`/`mac`/`ip`/`status` don't support
/// clearing, so a plain `Option<T>` is enough for them: absent inherits,
/// present overwrites.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateHostRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "deserialize_present_field")]
    pub notes: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_present_field")]
    pub tags: Option<Option<Vec<String>>>,
}

/// Distinguishes an absent key (outer `None`, field left untouched by
/// `#[serde(default)]`) from a key that was present in the payload, whether
/// its value was `null` (`Some(None)`) or a concrete value (`Some(Some(v))`).
fn deserialize_present_field<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Inbound messages a node sends to the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NodeMessage {
    Register {
        #[serde(rename = "nodeId")]
        node_id: String,
        location: String,
        capabilities: Vec<String>,
        metadata: RegisterMetadata,
        /// Legacy field some older agents still echo; tolerated if absent,
        /// checked against the upgrade's static token only if present.
        #[serde(rename = "authToken", default)]
        auth_token: Option<String>,
    },
    Heartbeat {},
    HostDiscovered {
        #[serde(flatten)]
        host: Value,
    },
    HostUpdated {
        #[serde(flatten)]
        host: Value,
    },
    HostRemoved {
        name: String,
    },
    ScanComplete {
        #[serde(flatten)]
        result: Value,
    },
    CommandResult(CommandResult),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterMetadata {
    pub version: String,
    pub platform: String,
    #[serde(rename = "protocolVersion", skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<u32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    #[serde(rename = "commandId")]
    pub command_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: u64,
    #[serde(rename = "correlationId", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(rename = "hostPing", skip_serializing_if = "Option::is_none")]
    pub host_ping: Option<HostPingResult>,
    #[serde(rename = "hostPortScan", skip_serializing_if = "Option::is_none")]
    pub host_port_scan: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostPingResult {
    pub reachable: bool,
    pub status: String,
    pub latency_ms: u64,
    pub checked_at: u64,
}

/// Messages the control plane sends back over the same socket, outside the
/// command/result channel: the registration handshake reply and protocol
/// errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Registered {
        #[serde(rename = "nodeId")]
        node_id: String,
        #[serde(rename = "heartbeatInterval")]
        heartbeat_interval: u64,
        #[serde(rename = "protocolVersion")]
        protocol_version: u32,
        #[serde(rename = "sessionToken")]
        session_token: String,
        #[serde(rename = "sessionExpiresAt")]
        session_expires_at: u64,
    },
    Error {
        message: String,
    },
}

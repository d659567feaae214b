//! Control-plane configuration: TOML on disk, `Default` impls for every
//! section so a field missing from the file falls back quietly, and a
//! `validate()` pass that turns misconfiguration into readable messages
//! instead of a panic deep in a worker.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CncConfig {
    pub server: ServerConfig,
    pub command: CommandConfig,
    pub node: NodeConfig,
    pub auth: AuthConfig,
    pub session_token: SessionTokenConfig,
    pub schedule_worker: ScheduleWorkerConfig,
}

impl Default for CncConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            command: CommandConfig::default(),
            node: NodeConfig::default(),
            auth: AuthConfig::default(),
            session_token: SessionTokenConfig::default(),
            schedule_worker: ScheduleWorkerConfig::default(),
        }
    }
}

impl CncConfig {
    /// Validate cross-field invariants and external prerequisites (TLS file
    /// existence, non-empty secrets). Returns every problem found rather
    /// than stopping at the first one, prefixed `ERROR:` for things that
    /// must be fixed and `WARNING:` for things that are probably a mistake.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        if self.command.timeout_ms == 0 {
            problems.push("ERROR: command.timeout_ms must be greater than zero".to_string());
        }
        if self.command.retry_base_delay_ms == 0 {
            problems.push("ERROR: command.retry_base_delay_ms must be greater than zero".to_string());
        }
        if self.command.retry_base_delay_ms * 2 > self.command.timeout_ms {
            problems.push(
                "WARNING: command.retry_base_delay_ms is large relative to command.timeout_ms; backoff may exceed the timeout on the first retry".to_string(),
            );
        }

        if self.node.heartbeat_interval_ms == 0 {
            problems.push("ERROR: node.heartbeat_interval_ms must be greater than zero".to_string());
        }
        if self.node.timeout_ms <= self.node.heartbeat_interval_ms {
            problems.push(
                "ERROR: node.timeout_ms must be greater than node.heartbeat_interval_ms, or heartbeats will always be considered overdue".to_string(),
            );
        }
        if self.node.supported_protocol_versions.is_empty() {
            problems.push("ERROR: node.supported_protocol_versions must not be empty".to_string());
        }

        if self.auth.node_auth_tokens.is_empty() {
            problems.push("WARNING: auth.node_auth_tokens is empty; no node will be able to complete the static-token phase of registration".to_string());
        }
        if self.auth.node_auth_tokens.iter().any(|t| t.trim().is_empty()) {
            problems.push("ERROR: auth.node_auth_tokens contains a blank token".to_string());
        }

        if self.session_token.secrets.is_empty() {
            problems.push("ERROR: session_token.secrets must contain at least one signing secret".to_string());
        }
        if self.session_token.issuer.trim().is_empty() {
            problems.push("ERROR: session_token.issuer must not be empty".to_string());
        }
        if self.session_token.audience.trim().is_empty() {
            problems.push("ERROR: session_token.audience must not be empty".to_string());
        }
        if self.session_token.ttl_seconds == 0 {
            problems.push("ERROR: session_token.ttl_seconds must be greater than zero".to_string());
        }

        if self.schedule_worker.enabled && self.schedule_worker.batch_size == 0 {
            problems.push("ERROR: schedule_worker.batch_size must be greater than zero when schedule_worker.enabled is true".to_string());
        }

        if let Some(cert) = &self.server.tls_cert {
            if !std::path::Path::new(cert).exists() {
                problems.push(format!("ERROR: server.tls_cert does not exist: {cert}"));
            }
        }
        if let Some(key) = &self.server.tls_key {
            if !std::path::Path::new(key).exists() {
                problems.push(format!("ERROR: server.tls_key does not exist: {key}"));
            }
        }
        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            problems.push("ERROR: server.tls_cert and server.tls_key must be set together".to_string());
        }

        if problems.iter().any(|p| p.starts_with("ERROR:")) {
            Err(problems)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub web_root: String,
    pub metrics_require_auth: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8443,
            tls_cert: None,
            tls_key: None,
            web_root: "./web".to_string(),
            metrics_require_auth: true,
        }
    }
}

/// `commandTimeout` / `commandMaxRetries` / `commandRetryBaseDelayMs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000, max_retries: 3, retry_base_delay_ms: 1_000 }
    }
}

/// `nodeHeartbeatInterval` / `nodeTimeout`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub heartbeat_interval_ms: u64,
    pub timeout_ms: u64,
    pub supported_protocol_versions: Vec<u32>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self { heartbeat_interval_ms: 30_000, timeout_ms: 90_000, supported_protocol_versions: vec![1, 2] }
    }
}

/// `nodeAuthTokens`: the static, pre-shared tokens a node may present
/// during the opening phase of registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub node_auth_tokens: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { node_auth_tokens: Vec::new() }
    }
}

/// `wsSessionTokenSecrets` / `wsSessionTokenIssuer` / `wsSessionTokenAudience`
/// / `wsSessionTokenTtlSeconds`. The first secret in the rotation list signs
/// new tokens; any secret in the list verifies one, so a secret can be
/// retired by dropping it off the end after its longest-lived token expires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTokenConfig {
    pub secrets: Vec<String>,
    pub issuer: String,
    pub audience: String,
    pub ttl_seconds: u64,
}

impl Default for SessionTokenConfig {
    fn default() -> Self {
        Self { secrets: Vec::new(), issuer: "cnc-control-plane".to_string(), audience: "cnc-node".to_string(), ttl_seconds: 86_400 }
    }
}

/// `scheduleWorkerEnabled` / `scheduleWorkerPollIntervalMs` / `scheduleWorkerBatchSize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleWorkerConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub batch_size: usize,
}

impl Default for ScheduleWorkerConfig {
    fn default() -> Self {
        Self { enabled: true, poll_interval_ms: 60_000, batch_size: 25 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_internally_consistent_except_for_secrets() {
        let config = CncConfig::default();
        let problems = config.validate().unwrap_err();
        // Defaults intentionally ship with no auth tokens or signing secrets;
        // everything else should be sound out of the box.
        assert!(problems.iter().all(|p| p.contains("node_auth_tokens") || p.contains("session_token.secrets")));
    }

    #[test]
    fn validate_passes_once_secrets_and_tokens_are_set() {
        let mut config = CncConfig::default();
        config.auth.node_auth_tokens = vec!["shared-secret".to_string()];
        config.session_token.secrets = vec!["signing-secret".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_node_timeout_not_exceeding_heartbeat() {
        let mut config = CncConfig::default();
        config.auth.node_auth_tokens = vec!["x".to_string()];
        config.session_token.secrets = vec!["y".to_string()];
        config.node.timeout_ms = config.node.heartbeat_interval_ms;
        let problems = config.validate().unwrap_err();
        assert!(problems.iter().any(|p| p.contains("node.timeout_ms")));
    }

    #[test]
    fn validate_rejects_mismatched_tls_pair() {
        let mut config = CncConfig::default();
        config.auth.node_auth_tokens = vec!["x".to_string()];
        config.session_token.secrets = vec!["y".to_string()];
        config.server.tls_cert = Some("/nonexistent/cert.pem".to_string());
        let problems = config.validate().unwrap_err();
        assert!(problems.iter().any(|p| p.contains("tls_key")));
    }

    #[test]
    fn toml_round_trip_preserves_values() {
        let mut config = CncConfig::default();
        config.auth.node_auth_tokens = vec!["shared".to_string()];
        let serialized = toml::to_string(&config).unwrap();
        let parsed: CncConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.auth.node_auth_tokens, vec!["shared".to_string()]);
        assert_eq!(parsed.command.timeout_ms, config.command.timeout_ms);
    }

    #[test]
    fn missing_sections_in_toml_fall_back_to_defaults() {
        let parsed: CncConfig = toml::from_str("").unwrap();
        assert_eq!(parsed.command.timeout_ms, CommandConfig::default().timeout_ms);
        assert_eq!(parsed.node.heartbeat_interval_ms, NodeConfig::default().heartbeat_interval_ms);
    }
}

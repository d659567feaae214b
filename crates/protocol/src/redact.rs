//! Recursive redaction of sensitive fields before a payload is logged.
//!
//! Mirrors the spirit of [`crate::messages::AgentCommand`]'s old redacting
//! `Debug` impl, generalized into a pure function over arbitrary JSON so it
//! can sit in front of any inbound or outbound message.

use serde_json::Value;

const MAX_DEPTH: usize = 4;
const MAX_ARRAY_LEN: usize = 50;
const MAX_STRING_LEN: usize = 2000;
const SENSITIVE_SUBSTRINGS: [&str; 4] = ["token", "authorization", "secret", "password"];

/// Redact a JSON value for logging: sensitive keys are replaced, deep
/// nesting is capped, and long arrays/strings are truncated.
pub fn redact_json(value: &Value) -> Value {
    redact_at(value, 0)
}

fn redact_at(value: &Value, depth: usize) -> Value {
    match value {
        Value::Object(map) => {
            if depth >= MAX_DEPTH {
                return Value::String("[depth limit]".to_string());
            }
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, val) in map {
                if is_sensitive_key(key) {
                    out.insert(key.clone(), Value::String("[REDACTED]".to_string()));
                } else {
                    out.insert(key.clone(), redact_at(val, depth + 1));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            if depth >= MAX_DEPTH {
                return Value::String("[depth limit]".to_string());
            }
            let overflow = items.len().saturating_sub(MAX_ARRAY_LEN);
            let mut out: Vec<Value> =
                items.iter().take(MAX_ARRAY_LEN).map(|v| redact_at(v, depth + 1)).collect();
            if overflow > 0 {
                out.push(Value::String(format!("[{overflow} more items truncated]")));
            }
            Value::Array(out)
        }
        Value::String(s) => Value::String(truncate_string(s)),
        other => other.clone(),
    }
}

fn truncate_string(s: &str) -> String {
    if s.len() <= MAX_STRING_LEN {
        return s.to_string();
    }
    let truncated: String = s.chars().take(MAX_STRING_LEN).collect();
    format!("{truncated}...[truncated]")
}

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_SUBSTRINGS.iter().any(|pat| lower.contains(pat))
}

//! Typed view over an inbound's `settings` JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::compiler::{CompileError, CompileResult};
use crate::store::InboundRecord;

fn default_true() -> bool {
    true
}

/// One entry of `settings.clients`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSettings {
    /// Client identity; also the key of the core's per-user counters.
    pub email: String,

    #[serde(default = "default_true")]
    pub enable: bool,

    /// Quota in bytes (0 = unlimited).
    #[serde(default)]
    pub total_bytes: u64,

    /// Expiry in unix milliseconds (0 = never).
    #[serde(default)]
    pub expiry_time: i64,

    /// Distinct source IPs allowed inside the tracking window (0 = unlimited).
    #[serde(default)]
    pub limit_ip: u32,

    /// Credentials and protocol fields (`id`, `password`, `flow`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ClientSettings {
    /// The client as the core sees it: credentials plus email. Quota,
    /// expiry and IP limit stay in the panel.
    pub fn render(&self) -> Value {
        let mut obj = self.extra.clone();
        obj.insert("email".to_string(), Value::String(self.email.clone()));
        Value::Object(obj)
    }

    /// Whether the expiry timestamp has passed at `now_ms`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiry_time > 0 && self.expiry_time <= now_ms
    }

    /// Whether `used` bytes reach the quota.
    pub fn is_depleted(&self, used: u64) -> bool {
        self.total_bytes > 0 && used >= self.total_bytes
    }
}

/// Parsed `settings` of one inbound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundSettings {
    #[serde(default)]
    pub clients: Vec<ClientSettings>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InboundSettings {
    /// Parse the settings column of `record`.
    pub fn parse(record: &InboundRecord) -> CompileResult<Self> {
        let settings: Self = serde_json::from_str(&record.settings)
            .map_err(|e| CompileError::invalid(record, format!("settings: {}", e)))?;

        for client in &settings.clients {
            if client.email.trim().is_empty() {
                return Err(CompileError::invalid(record, "client with empty email"));
            }
        }
        Ok(settings)
    }

    /// Enabled clients ordered by email.
    pub fn enabled_clients(&self) -> Vec<&ClientSettings> {
        let mut clients: Vec<_> = self.clients.iter().filter(|c| c.enable).collect();
        clients.sort_by(|a, b| a.email.cmp(&b.email));
        clients
    }
}

/// Parse an optional JSON column; blank text is treated as an empty object.
pub fn parse_json_column(record: &InboundRecord, column: &str, text: &str) -> CompileResult<Value> {
    if text.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_str(text).map_err(|e| CompileError::invalid(record, format!("{}: {}", column, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_defaults() {
        let client: ClientSettings =
            serde_json::from_str(r#"{"email":"alice","id":"u-1"}"#).unwrap();
        assert!(client.enable);
        assert_eq!(client.total_bytes, 0);
        assert!(!client.is_expired(i64::MAX));
        assert!(!client.is_depleted(u64::MAX));
        assert_eq!(client.extra["id"], "u-1");
    }

    #[test]
    fn test_render_strips_panel_fields() {
        let client: ClientSettings = serde_json::from_str(
            r#"{"email":"alice","id":"u-1","flow":"xtls-rprx-vision","totalBytes":10,"expiryTime":5,"limitIp":2}"#,
        )
        .unwrap();
        let rendered = client.render();
        let obj = rendered.as_object().unwrap();
        assert_eq!(obj.len(), 3);
        assert_eq!(obj["flow"], "xtls-rprx-vision");
        assert!(!obj.contains_key("totalBytes"));
    }

    #[test]
    fn test_quota_and_expiry_edges() {
        let client: ClientSettings = serde_json::from_str(
            r#"{"email":"a","totalBytes":1000,"expiryTime":2000}"#,
        )
        .unwrap();
        assert!(!client.is_depleted(999));
        assert!(client.is_depleted(1000));
        assert!(!client.is_expired(1999));
        assert!(client.is_expired(2000));
    }

    #[test]
    fn test_malformed_client_list_names_inbound() {
        let record = InboundRecord::new("broken", "vless", 443, r#"{"clients":{"email":"x"}}"#);
        let err = InboundSettings::parse(&record).unwrap_err();
        assert!(err.to_string().contains("broken"));
    }
}

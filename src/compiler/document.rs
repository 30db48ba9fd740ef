//! Fixed document sections and canonical hashing.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

/// Tag shared by the API inbound, outbound and routing rule.
pub const API_TAG: &str = "api";

/// Hex SHA-256 over the canonical form of a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigHash(pub String);

impl ConfigHash {
    pub fn of(document: &Value) -> Self {
        let mut canonical = String::new();
        write_canonical(document, &mut canonical);

        let digest = Sha256::digest(canonical.as_bytes());
        let hex = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Self(hex)
    }

    /// First 12 hex digits, for logs.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for ConfigHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compact JSON with object keys sorted at every level.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Outbounds used when no template supplies any.
pub fn default_outbounds() -> Value {
    json!([
        { "tag": "direct", "protocol": "freedom", "settings": {} },
        { "tag": "blocked", "protocol": "blackhole", "settings": {} }
    ])
}

/// Loopback inbound the stats queries and liveness probe go through.
pub fn api_inbound(listen: &str, port: u16) -> Value {
    json!({
        "tag": API_TAG,
        "listen": listen,
        "port": port,
        "protocol": "dokodemo-door",
        "settings": { "address": listen }
    })
}

/// Sections the engine always controls: logging, API, stats and policy.
pub fn control_sections(access_log: &str, log_level: &str) -> Map<String, Value> {
    let mut sections = Map::new();
    sections.insert(
        "log".to_string(),
        json!({ "access": access_log, "loglevel": log_level }),
    );
    sections.insert(
        "api".to_string(),
        json!({ "tag": API_TAG, "services": ["HandlerService", "LoggerService", "StatsService"] }),
    );
    sections.insert("stats".to_string(), json!({}));
    sections.insert(
        "policy".to_string(),
        json!({
            "levels": { "0": { "statsUserUplink": true, "statsUserDownlink": true } },
            "system": { "statsInboundUplink": true, "statsInboundDownlink": true }
        }),
    );
    sections
}

/// Routing with the API rule first, followed by any template rules.
pub fn routing(template_routing: Option<&Value>) -> Value {
    let mut routing = template_routing
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let mut rules = vec![json!({
        "type": "field",
        "inboundTag": [API_TAG],
        "outboundTag": API_TAG
    })];
    if let Some(extra) = routing.get("rules").and_then(Value::as_array) {
        rules.extend(
            extra
                .iter()
                .filter(|rule| rule.get("outboundTag").and_then(Value::as_str) != Some(API_TAG))
                .cloned(),
        );
    }
    routing.insert("rules".to_string(), Value::Array(rules));
    Value::Object(routing)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":{"y":[1,2],"x":"s"}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":{"x":"s","y":[1,2]},"b":1}"#).unwrap();
        assert_eq!(ConfigHash::of(&a), ConfigHash::of(&b));
    }

    #[test]
    fn test_hash_respects_array_order() {
        let a = json!([1, 2]);
        let b = json!([2, 1]);
        assert_ne!(ConfigHash::of(&a), ConfigHash::of(&b));
        assert_eq!(ConfigHash::of(&a).0.len(), 64);
    }

    #[test]
    fn test_routing_puts_api_rule_first() {
        let template = json!({
            "domainStrategy": "AsIs",
            "rules": [
                { "type": "field", "ip": ["geoip:private"], "outboundTag": "blocked" },
                { "type": "field", "inboundTag": ["api"], "outboundTag": "api" }
            ]
        });
        let routing = routing(Some(&template));
        let rules = routing["rules"].as_array().unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0]["outboundTag"], "api");
        assert_eq!(rules[1]["outboundTag"], "blocked");
        assert_eq!(routing["domainStrategy"], "AsIs");
    }
}

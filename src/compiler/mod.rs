//! Config compiler: store records → one canonical core document.
//!
//! # Data Flow
//! ```text
//! [InboundRecord] (any order)
//!     → settings.rs (parse client lists, drop disabled clients)
//!     → sort inbounds by tag, clients by email
//!     → document.rs (control sections, API inbound, routing, template)
//!     → DesiredConfig { document, hash, endpoints }
//! ```
//!
//! # Design Decisions
//! - Pure transform over an input snapshot; the template is read once at
//!   construction
//! - One malformed inbound fails the whole compilation, naming the inbound
//! - The hash covers semantic content only, so storage order never matters

pub mod document;
pub mod settings;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::config::CoreConfig;
use crate::store::InboundRecord;

pub use document::{ConfigHash, API_TAG};
pub use settings::{ClientSettings, InboundSettings};

/// Errors raised while compiling records into a document.
#[derive(Debug, Error)]
pub enum CompileError {
    /// Persisted data for one inbound cannot be used.
    #[error("invalid config in inbound {tag}: {reason}")]
    InvalidConfig { tag: String, reason: String },

    /// The configured template file is unreadable.
    #[error("template {path}: {reason}")]
    Template { path: PathBuf, reason: String },
}

impl CompileError {
    pub(crate) fn invalid(record: &InboundRecord, reason: impl Into<String>) -> Self {
        CompileError::InvalidConfig {
            tag: display_tag(record),
            reason: reason.into(),
        }
    }
}

/// Result type for compilation.
pub type CompileResult<T> = Result<T, CompileError>;

/// A socket the compiled document binds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenEndpoint {
    pub tag: String,
    pub listen: String,
    pub port: u16,
}

impl ListenEndpoint {
    /// Address used for the pre-launch bind check.
    pub fn bind_address(&self) -> String {
        let host = if self.listen.is_empty() {
            "0.0.0.0"
        } else {
            self.listen.as_str()
        };
        if host.contains(':') {
            format!("[{}]:{}", host, self.port)
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

/// The output of one compilation. Immutable; superseded by the next one.
#[derive(Debug, Clone)]
pub struct DesiredConfig {
    pub document: Value,
    pub hash: ConfigHash,
    /// User-facing listen sockets (the API inbound is excluded).
    pub endpoints: Vec<ListenEndpoint>,
    /// Emails of every client present in the document.
    pub clients: BTreeSet<String>,
}

impl DesiredConfig {
    pub fn contains_client(&self, email: &str) -> bool {
        self.clients.contains(email)
    }
}

fn display_tag(record: &InboundRecord) -> String {
    if record.tag.is_empty() {
        format!("inbound-{}", record.port)
    } else {
        record.tag.clone()
    }
}

/// Turns store snapshots into documents for one core installation.
#[derive(Debug, Clone)]
pub struct Compiler {
    access_log: String,
    log_level: String,
    api_listen: String,
    api_port: u16,
    template: Map<String, Value>,
}

impl Compiler {
    /// Build a compiler for `core`, loading its template if one is set.
    pub fn new(core: &CoreConfig) -> CompileResult<Self> {
        let template = match &core.template_path {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|e| CompileError::Template {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
                let value: Value = serde_json::from_str(&text).map_err(|e| CompileError::Template {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
                match value {
                    Value::Object(map) => map,
                    _ => {
                        return Err(CompileError::Template {
                            path: path.clone(),
                            reason: "top level must be an object".to_string(),
                        })
                    }
                }
            }
            None => Map::new(),
        };

        Ok(Self {
            access_log: core.access_log_path.display().to_string(),
            log_level: core.log_level.clone(),
            api_listen: core.api_listen.clone(),
            api_port: core.api_port,
            template,
        })
    }

    /// Compile a full snapshot of inbound records.
    pub fn compile(&self, records: &[InboundRecord]) -> CompileResult<DesiredConfig> {
        let mut rendered: BTreeMap<String, Value> = BTreeMap::new();
        let mut endpoints = Vec::new();
        let mut clients = BTreeSet::new();
        let mut sockets: BTreeMap<(String, u16), String> = BTreeMap::new();

        for record in records.iter().filter(|r| r.enable) {
            let tag = display_tag(record);
            if tag == API_TAG {
                return Err(CompileError::invalid(record, "tag is reserved"));
            }
            if record.port == 0 {
                return Err(CompileError::invalid(record, "port must be non-zero"));
            }
            if rendered.contains_key(&tag) {
                return Err(CompileError::invalid(record, "duplicate tag"));
            }
            if let Some(other) = sockets.insert((record.listen.clone(), record.port), tag.clone()) {
                return Err(CompileError::invalid(
                    record,
                    format!("port {} already used by {}", record.port, other),
                ));
            }

            let settings = InboundSettings::parse(record)?;
            let mut client_values = Vec::new();
            for client in settings.enabled_clients() {
                if !clients.insert(client.email.clone()) {
                    return Err(CompileError::invalid(
                        record,
                        format!("client email {} is used by another inbound", client.email),
                    ));
                }
                client_values.push(client.render());
            }

            let mut settings_value = settings.extra.clone();
            if !settings.clients.is_empty() {
                settings_value.insert("clients".to_string(), Value::Array(client_values));
            }

            let mut inbound = Map::new();
            inbound.insert("tag".to_string(), json!(tag));
            inbound.insert("protocol".to_string(), json!(record.protocol));
            if !record.listen.is_empty() {
                inbound.insert("listen".to_string(), json!(record.listen));
            }
            inbound.insert("port".to_string(), json!(record.port));
            inbound.insert("settings".to_string(), Value::Object(settings_value));
            inbound.insert(
                "streamSettings".to_string(),
                settings::parse_json_column(record, "streamSettings", &record.stream_settings)?,
            );
            inbound.insert(
                "sniffing".to_string(),
                settings::parse_json_column(record, "sniffing", &record.sniffing)?,
            );

            endpoints.push(ListenEndpoint {
                tag: tag.clone(),
                listen: record.listen.clone(),
                port: record.port,
            });
            rendered.insert(tag, Value::Object(inbound));
        }

        let mut inbounds = vec![document::api_inbound(&self.api_listen, self.api_port)];
        inbounds.extend(rendered.into_values());

        let mut doc = self.template.clone();
        doc.extend(document::control_sections(&self.access_log, &self.log_level));
        doc.insert("inbounds".to_string(), Value::Array(inbounds));
        if !doc.get("outbounds").map(Value::is_array).unwrap_or(false) {
            doc.insert("outbounds".to_string(), document::default_outbounds());
        }
        let routing = document::routing(self.template.get("routing"));
        doc.insert("routing".to_string(), routing);

        let document = Value::Object(doc);
        let hash = ConfigHash::of(&document);
        endpoints.sort_by(|a, b| a.tag.cmp(&b.tag));

        Ok(DesiredConfig {
            document,
            hash,
            endpoints,
            clients,
        })
    }
}

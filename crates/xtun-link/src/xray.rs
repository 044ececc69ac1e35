//! Xray Client Configuration
//!
//! Renders a parsed node into the JSON document the Xray engine loads:
//! one local HTTP inbound, the proxy outbound, and the `direct` / `block`
//! outbounds that routing rules point at.
//!
//! ```text
//! {
//!   "log":       { "loglevel": "warning" },
//!   "inbounds":  [ { "tag": "http-in", "protocol": "http", "port": 10809, ... } ],
//!   "outbounds": [ { "tag": "proxy", ... }, { "tag": "direct" }, { "tag": "block" } ],
//!   "routing":   { ... },   // filled in by the session layer
//!   "policy":    { ... },
//!   "stats":     {}
//! }
//! ```

use crate::node::{Network, ProxyNode, Security, StreamSettings};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use std::str::FromStr;

/// Outbound tags referenced by routing rules
pub const PROXY_TAG: &str = "proxy";
pub const DIRECT_TAG: &str = "direct";
pub const BLOCK_TAG: &str = "block";
pub const HTTP_INBOUND_TAG: &str = "http-in";

/// Engine log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    #[default]
    Warning,
    Error,
    None,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::None => "none",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown log level: {0}")]
pub struct UnknownLogLevel(pub String);

impl FromStr for LogLevel {
    type Err = UnknownLogLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "none" | "off" => Ok(LogLevel::None),
            _ => Err(UnknownLogLevel(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSection {
    pub loglevel: LogLevel,
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XrayConfig {
    pub log: LogSection,
    pub inbounds: Vec<Value>,
    pub outbounds: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<Value>,
}

impl XrayConfig {
    /// Client configuration for one node
    pub fn for_node(node: &ProxyNode, http_port: u16, log_level: LogLevel) -> Self {
        Self {
            log: LogSection { loglevel: log_level },
            inbounds: vec![http_inbound(http_port)],
            outbounds: vec![
                proxy_outbound(node),
                json!({ "tag": DIRECT_TAG, "protocol": "freedom", "settings": {} }),
                json!({ "tag": BLOCK_TAG, "protocol": "blackhole", "settings": {} }),
            ],
            routing: None,
            policy: None,
            stats: None,
        }
    }

    /// Port of the local HTTP inbound, if present
    pub fn http_port(&self) -> Option<u16> {
        self.inbounds
            .iter()
            .find(|i| i["tag"] == HTTP_INBOUND_TAG)
            .and_then(|i| i["port"].as_u64())
            .and_then(|p| u16::try_from(p).ok())
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

fn http_inbound(port: u16) -> Value {
    json!({
        "tag": HTTP_INBOUND_TAG,
        "listen": "127.0.0.1",
        "port": port,
        "protocol": "http",
        "settings": { "allowTransparent": false },
        "sniffing": { "enabled": true, "destOverride": ["http", "tls"] }
    })
}

fn proxy_outbound(node: &ProxyNode) -> Value {
    let settings = match node {
        ProxyNode::Vmess(n) => json!({
            "vnext": [{
                "address": n.address,
                "port": n.port,
                "users": [{ "id": n.id, "alterId": n.alter_id, "security": n.security }]
            }]
        }),
        ProxyNode::Vless(n) => {
            let mut user = json!({ "id": n.id, "encryption": n.encryption });
            if let Some(flow) = &n.flow {
                user["flow"] = json!(flow);
            }
            json!({ "vnext": [{ "address": n.address, "port": n.port, "users": [user] }] })
        }
        ProxyNode::Trojan(n) => json!({
            "servers": [{ "address": n.address, "port": n.port, "password": n.password }]
        }),
        ProxyNode::Shadowsocks(n) => json!({
            "servers": [{
                "address": n.address,
                "port": n.port,
                "method": n.method.as_str(),
                "password": n.password
            }]
        }),
    };

    let mut outbound = json!({
        "tag": PROXY_TAG,
        "protocol": node.kind().outbound_protocol(),
        "settings": settings,
    });
    if let Some(stream) = node.stream() {
        outbound["streamSettings"] = stream_settings(stream);
    }
    outbound
}

fn stream_settings(stream: &StreamSettings) -> Value {
    let mut out = Map::new();
    out.insert("network".into(), json!(stream.network.as_str()));
    out.insert("security".into(), json!(stream.security.as_str()));

    match stream.security {
        Security::Tls => {
            let mut tls = json!({ "allowInsecure": stream.allow_insecure });
            if let Some(sni) = stream.sni.as_ref().or(stream.host.as_ref()) {
                tls["serverName"] = json!(sni);
            }
            if !stream.alpn.is_empty() {
                tls["alpn"] = json!(stream.alpn);
            }
            if let Some(fp) = &stream.fingerprint {
                tls["fingerprint"] = json!(fp);
            }
            out.insert("tlsSettings".into(), tls);
        }
        Security::Reality => {
            let mut reality = json!({
                "fingerprint": stream.fingerprint.as_deref().unwrap_or("chrome"),
            });
            if let Some(sni) = &stream.sni {
                reality["serverName"] = json!(sni);
            }
            if let Some(params) = &stream.reality {
                reality["publicKey"] = json!(params.public_key);
                reality["shortId"] = json!(params.short_id.as_deref().unwrap_or_default());
                if let Some(spx) = &params.spider_x {
                    reality["spiderX"] = json!(spx);
                }
            }
            out.insert("realitySettings".into(), reality);
        }
        Security::None => {}
    }

    let path = stream.path.as_deref().unwrap_or("/");
    let transport = match stream.network {
        Network::Tcp => stream.header_type.as_deref().filter(|t| *t == "http").map(|_| {
            let mut request = json!({ "path": [path] });
            if let Some(host) = &stream.host {
                request["headers"] = json!({ "Host": [host] });
            }
            ("tcpSettings", json!({ "header": { "type": "http", "request": request } }))
        }),
        Network::Ws => {
            let mut ws = json!({ "path": path });
            if let Some(host) = &stream.host {
                ws["headers"] = json!({ "Host": host });
            }
            Some(("wsSettings", ws))
        }
        Network::Grpc => Some((
            "grpcSettings",
            json!({ "serviceName": stream.path.as_deref().unwrap_or_default() }),
        )),
        Network::Http => {
            let mut h2 = json!({ "path": path });
            if let Some(host) = &stream.host {
                h2["host"] = json!(host.split(',').map(str::trim).collect::<Vec<_>>());
            }
            Some(("httpSettings", h2))
        }
        Network::HttpUpgrade | Network::Xhttp => {
            let key = match stream.network {
                Network::HttpUpgrade => "httpupgradeSettings",
                _ => "xhttpSettings",
            };
            let mut settings = json!({ "path": path });
            if let Some(host) = &stream.host {
                settings["host"] = json!(host);
            }
            Some((key, settings))
        }
        Network::Kcp | Network::Quic => stream.header_type.as_ref().map(|t| {
            let key = match stream.network {
                Network::Kcp => "kcpSettings",
                _ => "quicSettings",
            };
            (key, json!({ "header": { "type": t } }))
        }),
    };

    if let Some((key, value)) = transport {
        out.insert(key.into(), value);
    }

    Value::Object(out)
}

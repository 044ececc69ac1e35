//! Proxy Node Model
//!
//! One variant per supported protocol. Each variant carries only the
//! fields its protocol defines; the shared transport/TLS block lives in
//! [`StreamSettings`].
//!
//! Nodes are produced by [`LinkParser`](crate::LinkParser) and never
//! mutated afterwards. Callers that need to share a node across tasks wrap
//! it in an `Arc`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::parser::ParseError;

/// Share-link protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
}

impl ProtocolKind {
    /// All supported protocols
    pub fn all() -> &'static [ProtocolKind] {
        &[
            ProtocolKind::Vmess,
            ProtocolKind::Vless,
            ProtocolKind::Trojan,
            ProtocolKind::Shadowsocks,
        ]
    }

    /// URI scheme (without `://`)
    pub fn scheme(&self) -> &'static str {
        match self {
            ProtocolKind::Vmess => "vmess",
            ProtocolKind::Vless => "vless",
            ProtocolKind::Trojan => "trojan",
            ProtocolKind::Shadowsocks => "ss",
        }
    }

    /// Xray outbound protocol name
    pub fn outbound_protocol(&self) -> &'static str {
        match self {
            ProtocolKind::Shadowsocks => "shadowsocks",
            other => other.scheme(),
        }
    }

    /// Resolve a scheme prefix (case-insensitive)
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "vmess" => Some(ProtocolKind::Vmess),
            "vless" => Some(ProtocolKind::Vless),
            "trojan" => Some(ProtocolKind::Trojan),
            "ss" | "shadowsocks" => Some(ProtocolKind::Shadowsocks),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// Stream transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Ws,
    Grpc,
    /// HTTP/2 (`h2` or `http` in links)
    Http,
    Kcp,
    Quic,
    HttpUpgrade,
    Xhttp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Ws => "ws",
            Network::Grpc => "grpc",
            Network::Http => "http",
            Network::Kcp => "kcp",
            Network::Quic => "quic",
            Network::HttpUpgrade => "httpupgrade",
            Network::Xhttp => "xhttp",
        }
    }
}

impl FromStr for Network {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "tcp" | "raw" => Ok(Network::Tcp),
            "ws" | "websocket" => Ok(Network::Ws),
            "grpc" | "gun" => Ok(Network::Grpc),
            "h2" | "http" => Ok(Network::Http),
            "kcp" | "mkcp" => Ok(Network::Kcp),
            "quic" => Ok(Network::Quic),
            "httpupgrade" => Ok(Network::HttpUpgrade),
            "xhttp" | "splithttp" => Ok(Network::Xhttp),
            other => Err(ParseError::MalformedUri(format!("unknown network type '{}'", other))),
        }
    }
}

/// Security layer on top of the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    #[default]
    None,
    Tls,
    Reality,
}

impl Security {
    pub fn as_str(&self) -> &'static str {
        match self {
            Security::None => "none",
            Security::Tls => "tls",
            Security::Reality => "reality",
        }
    }

    /// Lenient parse; anything unrecognized means no security layer
    pub fn from_param(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "tls" | "xtls" => Security::Tls,
            "reality" => Security::Reality,
            _ => Security::None,
        }
    }
}

/// REALITY handshake parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealityParams {
    /// Server public key (`pbk`)
    pub public_key: String,
    /// Short id (`sid`)
    pub short_id: Option<String>,
    /// Spider path (`spx`)
    pub spider_x: Option<String>,
}

/// Transport and TLS parameters shared by the V2Ray-family protocols
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamSettings {
    pub network: Network,
    /// Header obfuscation type (tcp `http`, kcp/quic header)
    pub header_type: Option<String>,
    /// Request path, or gRPC service name
    pub path: Option<String>,
    /// Host header
    pub host: Option<String>,
    pub security: Security,
    pub sni: Option<String>,
    pub alpn: Vec<String>,
    /// uTLS fingerprint
    pub fingerprint: Option<String>,
    pub allow_insecure: bool,
    pub reality: Option<RealityParams>,
}

/// Supported Shadowsocks AEAD ciphers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cipher {
    Aes128Gcm,
    Aes256Gcm,
    Chacha20Poly1305,
    Chacha20IetfPoly1305,
    Xchacha20Poly1305,
    Xchacha20IetfPoly1305,
    Blake3Aes128Gcm,
    Blake3Aes256Gcm,
    Blake3Chacha20Poly1305,
    None,
    Plain,
}

impl Cipher {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cipher::Aes128Gcm => "aes-128-gcm",
            Cipher::Aes256Gcm => "aes-256-gcm",
            Cipher::Chacha20Poly1305 => "chacha20-poly1305",
            Cipher::Chacha20IetfPoly1305 => "chacha20-ietf-poly1305",
            Cipher::Xchacha20Poly1305 => "xchacha20-poly1305",
            Cipher::Xchacha20IetfPoly1305 => "xchacha20-ietf-poly1305",
            Cipher::Blake3Aes128Gcm => "2022-blake3-aes-128-gcm",
            Cipher::Blake3Aes256Gcm => "2022-blake3-aes-256-gcm",
            Cipher::Blake3Chacha20Poly1305 => "2022-blake3-chacha20-poly1305",
            Cipher::None => "none",
            Cipher::Plain => "plain",
        }
    }
}

impl FromStr for Cipher {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aes-128-gcm" => Ok(Cipher::Aes128Gcm),
            "aes-256-gcm" => Ok(Cipher::Aes256Gcm),
            "chacha20-poly1305" => Ok(Cipher::Chacha20Poly1305),
            "chacha20-ietf-poly1305" => Ok(Cipher::Chacha20IetfPoly1305),
            "xchacha20-poly1305" => Ok(Cipher::Xchacha20Poly1305),
            "xchacha20-ietf-poly1305" => Ok(Cipher::Xchacha20IetfPoly1305),
            "2022-blake3-aes-128-gcm" => Ok(Cipher::Blake3Aes128Gcm),
            "2022-blake3-aes-256-gcm" => Ok(Cipher::Blake3Aes256Gcm),
            "2022-blake3-chacha20-poly1305" => Ok(Cipher::Blake3Chacha20Poly1305),
            "none" => Ok(Cipher::None),
            "plain" => Ok(Cipher::Plain),
            _ => Err(ParseError::UnsupportedCipher(s.to_string())),
        }
    }
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmessNode {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub id: String,
    pub alter_id: u16,
    /// Body cipher (`scy`), `auto` unless given
    pub security: String,
    pub stream: StreamSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlessNode {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub id: String,
    /// Always `none` for current VLESS
    pub encryption: String,
    /// Flow control tag, e.g. `xtls-rprx-vision`
    pub flow: Option<String>,
    pub stream: StreamSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrojanNode {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub password: String,
    pub stream: StreamSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowsocksNode {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub method: Cipher,
    pub password: String,
}

/// A parsed proxy node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ProxyNode {
    Vmess(VmessNode),
    Vless(VlessNode),
    Trojan(TrojanNode),
    Shadowsocks(ShadowsocksNode),
}

impl ProxyNode {
    pub fn kind(&self) -> ProtocolKind {
        match self {
            ProxyNode::Vmess(_) => ProtocolKind::Vmess,
            ProxyNode::Vless(_) => ProtocolKind::Vless,
            ProxyNode::Trojan(_) => ProtocolKind::Trojan,
            ProxyNode::Shadowsocks(_) => ProtocolKind::Shadowsocks,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ProxyNode::Vmess(n) => &n.name,
            ProxyNode::Vless(n) => &n.name,
            ProxyNode::Trojan(n) => &n.name,
            ProxyNode::Shadowsocks(n) => &n.name,
        }
    }

    pub fn address(&self) -> &str {
        match self {
            ProxyNode::Vmess(n) => &n.address,
            ProxyNode::Vless(n) => &n.address,
            ProxyNode::Trojan(n) => &n.address,
            ProxyNode::Shadowsocks(n) => &n.address,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            ProxyNode::Vmess(n) => n.port,
            ProxyNode::Vless(n) => n.port,
            ProxyNode::Trojan(n) => n.port,
            ProxyNode::Shadowsocks(n) => n.port,
        }
    }

    /// UUID or password, depending on protocol
    pub fn identifier(&self) -> &str {
        match self {
            ProxyNode::Vmess(n) => &n.id,
            ProxyNode::Vless(n) => &n.id,
            ProxyNode::Trojan(n) => &n.password,
            ProxyNode::Shadowsocks(n) => &n.password,
        }
    }

    /// Stream settings (Shadowsocks has none)
    pub fn stream(&self) -> Option<&StreamSettings> {
        match self {
            ProxyNode::Vmess(n) => Some(&n.stream),
            ProxyNode::Vless(n) => Some(&n.stream),
            ProxyNode::Trojan(n) => Some(&n.stream),
            ProxyNode::Shadowsocks(_) => None,
        }
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn endpoint(&self) -> String {
        let addr = self.address();
        if addr.contains(':') {
            format!("[{}]:{}", addr, self.port())
        } else {
            format!("{}:{}", addr, self.port())
        }
    }
}

impl fmt::Display for ProxyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.kind(), self.endpoint(), self.name())
    }
}

//! xtun Link - Share-Link Parsing
//!
//! Turns proxy share-links into typed nodes and renders the Xray client
//! configuration for a node.
//!
//! # Supported Links
//!
//! | Scheme | Identity | Payload |
//! |--------|----------|---------|
//! | `vmess://` | UUID | base64 JSON object |
//! | `vless://` | UUID | URI with query parameters |
//! | `trojan://` | password | URI with query parameters |
//! | `ss://` | `method:password` | SIP002, legacy, or fully encoded |
//!
//! # Usage
//!
//! ```rust,ignore
//! let parser = LinkParser::new();
//! let node = parser.parse(link, None)?;
//! println!("{} -> {}", node.name(), node.endpoint());
//! ```

mod node;
mod parser;
mod shadowsocks;
mod uri;
mod vmess;
mod xray;

pub use node::{
    Cipher, Network, ProtocolKind, ProxyNode, RealityParams, Security, ShadowsocksNode,
    StreamSettings, TrojanNode, VlessNode, VmessNode,
};
pub use parser::{DEFAULT_HTTP_PROXY_PORT, LinkParser, ParseError};
pub use xray::{
    BLOCK_TAG, DIRECT_TAG, HTTP_INBOUND_TAG, LogLevel, LogSection, PROXY_TAG, UnknownLogLevel,
    XrayConfig,
};

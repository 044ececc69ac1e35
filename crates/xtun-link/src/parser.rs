//! Share-Link Parser
//!
//! Decodes `vmess://`, `vless://`, `trojan://` and `ss://` links into
//! [`ProxyNode`] values and renders the client configuration handed to the
//! Xray engine.
//!
//! # Settings
//!
//! The local HTTP inbound port and the engine log level are process-wide
//! values owned by the parser. They are written only through the setters
//! below and read when a client configuration is emitted; parsing a link
//! never changes them.
//!
//! ```rust,ignore
//! let parser = LinkParser::new();
//! parser.set_http_proxy_port(1087);
//! let node = parser.parse("trojan://pw@example.com:443", None)?;
//! let config = parser.client_config_for(&node);
//! ```

use crate::node::{ProtocolKind, ProxyNode};
use crate::xray::{LogLevel, XrayConfig};
use crate::{shadowsocks, uri, vmess};
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU16, Ordering};
use tracing::{debug, info};

/// Default local HTTP inbound port
pub const DEFAULT_HTTP_PROXY_PORT: u16 = 10809;

/// Share-link parse errors
///
/// A failed parse never yields a partially filled node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Malformed URI: {0}")]
    MalformedUri(String),

    #[error("Unsupported cipher: {0}")]
    UnsupportedCipher(String),
}

impl ParseError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        ParseError::MalformedUri(reason.into())
    }
}

/// Share-link parser with its process-wide settings
pub struct LinkParser {
    http_proxy_port: AtomicU16,
    log_level: RwLock<LogLevel>,
}

impl LinkParser {
    /// Create a parser with default settings
    pub fn new() -> Self {
        Self {
            http_proxy_port: AtomicU16::new(DEFAULT_HTTP_PROXY_PORT),
            log_level: RwLock::new(LogLevel::default()),
        }
    }

    /// Set the local HTTP inbound port
    pub fn set_http_proxy_port(&self, port: u16) {
        let previous = self.http_proxy_port.swap(port, Ordering::Relaxed);
        if previous != port {
            info!("HTTP inbound port set to {}", port);
        }
    }

    pub fn http_proxy_port(&self) -> u16 {
        self.http_proxy_port.load(Ordering::Relaxed)
    }

    /// Set the engine log level
    pub fn set_log_level(&self, level: LogLevel) {
        match self.log_level.write() {
            Ok(mut guard) => *guard = level,
            Err(poisoned) => *poisoned.into_inner() = level,
        }
        debug!("Engine log level set to {}", level);
    }

    pub fn log_level(&self) -> LogLevel {
        match self.log_level.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Parse a share-link
    ///
    /// With no `hint`, the scheme selects the protocol. A hint overrides
    /// the scheme, and allows links with the scheme stripped.
    pub fn parse(&self, uri: &str, hint: Option<ProtocolKind>) -> Result<ProxyNode, ParseError> {
        let uri = uri.trim();
        let (scheme, body) = match uri.split_once("://") {
            Some((scheme, body)) => (Some(scheme), body),
            None => (None, uri),
        };

        let kind = match hint {
            Some(kind) => kind,
            None => {
                let scheme = scheme.unwrap_or_default();
                ProtocolKind::from_scheme(scheme)
                    .ok_or_else(|| ParseError::UnsupportedProtocol(scheme.to_string()))?
            }
        };

        let result = match kind {
            ProtocolKind::Vmess => vmess::parse(body),
            ProtocolKind::Vless => uri::parse_vless(body),
            ProtocolKind::Trojan => uri::parse_trojan(body),
            ProtocolKind::Shadowsocks => shadowsocks::parse(body),
        };

        match &result {
            Ok(node) => debug!("Parsed {}", node),
            Err(e) => debug!("Rejected {} link: {}", kind, e),
        }

        result
    }

    /// Parse a link and emit the full client configuration
    pub fn client_config(&self, uri: &str) -> Result<XrayConfig, ParseError> {
        let node = self.parse(uri, None)?;
        Ok(self.client_config_for(&node))
    }

    /// Emit the client configuration for an already parsed node
    pub fn client_config_for(&self, node: &ProxyNode) -> XrayConfig {
        XrayConfig::for_node(node, self.http_proxy_port(), self.log_level())
    }
}

impl Default for LinkParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode base64 in either alphabet, padded or not
pub(crate) fn decode_base64(input: &str) -> Option<Vec<u8>> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let trimmed = compact.trim_end_matches('=');
    if trimmed.is_empty() {
        return None;
    }

    STANDARD_NO_PAD
        .decode(trimmed)
        .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed))
        .ok()
}

/// Decode base64 and require UTF-8
pub(crate) fn decode_base64_str(input: &str) -> Option<String> {
    decode_base64(input).and_then(|bytes| String::from_utf8(bytes).ok())
}

/// Percent-decode a URI component
pub(crate) fn percent_decode(input: &str) -> String {
    percent_encoding::percent_decode_str(input)
        .decode_utf8_lossy()
        .into_owned()
}

/// Validate a port read from a link
pub(crate) fn check_port(port: u64) -> Result<u16, ParseError> {
    match u16::try_from(port) {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(ParseError::malformed(format!("port {} out of range", port))),
    }
}

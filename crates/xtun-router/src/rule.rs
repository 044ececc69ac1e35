//! Routing Rules
//!
//! A rule is one pattern in one of six category lists
//! (direct/proxy/block × domain/ip).
//!
//! # Pattern Syntax
//!
//! | Type | Example | Matches |
//! |------|---------|---------|
//! | domain | `example.com` | `example.com` and every subdomain |
//! | domain | `domain:example.com` | same as above |
//! | domain | `full:example.com` | exactly `example.com` |
//! | domain | `keyword:ads` | any domain containing `ads` |
//! | ip | `192.168.1.1` | that address |
//! | ip | `10.0.0.0/8` | the CIDR range |
//!
//! `geosite:` / `geoip:` patterns are handed to the engine verbatim and
//! never match locally.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use tracing::{debug, warn};

/// Errors reading rule fields from text
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("Unknown routing method: {0}")]
    UnknownMethod(String),

    #[error("Unknown match type: {0}")]
    UnknownType(String),
}

/// What to do with matched traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteAction {
    Direct,
    Proxy,
    Block,
}

impl RouteAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteAction::Direct => "direct",
            RouteAction::Proxy => "proxy",
            RouteAction::Block => "block",
        }
    }
}

impl fmt::Display for RouteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RouteAction {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(RouteAction::Direct),
            "proxy" => Ok(RouteAction::Proxy),
            "block" => Ok(RouteAction::Block),
            _ => Err(RuleError::UnknownMethod(s.to_string())),
        }
    }
}

/// Kind of target a rule matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Domain,
    Ip,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Domain => "domain",
            MatchType::Ip => "ip",
        }
    }
}

impl FromStr for MatchType {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "domain" => Ok(MatchType::Domain),
            "ip" => Ok(MatchType::Ip),
            _ => Err(RuleError::UnknownType(s.to_string())),
        }
    }
}

/// One of the six category lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Category {
    pub action: RouteAction,
    pub match_type: MatchType,
}

impl Category {
    pub const BLOCK_DOMAIN: Category = Category::new(RouteAction::Block, MatchType::Domain);
    pub const BLOCK_IP: Category = Category::new(RouteAction::Block, MatchType::Ip);
    pub const DIRECT_DOMAIN: Category = Category::new(RouteAction::Direct, MatchType::Domain);
    pub const DIRECT_IP: Category = Category::new(RouteAction::Direct, MatchType::Ip);
    pub const PROXY_DOMAIN: Category = Category::new(RouteAction::Proxy, MatchType::Domain);
    pub const PROXY_IP: Category = Category::new(RouteAction::Proxy, MatchType::Ip);

    /// Compiled order; block first so it takes precedence
    pub const ORDER: [Category; 6] = [
        Category::BLOCK_DOMAIN,
        Category::BLOCK_IP,
        Category::DIRECT_DOMAIN,
        Category::DIRECT_IP,
        Category::PROXY_DOMAIN,
        Category::PROXY_IP,
    ];

    pub const fn new(action: RouteAction, match_type: MatchType) -> Self {
        Self { action, match_type }
    }

    /// Position in [`Category::ORDER`]
    pub fn index(&self) -> usize {
        let action = match self.action {
            RouteAction::Block => 0,
            RouteAction::Direct => 1,
            RouteAction::Proxy => 2,
        };
        let kind = match self.match_type {
            MatchType::Domain => 0,
            MatchType::Ip => 1,
        };
        action * 2 + kind
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action, self.match_type.as_str())
    }
}

/// A routing rule in the `{method, type, content}` exchange form
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingRule {
    pub method: RouteAction,
    #[serde(rename = "type")]
    pub match_type: MatchType,
    #[serde(rename = "content")]
    pub pattern: String,
}

impl RoutingRule {
    pub fn new(method: RouteAction, match_type: MatchType, pattern: impl Into<String>) -> Self {
        Self {
            method,
            match_type,
            pattern: pattern.into(),
        }
    }

    pub fn category(&self) -> Category {
        Category::new(self.method, self.match_type)
    }
}

/// A pattern ready for matching
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Matcher {
    Suffix(String),
    Full(String),
    Keyword(String),
    Net(IpNet),
}

impl Matcher {
    /// Compile a pattern; `None` if it cannot match locally
    pub(crate) fn compile(match_type: MatchType, pattern: &str) -> Option<Self> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return None;
        }

        match match_type {
            MatchType::Domain => {
                let lower = pattern.to_ascii_lowercase();
                if let Some(rest) = lower.strip_prefix("full:") {
                    return Some(Matcher::Full(normalize_domain(rest).to_string()));
                }
                if let Some(rest) = lower.strip_prefix("keyword:") {
                    return Some(Matcher::Keyword(rest.to_string()));
                }
                if let Some(rest) = lower.strip_prefix("domain:") {
                    return Some(Matcher::Suffix(normalize_domain(rest).to_string()));
                }
                if lower.starts_with("geosite:") || lower.starts_with("regexp:") {
                    debug!("Domain pattern '{}' is evaluated by the engine only", pattern);
                    return None;
                }
                Some(Matcher::Suffix(normalize_domain(&lower).to_string()))
            }
            MatchType::Ip => {
                if pattern.to_ascii_lowercase().starts_with("geoip:") {
                    debug!("IP pattern '{}' is evaluated by the engine only", pattern);
                    return None;
                }
                if let Ok(net) = pattern.parse::<IpNet>() {
                    return Some(Matcher::Net(net.trunc()));
                }
                if let Ok(addr) = pattern.parse::<IpAddr>() {
                    return Some(Matcher::Net(IpNet::from(addr)));
                }
                warn!("Ignoring unparsable IP pattern '{}'", pattern);
                None
            }
        }
    }

    /// Match a normalized domain
    pub(crate) fn matches_domain(&self, domain: &str) -> bool {
        match self {
            Matcher::Suffix(suffix) => is_subdomain_or_equal(domain, suffix),
            Matcher::Full(full) => domain == full,
            Matcher::Keyword(keyword) => domain.contains(keyword.as_str()),
            Matcher::Net(_) => false,
        }
    }

    pub(crate) fn matches_ip(&self, addr: &IpAddr) -> bool {
        match self {
            Matcher::Net(net) => net.contains(addr),
            _ => false,
        }
    }
}

/// Trim whitespace and a trailing dot
pub(crate) fn normalize_domain(domain: &str) -> &str {
    domain.trim().trim_end_matches('.')
}

fn is_subdomain_or_equal(domain: &str, suffix: &str) -> bool {
    if domain == suffix {
        return true;
    }
    domain.len() > suffix.len()
        && domain.ends_with(suffix)
        && domain.as_bytes()[domain.len() - suffix.len() - 1] == b'.'
}

//! Shadowsocks links
//!
//! Accepted forms:
//! - SIP002: `ss://base64(method:password)@host:port#name`
//! - Legacy plain user-info: `ss://method:password@host:port#name`
//! - Fully encoded: `ss://base64(method:password@host:port)#name`
//!
//! Plugin parameters (`?plugin=...`) are not supported by the engine and
//! are dropped.

use crate::node::{Cipher, ProxyNode, ShadowsocksNode};
use crate::parser::{ParseError, check_port, decode_base64_str, percent_decode};
use tracing::debug;

pub(crate) fn parse(body: &str) -> Result<ProxyNode, ParseError> {
    let (rest, name) = match body.split_once('#') {
        Some((rest, fragment)) => (rest, percent_decode(fragment)),
        None => (body, String::new()),
    };

    let rest = match rest.split_once('?') {
        Some((rest, query)) => {
            debug!("Ignoring shadowsocks link parameters: {}", query);
            rest
        }
        None => rest,
    };
    let rest = rest.trim_end_matches('/');

    let (userinfo, hostport) = match rest.rsplit_once('@') {
        Some((userinfo, hostport)) => (decode_userinfo(userinfo)?, hostport.to_string()),
        None => {
            let decoded = decode_base64_str(rest)
                .ok_or_else(|| ParseError::malformed("ss: link is neither SIP002 nor base64"))?;
            let (userinfo, hostport) = decoded
                .rsplit_once('@')
                .ok_or_else(|| ParseError::malformed("ss: missing server address"))?;
            (userinfo.to_string(), hostport.to_string())
        }
    };

    let (method, password) = userinfo
        .split_once(':')
        .ok_or_else(|| ParseError::malformed("ss: user-info is not method:password"))?;
    if password.is_empty() {
        return Err(ParseError::malformed("ss: empty password"));
    }
    let method: Cipher = method.parse()?;

    let (address, port) = split_host_port(&hostport)?;

    Ok(ProxyNode::Shadowsocks(ShadowsocksNode {
        name,
        address,
        port,
        method,
        password: password.to_string(),
    }))
}

/// base64(`method:password`), or the legacy plain form
fn decode_userinfo(raw: &str) -> Result<String, ParseError> {
    let unescaped = percent_decode(raw);
    if let Some(decoded) = decode_base64_str(&unescaped).filter(|d| d.contains(':')) {
        return Ok(decoded);
    }
    if unescaped.contains(':') {
        return Ok(unescaped);
    }
    Err(ParseError::malformed("ss: user-info is neither base64 nor method:password"))
}

fn split_host_port(hostport: &str) -> Result<(String, u16), ParseError> {
    let (host, port) = hostport
        .rsplit_once(':')
        .ok_or_else(|| ParseError::malformed("ss: missing port"))?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(ParseError::malformed("ss: missing host"));
    }

    let port = port
        .parse::<u64>()
        .map_err(|_| ParseError::malformed(format!("ss: invalid port '{}'", port)))
        .and_then(check_port)?;

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};

    #[test]
    fn test_sip002() {
        let userinfo = URL_SAFE_NO_PAD.encode("aes-256-gcm:s3cret");
        let ProxyNode::Shadowsocks(node) =
            parse(&format!("{}@198.51.100.4:8388#Tokyo%2001", userinfo)).unwrap()
        else {
            panic!("expected shadowsocks node");
        };

        assert_eq!(node.method, Cipher::Aes256Gcm);
        assert_eq!(node.password, "s3cret");
        assert_eq!(node.address, "198.51.100.4");
        assert_eq!(node.port, 8388);
        assert_eq!(node.name, "Tokyo 01");
    }

    #[test]
    fn test_legacy_plain_userinfo() {
        let node = parse("chacha20-ietf-poly1305:pw@example.com:443/?plugin=obfs-local").unwrap();
        assert_eq!(node.port(), 443);
        assert_eq!(node.identifier(), "pw");
    }

    #[test]
    fn test_fully_encoded() {
        let encoded = STANDARD.encode("aes-128-gcm:pw@[2001:db8::9]:8388");
        let node = parse(&format!("{}#v6", encoded)).unwrap();
        assert_eq!(node.address(), "2001:db8::9");
        assert_eq!(node.name(), "v6");
    }

    #[test]
    fn test_unknown_cipher() {
        let userinfo = STANDARD.encode("rc4-md5:pw");
        assert_eq!(
            parse(&format!("{}@example.com:8388", userinfo)),
            Err(ParseError::UnsupportedCipher("rc4-md5".into()))
        );
    }

    #[test]
    fn test_malformed_inputs() {
        let userinfo = STANDARD.encode("aes-128-gcm:pw");
        assert!(matches!(
            parse(&format!("{}@example.com", userinfo)),
            Err(ParseError::MalformedUri(_))
        ));
        assert!(matches!(
            parse(&format!("{}@example.com:99999", userinfo)),
            Err(ParseError::MalformedUri(_))
        ));
        assert!(matches!(parse("%%%@example.com:1"), Err(ParseError::MalformedUri(_))));
    }
}

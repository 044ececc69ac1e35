//! VMess links: `vmess://<base64 JSON>`
//!
//! The JSON keys follow the v2rayN share format (`add` or `address`, `port`, `id`,
//! `aid`, `scy`, `net`, `type`, `host`, `path`, `tls`, `sni`, `alpn`,
//! `fp`, `ps`). Numbers may arrive as JSON numbers or numeric strings.

use crate::node::{ProxyNode, Security, StreamSettings, VmessNode};
use crate::parser::{ParseError, check_port, decode_base64_str};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VmessPayload {
    ps: Option<String>,
    #[serde(alias = "address")]
    add: Option<String>,
    port: Option<Value>,
    id: Option<String>,
    aid: Option<Value>,
    scy: Option<String>,
    net: Option<String>,
    #[serde(rename = "type")]
    header_type: Option<String>,
    host: Option<String>,
    path: Option<String>,
    tls: Option<String>,
    sni: Option<String>,
    alpn: Option<String>,
    fp: Option<String>,
    pbk: Option<String>,
    sid: Option<String>,
}

pub(crate) fn parse(body: &str) -> Result<ProxyNode, ParseError> {
    let json = decode_base64_str(body)
        .ok_or_else(|| ParseError::malformed("vmess payload is not valid base64"))?;

    let payload: VmessPayload = serde_json::from_str(&json)
        .map_err(|e| ParseError::malformed(format!("vmess payload is not valid JSON: {}", e)))?;

    let address = non_empty(payload.add).ok_or_else(|| ParseError::malformed("vmess: missing address"))?;
    let port = payload
        .port
        .as_ref()
        .and_then(json_number)
        .ok_or_else(|| ParseError::malformed("vmess: missing port"))
        .and_then(check_port)?;
    let id = non_empty(payload.id).ok_or_else(|| ParseError::malformed("vmess: missing id"))?;

    let alter_id = payload
        .aid
        .as_ref()
        .and_then(json_number)
        .and_then(|aid| u16::try_from(aid).ok())
        .unwrap_or(0);

    let security = Security::from_param(payload.tls.as_deref().unwrap_or_default());
    let reality = match (security, non_empty(payload.pbk)) {
        (Security::Reality, Some(public_key)) => Some(crate::node::RealityParams {
            public_key,
            short_id: non_empty(payload.sid),
            spider_x: None,
        }),
        _ => None,
    };

    let stream = StreamSettings {
        network: payload.net.as_deref().unwrap_or_default().parse()?,
        header_type: non_empty(payload.header_type).filter(|t| t != "none"),
        path: non_empty(payload.path),
        host: non_empty(payload.host),
        security,
        sni: non_empty(payload.sni),
        alpn: split_list(payload.alpn.as_deref()),
        fingerprint: non_empty(payload.fp),
        allow_insecure: false,
        reality,
    };

    Ok(ProxyNode::Vmess(VmessNode {
        name: payload.ps.unwrap_or_default(),
        address,
        port,
        id,
        alter_id,
        security: non_empty(payload.scy).unwrap_or_else(|| "auto".to_string()),
        stream,
    }))
}

fn json_number(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Split a comma separated parameter (`alpn=h2,http/1.1`)
pub(crate) fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Network;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;

    fn encode(json: &str) -> String {
        STANDARD.encode(json)
    }

    #[test]
    fn test_minimal_payload() {
        let body = encode(r#"{"add":"1.2.3.4","port":443,"id":"b831381d-6324-4d53-ad4f-8cda48b30811"}"#);
        let node = parse(&body).unwrap();

        assert_eq!(node.address(), "1.2.3.4");
        assert_eq!(node.port(), 443);
        let ProxyNode::Vmess(vmess) = node else {
            panic!("expected vmess node");
        };
        assert_eq!(vmess.alter_id, 0);
        assert_eq!(vmess.security, "auto");
        assert_eq!(vmess.stream.network, Network::Tcp);
        assert_eq!(vmess.stream.security, Security::None);
    }

    #[test]
    fn test_address_key_spellings() {
        for key in ["add", "address"] {
            let body = encode(&format!(r#"{{"{}":"1.2.3.4","port":443,"id":"u"}}"#, key));
            let node = parse(&body).unwrap();
            assert_eq!(node.address(), "1.2.3.4", "key {}", key);
            assert_eq!(node.port(), 443);
        }
    }

    #[test]
    fn test_missing_port_is_malformed() {
        let body = encode(r#"{"add":"1.2.3.4","id":"b831381d-6324-4d53-ad4f-8cda48b30811"}"#);
        assert!(matches!(parse(&body), Err(ParseError::MalformedUri(_))));
    }

    #[test]
    fn test_missing_address_or_id_is_malformed() {
        let no_add = encode(r#"{"port":443,"id":"x"}"#);
        let no_id = encode(r#"{"add":"h","port":443,"id":""}"#);
        assert!(matches!(parse(&no_add), Err(ParseError::MalformedUri(_))));
        assert!(matches!(parse(&no_id), Err(ParseError::MalformedUri(_))));
    }

    #[test]
    fn test_string_numbers_and_ws_tls() {
        let body = encode(
            r#"{"v":"2","ps":"hk-01","add":"hk.example.com","port":"8443","id":"u","aid":"64",
                "net":"ws","path":"/ray","host":"cdn.example.com","tls":"tls",
                "sni":"cdn.example.com","alpn":"h2,http/1.1","fp":"chrome"}"#,
        );
        let ProxyNode::Vmess(vmess) = parse(&body).unwrap() else {
            panic!("expected vmess node");
        };

        assert_eq!(vmess.name, "hk-01");
        assert_eq!(vmess.port, 8443);
        assert_eq!(vmess.alter_id, 64);
        assert_eq!(vmess.stream.network, Network::Ws);
        assert_eq!(vmess.stream.path.as_deref(), Some("/ray"));
        assert_eq!(vmess.stream.security, Security::Tls);
        assert_eq!(vmess.stream.alpn, vec!["h2", "http/1.1"]);
        assert_eq!(vmess.stream.fingerprint.as_deref(), Some("chrome"));
    }

    #[test]
    fn test_garbage_payloads() {
        assert!(matches!(parse("!!!not-base64!!!"), Err(ParseError::MalformedUri(_))));
        assert!(matches!(parse(&encode("not json")), Err(ParseError::MalformedUri(_))));
        assert!(matches!(
            parse(&encode(r#"{"add":"h","port":0,"id":"x"}"#)),
            Err(ParseError::MalformedUri(_))
        ));
    }
}

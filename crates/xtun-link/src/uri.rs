//! URI-style links: `vless://` and `trojan://`
//!
//! ```text
//! vless://<uuid>@<host>:<port>?security=&type=&path=&host=&sni=&fp=&alpn=&flow=#name
//! trojan://<password>@<host>:<port>?security=&type=&path=&host=&sni=&fp=&alpn=#name
//! ```

use crate::node::{
    Network, ProtocolKind, ProxyNode, RealityParams, Security, StreamSettings, TrojanNode,
    VlessNode,
};
use crate::parser::{ParseError, check_port, percent_decode};
use crate::vmess::split_list;
use std::collections::HashMap;
use url::Url;

/// Pieces common to both link styles
struct Authority {
    userinfo: String,
    address: String,
    port: u16,
    name: String,
    params: HashMap<String, String>,
}

fn split_authority(kind: ProtocolKind, body: &str) -> Result<Authority, ParseError> {
    let url = Url::parse(&format!("{}://{}", kind.scheme(), body))
        .map_err(|e| ParseError::malformed(format!("{}: {}", kind, e)))?;

    // A `:` inside the user-info splits it into username and password
    let userinfo = match url.password() {
        Some(password) => format!(
            "{}:{}",
            percent_decode(url.username()),
            percent_decode(password)
        ),
        None => percent_decode(url.username()),
    };
    if userinfo.is_empty() {
        return Err(ParseError::malformed(format!("{}: missing user-info", kind)));
    }

    let address = url
        .host_str()
        .filter(|h| !h.is_empty())
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
        .ok_or_else(|| ParseError::malformed(format!("{}: missing host", kind)))?;

    let port = url
        .port()
        .ok_or_else(|| ParseError::malformed(format!("{}: missing port", kind)))
        .and_then(|p| check_port(u64::from(p)))?;

    // Later duplicates win, matching how most clients read these links
    let params = url
        .query_pairs()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.into_owned()))
        .collect();

    Ok(Authority {
        userinfo,
        address,
        port,
        name: url.fragment().map(percent_decode).unwrap_or_default(),
        params,
    })
}

fn param(params: &HashMap<String, String>, key: &str) -> Option<String> {
    params
        .get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn stream_settings(
    params: &HashMap<String, String>,
    default_security: Security,
) -> Result<StreamSettings, ParseError> {
    let network: Network = param(params, "type").unwrap_or_default().parse()?;
    let security = param(params, "security")
        .map(|s| Security::from_param(&s))
        .unwrap_or(default_security);

    // gRPC carries its service name where other transports carry a path
    let path = match network {
        Network::Grpc => param(params, "servicename").or_else(|| param(params, "path")),
        _ => param(params, "path"),
    };

    let reality = match security {
        Security::Reality => {
            let public_key = param(params, "pbk").ok_or_else(|| {
                ParseError::malformed("reality security requires a public key (pbk)")
            })?;
            Some(RealityParams {
                public_key,
                short_id: param(params, "sid"),
                spider_x: param(params, "spx"),
            })
        }
        _ => None,
    };

    let allow_insecure = param(params, "allowinsecure")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    Ok(StreamSettings {
        network,
        header_type: param(params, "headertype").filter(|t| t != "none"),
        path,
        host: param(params, "host"),
        security,
        sni: param(params, "sni").or_else(|| param(params, "peer")),
        alpn: split_list(param(params, "alpn").as_deref()),
        fingerprint: param(params, "fp"),
        allow_insecure,
        reality,
    })
}

pub(crate) fn parse_vless(body: &str) -> Result<ProxyNode, ParseError> {
    let auth = split_authority(ProtocolKind::Vless, body)?;

    let id = uuid::Uuid::parse_str(&auth.userinfo)
        .map_err(|_| ParseError::malformed("vless: user-info is not a UUID"))?
        .hyphenated()
        .to_string();

    let stream = stream_settings(&auth.params, Security::None)?;

    Ok(ProxyNode::Vless(VlessNode {
        name: auth.name,
        address: auth.address,
        port: auth.port,
        id,
        encryption: param(&auth.params, "encryption").unwrap_or_else(|| "none".to_string()),
        flow: param(&auth.params, "flow"),
        stream,
    }))
}

pub(crate) fn parse_trojan(body: &str) -> Result<ProxyNode, ParseError> {
    let auth = split_authority(ProtocolKind::Trojan, body)?;
    let stream = stream_settings(&auth.params, Security::Tls)?;

    Ok(ProxyNode::Trojan(TrojanNode {
        name: auth.name,
        address: auth.address,
        port: auth.port,
        password: auth.userinfo,
        stream,
    }))
}

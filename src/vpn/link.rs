//! VLESS share-link parsing and rendering
//!
//! Turns `vless://uuid@host:port?params#name` into a validated [`Profile`].
//! Parsing never touches the network; every failure is a [`ParseError`].

use std::collections::BTreeMap;

use crate::error::ParseError;

use super::types::{
    is_supported, Network, Profile, RealityParams, Security, SecurityKind, TlsParams, Transport,
};

/// Share-link scheme prefix
pub const SCHEME: &str = "vless://";

const DEFAULT_PATH: &str = "/";
const DEFAULT_HEADER_TYPE: &str = "none";
const DEFAULT_FINGERPRINT: &str = "chrome";

/// Percent-decode, keeping the raw text when it is not valid UTF-8
fn decode(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

/// Split a query string into decoded key/value pairs. The first occurrence of
/// a repeated key wins.
fn parse_query(query: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = decode(key);
        if key.is_empty() {
            continue;
        }
        params.entry(key).or_insert_with(|| decode(value));
    }
    params
}

/// Remove a parameter, treating an empty value as absent
fn take(params: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    params.remove(key).filter(|v| !v.is_empty())
}

fn split_host_port(host_port: &str) -> Result<(String, u16), ParseError> {
    let (address, port_str) = if let Some(bracketed) = host_port.strip_prefix('[') {
        let (address, rest) = bracketed
            .split_once(']')
            .ok_or_else(|| ParseError::MalformedAuthority("unterminated IPv6 address".into()))?;
        let port_str = rest
            .strip_prefix(':')
            .ok_or_else(|| ParseError::MalformedAuthority("missing port".into()))?;
        (address, port_str)
    } else {
        host_port
            .rsplit_once(':')
            .ok_or_else(|| ParseError::MalformedAuthority("missing port".into()))?
    };

    if address.is_empty() {
        return Err(ParseError::MalformedAuthority("missing host".into()));
    }

    let port = port_str
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| ParseError::MalformedAuthority(format!("invalid port {port_str:?}")))?;

    Ok((address.to_string(), port))
}

fn build_transport(
    network: Network,
    params: &mut BTreeMap<String, String>,
) -> Result<Transport, ParseError> {
    let path = |params: &mut BTreeMap<String, String>| {
        take(params, "path").unwrap_or_else(|| DEFAULT_PATH.to_string())
    };

    let transport = match network {
        Network::Tcp => Transport::Tcp,
        Network::Ws => Transport::Ws {
            path: path(params),
            host: take(params, "host"),
        },
        Network::Grpc => Transport::Grpc {
            service_name: take(params, "serviceName")
                .ok_or(ParseError::MissingRequiredParameter("serviceName"))?,
            multi_mode: take(params, "mode").as_deref() == Some("multi"),
        },
        Network::H2 => Transport::H2 {
            path: path(params),
            host: take(params, "host"),
        },
        Network::Quic => Transport::Quic {
            security: take(params, "quicSecurity").unwrap_or_else(|| "none".to_string()),
            key: take(params, "key").unwrap_or_default(),
            header_type: take(params, "headerType")
                .unwrap_or_else(|| DEFAULT_HEADER_TYPE.to_string()),
        },
        Network::Mkcp => Transport::Mkcp {
            seed: take(params, "seed"),
            header_type: take(params, "headerType")
                .unwrap_or_else(|| DEFAULT_HEADER_TYPE.to_string()),
        },
        Network::HttpUpgrade => Transport::HttpUpgrade {
            path: path(params),
            host: take(params, "host"),
        },
        Network::SplitHttp => Transport::SplitHttp {
            path: path(params),
            host: take(params, "host"),
        },
    };

    Ok(transport)
}

fn build_security(
    kind: SecurityKind,
    params: &mut BTreeMap<String, String>,
) -> Result<Security, ParseError> {
    // `serverName` is an alias; when both are given it stays in `extra`
    let sni = |params: &mut BTreeMap<String, String>| {
        take(params, "sni").or_else(|| take(params, "serverName"))
    };

    let security = match kind {
        SecurityKind::None => Security::None,
        SecurityKind::Tls => Security::Tls(TlsParams {
            sni: sni(params),
            fingerprint: take(params, "fp"),
            alpn: take(params, "alpn")
                .map(|alpn| {
                    alpn.split(',')
                        .map(str::trim)
                        .filter(|a| !a.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            allow_insecure: matches!(
                take(params, "allowInsecure").as_deref(),
                Some("1") | Some("true")
            ),
        }),
        SecurityKind::Reality => Security::Reality(RealityParams {
            public_key: take(params, "pbk")
                .ok_or(ParseError::MissingRequiredParameter("publicKey"))?,
            sni: sni(params),
            fingerprint: take(params, "fp").unwrap_or_else(|| DEFAULT_FINGERPRINT.to_string()),
            short_id: take(params, "sid").unwrap_or_default(),
            spider_x: take(params, "spx").unwrap_or_else(|| DEFAULT_PATH.to_string()),
        }),
    };

    Ok(security)
}

/// Parse a `vless://` share link into a validated profile
pub fn parse_vless_link(link: &str) -> Result<Profile, ParseError> {
    let without_prefix = link
        .trim()
        .strip_prefix(SCHEME)
        .ok_or(ParseError::InvalidScheme)?;

    let (main_part, name) = match without_prefix.split_once('#') {
        Some((main, fragment)) => (main, Some(decode(fragment))),
        None => (without_prefix, None),
    };

    let (authority, query) = main_part.split_once('?').unwrap_or((main_part, ""));
    let authority = authority.trim_end_matches('/');

    let (credential, host_port) = authority
        .rsplit_once('@')
        .ok_or_else(|| ParseError::MalformedAuthority("missing credential".into()))?;
    if credential.is_empty() {
        return Err(ParseError::MalformedAuthority("missing credential".into()));
    }

    let (address, port) = split_host_port(host_port)?;

    let uuid = decode(credential);
    if uuid::Uuid::parse_str(&uuid).is_err() {
        return Err(ParseError::InvalidCredential(uuid));
    }

    let mut params = parse_query(query);

    let network = match take(&mut params, "type") {
        Some(value) => Network::from_param(&value).ok_or(ParseError::UnknownNetwork(value))?,
        None => Network::Tcp,
    };
    let security_kind = match take(&mut params, "security") {
        Some(value) => {
            SecurityKind::from_param(&value).ok_or(ParseError::UnknownSecurity(value))?
        }
        None => SecurityKind::None,
    };

    if !is_supported(network, security_kind) {
        return Err(ParseError::UnsupportedCombination {
            network: network.to_string(),
            security: security_kind.to_string(),
        });
    }

    let encryption = take(&mut params, "encryption").unwrap_or_else(|| "none".to_string());
    let flow = take(&mut params, "flow");
    let transport = build_transport(network, &mut params)?;
    let security = build_security(security_kind, &mut params)?;

    let name = name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| format!("{address}:{port}"));

    Ok(Profile {
        name,
        uuid,
        address,
        port,
        encryption,
        flow,
        transport,
        security,
        extra: params,
    })
}

impl Profile {
    /// Render the profile back into a share link
    pub fn to_link(&self) -> String {
        let mut query: Vec<(&str, String)> = vec![
            ("type", self.network().as_str().to_string()),
            ("security", self.security_kind().as_str().to_string()),
            ("encryption", self.encryption.clone()),
        ];
        if let Some(flow) = &self.flow {
            query.push(("flow", flow.clone()));
        }

        match &self.transport {
            Transport::Tcp => {}
            Transport::Ws { path, host }
            | Transport::H2 { path, host }
            | Transport::HttpUpgrade { path, host }
            | Transport::SplitHttp { path, host } => {
                query.push(("path", path.clone()));
                if let Some(host) = host {
                    query.push(("host", host.clone()));
                }
            }
            Transport::Grpc {
                service_name,
                multi_mode,
            } => {
                query.push(("serviceName", service_name.clone()));
                if *multi_mode {
                    query.push(("mode", "multi".to_string()));
                }
            }
            Transport::Quic {
                security,
                key,
                header_type,
            } => {
                query.push(("quicSecurity", security.clone()));
                if !key.is_empty() {
                    query.push(("key", key.clone()));
                }
                query.push(("headerType", header_type.clone()));
            }
            Transport::Mkcp { seed, header_type } => {
                if let Some(seed) = seed {
                    query.push(("seed", seed.clone()));
                }
                query.push(("headerType", header_type.clone()));
            }
        }

        match &self.security {
            Security::None => {}
            Security::Tls(tls) => {
                if let Some(sni) = &tls.sni {
                    query.push(("sni", sni.clone()));
                }
                if let Some(fp) = &tls.fingerprint {
                    query.push(("fp", fp.clone()));
                }
                if !tls.alpn.is_empty() {
                    query.push(("alpn", tls.alpn.join(",")));
                }
                if tls.allow_insecure {
                    query.push(("allowInsecure", "1".to_string()));
                }
            }
            Security::Reality(reality) => {
                if let Some(sni) = &reality.sni {
                    query.push(("sni", sni.clone()));
                }
                query.push(("fp", reality.fingerprint.clone()));
                query.push(("pbk", reality.public_key.clone()));
                if !reality.short_id.is_empty() {
                    query.push(("sid", reality.short_id.clone()));
                }
                query.push(("spx", reality.spider_x.clone()));
            }
        }

        let query = query
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(&v)))
            .chain(
                self.extra
                    .iter()
                    .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v))),
            )
            .collect::<Vec<_>>()
            .join("&");

        let host = if self.address.contains(':') {
            format!("[{}]", self.address)
        } else {
            self.address.clone()
        };

        format!(
            "{}{}@{}:{}?{}#{}",
            SCHEME,
            self.uuid,
            host,
            self.port,
            query,
            urlencoding::encode(&self.name)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: &str = "550e8400-e29b-41d4-a716-446655440000";

    fn link(rest: &str) -> String {
        format!("vless://{UUID}@{rest}")
    }

    #[test]
    fn test_parse_vless_ws_full() {
        let profile = parse_vless_link(&link(
            "example.com:443?security=tls&type=ws&path=%2Fws&host=cdn.example.com&sni=cdn.example.com#My%20Server",
        ))
        .unwrap();
        assert_eq!(profile.uuid, UUID);
        assert_eq!(profile.address, "example.com");
        assert_eq!(profile.port, 443);
        assert_eq!(profile.name, "My Server");
        assert_eq!(
            profile.transport,
            Transport::Ws {
                path: "/ws".into(),
                host: Some("cdn.example.com".into()),
            }
        );
        match profile.security {
            Security::Tls(tls) => assert_eq!(tls.sni.as_deref(), Some("cdn.example.com")),
            other => panic!("expected tls, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_scenario_ws_tls() {
        let profile =
            parse_vless_link(&link("1.2.3.4:443?type=ws&path=/x&security=tls#MyServer")).unwrap();
        assert_eq!(profile.name, "MyServer");
        assert_eq!(profile.address, "1.2.3.4");
        assert_eq!(profile.port, 443);
        assert_eq!(profile.network(), Network::Ws);
        assert_eq!(profile.security_kind(), SecurityKind::Tls);
    }

    #[test]
    fn test_parse_vless_reality() {
        let profile = parse_vless_link(&link(
            "1.2.3.4:443?security=reality&type=tcp&sni=www.google.com&fp=firefox&pbk=PUBKEY123&sid=ab12&flow=xtls-rprx-vision#Reality",
        ))
        .unwrap();
        assert_eq!(profile.flow.as_deref(), Some("xtls-rprx-vision"));
        assert_eq!(
            profile.security,
            Security::Reality(RealityParams {
                sni: Some("www.google.com".into()),
                fingerprint: "firefox".into(),
                public_key: "PUBKEY123".into(),
                short_id: "ab12".into(),
                spider_x: "/".into(),
            })
        );
    }

    #[test]
    fn test_parse_reality_missing_public_key() {
        let err = parse_vless_link(&link("1.2.3.4:443?security=reality&type=tcp&sid=ab")).unwrap_err();
        assert_eq!(err, ParseError::MissingRequiredParameter("publicKey"));
    }

    #[test]
    fn test_parse_grpc_requires_service_name() {
        let err = parse_vless_link(&link("1.2.3.4:443?type=grpc&security=tls")).unwrap_err();
        assert_eq!(err, ParseError::MissingRequiredParameter("serviceName"));

        let profile =
            parse_vless_link(&link("1.2.3.4:443?type=grpc&serviceName=svc&mode=multi")).unwrap();
        assert_eq!(
            profile.transport,
            Transport::Grpc {
                service_name: "svc".into(),
                multi_mode: true,
            }
        );
    }

    #[test]
    fn test_parse_vless_tcp_defaults() {
        let profile = parse_vless_link(&link("10.0.0.1:8080")).unwrap();
        assert_eq!(profile.transport, Transport::Tcp);
        assert_eq!(profile.security, Security::None);
        assert_eq!(profile.encryption, "none");
        assert!(profile.flow.is_none());
    }

    #[test]
    fn test_parse_vless_no_fragment_synthesizes_name() {
        let profile = parse_vless_link(&link("host.example:443?type=tcp")).unwrap();
        assert_eq!(profile.name, "host.example:443");
    }

    #[test]
    fn test_parse_vless_url_encoded_name() {
        let profile =
            parse_vless_link(&link("host:443?type=tcp#%D0%A1%D0%B5%D1%80%D0%B2%D0%B5%D1%80")).unwrap();
        assert_eq!(profile.name, "Сервер");
    }

    #[test]
    fn test_parse_vless_ipv6() {
        let profile = parse_vless_link(&link("[2001:db8::1]:8443?type=tcp")).unwrap();
        assert_eq!(profile.address, "2001:db8::1");
        assert_eq!(profile.port, 8443);
    }

    #[test]
    fn test_parse_vless_wrong_prefix() {
        let err = parse_vless_link("https://example.com").unwrap_err();
        assert_eq!(err, ParseError::InvalidScheme);
    }

    #[test]
    fn test_parse_vless_missing_at() {
        let err = parse_vless_link("vless://uuidhost:443?type=tcp").unwrap_err();
        assert!(matches!(err, ParseError::MalformedAuthority(_)));
    }

    #[test]
    fn test_parse_vless_invalid_port() {
        for bad in ["host:abc", "host:0", "host:70000", "host"] {
            let err = parse_vless_link(&link(bad)).unwrap_err();
            assert!(matches!(err, ParseError::MalformedAuthority(_)), "{bad}: {err:?}");
        }
    }

    #[test]
    fn test_parse_vless_invalid_uuid() {
        let err = parse_vless_link("vless://not-a-uuid@host:443").unwrap_err();
        assert_eq!(err, ParseError::InvalidCredential("not-a-uuid".into()));
    }

    #[test]
    fn test_parse_unknown_network_and_security() {
        let err = parse_vless_link(&link("h:1?type=smoke")).unwrap_err();
        assert_eq!(err, ParseError::UnknownNetwork("smoke".into()));

        let err = parse_vless_link(&link("h:1?security=xtls")).unwrap_err();
        assert_eq!(err, ParseError::UnknownSecurity("xtls".into()));
    }

    #[test]
    fn test_parse_unsupported_combination() {
        let err = parse_vless_link(&link("h:1?type=ws&security=reality&pbk=k")).unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedCombination { .. }));
    }

    #[test]
    fn test_parse_preserves_unknown_and_inapplicable_params() {
        let profile =
            parse_vless_link(&link("h:443?type=ws&path=/a&headerType=none&future=yes#n")).unwrap();
        assert_eq!(profile.extra.get("future").map(String::as_str), Some("yes"));
        assert_eq!(profile.extra.get("headerType").map(String::as_str), Some("none"));
        assert!(!profile.extra.contains_key("path"));
    }

    #[test]
    fn test_sni_wins_over_server_name() {
        let profile =
            parse_vless_link(&link("h:443?security=tls&sni=a.example&serverName=b.example#n")).unwrap();
        match &profile.security {
            Security::Tls(tls) => assert_eq!(tls.sni.as_deref(), Some("a.example")),
            other => panic!("unexpected security {other:?}"),
        }
        assert_eq!(profile.extra.get("serverName").map(String::as_str), Some("b.example"));

        let exported = profile.to_link();
        assert!(exported.contains("sni=a.example"));
        assert!(exported.contains("serverName=b.example"));
        assert_eq!(parse_vless_link(&exported).unwrap(), profile);

        let profile = parse_vless_link(&link("h:443?security=tls&serverName=b.example#n")).unwrap();
        match &profile.security {
            Security::Tls(tls) => assert_eq!(tls.sni.as_deref(), Some("b.example")),
            other => panic!("unexpected security {other:?}"),
        }
        assert!(profile.extra.is_empty());
    }

    #[test]
    fn test_parse_aliases() {
        let profile = parse_vless_link(&link("h:443?type=http&path=/h2")).unwrap();
        assert_eq!(profile.network(), Network::H2);

        let profile = parse_vless_link(&link("h:443?type=kcp&seed=s3cr3t&headerType=wechat-video")).unwrap();
        assert_eq!(
            profile.transport,
            Transport::Mkcp {
                seed: Some("s3cr3t".into()),
                header_type: "wechat-video".into(),
            }
        );
    }

    #[test]
    fn test_parse_whitespace_trimming() {
        let profile = parse_vless_link(&format!("  {}  \n", link("h:443#Trim"))).unwrap();
        assert_eq!(profile.name, "Trim");
    }

    #[test]
    fn test_to_link_reparses_to_same_profile() {
        let original = parse_vless_link(&link(
            "[2001:db8::1]:443?type=grpc&serviceName=svc&security=reality&pbk=K&sid=01&sni=a.com&custom=1#Grpc%20Reality",
        ))
        .unwrap();
        let reparsed = parse_vless_link(&original.to_link()).unwrap();
        assert_eq!(reparsed, original);
    }
}

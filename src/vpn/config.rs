//! Engine and routing-helper configuration compiler
//!
//! [`compile`] is a pure function of `(Profile, Settings)`. The documents are
//! typed structs serialized in declaration order, so compiling the same inputs
//! twice yields byte-identical JSON. No timestamps or host paths are embedded.
//!
//! The engine document follows the xray-core JSON schema. The helper document
//! is the tun2socks config file (JSON is valid YAML, which tun2socks reads).

use serde::Serialize;

use crate::error::CompileError;

use super::netstack::TUN_INTERFACE;
use super::settings::{DomainStrategy, Mode, Settings};
use super::types::{Profile, Security, Transport};

pub const SOCKS_INBOUND_TAG: &str = "socks-in";
pub const HTTP_INBOUND_TAG: &str = "http-in";
pub const PROXY_OUTBOUND_TAG: &str = "proxy";
pub const DIRECT_OUTBOUND_TAG: &str = "direct";
pub const BLOCK_OUTBOUND_TAG: &str = "block";

/// Loopback address the local listeners bind to
pub const LISTEN_ADDR: &str = "127.0.0.1";

const ADS_DOMAINS: &str = "geosite:category-ads-all";
const PRIVATE_IPS: &str = "geoip:private";
const CN_DOMAINS: &str = "geosite:cn";
const CN_IPS: &str = "geoip:cn";

// ==================== Engine document ====================

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineConfig {
    pub log: LogSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsSection>,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
    pub routing: RoutingSection,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogSection {
    pub loglevel: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DnsSection {
    pub servers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Inbound {
    pub listen: &'static str,
    pub port: u16,
    pub protocol: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<InboundSettings>,
    pub tag: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundSettings {
    pub udp: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Outbound {
    pub protocol: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<VlessSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mux: Option<Mux>,
    pub tag: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VlessSettings {
    pub vnext: Vec<VnextServer>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VnextServer {
    pub address: String,
    pub port: u16,
    pub users: Vec<VlessUser>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VlessUser {
    pub id: String,
    pub encryption: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
}

/// Multiplexing stanza; present only when mux is enabled
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mux {
    pub enabled: bool,
    pub concurrency: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamSettings {
    pub network: &'static str,
    pub security: &'static str,
    #[serde(flatten)]
    pub transport: Option<TransportStanza>,
    #[serde(flatten)]
    pub security_settings: Option<SecurityStanza>,
}

/// One sub-schema per transport; tcp has none
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TransportStanza {
    #[serde(rename = "wsSettings")]
    Ws(WsSettings),
    #[serde(rename = "grpcSettings")]
    Grpc(GrpcSettings),
    #[serde(rename = "httpSettings")]
    H2(HttpSettings),
    #[serde(rename = "quicSettings")]
    Quic(QuicSettings),
    #[serde(rename = "kcpSettings")]
    Mkcp(KcpSettings),
    #[serde(rename = "httpupgradeSettings")]
    HttpUpgrade(PathHostSettings),
    #[serde(rename = "splithttpSettings")]
    SplitHttp(PathHostSettings),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WsSettings {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<WsHeaders>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WsHeaders {
    #[serde(rename = "Host")]
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcSettings {
    pub service_name: String,
    pub multi_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpSettings {
    pub path: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub host: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeaderObfuscation {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuicSettings {
    pub security: String,
    pub key: String,
    pub header: HeaderObfuscation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KcpSettings {
    pub header: HeaderObfuscation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathHostSettings {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// Security sub-schema; `none` has none
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SecurityStanza {
    #[serde(rename = "tlsSettings")]
    Tls(TlsSettings),
    #[serde(rename = "realitySettings")]
    Reality(RealitySettings),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,
    pub allow_insecure: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealitySettings {
    pub server_name: String,
    pub fingerprint: String,
    pub public_key: String,
    pub short_id: String,
    pub spider_x: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingSection {
    pub domain_strategy: DomainStrategy,
    pub rules: Vec<RoutingRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub domain: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ip: Vec<String>,
    pub outbound_tag: &'static str,
}

impl RoutingRule {
    fn domains(domains: &[&str], outbound_tag: &'static str) -> Self {
        Self {
            kind: "field",
            domain: domains.iter().map(|d| d.to_string()).collect(),
            ip: Vec::new(),
            outbound_tag,
        }
    }

    fn ips(ips: &[&str], outbound_tag: &'static str) -> Self {
        Self {
            kind: "field",
            domain: Vec::new(),
            ip: ips.iter().map(|i| i.to_string()).collect(),
            outbound_tag,
        }
    }
}

impl EngineConfig {
    /// Render as pretty-printed JSON
    pub fn to_json(&self) -> Result<Vec<u8>, CompileError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// The remote proxy outbound
    pub fn proxy_outbound(&self) -> Option<&Outbound> {
        self.outbounds.iter().find(|o| o.tag == PROXY_OUTBOUND_TAG)
    }
}

// ==================== Helper document ====================

/// tun2socks configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HelperConfig {
    pub device: String,
    pub proxy: String,
    pub mtu: u16,
    pub loglevel: &'static str,
}

impl HelperConfig {
    pub fn to_json(&self) -> Result<Vec<u8>, CompileError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

/// Output of [`compile`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Compiled {
    pub engine: EngineConfig,
    /// Present only in tunnel mode
    pub helper: Option<HelperConfig>,
}

// ==================== Compiler ====================

fn transport_stanza(transport: &Transport) -> Option<TransportStanza> {
    let stanza = match transport {
        Transport::Tcp => return None,
        Transport::Ws { path, host } => TransportStanza::Ws(WsSettings {
            path: path.clone(),
            headers: host.clone().map(|host| WsHeaders { host }),
        }),
        Transport::Grpc {
            service_name,
            multi_mode,
        } => TransportStanza::Grpc(GrpcSettings {
            service_name: service_name.clone(),
            multi_mode: *multi_mode,
        }),
        Transport::H2 { path, host } => TransportStanza::H2(HttpSettings {
            path: path.clone(),
            host: host.iter().cloned().collect(),
        }),
        Transport::Quic {
            security,
            key,
            header_type,
        } => TransportStanza::Quic(QuicSettings {
            security: security.clone(),
            key: key.clone(),
            header: HeaderObfuscation {
                kind: header_type.clone(),
            },
        }),
        Transport::Mkcp { seed, header_type } => TransportStanza::Mkcp(KcpSettings {
            header: HeaderObfuscation {
                kind: header_type.clone(),
            },
            seed: seed.clone(),
        }),
        Transport::HttpUpgrade { path, host } => TransportStanza::HttpUpgrade(PathHostSettings {
            path: path.clone(),
            host: host.clone(),
        }),
        Transport::SplitHttp { path, host } => TransportStanza::SplitHttp(PathHostSettings {
            path: path.clone(),
            host: host.clone(),
        }),
    };
    Some(stanza)
}

fn security_stanza(profile: &Profile, settings: &Settings) -> Option<SecurityStanza> {
    match &profile.security {
        Security::None => None,
        Security::Tls(tls) => Some(SecurityStanza::Tls(TlsSettings {
            server_name: tls.sni.clone(),
            fingerprint: tls.fingerprint.clone(),
            alpn: tls.alpn.clone(),
            allow_insecure: settings.allow_insecure || tls.allow_insecure,
        })),
        Security::Reality(reality) => Some(SecurityStanza::Reality(RealitySettings {
            server_name: reality
                .sni
                .clone()
                .unwrap_or_else(|| profile.address.clone()),
            fingerprint: reality.fingerprint.clone(),
            public_key: reality.public_key.clone(),
            short_id: reality.short_id.clone(),
            spider_x: reality.spider_x.clone(),
        })),
    }
}

/// Routing rules in precedence order: block, then direct bypasses. The engine
/// takes the first matching rule, so a destination matching both an ad rule
/// and a bypass rule is blocked. Unmatched traffic uses the first outbound.
fn routing_rules(settings: &Settings) -> Vec<RoutingRule> {
    let mut rules = Vec::new();
    if settings.block_ads {
        rules.push(RoutingRule::domains(&[ADS_DOMAINS], BLOCK_OUTBOUND_TAG));
    }
    if settings.bypass_lan {
        rules.push(RoutingRule::ips(&[PRIVATE_IPS], DIRECT_OUTBOUND_TAG));
    }
    if settings.bypass_cn {
        rules.push(RoutingRule::domains(&[CN_DOMAINS], DIRECT_OUTBOUND_TAG));
        rules.push(RoutingRule::ips(&[CN_IPS], DIRECT_OUTBOUND_TAG));
    }
    rules
}

fn proxy_outbound(profile: &Profile, settings: &Settings) -> Outbound {
    Outbound {
        protocol: "vless",
        settings: Some(VlessSettings {
            vnext: vec![VnextServer {
                address: profile.address.clone(),
                port: profile.port,
                users: vec![VlessUser {
                    id: profile.uuid.clone(),
                    encryption: profile.encryption.clone(),
                    flow: profile.flow.clone(),
                }],
            }],
        }),
        stream_settings: Some(StreamSettings {
            network: profile.network().engine_name(),
            security: profile.security_kind().as_str(),
            transport: transport_stanza(&profile.transport),
            security_settings: security_stanza(profile, settings),
        }),
        mux: settings.mux_enabled.then(|| Mux {
            enabled: true,
            concurrency: settings.mux_concurrency,
        }),
        tag: PROXY_OUTBOUND_TAG,
    }
}

fn fixed_outbound(protocol: &'static str, tag: &'static str) -> Outbound {
    Outbound {
        protocol,
        settings: None,
        stream_settings: None,
        mux: None,
        tag,
    }
}

/// Build the helper document for tunnel mode
pub fn helper_config(settings: &Settings) -> HelperConfig {
    HelperConfig {
        device: format!("tun://{TUN_INTERFACE}"),
        proxy: format!("socks5://{}:{}", LISTEN_ADDR, settings.socks_port),
        mtu: settings.tun_mtu,
        loglevel: settings.log_level.helper_name(),
    }
}

/// Compile a profile and the process-wide settings into engine and helper
/// documents.
pub fn compile(profile: &Profile, settings: &Settings) -> Result<Compiled, CompileError> {
    if settings.socks_port == settings.http_port {
        return Err(CompileError::PortConflict(settings.socks_port));
    }

    if !profile.is_supported() {
        return Err(CompileError::UnsupportedCombination {
            network: profile.network().to_string(),
            security: profile.security_kind().to_string(),
        });
    }

    let dns = (!settings.custom_dns.is_empty()).then(|| DnsSection {
        servers: vec![settings.custom_dns.clone(), "localhost".to_string()],
    });

    let engine = EngineConfig {
        log: LogSection {
            loglevel: settings.log_level.as_str(),
        },
        dns,
        inbounds: vec![
            Inbound {
                listen: LISTEN_ADDR,
                port: settings.socks_port,
                protocol: "socks",
                settings: Some(InboundSettings { udp: true }),
                tag: SOCKS_INBOUND_TAG,
            },
            Inbound {
                listen: LISTEN_ADDR,
                port: settings.http_port,
                protocol: "http",
                settings: None,
                tag: HTTP_INBOUND_TAG,
            },
        ],
        outbounds: vec![
            proxy_outbound(profile, settings),
            fixed_outbound("freedom", DIRECT_OUTBOUND_TAG),
            fixed_outbound("blackhole", BLOCK_OUTBOUND_TAG),
        ],
        routing: RoutingSection {
            domain_strategy: settings.domain_strategy,
            rules: routing_rules(settings),
        },
    };

    let helper = match settings.mode {
        Mode::Tun => Some(helper_config(settings)),
        Mode::Proxy => None,
    };

    Ok(Compiled { engine, helper })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpn::link::parse_vless_link;
    use crate::vpn::types::{is_supported, Network, SecurityKind};
    use serde_json::Value;

    const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

    fn link_for(network: Network, security: SecurityKind) -> String {
        let mut query = format!("type={}&security={}", network.as_str(), security.as_str());
        match network {
            Network::Grpc => query.push_str("&serviceName=svc"),
            Network::Ws | Network::H2 | Network::HttpUpgrade | Network::SplitHttp => {
                query.push_str("&path=%2Fp&host=cdn.example.com")
            }
            Network::Quic | Network::Mkcp => query.push_str("&headerType=srtp"),
            Network::Tcp => {}
        }
        if security == SecurityKind::Reality {
            query.push_str("&pbk=PUB&sid=0a&fp=safari");
        }
        format!("vless://{UUID}@203.0.113.7:443?{query}#{network}-{security}")
    }

    fn to_value(engine: &EngineConfig) -> Value {
        serde_json::from_slice(&engine.to_json().unwrap()).unwrap()
    }

    #[test]
    fn test_every_supported_pair_compiles_to_one_proxy_outbound() {
        let expected_key = |network: Network| match network {
            Network::Tcp => None,
            Network::Ws => Some("wsSettings"),
            Network::Grpc => Some("grpcSettings"),
            Network::H2 => Some("httpSettings"),
            Network::Quic => Some("quicSettings"),
            Network::Mkcp => Some("kcpSettings"),
            Network::HttpUpgrade => Some("httpupgradeSettings"),
            Network::SplitHttp => Some("splithttpSettings"),
        };

        for network in Network::ALL {
            for security in SecurityKind::ALL {
                if !is_supported(network, security) {
                    continue;
                }
                let profile = parse_vless_link(&link_for(network, security)).unwrap();
                let compiled = compile(&profile, &Settings::default()).unwrap();
                let value = to_value(&compiled.engine);

                let outbounds = value["outbounds"].as_array().unwrap();
                let proxies: Vec<_> = outbounds.iter().filter(|o| o["protocol"] == "vless").collect();
                assert_eq!(proxies.len(), 1, "{network}/{security}");

                let stream = proxies[0]["streamSettings"].as_object().unwrap();
                assert_eq!(stream["network"], network.engine_name());
                assert_eq!(stream["security"], security.as_str());

                let transport_keys: Vec<_> =
                    stream.keys().filter(|k| k.ends_with("Settings") && !k.starts_with("tls") && !k.starts_with("reality")).collect();
                match expected_key(network) {
                    Some(key) => assert_eq!(transport_keys, vec![key], "{network}/{security}"),
                    None => assert!(transport_keys.is_empty(), "{network}/{security}"),
                }

                assert_eq!(stream.contains_key("tlsSettings"), security == SecurityKind::Tls);
                assert_eq!(stream.contains_key("realitySettings"), security == SecurityKind::Reality);
            }
        }
    }

    #[test]
    fn test_compile_scenario_ws_tls() {
        let profile = parse_vless_link(&format!(
            "vless://{UUID}@1.2.3.4:443?type=ws&path=/x&security=tls#MyServer"
        ))
        .unwrap();
        assert_eq!(profile.name, "MyServer");
        let compiled = compile(&profile, &Settings::default()).unwrap();
        let value = to_value(&compiled.engine);

        let proxy = &value["outbounds"][0];
        assert_eq!(proxy["tag"], "proxy");
        assert_eq!(proxy["settings"]["vnext"][0]["address"], "1.2.3.4");
        assert_eq!(proxy["settings"]["vnext"][0]["users"][0]["id"], UUID);
        assert_eq!(proxy["streamSettings"]["wsSettings"]["path"], "/x");
        assert_eq!(proxy["streamSettings"]["tlsSettings"]["allowInsecure"], false);
        assert!(proxy.get("mux").is_none());
        assert!(value["routing"]["rules"].as_array().unwrap().is_empty());
        assert!(compiled.helper.is_some());
    }

    #[test]
    fn test_compile_is_deterministic() {
        let profile = parse_vless_link(&link_for(Network::Grpc, SecurityKind::Reality)).unwrap();
        let settings = Settings {
            mux_enabled: true,
            bypass_cn: true,
            ..Default::default()
        };
        let first = compile(&profile, &settings).unwrap();
        let second = compile(&profile, &settings).unwrap();
        assert_eq!(first.engine.to_json().unwrap(), second.engine.to_json().unwrap());
        assert_eq!(
            first.helper.unwrap().to_json().unwrap(),
            second.helper.unwrap().to_json().unwrap()
        );
    }

    #[test]
    fn test_port_conflict() {
        let profile = parse_vless_link(&link_for(Network::Tcp, SecurityKind::None)).unwrap();
        for mode in [Mode::Tun, Mode::Proxy] {
            let settings = Settings {
                mode,
                socks_port: 20000,
                http_port: 20000,
                ..Default::default()
            };
            let err = compile(&profile, &settings).unwrap_err();
            assert!(matches!(err, CompileError::PortConflict(20000)));
        }
    }

    #[test]
    fn test_mux_absent_when_disabled() {
        let profile = parse_vless_link(&link_for(Network::Ws, SecurityKind::Tls)).unwrap();
        for concurrency in [1, 8, 16] {
            let settings = Settings {
                mux_enabled: false,
                mux_concurrency: concurrency,
                ..Default::default()
            };
            let value = to_value(&compile(&profile, &settings).unwrap().engine);
            assert!(value["outbounds"][0].get("mux").is_none());
        }

        let settings = Settings {
            mux_enabled: true,
            mux_concurrency: 4,
            ..Default::default()
        };
        let value = to_value(&compile(&profile, &settings).unwrap().engine);
        assert_eq!(value["outbounds"][0]["mux"]["enabled"], true);
        assert_eq!(value["outbounds"][0]["mux"]["concurrency"], 4);
    }

    #[test]
    fn test_helper_document_only_in_tun_mode() {
        let profile = parse_vless_link(&link_for(Network::Tcp, SecurityKind::Tls)).unwrap();

        let proxy = Settings {
            mode: Mode::Proxy,
            ..Default::default()
        };
        assert!(compile(&profile, &proxy).unwrap().helper.is_none());

        let tun = Settings {
            mode: Mode::Tun,
            socks_port: 11080,
            tun_mtu: 1500,
            ..Default::default()
        };
        let helper = compile(&profile, &tun).unwrap().helper.unwrap();
        assert_eq!(helper.proxy, "socks5://127.0.0.1:11080");
        assert_eq!(helper.mtu, 1500);
        assert_eq!(helper.device, "tun://tun0");
        assert_eq!(helper.loglevel, "warn");
    }

    #[test]
    fn test_routing_rules_block_before_bypass() {
        let profile = parse_vless_link(&link_for(Network::Tcp, SecurityKind::None)).unwrap();
        let settings = Settings {
            block_ads: true,
            bypass_lan: true,
            bypass_cn: true,
            ..Default::default()
        };
        let value = to_value(&compile(&profile, &settings).unwrap().engine);
        let tags: Vec<_> = value["routing"]["rules"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["outboundTag"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(tags, vec!["block", "direct", "direct", "direct"]);
        assert_eq!(value["routing"]["rules"][0]["domain"][0], "geosite:category-ads-all");
        assert_eq!(value["routing"]["rules"][1]["ip"][0], "geoip:private");
        assert_eq!(value["routing"]["domainStrategy"], "IPIfNonMatch");
    }

    #[test]
    fn test_dns_section() {
        let profile = parse_vless_link(&link_for(Network::Tcp, SecurityKind::None)).unwrap();

        let value = to_value(&compile(&profile, &Settings::default()).unwrap().engine);
        assert_eq!(value["dns"]["servers"][0], "1.1.1.1");
        assert_eq!(value["dns"]["servers"][1], "localhost");

        let settings = Settings {
            custom_dns: String::new(),
            domain_strategy: DomainStrategy::AsIs,
            ..Default::default()
        };
        let value = to_value(&compile(&profile, &settings).unwrap().engine);
        assert!(value.get("dns").is_none());
        assert_eq!(value["routing"]["domainStrategy"], "AsIs");
    }

    #[test]
    fn test_inbounds_and_fixed_outbounds() {
        let profile = parse_vless_link(&link_for(Network::Tcp, SecurityKind::None)).unwrap();
        let value = to_value(&compile(&profile, &Settings::default()).unwrap().engine);

        assert_eq!(value["inbounds"][0]["protocol"], "socks");
        assert_eq!(value["inbounds"][0]["port"], 10808);
        assert_eq!(value["inbounds"][0]["settings"]["udp"], true);
        assert_eq!(value["inbounds"][1]["protocol"], "http");
        assert_eq!(value["inbounds"][1]["port"], 10809);
        assert_eq!(value["outbounds"][1]["tag"], "direct");
        assert_eq!(value["outbounds"][2]["tag"], "block");
        assert_eq!(value["log"]["loglevel"], "warning");
        assert!(value["log"].get("access").is_none());
    }

    #[test]
    fn test_reality_fields_propagate_verbatim() {
        let profile = parse_vless_link(&link_for(Network::Tcp, SecurityKind::Reality)).unwrap();
        let value = to_value(&compile(&profile, &Settings::default()).unwrap().engine);
        let reality = &value["outbounds"][0]["streamSettings"]["realitySettings"];
        assert_eq!(reality["publicKey"], "PUB");
        assert_eq!(reality["shortId"], "0a");
        assert_eq!(reality["fingerprint"], "safari");
        assert_eq!(reality["serverName"], "203.0.113.7");
        assert_eq!(reality["spiderX"], "/");
    }

    #[test]
    fn test_allow_insecure_from_settings_or_profile() {
        let secure = parse_vless_link(&link_for(Network::Tcp, SecurityKind::Tls)).unwrap();
        let insecure = parse_vless_link(&format!(
            "vless://{UUID}@h:443?security=tls&allowInsecure=1"
        ))
        .unwrap();

        let allow = |profile: &Profile, settings: &Settings| {
            to_value(&compile(profile, settings).unwrap().engine)["outbounds"][0]["streamSettings"]
                ["tlsSettings"]["allowInsecure"]
                .as_bool()
                .unwrap()
        };

        assert!(!allow(&secure, &Settings::default()));
        assert!(allow(&insecure, &Settings::default()));
        let settings = Settings {
            allow_insecure: true,
            ..Default::default()
        };
        assert!(allow(&secure, &settings));
    }

    #[test]
    fn test_unsupported_combination_from_stored_profile() {
        let mut profile = parse_vless_link(&link_for(Network::Ws, SecurityKind::Tls)).unwrap();
        profile.security = Security::Reality(crate::vpn::types::RealityParams {
            sni: None,
            fingerprint: "chrome".into(),
            public_key: "k".into(),
            short_id: String::new(),
            spider_x: "/".into(),
        });
        let err = compile(&profile, &Settings::default()).unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedCombination { .. }));
    }
}

//! VPN-related type definitions
//!
//! This module contains the data structures shared by the link parser, the
//! config compiler and the coordinator: profiles with their transport and
//! security variants, connection status and dependency status.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::settings::Mode;

/// Transport variant of a profile (the `type` share-link parameter)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Ws,
    Grpc,
    H2,
    Quic,
    Mkcp,
    HttpUpgrade,
    SplitHttp,
}

impl Network {
    pub const ALL: [Network; 8] = [
        Network::Tcp,
        Network::Ws,
        Network::Grpc,
        Network::H2,
        Network::Quic,
        Network::Mkcp,
        Network::HttpUpgrade,
        Network::SplitHttp,
    ];

    /// Name used in share links
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Ws => "ws",
            Network::Grpc => "grpc",
            Network::H2 => "h2",
            Network::Quic => "quic",
            Network::Mkcp => "mkcp",
            Network::HttpUpgrade => "httpupgrade",
            Network::SplitHttp => "splithttp",
        }
    }

    /// Name the engine expects in `streamSettings.network`
    pub fn engine_name(&self) -> &'static str {
        match self {
            Network::H2 => "http",
            Network::Mkcp => "kcp",
            other => other.as_str(),
        }
    }

    /// Parse a share-link `type` value, accepting the common aliases
    pub fn from_param(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "tcp" | "raw" => Some(Network::Tcp),
            "ws" | "websocket" => Some(Network::Ws),
            "grpc" | "gun" => Some(Network::Grpc),
            "h2" | "http" => Some(Network::H2),
            "quic" => Some(Network::Quic),
            "mkcp" | "kcp" => Some(Network::Mkcp),
            "httpupgrade" => Some(Network::HttpUpgrade),
            "splithttp" | "xhttp" => Some(Network::SplitHttp),
            _ => None,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Security variant of a profile (the `security` share-link parameter)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityKind {
    None,
    Tls,
    Reality,
}

impl SecurityKind {
    pub const ALL: [SecurityKind; 3] = [SecurityKind::None, SecurityKind::Tls, SecurityKind::Reality];

    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityKind::None => "none",
            SecurityKind::Tls => "tls",
            SecurityKind::Reality => "reality",
        }
    }

    pub fn from_param(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "" | "none" => Some(SecurityKind::None),
            "tls" => Some(SecurityKind::Tls),
            "reality" => Some(SecurityKind::Reality),
            _ => None,
        }
    }
}

impl fmt::Display for SecurityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the engine has a stanza for this (network, security) pair.
///
/// Reality is only available on stream transports that carry a raw TLS-like
/// handshake; ws, quic, mkcp and httpupgrade have no reality stanza.
pub fn is_supported(network: Network, security: SecurityKind) -> bool {
    match security {
        SecurityKind::None | SecurityKind::Tls => true,
        SecurityKind::Reality => matches!(
            network,
            Network::Tcp | Network::Grpc | Network::H2 | Network::SplitHttp
        ),
    }
}

/// Transport parameters, one variant per network with exactly its own fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Ws {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<String>,
    },
    Grpc {
        service_name: String,
        #[serde(default)]
        multi_mode: bool,
    },
    H2 {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<String>,
    },
    Quic {
        security: String,
        #[serde(default)]
        key: String,
        header_type: String,
    },
    Mkcp {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seed: Option<String>,
        header_type: String,
    },
    HttpUpgrade {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<String>,
    },
    SplitHttp {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<String>,
    },
}

impl Transport {
    pub fn network(&self) -> Network {
        match self {
            Transport::Tcp => Network::Tcp,
            Transport::Ws { .. } => Network::Ws,
            Transport::Grpc { .. } => Network::Grpc,
            Transport::H2 { .. } => Network::H2,
            Transport::Quic { .. } => Network::Quic,
            Transport::Mkcp { .. } => Network::Mkcp,
            Transport::HttpUpgrade { .. } => Network::HttpUpgrade,
            Transport::SplitHttp { .. } => Network::SplitHttp,
        }
    }
}

/// Parameters of a standard TLS handshake
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,
    #[serde(default)]
    pub allow_insecure: bool,
}

/// Parameters of the reality handshake, propagated verbatim to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealityParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
    pub fingerprint: String,
    pub public_key: String,
    #[serde(default)]
    pub short_id: String,
    pub spider_x: String,
}

/// Security layer of a profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Security {
    None,
    Tls(TlsParams),
    Reality(RealityParams),
}

impl Security {
    pub fn kind(&self) -> SecurityKind {
        match self {
            Security::None => SecurityKind::None,
            Security::Tls(_) => SecurityKind::Tls,
            Security::Reality(_) => SecurityKind::Reality,
        }
    }
}

fn default_encryption() -> String {
    "none".to_string()
}

/// A saved VLESS profile.
///
/// Profiles are created by link import and replaced wholesale on re-import;
/// nothing mutates one in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Unique display name (the link fragment, or `address:port`)
    pub name: String,
    /// VLESS user id
    pub uuid: String,
    pub address: String,
    pub port: u16,
    #[serde(default = "default_encryption")]
    pub encryption: String,
    /// Flow control, e.g. `xtls-rprx-vision`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    pub transport: Transport,
    pub security: Security,
    /// Link parameters not consumed by the transport/security variant
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl Profile {
    pub fn network(&self) -> Network {
        self.transport.network()
    }

    pub fn security_kind(&self) -> SecurityKind {
        self.security.kind()
    }

    /// Whether the (network, security) pair has a known stanza builder
    pub fn is_supported(&self) -> bool {
        is_supported(self.network(), self.security_kind())
    }
}

/// Connection status published by the coordinator.
///
/// Use [`ConnectionStatus::connected`] / [`ConnectionStatus::disconnected`] so
/// that `profile` is set exactly when `connected` is true.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    /// Routing mode in effect when the connection was made
    pub mode: Option<Mode>,
    /// Name of the profile in use
    pub profile: Option<String>,
}

impl ConnectionStatus {
    pub fn connected(mode: Mode, profile: impl Into<String>) -> Self {
        Self {
            connected: true,
            mode: Some(mode),
            profile: Some(profile.into()),
        }
    }

    pub fn disconnected() -> Self {
        Self::default()
    }
}

/// Installation state of one external binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryStatus {
    pub name: String,
    pub installed: bool,
    pub version: String,
}

/// Dependency status reported by the dependency gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepsStatus {
    pub engine: BinaryStatus,
    pub helper: BinaryStatus,
    pub all_installed: bool,
}

impl DepsStatus {
    pub fn new(engine: BinaryStatus, helper: BinaryStatus) -> Self {
        let all_installed = engine.installed && helper.installed;
        Self {
            engine,
            helper,
            all_installed,
        }
    }

    /// Names of binaries that are not installed
    pub fn missing(&self) -> Vec<String> {
        [&self.engine, &self.helper]
            .into_iter()
            .filter(|b| !b.installed)
            .map(|b| b.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_aliases() {
        assert_eq!(Network::from_param("http"), Some(Network::H2));
        assert_eq!(Network::from_param("kcp"), Some(Network::Mkcp));
        assert_eq!(Network::from_param("xhttp"), Some(Network::SplitHttp));
        assert_eq!(Network::from_param("WS"), Some(Network::Ws));
        assert_eq!(Network::from_param("carrier-pigeon"), None);
    }

    #[test]
    fn test_engine_names() {
        assert_eq!(Network::H2.engine_name(), "http");
        assert_eq!(Network::Mkcp.engine_name(), "kcp");
        assert_eq!(Network::SplitHttp.engine_name(), "splithttp");
    }

    #[test]
    fn test_supported_combinations() {
        for network in Network::ALL {
            assert!(is_supported(network, SecurityKind::None));
            assert!(is_supported(network, SecurityKind::Tls));
        }
        assert!(is_supported(Network::Tcp, SecurityKind::Reality));
        assert!(is_supported(Network::Grpc, SecurityKind::Reality));
        assert!(!is_supported(Network::Ws, SecurityKind::Reality));
        assert!(!is_supported(Network::Mkcp, SecurityKind::Reality));
    }

    #[test]
    fn test_connection_status_invariant() {
        let status = ConnectionStatus::connected(Mode::Tun, "MyServer");
        assert!(status.connected);
        assert_eq!(status.profile.as_deref(), Some("MyServer"));

        let status = ConnectionStatus::disconnected();
        assert!(!status.connected);
        assert!(status.profile.is_none());
        assert!(status.mode.is_none());
    }

    #[test]
    fn test_profile_json_shape() {
        let profile = Profile {
            name: "ws".into(),
            uuid: "b831381d-6324-4d53-ad4f-8cda48b30811".into(),
            address: "example.com".into(),
            port: 443,
            encryption: "none".into(),
            flow: None,
            transport: Transport::Ws {
                path: "/x".into(),
                host: None,
            },
            security: Security::Tls(TlsParams::default()),
            extra: BTreeMap::new(),
        };

        let value = serde_json::to_value(&profile).unwrap();
        assert_eq!(value["transport"]["type"], "ws");
        assert_eq!(value["transport"]["path"], "/x");
        assert_eq!(value["security"]["type"], "tls");
        assert!(value.get("extra").is_none());

        let back: Profile = serde_json::from_value(value).unwrap();
        assert_eq!(back, profile);
    }

    #[test]
    fn test_deps_status_missing() {
        let status = DepsStatus::new(
            BinaryStatus {
                name: "xray".into(),
                installed: true,
                version: "1.8.24".into(),
            },
            BinaryStatus {
                name: "tun2socks".into(),
                installed: false,
                version: "2.5.2".into(),
            },
        );
        assert!(!status.all_installed);
        assert_eq!(status.missing(), vec!["tun2socks".to_string()]);
    }
}

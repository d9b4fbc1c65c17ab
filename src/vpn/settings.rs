//! Process-wide connection settings.
//!
//! Numeric fields are clamped into their bounds both while deserializing
//! (so an edited store holding `70000` or `-1` still loads) and by
//! [`Settings::sanitize`] after any in-memory edit.

use std::fmt;
use std::ops::RangeInclusive;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Number;

pub const PORT_RANGE: RangeInclusive<u16> = 1024..=65535;
pub const MUX_CONCURRENCY_RANGE: RangeInclusive<u16> = 1..=16;
pub const TUN_MTU_RANGE: RangeInclusive<u16> = 1280..=9000;

pub const DEFAULT_SOCKS_PORT: u16 = 10808;
pub const DEFAULT_HTTP_PORT: u16 = 10809;
pub const DEFAULT_MUX_CONCURRENCY: u16 = 8;
pub const DEFAULT_TUN_MTU: u16 = 9000;
pub const DEFAULT_DNS: &str = "1.1.1.1";

/// Routing mode: full tunnel through the routing helper, or local listeners only
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Tun,
    Proxy,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Tun => "tun",
            Mode::Proxy => "proxy",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine log verbosity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    None,
    Error,
    #[default]
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::None => "none",
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }

    /// tun2socks spells "none" as "silent" and "warning" as "warn"
    pub fn helper_name(&self) -> &'static str {
        match self {
            LogLevel::None => "silent",
            LogLevel::Warning => "warn",
            other => other.as_str(),
        }
    }
}

/// Engine domain resolution strategy for routing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainStrategy {
    AsIs,
    #[default]
    IPIfNonMatch,
    IPOnDemand,
}

fn default_socks_port() -> u16 {
    DEFAULT_SOCKS_PORT
}

fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

fn default_mux_concurrency() -> u16 {
    DEFAULT_MUX_CONCURRENCY
}

fn default_tun_mtu() -> u16 {
    DEFAULT_TUN_MTU
}

fn default_dns() -> String {
    DEFAULT_DNS.to_string()
}

fn clamp_i64(value: i64, range: &RangeInclusive<u16>) -> u16 {
    value.clamp(i64::from(*range.start()), i64::from(*range.end())) as u16
}

/// Saturate any JSON number into `range`. Floats are rounded first.
fn clamp_number(number: &Number, range: &RangeInclusive<u16>) -> u16 {
    if let Some(value) = number.as_i64() {
        return clamp_i64(value, range);
    }
    if number.as_u64().is_some() {
        return *range.end();
    }
    match number.as_f64() {
        Some(value) if !value.is_nan() => {
            value.round().clamp(f64::from(*range.start()), f64::from(*range.end())) as u16
        }
        _ => *range.start(),
    }
}

fn bounded<'de, D: Deserializer<'de>>(
    deserializer: D,
    range: &RangeInclusive<u16>,
) -> Result<u16, D::Error> {
    Ok(clamp_number(&Number::deserialize(deserializer)?, range))
}

fn port<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    bounded(deserializer, &PORT_RANGE)
}

fn mux_concurrency<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    bounded(deserializer, &MUX_CONCURRENCY_RANGE)
}

fn tun_mtu<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    bounded(deserializer, &TUN_MTU_RANGE)
}

/// User-tunable settings layered onto every compiled profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "default_socks_port", deserialize_with = "port")]
    pub socks_port: u16,
    #[serde(default = "default_http_port", deserialize_with = "port")]
    pub http_port: u16,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub domain_strategy: DomainStrategy,
    #[serde(default)]
    pub allow_insecure: bool,
    #[serde(default)]
    pub mux_enabled: bool,
    /// Only meaningful when `mux_enabled`
    #[serde(default = "default_mux_concurrency", deserialize_with = "mux_concurrency")]
    pub mux_concurrency: u16,
    #[serde(default)]
    pub block_ads: bool,
    #[serde(default)]
    pub bypass_lan: bool,
    #[serde(default)]
    pub bypass_cn: bool,
    /// Upstream DNS server; empty means inherit system resolution
    #[serde(default = "default_dns")]
    pub custom_dns: String,
    #[serde(default = "default_tun_mtu", deserialize_with = "tun_mtu")]
    pub tun_mtu: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: Mode::Tun,
            socks_port: DEFAULT_SOCKS_PORT,
            http_port: DEFAULT_HTTP_PORT,
            log_level: LogLevel::Warning,
            domain_strategy: DomainStrategy::IPIfNonMatch,
            allow_insecure: false,
            mux_enabled: false,
            mux_concurrency: DEFAULT_MUX_CONCURRENCY,
            block_ads: false,
            bypass_lan: false,
            bypass_cn: false,
            custom_dns: default_dns(),
            tun_mtu: DEFAULT_TUN_MTU,
        }
    }
}

impl Settings {
    /// Clamp every bounded field into range and trim free-form strings
    pub fn sanitize(mut self) -> Self {
        self.socks_port = clamp_i64(i64::from(self.socks_port), &PORT_RANGE);
        self.http_port = clamp_i64(i64::from(self.http_port), &PORT_RANGE);
        self.mux_concurrency = clamp_i64(i64::from(self.mux_concurrency), &MUX_CONCURRENCY_RANGE);
        self.tun_mtu = clamp_i64(i64::from(self.tun_mtu), &TUN_MTU_RANGE);
        self.custom_dns = self.custom_dns.trim().to_string();
        self
    }

    /// Whether any routing toggle is on
    pub fn has_routing_rules(&self) -> bool {
        self.block_ads || self.bypass_lan || self.bypass_cn
    }

    /// Return a copy with `key` set to the JSON `value`, re-clamped.
    ///
    /// Used by the command surface for single-field edits; unknown keys and
    /// values of the wrong shape are rejected.
    pub fn with_field(&self, key: &str, value: serde_json::Value) -> Result<Self, serde_json::Error> {
        let mut map = match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        if !map.contains_key(key) {
            return Err(serde::de::Error::custom(format!("unknown setting: {key}")));
        }
        map.insert(key.to_string(), value);
        let updated: Settings = serde_json::from_value(serde_json::Value::Object(map))?;
        Ok(updated.sanitize())
    }
}

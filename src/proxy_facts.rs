//! Normalized facts about an observed proxy configuration.
//!
//! Configuration records come from stores that have used several field
//! spellings over time, so every fact is read through an ordered list of
//! candidate keys where the first non-empty value wins.

use std::fmt;

use serde_json::{Map, Value, json};

use crate::{
    desired_state::DesiredState,
    validate::{parse_host_port, port_from_json},
};

pub const LOCAL_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1"];
pub const PASSTHROUGH: &str = "localhost, 127.0.0.1, ::1";
pub const LOOPBACK_HOST: &str = "localhost";

const MODE_KEYS: &[&str] = &["proxyType", "proxy_type", "proxytype", "mode"];
const HOST_KEYS: &[&str] = &["socks", "socksHost", "socks_host", "sockshost"];
const PORT_KEYS: &[&str] = &["socksPort", "socks_port", "socksport", "port"];
const VERSION_KEYS: &[&str] = &["socksVersion", "socks_version", "socksversion", "version"];
const DNS_KEYS: &[&str] = &["proxyDNS", "proxyDns", "proxy_dns", "proxydns"];

/// Opaque proxy configuration record, as read from or written to a
/// configuration store.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProxyConfig(Map<String, Value>);

impl ProxyConfig {
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Non-object values yield an empty record (mode unknown).
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }

    pub fn direct() -> Self {
        Self::from_value(json!({ "proxyType": "none" }))
    }

    pub fn manual_socks5(port: u16, proxy_dns: bool) -> Self {
        Self::from_value(json!({
            "proxyType": "manual",
            "http": "",
            "httpPort": 0,
            "ssl": "",
            "sslPort": 0,
            "ftp": "",
            "ftpPort": 0,
            "shareProxySettings": false,
            "socks": LOOPBACK_HOST,
            "socksPort": port,
            "socksVersion": 5,
            "proxyDNS": proxy_dns,
            "passthrough": PASSTHROUGH,
        }))
    }

    fn lookup(&self, keys: &[&str]) -> Option<&Value> {
        self.lookup_with(keys, is_empty)
    }

    fn lookup_with(&self, keys: &[&str], empty: fn(&Value) -> bool) -> Option<&Value> {
        keys.iter()
            .filter_map(|key| self.0.get(*key))
            .find(|value| !empty(value))
    }

    pub fn facts(&self) -> ProxyFacts {
        let mode = match self.lookup(MODE_KEYS) {
            Some(Value::String(raw)) => ProxyMode::parse(raw),
            Some(other) => ProxyMode::Unknown(other.to_string()),
            None => ProxyMode::Unknown(String::new()),
        };

        let raw_host = match self.lookup(HOST_KEYS) {
            Some(Value::String(raw)) => Some(raw.trim().to_string()),
            Some(other) => Some(other.to_string()),
            None => None,
        };
        let parsed_host = raw_host.as_deref().map(parse_host_port);

        let port = match self.lookup_with(PORT_KEYS, is_empty_port) {
            Some(value) => port_from_json(value),
            None => parsed_host.as_ref().and_then(|parsed| parsed.port),
        };
        let host = parsed_host
            .map(|parsed| parsed.host)
            .filter(|host| !host.is_empty());

        let socks_version = match self.lookup(VERSION_KEYS) {
            None => SocksVersion::Absent,
            Some(value) if numeric(value) == Some(5.0) => SocksVersion::Five,
            Some(value) => SocksVersion::Other(value.to_string()),
        };

        let proxy_dns = self.lookup(DNS_KEYS).is_some_and(truthy);

        ProxyFacts {
            mode,
            host,
            port,
            socks_version,
            proxy_dns,
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        _ => false,
    }
}

/// A zero port means "unset" in records that carry placeholder ports.
fn is_empty_port(value: &Value) -> bool {
    is_empty(value) || matches!(value, Value::Number(number) if number.as_f64() == Some(0.0))
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Value::String(text) => !text.is_empty(),
        Value::Null => false,
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProxyMode {
    Off,
    Manual,
    System,
    AutoDetect,
    Pac,
    /// Raw mode string as reported; empty when the record carries none.
    Unknown(String),
}

impl ProxyMode {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "none" | "direct" | "off" => Self::Off,
            "manual" => Self::Manual,
            "system" => Self::System,
            "autoDetect" | "auto_detect" | "autodetect" => Self::AutoDetect,
            "autoConfig" | "auto_config" | "autoconfig" | "pac" => Self::Pac,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => formatter.write_str("off"),
            Self::Manual => formatter.write_str("manual"),
            Self::System => formatter.write_str("system"),
            Self::AutoDetect => formatter.write_str("auto-detect"),
            Self::Pac => formatter.write_str("pac"),
            Self::Unknown(raw) if raw.is_empty() => formatter.write_str("unknown"),
            Self::Unknown(raw) => write!(formatter, "unknown({raw})"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocksVersion {
    Absent,
    Five,
    Other(String),
}

impl SocksVersion {
    pub fn absent_or_five(&self) -> bool {
        matches!(self, Self::Absent | Self::Five)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyFacts {
    pub mode: ProxyMode,
    /// Lower-cased, without any `:port` suffix.
    pub host: Option<String>,
    pub port: Option<u16>,
    pub socks_version: SocksVersion,
    pub proxy_dns: bool,
}

impl ProxyFacts {
    pub fn host_is_local(&self) -> bool {
        self.host
            .as_deref()
            .is_some_and(|host| LOCAL_HOSTS.contains(&host))
    }
}

impl fmt::Display for ProxyFacts {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "mode={}", self.mode)?;
        if let Some(host) = &self.host {
            write!(formatter, " host={host}")?;
        }
        match self.port {
            Some(port) => write!(formatter, " port={port}")?,
            None => formatter.write_str(" port=?")?,
        }
        match &self.socks_version {
            SocksVersion::Absent => {}
            SocksVersion::Five => formatter.write_str(" socks=5")?,
            SocksVersion::Other(raw) => write!(formatter, " socks={raw}")?,
        }
        write!(formatter, " dns={}", self.proxy_dns)
    }
}

/// Manual, loopback host, SOCKS5 (or unspecified) and a usable port.
pub fn is_our_manual_proxy(config: &ProxyConfig) -> bool {
    let facts = config.facts();
    facts.mode == ProxyMode::Manual
        && facts.host_is_local()
        && facts.socks_version.absent_or_five()
        && facts.port.is_some()
}

pub fn matches_desired(config: &ProxyConfig, desired: &DesiredState) -> bool {
    if !desired.enabled {
        return false;
    }
    let facts = config.facts();
    facts.mode == ProxyMode::Manual
        && facts.port == Some(desired.port)
        && facts.proxy_dns == desired.dns_through_proxy
        && facts.socks_version.absent_or_five()
        && (facts.host.is_none() || facts.host_is_local())
}

/// Human-facing classification of a configuration relative to what the
/// user asked for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProxySummary {
    Off,
    MatchesDesired { port: u16, dns: bool },
    OursDifferent { port: u16, dns: bool },
    ForeignManual {
        host: Option<String>,
        port: Option<u16>,
        dns: bool,
    },
    System,
    AutoDetect,
    Pac,
    Unknown(String),
}

fn dns_suffix(dns: bool) -> &'static str {
    if dns { ", DNS" } else { "" }
}

impl fmt::Display for ProxySummary {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => formatter.write_str("Off (no proxy)"),
            Self::MatchesDesired { port, dns } => {
                write!(formatter, "On (SOCKS5 localhost:{port}{})", dns_suffix(*dns))
            }
            Self::OursDifferent { port, dns } => write!(
                formatter,
                "On (SOCKS5 localhost:{port}{}; differs from saved settings)",
                dns_suffix(*dns)
            ),
            Self::ForeignManual { host, port, dns } => {
                let host = host.as_deref().unwrap_or("?");
                match port {
                    Some(port) => write!(
                        formatter,
                        "On (foreign proxy {host}:{port}{})",
                        dns_suffix(*dns)
                    ),
                    None => write!(formatter, "On (foreign proxy {host}{})", dns_suffix(*dns)),
                }
            }
            Self::System => formatter.write_str("Use system proxy settings"),
            Self::AutoDetect => formatter.write_str("Auto-detect proxy settings"),
            Self::Pac => formatter.write_str("PAC URL"),
            Self::Unknown(raw) if raw.is_empty() => formatter.write_str("Unknown"),
            Self::Unknown(raw) => formatter.write_str(raw),
        }
    }
}

pub fn describe(config: &ProxyConfig, desired: &DesiredState) -> ProxySummary {
    let facts = config.facts();
    match facts.mode {
        ProxyMode::Off => ProxySummary::Off,
        ProxyMode::Manual => {
            if matches_desired(config, desired) {
                ProxySummary::MatchesDesired {
                    port: desired.port,
                    dns: desired.dns_through_proxy,
                }
            } else if let (true, Some(port)) = (is_our_manual_proxy(config), facts.port) {
                ProxySummary::OursDifferent {
                    port,
                    dns: facts.proxy_dns,
                }
            } else {
                ProxySummary::ForeignManual {
                    host: facts.host,
                    port: facts.port,
                    dns: facts.proxy_dns,
                }
            }
        }
        ProxyMode::System => ProxySummary::System,
        ProxyMode::AutoDetect => ProxySummary::AutoDetect,
        ProxyMode::Pac => ProxySummary::Pac,
        ProxyMode::Unknown(raw) => ProxySummary::Unknown(raw),
    }
}

/// Desired state implied by the live configuration at startup, if any.
///
/// Only an off store or one that looks like our own loopback SOCKS5 proxy
/// overrides the saved desired state. Any other configuration (including a
/// foreign manual proxy) leaves the saved state as it was.
pub fn reconcile_on_startup(config: &ProxyConfig, fallback: &DesiredState) -> Option<DesiredState> {
    let facts = config.facts();
    if facts.mode == ProxyMode::Off {
        return Some(fallback.with_enabled(false));
    }
    if is_our_manual_proxy(config) {
        return Some(DesiredState {
            enabled: true,
            port: facts.port.unwrap_or(fallback.port),
            dns_through_proxy: facts.proxy_dns,
        });
    }
    None
}

use std::net::Ipv6Addr;

use serde_json::Value;

pub const MIN_PORT: u32 = 1;
pub const MAX_PORT: u32 = 65535;

/// Returns `None` for anything that is not a whole number in `1..=65535`.
pub fn parse_port(raw: &str) -> Option<u16> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let number = trimmed.parse::<u32>().ok()?;
    port_in_range(i64::from(number))
}

/// Same rules as [`parse_port`] for values read out of an opaque record,
/// where a port may arrive as a JSON number or a string.
pub fn port_from_json(value: &Value) -> Option<u16> {
    match value {
        Value::Number(number) => {
            if let Some(integer) = number.as_i64() {
                return port_in_range(integer);
            }
            let float = number.as_f64()?;
            if float.fract() != 0.0 {
                return None;
            }
            port_in_range(float as i64)
        }
        Value::String(text) => parse_port(text),
        _ => None,
    }
}

pub fn port_in_range(value: i64) -> Option<u16> {
    if value < i64::from(MIN_PORT) || value > i64::from(MAX_PORT) {
        return None;
    }
    u16::try_from(value).ok()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: Option<u16>,
}

/// Splits `host:port`, `[v6]:port` or a bare host. A trailing segment that is
/// not a valid port leaves the whole string as the host. An unbracketed
/// IPv6 address is always host-only.
pub fn parse_host_port(raw: &str) -> HostPort {
    let trimmed = raw.trim();

    if let Some(rest) = trimmed.strip_prefix('[')
        && let Some((host, tail)) = rest.split_once(']')
    {
        if tail.is_empty() {
            return HostPort {
                host: host.to_lowercase(),
                port: None,
            };
        }
        if let Some(port) = tail.strip_prefix(':').and_then(parse_port) {
            return HostPort {
                host: host.to_lowercase(),
                port: Some(port),
            };
        }
        return host_only(trimmed);
    }

    if trimmed.parse::<Ipv6Addr>().is_ok() {
        return host_only(trimmed);
    }

    match trimmed.rsplit_once(':') {
        Some((host, tail)) => match parse_port(tail) {
            Some(port) => HostPort {
                host: host.to_lowercase(),
                port: Some(port),
            },
            None => host_only(trimmed),
        },
        None => host_only(trimmed),
    }
}

fn host_only(raw: &str) -> HostPort {
    HostPort {
        host: raw.to_lowercase(),
        port: None,
    }
}

//! Configuration store backed by GNOME's `org.gnome.system.proxy` schemas,
//! driven through the `gsettings` CLI.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::{CommandOutput, run_silent_with_output};
use crate::{
    error::StoreError,
    proxy_facts::{LOOPBACK_HOST, PASSTHROUGH, ProxyConfig, ProxyMode},
    store::{ConfigurationStore, ControlLevel, ProxySnapshot},
};

const PROXY_SCHEMA: &str = "org.gnome.system.proxy";
const SOCKS_SCHEMA: &str = "org.gnome.system.proxy.socks";
const CLEARED_PROTOCOLS: &[&str] = &["http", "https", "ftp"];

/// GSettings has no remote-DNS key, so the flag last written through this
/// store is kept here and reported back on reads.
pub struct GSettingsStore {
    proxy_dns: Mutex<bool>,
}

impl GSettingsStore {
    pub fn new(proxy_dns: bool) -> Self {
        Self {
            proxy_dns: Mutex::new(proxy_dns),
        }
    }

    pub fn is_available() -> bool {
        run_silent_with_output("gsettings", &["list-keys", PROXY_SCHEMA])
            .map(|output| output.success)
            .unwrap_or(false)
    }

    fn proxy_dns(&self) -> bool {
        *self.proxy_dns.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn gsettings(arguments: Vec<String>) -> Result<CommandOutput, StoreError> {
    tokio::task::spawn_blocking(move || {
        let borrowed: Vec<&str> = arguments.iter().map(String::as_str).collect();
        run_silent_with_output("gsettings", &borrowed)
    })
    .await
    .map_err(|error| StoreError::Backend(format!("gsettings task failed: {error}")))?
    .map_err(StoreError::Io)
}

async fn get_key(schema: &str, key: &str) -> Result<String, StoreError> {
    let output = gsettings(vec!["get".into(), schema.into(), key.into()]).await?;
    if !output.success {
        return Err(classify_failure(&output.stderr));
    }
    Ok(unquote(&output.stdout))
}

async fn set_key(schema: &str, key: &str, value: &str) -> Result<(), StoreError> {
    let output = gsettings(vec!["set".into(), schema.into(), key.into(), value.into()]).await?;
    if !output.success {
        log::warn!(
            "[gsettings] set {schema} {key} failed: {}",
            output.stderr.trim()
        );
        return Err(classify_failure(&output.stderr));
    }
    Ok(())
}

fn classify_failure(stderr: &str) -> StoreError {
    let lower = stderr.to_lowercase();
    if lower.contains("permission denied") {
        StoreError::PermissionDenied(stderr.trim().to_string())
    } else if lower.contains("not writable") {
        StoreError::NotControllable
    } else {
        StoreError::Backend(stderr.trim().to_string())
    }
}

/// `'manual'` -> `manual`, `uint32 1080` -> `1080`.
fn unquote(raw: &str) -> String {
    let trimmed = raw.trim();
    let value = trimmed.rsplit(' ').next().unwrap_or(trimmed);
    value.trim_matches('\'').to_string()
}

fn ignore_hosts_value() -> String {
    let hosts: Vec<String> = PASSTHROUGH
        .split(',')
        .map(|host| format!("'{}'", host.trim()))
        .collect();
    format!("[{}]", hosts.join(", "))
}

/// `None` when `gsettings` cannot be run at all.
async fn control_level() -> Option<ControlLevel> {
    let arguments = vec!["writable".into(), PROXY_SCHEMA.into(), "mode".into()];
    match gsettings(arguments).await {
        Ok(output) if output.success && output.stdout.trim() == "true" => {
            Some(ControlLevel::Controllable)
        }
        Ok(output) => {
            log::info!(
                "[gsettings] proxy mode is not writable ({})",
                output.stdout.trim()
            );
            Some(ControlLevel::NotControllable)
        }
        Err(error) => {
            log::warn!("[gsettings] cannot query writability: {error}");
            None
        }
    }
}

#[async_trait]
impl ConfigurationStore for GSettingsStore {
    fn name(&self) -> &str {
        "GSettings"
    }

    async fn get(&self) -> Result<ProxySnapshot, StoreError> {
        let Some(control) = control_level().await else {
            return Ok(ProxySnapshot {
                config: ProxyConfig::default(),
                control: ControlLevel::NotControllable,
            });
        };

        let mode = get_key(PROXY_SCHEMA, "mode").await?;
        let mut record = Map::new();
        match mode.as_str() {
            "none" => {
                record.insert("proxyType".into(), json!("none"));
            }
            "manual" => {
                record.insert("proxyType".into(), json!("manual"));
                record.insert("socks".into(), json!(get_key(SOCKS_SCHEMA, "host").await?));
                let port = get_key(SOCKS_SCHEMA, "port").await?;
                record.insert(
                    "socksPort".into(),
                    port.parse::<i64>().map(Value::from).unwrap_or(Value::String(port)),
                );
                record.insert("proxyDNS".into(), json!(self.proxy_dns()));
            }
            "auto" => {
                let url = get_key(PROXY_SCHEMA, "autoconfig-url").await?;
                let kind = if url.is_empty() { "autoDetect" } else { "autoConfig" };
                record.insert("proxyType".into(), json!(kind));
                record.insert("autoConfigUrl".into(), json!(url));
            }
            other => {
                record.insert("proxyType".into(), json!(other));
            }
        }

        let config = ProxyConfig::from_map(record);
        log::debug!("[gsettings] observed {}", config.facts());
        Ok(ProxySnapshot { config, control })
    }

    async fn set(&self, config: ProxyConfig) -> Result<(), StoreError> {
        let facts = config.facts();
        match facts.mode {
            ProxyMode::Off => {
                log::info!("[gsettings] clearing proxy settings");
                set_key(PROXY_SCHEMA, "mode", "none").await?;
                set_key(PROXY_SCHEMA, "use-same-proxy", "true").await?;
            }
            ProxyMode::Manual => {
                let host = facts.host.unwrap_or_else(|| LOOPBACK_HOST.to_string());
                let port = facts
                    .port
                    .ok_or_else(|| StoreError::Backend("manual proxy without a port".into()))?;
                log::info!(
                    "[gsettings] setting SOCKS5 proxy to {host}:{port} (dns={})",
                    facts.proxy_dns
                );

                set_key(SOCKS_SCHEMA, "host", &host).await?;
                set_key(SOCKS_SCHEMA, "port", &port.to_string()).await?;
                for protocol in CLEARED_PROTOCOLS {
                    let schema = format!("{PROXY_SCHEMA}.{protocol}");
                    set_key(&schema, "host", "").await?;
                    set_key(&schema, "port", "0").await?;
                }
                set_key(PROXY_SCHEMA, "use-same-proxy", "false").await?;
                set_key(PROXY_SCHEMA, "ignore-hosts", &ignore_hosts_value()).await?;
                *self.proxy_dns.lock().unwrap_or_else(PoisonError::into_inner) = facts.proxy_dns;
                set_key(PROXY_SCHEMA, "mode", "manual").await?;
            }
            other => {
                return Err(StoreError::Backend(format!(
                    "cannot write proxy mode {other} through GSettings"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unquotes_gsettings_output() {
        assert_eq!(unquote("'manual'\n"), "manual");
        assert_eq!(unquote("1080\n"), "1080");
        assert_eq!(unquote("uint32 1080"), "1080");
        assert_eq!(unquote("''\n"), "");
    }

    #[test]
    fn ignore_hosts_lists_loopback() {
        assert_eq!(ignore_hosts_value(), "['localhost', '127.0.0.1', '::1']");
    }

    #[test]
    fn classifies_cli_failures() {
        assert!(matches!(
            classify_failure("error: Permission denied"),
            StoreError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_failure("The key is not writable"),
            StoreError::NotControllable
        ));
        assert!(matches!(
            classify_failure("No such schema"),
            StoreError::Backend(_)
        ));
    }
}

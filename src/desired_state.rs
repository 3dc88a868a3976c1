use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{error::StoreError, validate::parse_port};

pub const DEFAULT_PORT: u16 = 1080;

/// What the user wants the proxy to look like, independent of what the
/// configuration store currently reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DesiredState {
    pub enabled: bool,
    pub port: u16,
    pub dns_through_proxy: bool,
}

impl Default for DesiredState {
    fn default() -> Self {
        Self {
            enabled: false,
            port: DEFAULT_PORT,
            dns_through_proxy: false,
        }
    }
}

impl DesiredState {
    pub fn with_enabled(self, enabled: bool) -> Self {
        Self { enabled, ..self }
    }

    pub fn with_port(self, port: u16) -> Self {
        Self { port, ..self }
    }

    pub fn with_dns(self, dns_through_proxy: bool) -> Self {
        Self {
            dns_through_proxy,
            ..self
        }
    }
}

/// Persistent key-value store for [`DesiredState`]. Last write wins, no
/// transactions.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, defaults: DesiredState) -> Result<DesiredState, StoreError>;

    async fn save(&self, state: &DesiredState) -> Result<(), StoreError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredPort {
    Number(i64),
    Text(String),
}

#[derive(Deserialize, Default)]
struct StoredRecord {
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    port: Option<StoredPort>,
    #[serde(default)]
    dns: Option<bool>,
}

#[derive(Serialize)]
struct SavedRecord {
    enabled: bool,
    port: u16,
    dns: bool,
}

impl StoredRecord {
    fn into_state(self, defaults: DesiredState) -> DesiredState {
        let port = match self.port {
            Some(StoredPort::Number(number)) => parse_port(&number.to_string()),
            Some(StoredPort::Text(text)) => parse_port(&text),
            None => None,
        };
        DesiredState {
            enabled: self.enabled.unwrap_or(defaults.enabled),
            port: port.unwrap_or(defaults.port),
            dns_through_proxy: self.dns.unwrap_or(defaults.dns_through_proxy),
        }
    }
}

pub struct TomlStateStore {
    path: PathBuf,
}

impl TomlStateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("socks-switch")
            .join("state.toml")
    }
}

#[async_trait]
impl StateStore for TomlStateStore {
    async fn load(&self, defaults: DesiredState) -> Result<DesiredState, StoreError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                log::info!(
                    "[state] no state file at {}, using defaults",
                    self.path.display()
                );
                return Ok(defaults);
            }
            Err(error) => return Err(StoreError::Io(error)),
        };

        match toml::from_str::<StoredRecord>(&content) {
            Ok(record) => {
                let state = record.into_state(defaults);
                log::info!("[state] loaded {:?} from {}", state, self.path.display());
                Ok(state)
            }
            Err(error) => {
                log::warn!("[state] failed to parse {}: {error}", self.path.display());
                Ok(defaults)
            }
        }
    }

    async fn save(&self, state: &DesiredState) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let record = SavedRecord {
            enabled: state.enabled,
            port: state.port,
            dns: state.dns_through_proxy,
        };
        let content = toml::to_string_pretty(&record)
            .map_err(|error| StoreError::Backend(format!("failed to serialize state: {error}")))?;
        tokio::fs::write(&self.path, content).await?;
        log::debug!("[state] saved {:?} to {}", state, self.path.display());
        Ok(())
    }
}

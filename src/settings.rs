use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Tunables read from `settings.toml`. Every field has a default so a
/// partial file is fine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Settings {
    #[serde(default = "default_probe_url")]
    pub probe_url: String,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_port_debounce_ms")]
    pub port_debounce_ms: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_verify_delays_ms")]
    pub verify_delays_ms: Vec<u64>,
    #[serde(default = "default_permission_help_url")]
    pub permission_help_url: Option<String>,
}

fn default_probe_url() -> String {
    "https://www.gstatic.com/generate_204".into()
}

fn default_probe_timeout_ms() -> u64 {
    2500
}

fn default_port_debounce_ms() -> u64 {
    180
}

fn default_settle_delay_ms() -> u64 {
    150
}

fn default_verify_delays_ms() -> Vec<u64> {
    vec![0, 30, 60, 120, 240]
}

fn default_permission_help_url() -> Option<String> {
    Some("https://wiki.gnome.org/Projects/dconf/SystemAdministrators".into())
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            probe_url: default_probe_url(),
            probe_timeout_ms: default_probe_timeout_ms(),
            port_debounce_ms: default_port_debounce_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            verify_delays_ms: default_verify_delays_ms(),
            permission_help_url: default_permission_help_url(),
        }
    }
}

impl Settings {
    pub fn settings_file_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("socks-switch")
            .join("settings.toml")
    }

    pub fn load() -> Self {
        Self::load_from(&Self::settings_file_path())
    }

    pub fn load_from(path: &std::path::Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content).unwrap_or_else(|error| {
                log::warn!("[settings] failed to parse {}: {error}", path.display());
                Self::default()
            }),
            Err(_) => {
                log::info!(
                    "[settings] no settings file at {}, using defaults",
                    path.display()
                );
                Self::default()
            }
        }
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        let mut settings: Self = toml::from_str(content)?;
        if settings.verify_delays_ms.is_empty() {
            settings.verify_delays_ms = default_verify_delays_ms();
        }
        Ok(settings)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn port_debounce(&self) -> Duration {
        Duration::from_millis(self.port_debounce_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn verify_delays(&self) -> Vec<Duration> {
        self.verify_delays_ms
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect()
    }
}

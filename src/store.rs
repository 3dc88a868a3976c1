use async_trait::async_trait;

use crate::{error::StoreError, proxy_facts::ProxyConfig};

/// Who is allowed to change the proxy configuration right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlLevel {
    Controllable,
    ControlledByOther,
    NotControllable,
}

impl ControlLevel {
    pub fn allows_apply(&self) -> bool {
        matches!(self, Self::Controllable)
    }
}

#[derive(Clone, Debug)]
pub struct ProxySnapshot {
    pub config: ProxyConfig,
    pub control: ControlLevel,
}

/// External, eventually-consistent proxy configuration.
///
/// `set` may return before the change is visible; callers confirm by
/// reading back with `get`.
#[async_trait]
pub trait ConfigurationStore: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self) -> Result<ProxySnapshot, StoreError>;

    async fn set(&self, config: ProxyConfig) -> Result<(), StoreError>;
}

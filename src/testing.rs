//! In-memory collaborators for unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Semaphore, oneshot};

use crate::{
    desired_state::{DesiredState, StateStore},
    error::StoreError,
    probe::{ProbeCompletion, ProbeId, ProbeKey, ProbeRequest, ProbeResource},
    proxy_facts::{ProxyConfig, ProxyMode},
    store::{ConfigurationStore, ControlLevel, ProxySnapshot},
};

struct FakeStoreInner {
    visible: ProxyConfig,
    control: ControlLevel,
    /// Written config plus how many more reads keep returning the old one.
    pending: Option<(ProxyConfig, usize)>,
    lag: usize,
    frozen: bool,
    deny_writes: bool,
    gated: bool,
    writes: Vec<ProxyConfig>,
    reads: usize,
    set_calls: usize,
}

pub struct FakeStore {
    inner: Mutex<FakeStoreInner>,
    gate: Semaphore,
}

impl FakeStore {
    pub fn new(initial: ProxyConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(FakeStoreInner {
                visible: initial,
                control: ControlLevel::Controllable,
                pending: None,
                lag: 0,
                frozen: false,
                deny_writes: false,
                gated: false,
                writes: Vec::new(),
                reads: 0,
                set_calls: 0,
            }),
            gate: Semaphore::new(0),
        })
    }

    pub fn set_lag(&self, reads: usize) {
        self.inner.lock().unwrap().lag = reads;
    }

    /// Accept writes but never show them.
    pub fn freeze(&self) {
        self.inner.lock().unwrap().frozen = true;
    }

    pub fn deny_writes(&self) {
        self.inner.lock().unwrap().deny_writes = true;
    }

    pub fn set_control(&self, control: ControlLevel) {
        self.inner.lock().unwrap().control = control;
    }

    /// Hold every `set` until [`FakeStore::release`] hands out permits.
    pub fn hold_writes(&self) {
        self.inner.lock().unwrap().gated = true;
    }

    pub fn release(&self, writes: usize) {
        self.gate.add_permits(writes);
    }

    pub fn writes(&self) -> Vec<ProxyConfig> {
        self.inner.lock().unwrap().writes.clone()
    }

    pub fn reads(&self) -> usize {
        self.inner.lock().unwrap().reads
    }

    pub fn set_calls(&self) -> usize {
        self.inner.lock().unwrap().set_calls
    }
}

#[async_trait]
impl ConfigurationStore for FakeStore {
    fn name(&self) -> &str {
        "fake"
    }

    async fn get(&self) -> Result<ProxySnapshot, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.reads += 1;
        match inner.pending.take() {
            Some((config, 0)) => inner.visible = config,
            Some((config, remaining)) => inner.pending = Some((config, remaining - 1)),
            None => {}
        }
        Ok(ProxySnapshot {
            config: inner.visible.clone(),
            control: inner.control,
        })
    }

    async fn set(&self, config: ProxyConfig) -> Result<(), StoreError> {
        let gated = {
            let mut inner = self.inner.lock().unwrap();
            inner.set_calls += 1;
            inner.gated
        };
        if gated {
            self.gate.acquire().await.unwrap().forget();
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.deny_writes {
            return Err(StoreError::PermissionDenied("writes are locked".into()));
        }
        inner.writes.push(config.clone());
        if inner.frozen {
            return Ok(());
        }
        if inner.lag == 0 {
            inner.visible = config;
        } else {
            let lag = inner.lag;
            inner.pending = Some((config, lag));
        }
        Ok(())
    }
}

/// `None` for an "off" write, the SOCKS port otherwise.
pub fn written_ports(writes: &[ProxyConfig]) -> Vec<Option<u16>> {
    writes
        .iter()
        .map(|config| {
            let facts = config.facts();
            match facts.mode {
                ProxyMode::Off => None,
                _ => facts.port,
            }
        })
        .collect()
}

#[derive(Default)]
pub struct MemoryStateStore {
    saved: Mutex<Option<DesiredState>>,
}

impl MemoryStateStore {
    pub fn with(state: DesiredState) -> Arc<Self> {
        Arc::new(Self {
            saved: Mutex::new(Some(state)),
        })
    }

    pub fn saved(&self) -> Option<DesiredState> {
        *self.saved.lock().unwrap()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, defaults: DesiredState) -> Result<DesiredState, StoreError> {
        Ok(self.saved.lock().unwrap().unwrap_or(defaults))
    }

    async fn save(&self, state: &DesiredState) -> Result<(), StoreError> {
        *self.saved.lock().unwrap() = Some(*state);
        Ok(())
    }
}

#[derive(Default)]
struct FakeProbeInner {
    requests: Vec<(ProbeKey, Option<oneshot::Sender<ProbeCompletion>>)>,
    destroyed: Vec<ProbeId>,
    fail_next: Option<String>,
}

/// Probe resource completed by hand. Ids are allocated 0, 1, 2, …
#[derive(Default)]
pub struct FakeProbe {
    inner: Mutex<FakeProbeInner>,
}

impl FakeProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_create(&self, reason: &str) {
        self.inner.lock().unwrap().fail_next = Some(reason.to_string());
    }

    pub fn complete(&self, index: usize, completion: ProbeCompletion) {
        let sender = self
            .inner
            .lock()
            .unwrap()
            .requests
            .get_mut(index)
            .and_then(|(_, sender)| sender.take());
        if let Some(sender) = sender {
            let _ = sender.send(completion);
        }
    }

    pub fn requested_keys(&self) -> Vec<ProbeKey> {
        self.inner
            .lock()
            .unwrap()
            .requests
            .iter()
            .map(|(key, _)| *key)
            .collect()
    }

    pub fn destroyed(&self) -> Vec<ProbeId> {
        self.inner.lock().unwrap().destroyed.clone()
    }
}

impl ProbeResource for FakeProbe {
    fn create(&self, _url: &str, key: ProbeKey) -> Result<ProbeRequest, String> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(reason) = inner.fail_next.take() {
            return Err(reason);
        }
        let (sender, completion) = oneshot::channel();
        let id = ProbeId(inner.requests.len() as u64);
        inner.requests.push((key, Some(sender)));
        Ok(ProbeRequest { id, completion })
    }

    fn destroy(&self, id: ProbeId) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.destroyed.contains(&id) {
            inner.destroyed.push(id);
        }
    }
}

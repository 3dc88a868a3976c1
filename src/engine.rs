use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use crate::{
    apply_queue::ApplyQueue,
    converge::{ApplyTiming, Reconciler},
    debounce::Debouncer,
    desired_state::{DesiredState, StateStore},
    error::ReconcileError,
    probe::{ProbeResource, ProbeSupervisor},
    proxy_facts::{describe, reconcile_on_startup},
    settings::Settings,
    status::{ErrorNotice, Reachability, StatusHandle, StatusSnapshot},
    store::{ConfigurationStore, ControlLevel},
    validate::parse_port,
};

/// Entry point for the presentation layer: feed user intent in, read status
/// out through [`Engine::subscribe`].
pub struct Engine {
    desired: Mutex<DesiredState>,
    state_store: Arc<dyn StateStore>,
    store: Arc<dyn ConfigurationStore>,
    queue: ApplyQueue,
    probes: Arc<ProbeSupervisor>,
    status: StatusHandle,
    port_debounce: Debouncer,
}

impl Engine {
    pub fn new(
        store: Arc<dyn ConfigurationStore>,
        state_store: Arc<dyn StateStore>,
        probe: Arc<dyn ProbeResource>,
        settings: &Settings,
    ) -> Arc<Self> {
        let status = StatusHandle::new(settings.permission_help_url.clone());
        let probes = ProbeSupervisor::new(
            probe,
            status.clone(),
            settings.probe_url.clone(),
            settings.probe_timeout(),
        );
        let reconciler = Reconciler::new(
            store.clone(),
            probes.clone(),
            status.clone(),
            ApplyTiming::from(settings),
        );
        let queue = ApplyQueue::new(Arc::new(reconciler), status.clone());

        Arc::new(Self {
            desired: Mutex::new(DesiredState::default()),
            state_store,
            store,
            queue,
            probes,
            status,
            port_debounce: Debouncer::new(settings.port_debounce()),
        })
    }

    pub fn desired(&self) -> DesiredState {
        *self.desired.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, change: impl FnOnce(DesiredState) -> DesiredState) -> DesiredState {
        let mut desired = self.desired.lock().unwrap_or_else(PoisonError::into_inner);
        *desired = change(*desired);
        *desired
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    async fn persist(&self, desired: &DesiredState) {
        if let Err(error) = self.state_store.save(desired).await {
            log::warn!("[state] failed to persist {desired:?}: {error}");
        }
    }

    /// Loads the saved desired state and reconciles it once against the live
    /// configuration. Nothing is written to the configuration store.
    pub async fn start(&self) -> DesiredState {
        let saved = match self.state_store.load(DesiredState::default()).await {
            Ok(saved) => saved,
            Err(error) => {
                log::warn!("[startup] failed to load desired state: {error}");
                DesiredState::default()
            }
        };
        self.update(|_| saved);

        let snapshot = match self.store.get().await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                let error = ReconcileError::from(error);
                log::warn!("[startup] failed to read proxy settings: {error}");
                self.status.report_failure(&error);
                return saved;
            }
        };

        match snapshot.control {
            ControlLevel::Controllable => {}
            ControlLevel::NotControllable => {
                self.status.set_error(ErrorNotice::plain(
                    "Proxy settings are not controllable in this context.",
                ));
            }
            ControlLevel::ControlledByOther => {
                let error = ReconcileError::ControlLevelDenied(ControlLevel::ControlledByOther);
                self.status.set_error(self.status.notice_for(&error));
            }
        }

        let mut desired = saved;
        if let Some(synced) = reconcile_on_startup(&snapshot.config, &saved)
            && synced != saved
        {
            log::info!("[startup] resynced desired state from {}: {synced:?}", self.store.name());
            desired = self.update(|_| synced);
            self.persist(&desired).await;
        }

        let summary = describe(&snapshot.config, &desired);
        log::info!("[startup] current proxy: {summary}");
        self.status.set_text(summary.to_string());
        desired
    }

    /// Any pending port edit is folded into this apply.
    pub async fn set_enabled(&self, enabled: bool) {
        let desired = self.update(|desired| desired.with_enabled(enabled));
        self.persist(&desired).await;
        self.port_debounce.cancel();
        if !enabled {
            self.probes.cancel();
            self.status.set_reachability(Reachability::None);
        }
        self.queue.request(desired);
    }

    pub async fn set_dns(&self, proxy_dns: bool) {
        let desired = self.update(|desired| desired.with_dns(proxy_dns));
        self.persist(&desired).await;
        if desired.enabled {
            self.port_debounce.cancel();
            self.queue.request(desired);
        }
    }

    /// Handles an edit of the port field. A valid port is saved right away and
    /// applied after the debounce delay, if the proxy is still enabled then.
    pub async fn set_port_input(self: &Arc<Self>, raw: &str) -> Result<u16, ReconcileError> {
        let Some(port) = parse_port(raw) else {
            self.port_debounce.cancel();
            let error = ReconcileError::InvalidPort(raw.trim().to_string());
            self.status.report_failure(&error);
            return Err(error);
        };

        self.status.clear_error();
        let desired = self.update(|desired| desired.with_port(port));
        self.persist(&desired).await;

        let engine = Arc::clone(self);
        self.port_debounce.schedule(async move {
            let desired = engine.desired();
            if desired.enabled {
                engine.queue.request(desired);
            }
        });
        Ok(port)
    }

    /// Text the port field should show once editing ends: the input if it is a
    /// valid port, otherwise the last accepted one.
    pub fn normalize_port_field(&self, raw: &str) -> String {
        if parse_port(raw).is_some() {
            return raw.trim().to_string();
        }
        self.status.clear_error();
        self.desired().port.to_string()
    }

    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }

    pub fn shutdown(&self) {
        log::info!("[engine] shutting down");
        self.port_debounce.cancel();
        self.probes.cancel();
    }
}

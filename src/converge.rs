//! Apply-and-verify: push a desired state to the configuration store and poll
//! until the store reflects it.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    apply_queue::Applier,
    desired_state::DesiredState,
    error::ReconcileError,
    probe::{ProbeKey, ProbeSupervisor},
    proxy_facts::{ProxyConfig, ProxyFacts, ProxyMode, ProxySummary},
    settings::Settings,
    status::{Reachability, StatusHandle},
    store::ConfigurationStore,
    validate::port_in_range,
};

#[derive(Clone, Debug)]
pub struct ApplyTiming {
    /// Wait between writing "off" and the new manual configuration when the
    /// port changes in place.
    pub settle_delay: Duration,
    /// Delay before each verification read; its length is the attempt budget.
    pub verify_delays: Vec<Duration>,
}

impl Default for ApplyTiming {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for ApplyTiming {
    fn from(settings: &Settings) -> Self {
        Self {
            settle_delay: settings.settle_delay(),
            verify_delays: settings.verify_delays(),
        }
    }
}

pub struct Reconciler {
    store: Arc<dyn ConfigurationStore>,
    probes: Arc<ProbeSupervisor>,
    status: StatusHandle,
    timing: ApplyTiming,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ConfigurationStore>,
        probes: Arc<ProbeSupervisor>,
        status: StatusHandle,
        timing: ApplyTiming,
    ) -> Self {
        Self {
            store,
            probes,
            status,
            timing,
        }
    }

    async fn verify(&self, desired: &DesiredState) -> Result<ProxyFacts, ReconcileError> {
        let mut last_observed = None;
        for (attempt, delay) in self.timing.verify_delays.iter().enumerate() {
            if !delay.is_zero() {
                tokio::time::sleep(*delay).await;
            }
            let snapshot = self.store.get().await?;
            let facts = snapshot.config.facts();
            log::debug!(
                "[verify] attempt {} via {}: {facts}",
                attempt + 1,
                self.store.name()
            );
            if facts.mode == ProxyMode::Manual
                && facts.port == Some(desired.port)
                && facts.proxy_dns == desired.dns_through_proxy
            {
                log::info!("[verify] converged on attempt {}", attempt + 1);
                return Ok(facts);
            }
            last_observed = Some(facts);
        }

        Err(ReconcileError::ApplyNotConverged {
            port: desired.port,
            dns: desired.dns_through_proxy,
            last_observed: last_observed
                .map(|facts| facts.to_string())
                .unwrap_or_else(|| "nothing".into()),
        })
    }
}

#[async_trait]
impl Applier for Reconciler {
    async fn apply(&self, desired: DesiredState) -> Result<(), ReconcileError> {
        self.status.clear_error();
        self.status.set_text("Applying…");

        let current = self.store.get().await?;
        if !current.control.allows_apply() {
            return Err(ReconcileError::ControlLevelDenied(current.control));
        }

        if !desired.enabled {
            self.store.set(ProxyConfig::direct()).await?;
            self.probes.cancel();
            self.status.set_reachability(Reachability::None);
            self.status.set_text(ProxySummary::Off.to_string());
            log::info!("[apply] proxy switched off via {}", self.store.name());
            return Ok(());
        }

        let port = port_in_range(i64::from(desired.port))
            .ok_or_else(|| ReconcileError::InvalidPort(desired.port.to_string()))?;
        let desired = desired.with_port(port);

        let observed = current.config.facts();
        if observed.mode == ProxyMode::Manual && observed.port.is_some_and(|old| old != port) {
            log::info!(
                "[apply] port changing {} -> {port}, switching off first",
                observed.port.unwrap_or_default()
            );
            self.store.set(ProxyConfig::direct()).await?;
            tokio::time::sleep(self.timing.settle_delay).await;
        }

        self.store
            .set(ProxyConfig::manual_socks5(port, desired.dns_through_proxy))
            .await?;

        let facts = self.verify(&desired).await?;
        let port = facts.port.unwrap_or(port);
        self.status.set_text(
            ProxySummary::MatchesDesired {
                port,
                dns: facts.proxy_dns,
            }
            .to_string(),
        );

        self.probes.start(ProbeKey {
            port,
            proxy_dns: facts.proxy_dns,
        });
        Ok(())
    }
}

//! Reachability probing through the applied proxy.
//!
//! Every session gets the next value of a monotonic sequence counter. Only the
//! session whose sequence is still current may publish a result; anything a
//! superseded session reports afterwards is dropped.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{sync::oneshot, task::JoinHandle};

use crate::status::{Reachability, StatusHandle};

/// The proxy configuration a probe session is verifying.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProbeKey {
    pub port: u16,
    pub proxy_dns: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProbeId(pub u64);

/// The single terminal event a probe resource emits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeCompletion {
    Navigated { final_url: String },
    Failed(String),
}

pub struct ProbeRequest {
    pub id: ProbeId,
    pub completion: oneshot::Receiver<ProbeCompletion>,
}

/// A throwaway outbound request. `destroy` must be idempotent and safe to
/// call after completion.
pub trait ProbeResource: Send + Sync {
    fn create(&self, url: &str, key: ProbeKey) -> Result<ProbeRequest, String>;

    fn destroy(&self, id: ProbeId);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ok,
    Failed(String),
    TimedOut,
}

struct ActiveSession {
    sequence: u64,
    key: ProbeKey,
    request: Option<ProbeId>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct SupervisorState {
    sequence: u64,
    active: Option<ActiveSession>,
    /// Key that has reported `Ok` since it last changed.
    proven: Option<ProbeKey>,
}

pub struct ProbeSupervisor {
    resource: Arc<dyn ProbeResource>,
    status: StatusHandle,
    url: String,
    timeout: Duration,
    state: Mutex<SupervisorState>,
}

impl ProbeSupervisor {
    pub fn new(
        resource: Arc<dyn ProbeResource>,
        status: StatusHandle,
        url: String,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            resource,
            status,
            url,
            timeout,
            state: Mutex::new(SupervisorState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current_sequence(&self) -> u64 {
        self.state().sequence
    }

    /// Starts a session for `key`, superseding whatever session was running.
    /// Returns the new session's sequence number.
    pub fn start(self: &Arc<Self>, key: ProbeKey) -> u64 {
        let mut state = self.state();
        let stale = state.active.take();
        state.sequence += 1;
        let sequence = state.sequence;

        if state.proven != Some(key) {
            state.proven = None;
            self.status.set_reachability(Reachability::Loading);
        }

        let task = tokio::spawn(self.clone().run_session(sequence, key));
        state.active = Some(ActiveSession {
            sequence,
            key,
            request: None,
            task,
        });
        drop(state);

        log::info!(
            "[probe] session #{sequence} started for port {} (dns={})",
            key.port,
            key.proxy_dns
        );
        if let Some(stale) = stale {
            self.release(stale);
        }
        sequence
    }

    /// Cancels the running session, if any. Nothing it reports later is
    /// published.
    pub fn cancel(&self) {
        let mut state = self.state();
        state.sequence += 1;
        let stale = state.active.take();
        drop(state);

        if let Some(stale) = stale {
            self.release(stale);
        }
    }

    fn release(&self, session: ActiveSession) {
        log::debug!(
            "[probe] cancelling session #{} (port {})",
            session.sequence,
            session.key.port
        );
        session.task.abort();
        if let Some(id) = session.request {
            self.resource.destroy(id);
        }
    }

    async fn run_session(self: Arc<Self>, sequence: u64, key: ProbeKey) {
        let request = match self.resource.create(&self.url, key) {
            Ok(request) => request,
            Err(reason) => {
                log::warn!("[probe] session #{sequence}: could not create probe: {reason}");
                self.finish(sequence, key, ProbeOutcome::Failed(reason));
                return;
            }
        };
        let id = request.id;

        {
            let mut state = self.state();
            match state.active.as_mut() {
                Some(active) if active.sequence == sequence => active.request = Some(id),
                _ => {
                    drop(state);
                    self.resource.destroy(id);
                    return;
                }
            }
        }

        let outcome = match tokio::time::timeout(self.timeout, request.completion).await {
            Ok(Ok(ProbeCompletion::Navigated { final_url })) if final_url.starts_with(&self.url) => {
                ProbeOutcome::Ok
            }
            Ok(Ok(ProbeCompletion::Navigated { final_url })) => {
                ProbeOutcome::Failed(format!("redirected to {final_url}"))
            }
            Ok(Ok(ProbeCompletion::Failed(reason))) => ProbeOutcome::Failed(reason),
            Ok(Err(_)) => ProbeOutcome::Failed("probe ended without a result".into()),
            Err(_) => ProbeOutcome::TimedOut,
        };

        self.resource.destroy(id);
        self.finish(sequence, key, outcome);
    }

    fn finish(&self, sequence: u64, key: ProbeKey, outcome: ProbeOutcome) {
        let mut state = self.state();
        if state.sequence != sequence {
            log::debug!(
                "[probe] discarding {outcome:?} from stale session #{sequence} (current #{})",
                state.sequence
            );
            return;
        }
        state.active = None;

        match outcome {
            ProbeOutcome::Ok => {
                log::info!("[probe] session #{sequence}: port {} reachable", key.port);
                state.proven = Some(key);
                self.status.set_reachability(Reachability::Ok);
            }
            failure if state.proven == Some(key) => {
                log::info!(
                    "[probe] session #{sequence}: {failure:?} suppressed, port {} proved reachable before",
                    key.port
                );
                self.status.set_reachability(Reachability::Ok);
            }
            failure => {
                log::warn!("[probe] session #{sequence}: port {} {failure:?}", key.port);
                self.status.set_reachability(Reachability::Fail);
            }
        }
    }
}

/// Probe resource that fetches the probe URL with `reqwest` through the
/// local SOCKS5 proxy. `socks5h` is used when DNS goes through the proxy.
pub struct HttpProbe {
    timeout: Duration,
    next_id: AtomicU64,
    in_flight: Mutex<HashMap<ProbeId, JoinHandle<()>>>,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            next_id: AtomicU64::new(1),
            in_flight: Mutex::new(HashMap::new()),
        }
    }
}

impl ProbeResource for HttpProbe {
    fn create(&self, url: &str, key: ProbeKey) -> Result<ProbeRequest, String> {
        let scheme = if key.proxy_dns { "socks5h" } else { "socks5" };
        let proxy = reqwest::Proxy::all(format!("{scheme}://localhost:{}", key.port))
            .map_err(|error| format!("invalid proxy address: {error}"))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .build()
            .map_err(|error| format!("failed to build HTTP client: {error}"))?;

        let id = ProbeId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, completion) = oneshot::channel();
        let url = url.to_string();

        log::debug!("[probe] GET {url} via {scheme}://localhost:{}", key.port);
        let task = tokio::spawn(async move {
            let result = match client.get(&url).send().await {
                Ok(response) => ProbeCompletion::Navigated {
                    final_url: response.url().to_string(),
                },
                Err(error) => ProbeCompletion::Failed(error.to_string()),
            };
            let _ = sender.send(result);
        });

        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, task);
        Ok(ProbeRequest { id, completion })
    }

    fn destroy(&self, id: ProbeId) {
        if let Some(task) = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
        {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProbe;

    const PROBE_URL: &str = "https://probe.test/generate_204";

    fn supervisor() -> (Arc<ProbeSupervisor>, Arc<FakeProbe>, StatusHandle) {
        let status = StatusHandle::new(None);
        let probe = FakeProbe::new();
        let supervisor = ProbeSupervisor::new(
            probe.clone(),
            status.clone(),
            PROBE_URL.into(),
            Duration::from_millis(2500),
        );
        (supervisor, probe, status)
    }

    fn key(port: u16) -> ProbeKey {
        ProbeKey {
            port,
            proxy_dns: false,
        }
    }

    fn ok() -> ProbeCompletion {
        ProbeCompletion::Navigated {
            final_url: PROBE_URL.into(),
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn successful_navigation_reports_ok_and_releases_resource() {
        let (supervisor, probe, status) = supervisor();
        let sequence = supervisor.start(key(8080));
        settle().await;
        assert_eq!(status.snapshot().reachability, Reachability::Loading);

        probe.complete(0, ok());
        settle().await;

        assert_eq!(status.snapshot().reachability, Reachability::Ok);
        assert_eq!(supervisor.current_sequence(), sequence);
        assert_eq!(probe.destroyed(), vec![ProbeId(0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn redirect_elsewhere_counts_as_failure() {
        let (supervisor, probe, status) = supervisor();
        supervisor.start(key(8080));
        settle().await;
        probe.complete(
            0,
            ProbeCompletion::Navigated {
                final_url: "https://captive.portal/login".into(),
            },
        );
        settle().await;
        assert_eq!(status.snapshot().reachability, Reachability::Fail);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_session_fences_out_the_older_one() {
        let (supervisor, probe, status) = supervisor();
        let first = supervisor.start(key(1080));
        settle().await;
        let second = supervisor.start(key(1081));
        settle().await;
        assert!(second > first);
        assert_eq!(probe.requested_keys(), vec![key(1080), key(1081)]);
        assert!(probe.destroyed().contains(&ProbeId(0)));

        probe.complete(1, ProbeCompletion::Failed("connection refused".into()));
        settle().await;
        assert_eq!(status.snapshot().reachability, Reachability::Fail);

        probe.complete(0, ok());
        settle().await;
        assert_eq!(status.snapshot().reachability, Reachability::Fail);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_the_session() {
        let (supervisor, probe, status) = supervisor();
        supervisor.start(key(8080));
        tokio::time::sleep(Duration::from_millis(3000)).await;

        assert_eq!(status.snapshot().reachability, Reachability::Fail);
        assert_eq!(probe.destroyed(), vec![ProbeId(0)]);

        probe.complete(0, ok());
        settle().await;
        assert_eq!(status.snapshot().reachability, Reachability::Fail);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_after_success_on_same_key_is_suppressed() {
        let (supervisor, probe, status) = supervisor();
        supervisor.start(key(8080));
        settle().await;
        probe.complete(0, ok());
        settle().await;

        supervisor.start(key(8080));
        settle().await;
        assert_eq!(status.snapshot().reachability, Reachability::Ok);
        probe.complete(1, ProbeCompletion::Failed("slow".into()));
        settle().await;
        assert_eq!(status.snapshot().reachability, Reachability::Ok);

        supervisor.start(key(9090));
        settle().await;
        probe.complete(2, ProbeCompletion::Failed("refused".into()));
        settle().await;
        assert_eq!(status.snapshot().reachability, Reachability::Fail);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_discards_later_result() {
        let (supervisor, probe, status) = supervisor();
        supervisor.start(key(8080));
        settle().await;
        supervisor.cancel();
        status.set_reachability(Reachability::None);

        probe.complete(0, ok());
        settle().await;

        assert_eq!(status.snapshot().reachability, Reachability::None);
        assert_eq!(probe.destroyed(), vec![ProbeId(0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn creation_failure_reports_fail() {
        let (supervisor, probe, status) = supervisor();
        probe.fail_next_create("no network");
        supervisor.start(key(8080));
        settle().await;
        assert_eq!(status.snapshot().reachability, Reachability::Fail);
        assert!(probe.destroyed().is_empty());
    }
}

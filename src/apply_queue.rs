//! Single-flight apply queue.
//!
//! At most one apply runs at a time. Requests made while it runs overwrite a
//! single pending slot, so a burst of edits collapses into one follow-up
//! apply carrying the latest desired state.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::{desired_state::DesiredState, error::ReconcileError, status::StatusHandle};

#[async_trait]
pub trait Applier: Send + Sync + 'static {
    async fn apply(&self, desired: DesiredState) -> Result<(), ReconcileError>;
}

#[derive(Default)]
struct Slot {
    pending: Option<DesiredState>,
    in_flight: bool,
}

struct Shared {
    slot: Mutex<Slot>,
    idle: Notify,
    applier: Arc<dyn Applier>,
    status: StatusHandle,
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct ApplyQueue {
    shared: Arc<Shared>,
}

impl ApplyQueue {
    pub fn new(applier: Arc<dyn Applier>, status: StatusHandle) -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::default()),
                idle: Notify::new(),
                applier,
                status,
            }),
        }
    }

    /// Non-blocking. Replaces any request that has not started yet.
    pub fn request(&self, desired: DesiredState) {
        let mut slot = self.shared.slot();
        if let Some(replaced) = slot.pending.replace(desired) {
            log::debug!("[apply] superseding pending request {replaced:?}");
        }
        if slot.in_flight {
            return;
        }
        slot.in_flight = true;
        drop(slot);

        tokio::spawn(run_worker(self.shared.clone()));
    }

    pub fn is_busy(&self) -> bool {
        self.shared.slot().in_flight
    }

    /// Resolves once no apply is running and nothing is pending.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_busy() {
                return;
            }
            notified.await;
        }
    }
}

async fn run_worker(shared: Arc<Shared>) {
    loop {
        let desired = {
            let mut slot = shared.slot();
            match slot.pending.take() {
                Some(desired) => desired,
                None => {
                    slot.in_flight = false;
                    break;
                }
            }
        };

        log::info!("[apply] applying {desired:?}");
        if let Err(error) = shared.applier.apply(desired).await {
            log::warn!("[apply] apply of {desired:?} failed: {error}");
            shared.status.report_failure(&error);
        }
    }
    shared.idle.notify_waiters();
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    struct RecordingApplier {
        applied: Mutex<Vec<DesiredState>>,
        gate: tokio::sync::Semaphore,
        fail_port: Option<u16>,
    }

    impl RecordingApplier {
        fn new(fail_port: Option<u16>) -> Arc<Self> {
            Arc::new(Self {
                applied: Mutex::new(Vec::new()),
                gate: tokio::sync::Semaphore::new(0),
                fail_port,
            })
        }

        fn applied(&self) -> Vec<u16> {
            self.applied.lock().unwrap().iter().map(|s| s.port).collect()
        }
    }

    #[async_trait]
    impl Applier for RecordingApplier {
        async fn apply(&self, desired: DesiredState) -> Result<(), ReconcileError> {
            self.applied.lock().unwrap().push(desired);
            self.gate.acquire().await.unwrap().forget();
            if Some(desired.port) == self.fail_port {
                return Err(ReconcileError::InvalidPort(desired.port.to_string()));
            }
            Ok(())
        }
    }

    fn state(port: u16) -> DesiredState {
        DesiredState::default().with_enabled(true).with_port(port)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn burst_collapses_to_latest_pending() {
        let applier = RecordingApplier::new(None);
        let queue = ApplyQueue::new(applier.clone(), StatusHandle::new(None));

        queue.request(state(1000));
        settle().await;
        assert_eq!(applier.applied(), vec![1000]);

        queue.request(state(1001));
        queue.request(state(1002));
        applier.gate.add_permits(10);
        queue.wait_idle().await;

        assert_eq!(applier.applied(), vec![1000, 1002]);
        assert!(!queue.is_busy());
    }

    #[tokio::test]
    async fn failure_is_reported_and_loop_continues() {
        let applier = RecordingApplier::new(Some(1000));
        let status = StatusHandle::new(None);
        let queue = ApplyQueue::new(applier.clone(), status.clone());

        queue.request(state(1000));
        settle().await;
        queue.request(state(2000));
        applier.gate.add_permits(10);
        queue.wait_idle().await;

        assert_eq!(applier.applied(), vec![1000, 2000]);
        assert!(status.snapshot().error.is_some());
    }

    #[tokio::test]
    async fn new_worker_starts_after_idle() {
        let applier = RecordingApplier::new(None);
        applier.gate.add_permits(10);
        let queue = ApplyQueue::new(applier.clone(), StatusHandle::new(None));

        queue.request(state(1));
        queue.wait_idle().await;
        queue.request(state(2));
        tokio::time::timeout(Duration::from_secs(1), queue.wait_idle())
            .await
            .unwrap();

        assert_eq!(applier.applied(), vec![1, 2]);
    }
}

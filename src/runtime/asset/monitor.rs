//! Asset monitor: the wait queue of one asset.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{trace, warn};

use super::{Asset, AssetManager, AssetTicket, AssetWait, CheckAssetContext};
use crate::runtime::error::{panic_message, KernelError};
use crate::runtime::ids::{JobId, MonitorId};
use crate::runtime::job::{ActivationSet, JobNode};

#[derive(Debug, Clone)]
enum MonitorState {
    Waiting,
    Activated,
    Failed(KernelError),
}

struct MonitorInner {
    waiters: IndexMap<JobId, JobNode>,
    state: MonitorState,
    registered: bool,
}

/// Queue of job nodes waiting on one asset.
///
/// Once permanently activated or failed the monitor never reverts: every
/// current and future waiter is released with the same outcome.
pub struct AssetMonitor {
    id: MonitorId,
    asset: Arc<dyn Asset>,
    manager: Arc<AssetManager>,
    inner: Mutex<MonitorInner>,
    /// Bumped under the inner lock whenever waiters are released.
    releases: AtomicU64,
}

impl std::fmt::Debug for AssetMonitor {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("AssetMonitor")
            .field("id", &self.id)
            .field("manager", &self.manager.name())
            .field("waiting", &inner.waiters.len())
            .field("state", &inner.state)
            .finish()
    }
}

impl AssetMonitor {
    /// Create a monitor for `asset`, swept by `manager`.
    pub fn new(
        asset: Arc<dyn Asset>,
        manager: Arc<AssetManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: MonitorId::next(),
            asset,
            manager,
            inner: Mutex::new(MonitorInner {
                waiters: IndexMap::new(),
                state: MonitorState::Waiting,
                registered: false,
            }),
            releases: AtomicU64::new(0),
        })
    }

    /// Get the monitor id.
    #[inline]
    pub fn id(&self) -> MonitorId {
        self.id
    }

    /// Get the manager sweeping this monitor.
    #[inline]
    pub fn manager(&self) -> &Arc<AssetManager> {
        &self.manager
    }

    /// Capture the current release count, to wait on the monitor later.
    pub fn ticket(self: &Arc<Self>) -> AssetTicket {
        AssetTicket::new(self.clone(), self.releases.load(Ordering::SeqCst))
    }

    /// Park `job` on this monitor.
    ///
    /// Registration is idempotent per job id: a second registration of the
    /// same job while it is still waiting is discarded.
    pub fn wait_on_asset(
        self: &Arc<Self>,
        job: JobNode,
    ) -> AssetWait {
        self.enqueue(job, None)
    }

    /// Park `job` unless waiters were released after `seen` was captured,
    /// in which case the job is handed back to check its asset again.
    pub(crate) fn wait_on_asset_after(
        self: &Arc<Self>,
        job: JobNode,
        seen: u64,
    ) -> AssetWait {
        self.enqueue(job, Some(seen))
    }

    fn enqueue(
        self: &Arc<Self>,
        job: JobNode,
        seen: Option<u64>,
    ) -> AssetWait {
        let mut inner = self.inner.lock();
        let failure = match &inner.state {
            MonitorState::Activated => return AssetWait::Ready(job),
            MonitorState::Failed(failure) => Some(failure.clone()),
            MonitorState::Waiting => None,
        };
        if let Some(failure) = failure {
            drop(inner);
            return AssetWait::Ready(job.into_failed(failure));
        }

        let id = job.id();
        if seen.is_some_and(|seen| seen != self.releases.load(Ordering::SeqCst)) {
            trace!("{} released before {} parked", self.id, id);
            return AssetWait::Ready(job);
        }
        if inner.waiters.contains_key(&id) {
            trace!("{} already waiting on {}", id, self.id);
            return AssetWait::Parked;
        }
        inner.waiters.insert(id, job);
        if !inner.registered {
            inner.registered = true;
            self.manager.register(self);
        }
        trace!("{} parked on {}", id, self.id);
        AssetWait::Parked
    }

    /// Release every waiter into `activations`.
    ///
    /// A permanent activation short-circuits all future registrations. It
    /// never clears a permanent failure.
    pub fn activate(
        &self,
        permanent: bool,
        activations: &mut ActivationSet,
    ) {
        let released = {
            let mut inner = self.inner.lock();
            if let MonitorState::Failed(_) = inner.state {
                return;
            }
            if permanent {
                inner.state = MonitorState::Activated;
            }
            self.drain(&mut inner)
        };

        if !released.is_empty() {
            trace!("{} activated {} waiters", self.id, released.len());
        }
        activations.extend(released);
    }

    /// Release every waiter into `activations` with `failure`.
    ///
    /// A permanent failure is only recorded if the monitor is not already
    /// terminal; terminal states never change.
    pub fn fail(
        &self,
        failure: KernelError,
        permanent: bool,
        activations: &mut ActivationSet,
    ) {
        let released = {
            let mut inner = self.inner.lock();
            if permanent && matches!(inner.state, MonitorState::Waiting) {
                inner.state = MonitorState::Failed(failure.clone());
            }
            self.drain(&mut inner)
        };

        if !released.is_empty() {
            warn!("{} failed {} waiters: {}", self.id, released.len(), failure);
        }
        activations.extend(
            released
                .into_iter()
                .map(|job| job.into_failed(failure.clone())),
        );
    }

    fn drain(
        &self,
        inner: &mut MonitorInner,
    ) -> Vec<JobNode> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        let released: Vec<JobNode> = inner.waiters.drain(..).map(|(_, job)| job).collect();
        if inner.registered {
            inner.registered = false;
            self.manager.unregister(self.id);
        }
        released
    }

    /// Let the asset evaluate itself; invoked by the manager's sweep.
    pub(crate) fn check_on_asset(
        &self,
        now: Instant,
        activations: &mut ActivationSet,
    ) {
        let outcome = {
            let mut context = CheckAssetContext::new(now, self, activations);
            panic::catch_unwind(AssertUnwindSafe(|| self.asset.check_on_asset(&mut context)))
        };

        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(failure)) => failure,
            Err(payload) => KernelError::Panicked {
                job: format!("check on {}", self.id),
                message: panic_message(payload.as_ref()),
            },
        };
        warn!("asset check for {} failed: {}", self.id, failure);
        self.fail(failure, true, activations);
    }

    /// Number of jobs currently waiting.
    pub fn waiting_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Check whether the monitor has been permanently activated.
    pub fn is_activated(&self) -> bool {
        matches!(self.inner.lock().state, MonitorState::Activated)
    }

    /// Check whether the monitor has been permanently failed.
    pub fn is_failed(&self) -> bool {
        matches!(self.inner.lock().state, MonitorState::Failed(_))
    }

    /// The permanent failure, if any.
    pub fn failure(&self) -> Option<KernelError> {
        match &self.inner.lock().state {
            MonitorState::Failed(failure) => Some(failure.clone()),
            _ => None,
        }
    }
}

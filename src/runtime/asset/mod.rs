//! Assets: the wait-and-resume primitive
//!
//! Anything whose readiness is not immediate (a resource being sourced, an
//! asynchronous operation in flight) is an [`Asset`]. Job nodes that need an
//! asset park on its [`AssetMonitor`]; an [`AssetManager`] sweeps registered
//! monitors periodically, letting each asset evaluate readiness and timeouts
//! against one shared timestamp.
//!
//! ```text
//! JobNode ──wait_on_asset──▶ AssetMonitor ◀──check_on_assets── AssetManager
//!                                  │
//!                      activate / fail (drain waiters)
//!                                  ▼
//!                            ActivationSet ──dispatch──▶ Team
//! ```

pub mod manager;
pub mod monitor;

pub use manager::AssetManager;
pub use monitor::AssetMonitor;

use std::sync::Arc;
use std::time::Instant;

use crate::runtime::error::{KernelError, KernelResult};
use crate::runtime::job::{ActivationSet, JobNode};

/// A resource whose readiness must be waited on.
pub trait Asset: Send + Sync {
    /// Evaluate readiness and timeouts.
    ///
    /// Called by the owning manager's sweep without any kernel lock held.
    /// Returning an error permanently fails the monitor.
    fn check_on_asset(
        &self,
        context: &mut CheckAssetContext<'_>,
    ) -> KernelResult<()>;
}

/// Outcome of [`AssetMonitor::wait_on_asset`].
#[derive(Debug)]
pub enum AssetWait {
    /// The job is parked until the monitor is activated or failed.
    Parked,
    /// The monitor is already terminal; the job must continue now.
    ///
    /// If the monitor permanently failed, the job's head step has already
    /// been replaced by a failure of its thread.
    Ready(JobNode),
}

impl AssetWait {
    /// Check whether the job was parked.
    #[inline]
    pub fn is_parked(&self) -> bool {
        matches!(self, AssetWait::Parked)
    }
}

/// A monitor paired with its release count at the time a readiness check
/// decided to wait.
///
/// Waiting through a ticket closes the window between that check and the
/// registration: a release in between hands the job back instead of parking
/// it on a monitor nobody will release again.
#[derive(Debug, Clone)]
pub struct AssetTicket {
    monitor: Arc<AssetMonitor>,
    releases: u64,
}

impl AssetTicket {
    pub(crate) fn new(
        monitor: Arc<AssetMonitor>,
        releases: u64,
    ) -> Self {
        Self { monitor, releases }
    }

    /// The monitor to wait on.
    #[inline]
    pub fn monitor(&self) -> &Arc<AssetMonitor> {
        &self.monitor
    }

    /// Park `job`, or hand it back if the monitor released since the ticket
    /// was taken.
    pub fn wait(
        self,
        job: JobNode,
    ) -> AssetWait {
        self.monitor.wait_on_asset_after(job, self.releases)
    }
}

/// View handed to [`Asset::check_on_asset`] during a sweep.
pub struct CheckAssetContext<'a> {
    now: Instant,
    monitor: &'a AssetMonitor,
    activations: &'a mut ActivationSet,
}

impl<'a> CheckAssetContext<'a> {
    pub(crate) fn new(
        now: Instant,
        monitor: &'a AssetMonitor,
        activations: &'a mut ActivationSet,
    ) -> Self {
        Self {
            now,
            monitor,
            activations,
        }
    }

    /// Timestamp shared by every asset checked in this sweep.
    #[inline]
    pub fn time(&self) -> Instant {
        self.now
    }

    /// Number of jobs currently waiting on the asset.
    pub fn waiting(&self) -> usize {
        self.monitor.waiting_count()
    }

    /// Release the waiters.
    pub fn activate_waiters(
        &mut self,
        permanent: bool,
    ) {
        self.monitor.activate(permanent, self.activations);
    }

    /// Release the waiters with a failure.
    pub fn fail_waiters(
        &mut self,
        failure: KernelError,
        permanent: bool,
    ) {
        self.monitor.fail(failure, permanent, self.activations);
    }
}

//! Asset manager: periodic sweep over waited-on assets.
//!
//! Timeouts are enforced only here, never by a timer per resource, so their
//! precision is bounded by the sweep interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::AssetMonitor;
use crate::runtime::ids::MonitorId;
use crate::runtime::job::ActivationSet;

struct Sweeper {
    shutdown: Sender<()>,
    handle: thread::JoinHandle<()>,
}

/// Sweeps the monitors that currently have waiters.
pub struct AssetManager {
    name: String,
    monitors: Mutex<IndexMap<MonitorId, Weak<AssetMonitor>>>,
    sweeper: Mutex<Option<Sweeper>>,
    sweeps: AtomicU64,
}

impl std::fmt::Debug for AssetManager {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("AssetManager")
            .field("name", &self.name)
            .field("monitors", &self.monitors.lock().len())
            .field("sweeps", &self.sweeps.load(Ordering::Relaxed))
            .finish()
    }
}

impl AssetManager {
    /// Create a manager. It only sweeps when asked to, or once started.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            monitors: Mutex::new(IndexMap::new()),
            sweeper: Mutex::new(None),
            sweeps: AtomicU64::new(0),
        })
    }

    /// Manager name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of monitors currently registered.
    pub fn monitor_count(&self) -> usize {
        self.monitors.lock().len()
    }

    /// Number of sweeps completed.
    pub fn sweep_count(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    pub(crate) fn register(
        &self,
        monitor: &Arc<AssetMonitor>,
    ) {
        self.monitors
            .lock()
            .insert(monitor.id(), Arc::downgrade(monitor));
    }

    pub(crate) fn unregister(
        &self,
        id: MonitorId,
    ) {
        self.monitors.lock().shift_remove(&id);
    }

    /// Sweep now and dispatch everything released.
    pub fn check_on_assets(&self) {
        let mut activations = ActivationSet::new();
        self.check_on_assets_at(Instant::now(), &mut activations);
        activations.dispatch();
    }

    /// Sweep with an explicit `now`, collecting released jobs.
    ///
    /// `now` is shared by every asset in the sweep so timeout comparisons
    /// are consistent within one pass.
    pub fn check_on_assets_at(
        &self,
        now: Instant,
        activations: &mut ActivationSet,
    ) {
        let snapshot: Vec<Arc<AssetMonitor>> = {
            let mut monitors = self.monitors.lock();
            monitors.retain(|_, monitor| monitor.strong_count() > 0);
            monitors.values().filter_map(Weak::upgrade).collect()
        };

        trace!("sweeping {} monitors on '{}'", snapshot.len(), self.name);
        for monitor in snapshot {
            monitor.check_on_asset(now, activations);
        }
        self.sweeps.fetch_add(1, Ordering::Relaxed);
    }

    /// Sweep on a dedicated thread every `interval` until stopped.
    pub fn start(
        self: &Arc<Self>,
        interval: Duration,
    ) -> std::io::Result<()> {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return Ok(());
        }

        let (shutdown, shutdown_rx) = channel::bounded::<()>(1);
        let manager = Arc::downgrade(self);
        let handle = thread::Builder::new()
            .name(format!("asset-sweep-{}", self.name))
            .spawn(move || loop {
                match shutdown_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {},
                    _ => break,
                }
                match manager.upgrade() {
                    Some(manager) => manager.check_on_assets(),
                    None => break,
                }
            })?;

        debug!("asset manager '{}' sweeping every {:?}", self.name, interval);
        *sweeper = Some(Sweeper { shutdown, handle });
        Ok(())
    }

    /// Stop the sweep thread, if running.
    pub fn stop(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.shutdown.send(());
            if sweeper.handle.thread().id() == thread::current().id() {
                return;
            }
            if sweeper.handle.join().is_err() {
                warn!("asset manager '{}' sweeper panicked", self.name);
            }
        }
    }
}

impl Drop for AssetManager {
    fn drop(&mut self) {
        self.stop();
    }
}

//! Shared work-stealing worker pool.
//!
//! Tasks are pushed onto a global injector; each worker drains its local
//! deque first, then refills from the injector in batches, then steals from
//! its siblings. Idle workers park until woken or until the idle timeout.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use crossbeam::sync::{Parker, Unparker};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::task::Task;
use super::Team;
use crate::runtime::error::{KernelError, KernelResult};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads.
    pub num_workers: usize,
    /// Idle timeout before a worker re-checks the queues.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let num_cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            num_workers: num_cpus,
            idle_timeout: Duration::from_millis(1),
        }
    }
}

/// Statistics about work stealing operations.
#[derive(Debug, Default)]
pub struct StealStats {
    /// Number of successful steals.
    pub steal_successes: AtomicUsize,
    /// Number of failed steal attempts.
    pub steal_failures: AtomicUsize,
    /// Total tasks run by the pool.
    pub tasks_run: AtomicUsize,
}

impl StealStats {
    /// Record a successful steal.
    #[inline]
    pub fn record_success(&self) {
        self.steal_successes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed steal attempt.
    #[inline]
    pub fn record_failure(&self) {
        self.steal_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get success rate of steal attempts.
    pub fn success_rate(&self) -> f64 {
        let successes = self.steal_successes.load(Ordering::Relaxed);
        let total = successes + self.steal_failures.load(Ordering::Relaxed);
        if total == 0 {
            return 1.0;
        }
        successes as f64 / total as f64
    }
}

struct PoolShared {
    injector: Injector<Task>,
    stealers: Vec<Stealer<Task>>,
    unparkers: Vec<Unparker>,
    running: AtomicBool,
    next_wake: AtomicUsize,
    stats: StealStats,
}

/// Team running tasks on a fixed set of worker threads.
pub struct WorkerPoolTeam {
    name: String,
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPoolTeam {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("WorkerPoolTeam")
            .field("name", &self.name)
            .field("num_workers", &self.shared.stealers.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl WorkerPoolTeam {
    /// Create the pool and spawn its workers.
    pub fn new(
        name: impl Into<String>,
        config: PoolConfig,
    ) -> KernelResult<Self> {
        let name = name.into();
        let num_workers = config.num_workers.max(1);

        let locals: Vec<Worker<Task>> = (0..num_workers).map(|_| Worker::new_fifo()).collect();
        let parkers: Vec<Parker> = (0..num_workers).map(|_| Parker::new()).collect();

        let shared = Arc::new(PoolShared {
            injector: Injector::new(),
            stealers: locals.iter().map(|w| w.stealer()).collect(),
            unparkers: parkers.iter().map(|p| p.unparker().clone()).collect(),
            running: AtomicBool::new(true),
            next_wake: AtomicUsize::new(0),
            stats: StealStats::default(),
        });

        let mut workers = Vec::with_capacity(num_workers);
        for (worker_id, (local, parker)) in locals.into_iter().zip(parkers).enumerate() {
            let shared = shared.clone();
            let idle_timeout = config.idle_timeout;
            let worker = thread::Builder::new()
                .name(format!("{}-worker-{}", name, worker_id))
                .spawn(move || Self::worker_loop(worker_id, &shared, &local, &parker, idle_timeout))
                .map_err(|e| KernelError::execution(name.clone(), e.to_string()))?;
            workers.push(worker);
        }

        debug!("team '{}' started with {} workers", name, num_workers);
        Ok(Self {
            name,
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Worker thread main loop.
    fn worker_loop(
        worker_id: usize,
        shared: &PoolShared,
        local: &Worker<Task>,
        parker: &Parker,
        idle_timeout: Duration,
    ) {
        while shared.running.load(Ordering::SeqCst) {
            match Self::find_task(worker_id, shared, local) {
                Some(task) => {
                    trace!("worker {} running {}", worker_id, task.id());
                    task.run();
                    shared.stats.tasks_run.fetch_add(1, Ordering::Relaxed);
                },
                None => parker.park_timeout(idle_timeout),
            }
        }
    }

    /// Local queue first, then a batch from the injector, then siblings.
    fn find_task(
        worker_id: usize,
        shared: &PoolShared,
        local: &Worker<Task>,
    ) -> Option<Task> {
        if let Some(task) = local.pop() {
            return Some(task);
        }

        loop {
            let mut retry = false;

            match shared.injector.steal_batch_and_pop(local) {
                Steal::Success(task) => return Some(task),
                Steal::Retry => retry = true,
                Steal::Empty => {},
            }

            for (victim, stealer) in shared.stealers.iter().enumerate() {
                if victim == worker_id {
                    continue;
                }
                match stealer.steal() {
                    Steal::Success(task) => {
                        shared.stats.record_success();
                        return Some(task);
                    },
                    Steal::Retry => retry = true,
                    Steal::Empty => {},
                }
            }

            if !retry {
                shared.stats.record_failure();
                return None;
            }
        }
    }

    /// Get the number of workers.
    #[inline]
    pub fn num_workers(&self) -> usize {
        self.shared.stealers.len()
    }

    /// Get steal statistics.
    #[inline]
    pub fn stats(&self) -> &StealStats {
        &self.shared.stats
    }

    /// Check if the pool is running.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

impl Team for WorkerPoolTeam {
    fn name(&self) -> &str {
        &self.name
    }

    fn assign(
        &self,
        task: Task,
    ) -> KernelResult<()> {
        if !self.is_running() {
            return Err(KernelError::TeamStopped(self.name.clone()));
        }
        self.shared.injector.push(task);

        // Round-robin wake-up
        let unparkers = &self.shared.unparkers;
        let next = self.shared.next_wake.fetch_add(1, Ordering::Relaxed);
        unparkers[next % unparkers.len()].unpark();
        Ok(())
    }

    fn stop_working(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for unparker in &self.shared.unparkers {
            unparker.unpark();
        }

        let current = thread::current().id();
        for worker in self.workers.lock().drain(..) {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                warn!("team '{}' worker panicked", self.name);
            }
        }
        debug!("team '{}' stopped", self.name);
    }
}

impl Drop for WorkerPoolTeam {
    fn drop(&mut self) {
        self.stop_working();
    }
}

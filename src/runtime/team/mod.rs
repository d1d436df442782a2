//! Teams: pluggable execution backends
//!
//! A team accepts [`Task`]s and guarantees each one is run exactly once while
//! the team is working. Parallelism in the kernel comes only from teams:
//!
//! - [`PassiveTeam`]: runs the task synchronously on the assigning thread
//! - [`OnePersonTeam`]: a single dedicated OS thread fed by a channel
//! - [`WorkerPoolTeam`]: a shared work-stealing pool

pub mod pool;
pub mod task;

pub use pool::{PoolConfig, StealStats, WorkerPoolTeam};
pub use task::{Task, TaskId, TaskState};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::runtime::error::{KernelError, KernelResult};

/// Name of a team registered with an office.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TeamId(pub String);

impl TeamId {
    /// Create a team id.
    pub fn new(name: impl Into<String>) -> Self {
        TeamId(name.into())
    }

    /// Get the team name.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TeamId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TeamId {
    fn from(name: &str) -> Self {
        TeamId(name.to_string())
    }
}

/// Which team is responsible for running a job node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TeamSelector {
    /// Run on whichever team is currently driving the chain.
    #[default]
    Any,
    /// Run on the named team.
    Team(TeamId),
}

impl TeamSelector {
    /// Select the named team.
    pub fn team(name: impl Into<String>) -> Self {
        TeamSelector::Team(TeamId::new(name))
    }

    /// Check whether a node with this selector may run on `current`.
    #[inline]
    pub fn accepts(
        &self,
        current: Option<&TeamId>,
    ) -> bool {
        match self {
            TeamSelector::Any => true,
            TeamSelector::Team(id) => current == Some(id),
        }
    }
}

/// Execution backend.
pub trait Team: Send + Sync {
    /// Team name for diagnostics.
    fn name(&self) -> &str;

    /// Begin accepting tasks. Teams that start eagerly need not override this.
    fn start_working(&self) {}

    /// Hand a task to the team.
    fn assign(
        &self,
        task: Task,
    ) -> KernelResult<()>;

    /// Stop the team. Tasks not yet run may be discarded.
    fn stop_working(&self) {}
}

/// Runs every task immediately on the assigning thread.
#[derive(Debug)]
pub struct PassiveTeam {
    name: String,
}

impl PassiveTeam {
    /// Create a passive team.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for PassiveTeam {
    fn default() -> Self {
        Self::new("passive")
    }
}

impl Team for PassiveTeam {
    fn name(&self) -> &str {
        &self.name
    }

    fn assign(
        &self,
        task: Task,
    ) -> KernelResult<()> {
        task.run();
        Ok(())
    }
}

/// A team backed by one dedicated OS thread.
pub struct OnePersonTeam {
    name: String,
    sender: Mutex<Option<Sender<Task>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    running: AtomicBool,
}

impl fmt::Debug for OnePersonTeam {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("OnePersonTeam")
            .field("name", &self.name)
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}

impl OnePersonTeam {
    /// Create the team and spawn its thread.
    pub fn new(name: impl Into<String>) -> KernelResult<Self> {
        let name = name.into();
        let (sender, receiver) = channel::unbounded::<Task>();

        let worker = thread::Builder::new()
            .name(format!("team-{}", name))
            .spawn(move || {
                // Ends once every sender has been dropped
                for task in receiver.iter() {
                    task.run();
                }
            })
            .map_err(|e| KernelError::execution(name.clone(), e.to_string()))?;

        debug!("team '{}' started", name);
        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            running: AtomicBool::new(true),
        })
    }
}

impl Team for OnePersonTeam {
    fn name(&self) -> &str {
        &self.name
    }

    fn assign(
        &self,
        task: Task,
    ) -> KernelResult<()> {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => sender
                .send(task)
                .map_err(|_| KernelError::TeamStopped(self.name.clone())),
            None => Err(KernelError::TeamStopped(self.name.clone())),
        }
    }

    fn stop_working(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.sender.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            // A team stopped from its own thread cannot join itself
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                warn!("team '{}' worker panicked", self.name);
            }
        }
        debug!("team '{}' stopped", self.name);
    }
}

impl Drop for OnePersonTeam {
    fn drop(&mut self) {
        self.stop_working();
    }
}

#[cfg(test)]
mod tests;

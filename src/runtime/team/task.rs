//! Units of work handed to a team.
//!
//! A [`Task`] wraps the closure that drives one job-node loop. Teams only see
//! tasks; they never inspect the job nodes inside.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Where a task is in its single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Finished,
}

type TaskBody = Box<dyn FnOnce() + Send>;

/// A closure a team runs at most once.
pub struct Task {
    id: TaskId,
    name: String,
    body: Mutex<Option<TaskBody>>,
    running: AtomicBool,
}

impl fmt::Debug for Task {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{} '{}' ({:?})", self.id, self.name, self.state())
    }
}

impl Task {
    pub fn new<F>(
        name: impl Into<String>,
        body: F,
    ) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            id: TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            body: Mutex::new(Some(Box::new(body))),
            running: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Description of the job node the task drives.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        let body = self.body.lock();
        match (body.is_some(), self.running.load(Ordering::SeqCst)) {
            (true, _) => TaskState::Ready,
            (false, true) => TaskState::Running,
            (false, false) => TaskState::Finished,
        }
    }

    /// Run the body; later calls do nothing.
    pub fn run(&self) {
        let body = {
            let mut slot = self.body.lock();
            let body = slot.take();
            if body.is_some() {
                self.running.store(true, Ordering::SeqCst);
            }
            body
        };
        if let Some(body) = body {
            body();
            self.running.store(false, Ordering::SeqCst);
        }
    }
}

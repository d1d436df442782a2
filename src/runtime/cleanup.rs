//! Serialized execution of cleanup jobs.
//!
//! Each process owns one [`CleanupSequence`]. Recycle jobs registered on it
//! run strictly one after another, in registration order: the next job is
//! released only when the thread running the previous one has terminated.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::runtime::job::{ActivationSet, JobNode};

type IdleCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct SequenceInner {
    active: bool,
    queue: VecDeque<JobNode>,
    completed: usize,
    idle: Vec<IdleCallback>,
}

/// FIFO of cleanup jobs with at most one running.
#[derive(Default)]
pub struct CleanupSequence {
    inner: Mutex<SequenceInner>,
}

impl fmt::Debug for CleanupSequence {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CleanupSequence")
            .field("active", &inner.active)
            .field("queued", &inner.queue.len())
            .field("completed", &inner.completed)
            .finish()
    }
}

impl CleanupSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `job`, or release it into `activations` right away when no
    /// cleanup job is running.
    pub fn register_cleanup(
        self: &Arc<Self>,
        job: JobNode,
        activations: &mut ActivationSet,
    ) {
        {
            let mut inner = self.inner.lock();
            if inner.active {
                trace!("queueing cleanup job {}", job.id());
                inner.queue.push_back(job);
                return;
            }
            inner.active = true;
        }
        if !self.release(job, activations) {
            self.advance(activations);
        }
    }

    /// Run `callback` once no cleanup job is running or queued; right away
    /// when the sequence is idle.
    pub fn when_idle<F>(
        &self,
        callback: F,
    ) where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut inner = self.inner.lock();
            if inner.active {
                inner.idle.push(Box::new(callback));
                return;
            }
        }
        callback();
    }

    /// Whether a cleanup job is running.
    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    /// Jobs waiting behind the running one.
    pub fn queued_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Cleanup jobs whose thread has terminated.
    pub fn completed(&self) -> usize {
        self.inner.lock().completed
    }

    /// Hand `job` out and advance once its thread terminates. Returns false
    /// when that thread has already terminated.
    fn release(
        self: &Arc<Self>,
        job: JobNode,
        activations: &mut ActivationSet,
    ) -> bool {
        debug!("releasing cleanup job {}", job.id());
        let sequence = self.clone();
        let listening = job
            .thread_state()
            .add_completion_listener(move |_, activations| sequence.advance(activations));
        activations.push(job);
        listening.is_ok()
    }

    fn advance(
        self: &Arc<Self>,
        activations: &mut ActivationSet,
    ) {
        // Jobs whose thread already ended only drain their chain
        while let Some(job) = self.finish_current() {
            if self.release(job, activations) {
                return;
            }
        }
    }

    /// Count the running job as done and pop its successor.
    fn finish_current(&self) -> Option<JobNode> {
        let idle = {
            let mut inner = self.inner.lock();
            inner.completed += 1;
            if let Some(job) = inner.queue.pop_front() {
                return Some(job);
            }
            inner.active = false;
            std::mem::take(&mut inner.idle)
        };
        if !idle.is_empty() {
            trace!("cleanup sequence drained, {} waiting", idle.len());
        }
        for callback in idle {
            callback();
        }
        None
    }
}

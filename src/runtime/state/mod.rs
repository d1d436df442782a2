//! Process and thread state
//!
//! A [`ProcessState`] is one externally-triggered unit of execution. It owns
//! the process-scoped resource containers and the set of active
//! [`ThreadState`]s, and completes exactly once, when its last thread
//! terminates. Each thread runs one or more [`Flow`]s, each anchoring a chain
//! of job nodes.
//!
//! ```text
//! Process: Active ──last thread detaches──▶ Completing ──listeners fired──▶ Complete
//! Thread:  Running ──failure──▶ Escalating ──handled──▶ Running ──flows done──▶ Terminated
//! ```

pub mod process;
pub mod thread;

pub use process::{ProcessPhase, ProcessState};
pub use thread::{Flow, SpawnRequest, ThreadPhase, ThreadState};

use std::fmt;
use std::sync::Arc;

use crate::runtime::container::ResourceMetaData;
use crate::runtime::error::{KernelError, KernelResult};
use crate::runtime::escalation::EscalationHandler;
use crate::runtime::ids::{ProcessId, ThreadId};
use crate::runtime::job::{JobContext, JobNode};

/// Immutable description of a kind of process.
#[derive(Debug, Clone, Default)]
pub struct ProcessMetaData {
    /// Process name, for logs.
    pub name: String,
    /// Resources bound once per process.
    pub process_resources: Vec<Arc<ResourceMetaData>>,
    /// Resources bound once per thread.
    pub thread_resources: Vec<Arc<ResourceMetaData>>,
}

impl ProcessMetaData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Add a process-scoped resource.
    pub fn process_resource(
        mut self,
        metadata: impl Into<Arc<ResourceMetaData>>,
    ) -> Self {
        self.process_resources.push(metadata.into());
        self
    }

    /// Add a thread-scoped resource.
    pub fn thread_resource(
        mut self,
        metadata: impl Into<Arc<ResourceMetaData>>,
    ) -> Self {
        self.thread_resources.push(metadata.into());
        self
    }
}

/// How a process ended.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    /// Every failure was handled.
    Completed,
    /// A failure reached no handler and aborted the process.
    Failed(KernelError),
}

impl ProcessOutcome {
    #[inline]
    pub fn is_completed(&self) -> bool {
        matches!(self, ProcessOutcome::Completed)
    }
}

/// How a thread ended.
#[derive(Debug, Clone)]
pub struct ThreadOutcome {
    pub thread: ThreadId,
    /// Failure that reached no handler, if any.
    pub unhandled: Option<KernelError>,
}

/// Notified once when a process completes.
///
/// By then every thread has terminated, every container has been unloaded
/// and the process's cleanup sequence has drained, so pooled resources have
/// been returned or lost.
pub trait ProcessCompletionListener: Send + Sync {
    fn process_completed(
        &self,
        process: ProcessId,
        outcome: &ProcessOutcome,
    );
}

impl<F> ProcessCompletionListener for F
where
    F: Fn(ProcessId, &ProcessOutcome) + Send + Sync,
{
    fn process_completed(
        &self,
        process: ProcessId,
        outcome: &ProcessOutcome,
    ) {
        self(process, outcome)
    }
}

type InitialChain = Box<dyn FnOnce(&Arc<ThreadState>) -> JobNode + Send>;

/// Everything an external trigger supplies to start a process.
pub struct ProcessRequest {
    pub(crate) metadata: Arc<ProcessMetaData>,
    pub(crate) source_handler: Option<Arc<dyn EscalationHandler>>,
    pub(crate) listeners: Vec<Arc<dyn ProcessCompletionListener>>,
    pub(crate) initial: InitialChain,
}

impl fmt::Debug for ProcessRequest {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ProcessRequest")
            .field("metadata", &self.metadata)
            .field("source_handler", &self.source_handler.is_some())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl ProcessRequest {
    /// `initial` builds the main thread's first chain.
    pub fn new<F>(
        metadata: impl Into<Arc<ProcessMetaData>>,
        initial: F,
    ) -> Self
    where
        F: FnOnce(&Arc<ThreadState>) -> JobNode + Send + 'static,
    {
        Self {
            metadata: metadata.into(),
            source_handler: None,
            listeners: Vec::new(),
            initial: Box::new(initial),
        }
    }

    /// Handler for failures no function or office handler takes.
    pub fn with_source_handler<F>(
        self,
        handler: F,
    ) -> Self
    where
        F: Fn(&KernelError, &mut JobContext<'_>) -> KernelResult<Option<JobNode>>
            + Send
            + Sync
            + 'static,
    {
        self.with_shared_source_handler(Arc::new(handler))
    }

    pub fn with_shared_source_handler(
        mut self,
        handler: Arc<dyn EscalationHandler>,
    ) -> Self {
        self.source_handler = Some(handler);
        self
    }

    /// Listen for completion of the process.
    pub fn with_listener<F>(
        mut self,
        listener: F,
    ) -> Self
    where
        F: Fn(ProcessId, &ProcessOutcome) + Send + Sync + 'static,
    {
        self.listeners.push(Arc::new(listener));
        self
    }

    pub fn with_shared_listener(
        mut self,
        listener: Arc<dyn ProcessCompletionListener>,
    ) -> Self {
        self.listeners.push(listener);
        self
    }
}

//! Thread state and flows.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, trace, warn};

use super::{ProcessState, ThreadOutcome};
use crate::runtime::container::{ResourceContainer, ResourceScope, ScopeContainers};
use crate::runtime::error::{panic_message, KernelError, KernelResult};
use crate::runtime::ids::{FlowId, ThreadId};
use crate::runtime::job::{ActivationSet, FunctionJob, JobNode};

/// Thread lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadPhase {
    Running,
    /// A failure is set and awaits its handler.
    Escalating,
    Terminated,
}

type CompletionListener = Box<dyn FnOnce(&ThreadOutcome, &mut ActivationSet) + Send>;

struct ThreadInner {
    phase: ThreadPhase,
    failure: Option<KernelError>,
    active_flows: usize,
    unhandled: Option<KernelError>,
    listeners: Vec<CompletionListener>,
}

/// One logical thread of control within a process.
pub struct ThreadState {
    id: ThreadId,
    process: Arc<ProcessState>,
    lock: Arc<ReentrantMutex<()>>,
    containers: Vec<Arc<ResourceContainer>>,
    inner: Mutex<ThreadInner>,
}

impl fmt::Debug for ThreadState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ThreadState")
            .field("id", &self.id)
            .field("process", &self.process.id())
            .field("phase", &inner.phase)
            .field("active_flows", &inner.active_flows)
            .finish()
    }
}

impl ThreadState {
    pub(crate) fn new(
        process: &Arc<ProcessState>,
        lock: Arc<ReentrantMutex<()>>,
    ) -> KernelResult<Arc<Self>> {
        let mut containers = Vec::with_capacity(process.metadata().thread_resources.len());
        for metadata in &process.metadata().thread_resources {
            let scopes = ScopeContainers {
                process: process.containers(),
                thread: &containers,
                function: &[],
            };
            let container = ResourceContainer::new(
                metadata.clone(),
                ResourceScope::Thread,
                &scopes,
                process.office(),
            )?;
            containers.push(container);
        }

        Ok(Arc::new(Self {
            id: ThreadId::next(),
            process: process.clone(),
            lock,
            containers,
            inner: Mutex::new(ThreadInner {
                phase: ThreadPhase::Running,
                failure: None,
                active_flows: 0,
                unhandled: None,
                listeners: Vec::new(),
            }),
        }))
    }

    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Owning process.
    #[inline]
    pub fn process(&self) -> &Arc<ProcessState> {
        &self.process
    }

    /// Safety lock held while steps that require thread-state safety run.
    /// The main thread shares the process main lock.
    #[inline]
    pub fn lock(&self) -> &Arc<ReentrantMutex<()>> {
        &self.lock
    }

    /// Thread-scoped containers, in declaration order.
    #[inline]
    pub fn containers(&self) -> &[Arc<ResourceContainer>] {
        &self.containers
    }

    pub fn container(
        &self,
        index: usize,
    ) -> Option<&Arc<ResourceContainer>> {
        self.containers.get(index)
    }

    pub fn phase(&self) -> ThreadPhase {
        self.inner.lock().phase
    }

    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.phase() == ThreadPhase::Terminated
    }

    /// Failure currently being escalated.
    pub fn failure(&self) -> Option<KernelError> {
        self.inner.lock().failure.clone()
    }

    /// Failure that reached no handler.
    pub fn unhandled_failure(&self) -> Option<KernelError> {
        self.inner.lock().unhandled.clone()
    }

    pub fn active_flows(&self) -> usize {
        self.inner.lock().active_flows
    }

    /// Open a new flow on this thread.
    pub fn create_flow(self: &Arc<Self>) -> KernelResult<Flow> {
        let mut inner = self.inner.lock();
        if inner.phase == ThreadPhase::Terminated {
            return Err(KernelError::ThreadTerminated(self.id.value()));
        }
        inner.active_flows += 1;
        Ok(Flow {
            id: FlowId::next(),
            thread: self.clone(),
        })
    }

    /// Run `listener` once this thread terminates.
    pub fn add_completion_listener<F>(
        &self,
        listener: F,
    ) -> KernelResult<()>
    where
        F: FnOnce(&ThreadOutcome, &mut ActivationSet) + Send + 'static,
    {
        let mut inner = self.inner.lock();
        if inner.phase == ThreadPhase::Terminated {
            return Err(KernelError::ThreadTerminated(self.id.value()));
        }
        inner.listeners.push(Box::new(listener));
        Ok(())
    }

    /// A flow finished. Returns the thread's completion chain when it was
    /// the last one.
    pub(crate) fn flow_completed(
        self: &Arc<Self>,
        flow: FlowId,
    ) -> Option<JobNode> {
        {
            let mut inner = self.inner.lock();
            if inner.phase == ThreadPhase::Terminated {
                return None;
            }
            inner.active_flows = inner.active_flows.saturating_sub(1);
            trace!("{} completed {}, {} left", self.id, flow, inner.active_flows);
            if inner.active_flows > 0 {
                return None;
            }
            inner.phase = ThreadPhase::Terminated;
        }
        Some(self.completion())
    }

    /// Terminate the thread whatever its flows are doing.
    pub(crate) fn abandon(self: &Arc<Self>) -> Option<JobNode> {
        {
            let mut inner = self.inner.lock();
            if inner.phase == ThreadPhase::Terminated {
                return None;
            }
            if let Some(failure) = inner.failure.take() {
                inner.unhandled.get_or_insert(failure);
            }
            inner.active_flows = 0;
            inner.phase = ThreadPhase::Terminated;
        }
        warn!("{} abandoned", self.id);
        Some(self.completion())
    }

    pub(crate) fn abandon_node(thread: &Arc<ThreadState>) -> JobNode {
        let owner = thread.clone();
        FunctionJob::kernel("abandon thread", thread, move |_| Ok(owner.abandon()))
    }

    pub(crate) fn begin_escalation(
        &self,
        failure: &KernelError,
    ) {
        let mut inner = self.inner.lock();
        if inner.phase == ThreadPhase::Running {
            inner.phase = ThreadPhase::Escalating;
        }
        // Write-once per escalation cycle
        if inner.failure.is_none() {
            inner.failure = Some(failure.clone());
        }
    }

    pub(crate) fn end_escalation(&self) {
        let mut inner = self.inner.lock();
        inner.failure = None;
        if inner.phase == ThreadPhase::Escalating {
            inner.phase = ThreadPhase::Running;
        }
    }

    pub(crate) fn record_unhandled(
        &self,
        failure: KernelError,
    ) {
        let mut inner = self.inner.lock();
        inner.failure = None;
        inner.unhandled.get_or_insert(failure);
        if inner.phase == ThreadPhase::Escalating {
            inner.phase = ThreadPhase::Running;
        }
    }

    /// Unload thread containers in reverse order, then fire listeners and
    /// detach from the process.
    fn completion(self: &Arc<Self>) -> JobNode {
        let unload = {
            let thread = self.clone();
            FunctionJob::kernel("unload thread resources", self, move |context| {
                let process = thread.process().clone();
                for container in thread.containers.iter().rev() {
                    container.unload(&process, context.activations());
                }
                Ok(None)
            })
        };
        let finalize = {
            let thread = self.clone();
            FunctionJob::kernel("finalize thread", self, move |context| {
                Ok(thread.finalize(context.activations()))
            })
        };
        JobNode::iterate_list(self, [unload, finalize])
    }

    fn finalize(
        self: &Arc<Self>,
        activations: &mut ActivationSet,
    ) -> Option<JobNode> {
        let (listeners, outcome) = {
            let mut inner = self.inner.lock();
            let outcome = ThreadOutcome {
                thread: self.id,
                unhandled: inner.unhandled.clone(),
            };
            (std::mem::take(&mut inner.listeners), outcome)
        };

        debug!("{} terminated", self.id);
        for listener in listeners {
            let result = panic::catch_unwind(AssertUnwindSafe(|| listener(&outcome, &mut *activations)));
            if let Err(payload) = result {
                warn!(
                    "completion listener of {} panicked: {}",
                    self.id,
                    panic_message(payload.as_ref())
                );
            }
        }
        self.process.thread_terminated(self)
    }
}

/// Anchors one chain of job nodes to a thread.
#[derive(Debug)]
pub struct Flow {
    id: FlowId,
    thread: Arc<ThreadState>,
}

impl Flow {
    #[inline]
    pub fn id(&self) -> FlowId {
        self.id
    }

    #[inline]
    pub fn thread_state(&self) -> &Arc<ThreadState> {
        &self.thread
    }

    /// Wrap `chain` so the flow completes once the chain has finished,
    /// whatever its result.
    pub fn anchor(
        self,
        chain: JobNode,
    ) -> JobNode {
        let Flow { id, thread } = self;
        let owner = thread.clone();
        let complete = FunctionJob::kernel(format!("complete {}", id), &thread, move |_| {
            Ok(owner.flow_completed(id))
        });
        JobNode::continue_with(chain, complete)
    }
}

type InitialChain = Box<dyn FnOnce(&Arc<ThreadState>) -> JobNode + Send>;
type SpawnCallback = Box<dyn FnOnce(&ThreadOutcome) + Send>;

/// A request to start a new thread in the spawning thread's process.
pub struct SpawnRequest {
    initial: InitialChain,
    callback: Option<SpawnCallback>,
}

impl fmt::Debug for SpawnRequest {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("SpawnRequest")
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl SpawnRequest {
    /// `initial` builds the new thread's first chain.
    pub fn new<F>(initial: F) -> Self
    where
        F: FnOnce(&Arc<ThreadState>) -> JobNode + Send + 'static,
    {
        Self {
            initial: Box::new(initial),
            callback: None,
        }
    }

    /// Called with the spawned thread's outcome once it terminates.
    pub fn on_complete<F>(
        mut self,
        callback: F,
    ) -> Self
    where
        F: FnOnce(&ThreadOutcome) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Attach the thread and build its anchored chain. The chain opens with a
    /// barrier on the process main lock so the new thread observes every
    /// write made before the spawn.
    pub(crate) fn launch(
        self,
        process: &Arc<ProcessState>,
    ) -> KernelResult<JobNode> {
        let thread = process.spawn_thread()?;
        if let Some(callback) = self.callback {
            thread.add_completion_listener(move |outcome, _| callback(outcome))?;
        }
        let flow = thread.create_flow()?;
        let chain = (self.initial)(&thread);
        Ok(flow.anchor(JobNode::synchronize(&thread, Some(chain))))
    }
}

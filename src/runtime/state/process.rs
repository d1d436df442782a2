//! Process state.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex, ReentrantMutex};
use tracing::{debug, error, info, warn};

use super::{ProcessCompletionListener, ProcessMetaData, ProcessOutcome, ThreadState};
use crate::runtime::cleanup::CleanupSequence;
use crate::runtime::container::{ResourceContainer, ResourceScope, ScopeContainers};
use crate::runtime::error::{panic_message, KernelError, KernelResult};
use crate::runtime::escalation::EscalationHandler;
use crate::runtime::ids::{ProcessId, ThreadId};
use crate::runtime::job::{ActivationSet, FunctionJob, JobNode};
use crate::runtime::office::OfficeCore;

/// Process lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessPhase {
    /// At least one thread is attached.
    Active,
    /// The last thread detached; containers are being unloaded.
    Completing,
    /// Listeners have fired. Terminal.
    Complete,
}

struct ProcessInner {
    phase: ProcessPhase,
    main_created: bool,
    threads: IndexMap<ThreadId, Arc<ThreadState>>,
    listeners: Vec<Arc<dyn ProcessCompletionListener>>,
    unhandled: Option<KernelError>,
    /// Completion listeners have all run.
    notified: bool,
}

/// One externally-triggered execution and everything it causes.
pub struct ProcessState {
    id: ProcessId,
    office: Arc<OfficeCore>,
    metadata: Arc<ProcessMetaData>,
    main_lock: Arc<ReentrantMutex<()>>,
    containers: Vec<Arc<ResourceContainer>>,
    source_handler: Option<Arc<dyn EscalationHandler>>,
    cleanup: Arc<CleanupSequence>,
    aborted: AtomicBool,
    completed: AtomicBool,
    inner: Mutex<ProcessInner>,
    completion: Condvar,
}

impl fmt::Debug for ProcessState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ProcessState")
            .field("id", &self.id)
            .field("name", &self.metadata.name)
            .field("phase", &inner.phase)
            .field("threads", &inner.threads.len())
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

impl ProcessState {
    pub(crate) fn new(
        office: Arc<OfficeCore>,
        metadata: Arc<ProcessMetaData>,
        source_handler: Option<Arc<dyn EscalationHandler>>,
        listeners: Vec<Arc<dyn ProcessCompletionListener>>,
    ) -> KernelResult<Arc<Self>> {
        let mut containers = Vec::with_capacity(metadata.process_resources.len());
        for resource in &metadata.process_resources {
            let scopes = ScopeContainers {
                process: &containers,
                thread: &[],
                function: &[],
            };
            let container =
                ResourceContainer::new(resource.clone(), ResourceScope::Process, &scopes, &office)?;
            containers.push(container);
        }

        let process = Arc::new(Self {
            id: ProcessId::next(),
            office,
            metadata,
            main_lock: Arc::new(ReentrantMutex::new(())),
            containers,
            source_handler,
            cleanup: Arc::new(CleanupSequence::new()),
            aborted: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            inner: Mutex::new(ProcessInner {
                phase: ProcessPhase::Active,
                main_created: false,
                threads: IndexMap::new(),
                listeners,
                unhandled: None,
                notified: false,
            }),
            completion: Condvar::new(),
        });
        process.office.stats().record_process_started();
        debug!("{} '{}' created", process.id, process.metadata.name);
        Ok(process)
    }

    #[inline]
    pub fn id(&self) -> ProcessId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    #[inline]
    pub fn metadata(&self) -> &Arc<ProcessMetaData> {
        &self.metadata
    }

    #[inline]
    pub(crate) fn office(&self) -> &Arc<OfficeCore> {
        &self.office
    }

    /// Lock of the main thread, also used as the spawn barrier.
    #[inline]
    pub fn main_lock(&self) -> &Arc<ReentrantMutex<()>> {
        &self.main_lock
    }

    /// Process-scoped containers, in declaration order.
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

    #[inline]
    pub(crate) fn source_handler(&self) -> Option<&Arc<dyn EscalationHandler>> {
        self.source_handler.as_ref()
    }

    /// Serializer for this process's recycle jobs.
    #[inline]
    pub fn cleanup(&self) -> &Arc<CleanupSequence> {
        &self.cleanup
    }

    pub fn phase(&self) -> ProcessPhase {
        self.inner.lock().phase
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Whether an unhandled failure aborted the process.
    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn thread_count(&self) -> usize {
        self.inner.lock().threads.len()
    }

    /// First failure that reached no handler.
    pub fn unhandled_failure(&self) -> Option<KernelError> {
        self.inner.lock().unhandled.clone()
    }

    /// Listen for completion.
    pub fn add_completion_listener(
        &self,
        listener: Arc<dyn ProcessCompletionListener>,
    ) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        if inner.phase == ProcessPhase::Complete {
            return Err(KernelError::ProcessComplete(self.id.value()));
        }
        inner.listeners.push(listener);
        Ok(())
    }

    /// Block until the process completes, or `timeout` elapses.
    pub fn wait_for_completion(
        &self,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while !inner.notified {
            if self
                .completion
                .wait_until(&mut inner, deadline)
                .timed_out()
            {
                return inner.notified;
            }
        }
        true
    }

    /// Attach a new thread. The first one is the main thread and shares the
    /// process main lock.
    pub(crate) fn spawn_thread(self: &Arc<Self>) -> KernelResult<Arc<ThreadState>> {
        let is_main = {
            let mut inner = self.inner.lock();
            if inner.phase != ProcessPhase::Active {
                return Err(KernelError::ProcessComplete(self.id.value()));
            }
            !std::mem::replace(&mut inner.main_created, true)
        };

        let lock = if is_main {
            self.main_lock.clone()
        } else {
            Arc::new(ReentrantMutex::new(()))
        };
        let thread = ThreadState::new(self, lock)?;

        let mut inner = self.inner.lock();
        if inner.phase != ProcessPhase::Active {
            return Err(KernelError::ProcessComplete(self.id.value()));
        }
        inner.threads.insert(thread.id(), thread.clone());
        self.office.stats().record_thread_spawned();
        debug!("{} attached to {}", thread.id(), self.id);
        Ok(thread)
    }

    /// Detach a terminated thread. Returns the process completion chain when
    /// it was the last one.
    pub(crate) fn thread_terminated(
        self: &Arc<Self>,
        thread: &Arc<ThreadState>,
    ) -> Option<JobNode> {
        {
            let mut inner = self.inner.lock();
            inner.threads.shift_remove(&thread.id());
            if !inner.threads.is_empty() || inner.phase != ProcessPhase::Active {
                return None;
            }
            inner.phase = ProcessPhase::Completing;
        }
        debug!("{} completing", self.id);

        let unload = {
            let process = self.clone();
            FunctionJob::kernel("unload process resources", thread, move |context| {
                for container in process.containers.iter().rev() {
                    container.unload(&process, context.activations());
                }
                Ok(None)
            })
        };
        let finalize = {
            let process = self.clone();
            FunctionJob::kernel("finalize process", thread, move |_| {
                // Listeners see the process only after its recycling is done
                let cleanup = process.cleanup().clone();
                cleanup.when_idle(move || process.finalize());
                Ok(None)
            })
        };
        Some(JobNode::iterate_list(thread, [unload, finalize]))
    }

    fn finalize(&self) {
        let (listeners, outcome) = {
            let mut inner = self.inner.lock();
            let outcome = match &inner.unhandled {
                Some(failure) => ProcessOutcome::Failed(failure.clone()),
                None => ProcessOutcome::Completed,
            };
            // Counted before the phase flips so waiters observe both
            self.office
                .stats()
                .record_process_completed(outcome.is_completed());
            inner.phase = ProcessPhase::Complete;
            self.completed.store(true, Ordering::SeqCst);
            (std::mem::take(&mut inner.listeners), outcome)
        };

        match &outcome {
            ProcessOutcome::Completed => info!("{} '{}' complete", self.id, self.name()),
            ProcessOutcome::Failed(failure) => {
                warn!("{} '{}' complete with failure: {}", self.id, self.name(), failure)
            },
        }
        for listener in listeners {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                listener.process_completed(self.id, &outcome)
            }));
            if let Err(payload) = result {
                warn!(
                    "completion listener of {} panicked: {}",
                    self.id,
                    panic_message(payload.as_ref())
                );
            }
        }

        self.inner.lock().notified = true;
        self.completion.notify_all();
    }

    /// Abort after an unhandled failure.
    ///
    /// Parked waiters on every container of the process are released with
    /// `failure`; job steps not yet run are skipped, kernel steps still run.
    pub(crate) fn abort(
        &self,
        failure: KernelError,
        activations: &mut ActivationSet,
    ) {
        let threads: Vec<Arc<ThreadState>> = {
            let mut inner = self.inner.lock();
            inner.unhandled.get_or_insert_with(|| failure.clone());
            inner.threads.values().cloned().collect()
        };
        if self.aborted.swap(true, Ordering::SeqCst) {
            return;
        }

        error!("{} '{}' aborted: {}", self.id, self.name(), failure);
        for container in &self.containers {
            container.cancel(&failure, activations);
        }
        for thread in threads {
            for container in thread.containers() {
                container.cancel(&failure, activations);
            }
        }
    }
}

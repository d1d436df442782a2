//! Function jobs: the steps that do actual work.
//!
//! A function job names the resources it depends on. Before its body runs,
//! every dependency is checked afresh: a dependency still sourcing (or busy
//! with an asynchronous operation) parks the job on that container's monitor,
//! and a failed dependency turns the job into a failure of its thread.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{trace, warn};

use super::{ActivationSet, JobKind, JobNode, NodeHead};
use crate::runtime::container::{
    DependencyRef, OperationHandle, Readiness, ResourceContainer, ResourceMetaData,
    ResourceScope, ScopeContainers,
};
use crate::runtime::error::{panic_message, KernelError, KernelResult};
use crate::runtime::escalation::{EscalationCursor, EscalationProcedure, FailStep};
use crate::runtime::ids::JobId;
use crate::runtime::state::{ProcessState, SpawnRequest, ThreadState};
use crate::runtime::team::TeamSelector;

/// Body of a function job.
pub type JobBody = Box<dyn FnOnce(&mut JobContext<'_>) -> KernelResult<Option<JobNode>> + Send>;

/// A user or kernel step.
pub struct FunctionJob {
    name: String,
    dependencies: SmallVec<[Arc<ResourceContainer>; 4]>,
    scoped: SmallVec<[Arc<ResourceContainer>; 2]>,
    escalation: Option<Arc<EscalationProcedure>>,
    body: JobBody,
    next: Option<Box<JobNode>>,
    kernel: bool,
    setup_error: Option<KernelError>,
}

impl FunctionJob {
    /// Start building a function job on `thread`.
    pub fn builder(
        name: impl Into<String>,
        thread: &Arc<ThreadState>,
    ) -> FunctionJobBuilder {
        FunctionJobBuilder {
            name: name.into(),
            thread: thread.clone(),
            id: None,
            team: TeamSelector::Any,
            safety: false,
            dependencies: SmallVec::new(),
            scoped: SmallVec::new(),
            escalation: None,
            next: None,
            kernel: false,
            setup_error: None,
        }
    }

    /// A kernel step: runs under thread-state safety, even after the process
    /// has been aborted.
    pub(crate) fn kernel<F>(
        name: impl Into<String>,
        thread: &Arc<ThreadState>,
        body: F,
    ) -> JobNode
    where
        F: FnOnce(&mut JobContext<'_>) -> KernelResult<Option<JobNode>> + Send + 'static,
    {
        FunctionJob::kernel_builder(name, thread).build(body)
    }

    pub(crate) fn kernel_builder(
        name: impl Into<String>,
        thread: &Arc<ThreadState>,
    ) -> FunctionJobBuilder {
        let mut builder = FunctionJob::builder(name, thread).requires_thread_state_safety(true);
        builder.kernel = true;
        builder
    }

    /// Job name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn take_next(&mut self) -> Option<JobNode> {
        self.next.take().map(|next| *next)
    }

    fn dependencies_ready(&self) -> Readiness {
        for dependency in &self.dependencies {
            match dependency.check_ready() {
                Readiness::Ready => {},
                Readiness::Failed(failure) => {
                    return Readiness::Failed(failure.as_dependency_of(dependency.name()))
                },
                wait => return wait,
            }
        }
        Readiness::Ready
    }

    fn release_scoped(
        &self,
        process: &Arc<ProcessState>,
        activations: &mut ActivationSet,
    ) {
        for container in self.scoped.iter().rev() {
            container.unload(process, activations);
        }
    }

    /// Turn this job into a failure of its thread, escalated through this
    /// job's own procedure first. Function-scoped resources are released
    /// before escalation; `next` is dropped.
    pub(crate) fn into_failure(
        self,
        head: NodeHead,
        failure: KernelError,
    ) -> JobNode {
        JobNode::fail_step(
            head,
            FailStep {
                failure,
                cursor: EscalationCursor::function(self.escalation),
                release: self.scoped,
                continuation: None,
            },
        )
    }

    pub(crate) fn execute(
        mut self,
        head: NodeHead,
        activations: &mut ActivationSet,
    ) -> Option<JobNode> {
        let thread = head.thread.clone();
        let process = thread.process().clone();

        if !self.kernel && process.is_aborted() {
            trace!("skipping '{}': {} aborted", self.name, process.id());
            self.release_scoped(&process, activations);
            return None;
        }
        if let Some(failure) = self.setup_error.take() {
            return Some(self.into_failure(head, failure));
        }

        match self.dependencies_ready() {
            Readiness::Ready => {},
            Readiness::Wait(ticket) => {
                trace!("'{}' waiting on {}", self.name, ticket.monitor().id());
                process.office().stats().record_park();
                let resume = JobNode {
                    head,
                    kind: JobKind::Function(self),
                };
                return Some(JobNode::park(ticket, resume));
            },
            Readiness::Failed(failure) => return Some(self.into_failure(head, failure)),
        }

        let FunctionJob {
            name,
            dependencies,
            scoped,
            escalation,
            body,
            next,
            ..
        } = self;

        let outcome = {
            let mut context = JobContext::new(&thread, &name, &dependencies, activations);
            panic::catch_unwind(AssertUnwindSafe(move || body(&mut context)))
        };

        for container in scoped.iter().rev() {
            container.unload(&process, activations);
        }

        let failure = match outcome {
            Ok(Ok(Some(produced))) => {
                return Some(match next {
                    Some(next) => JobNode::continue_with(produced, *next),
                    None => produced,
                })
            },
            Ok(Ok(None)) => return next.map(|next| *next),
            Ok(Err(failure)) => failure,
            Err(payload) => KernelError::Panicked {
                job: name.clone(),
                message: panic_message(payload.as_ref()),
            },
        };

        warn!("'{}' failed on {}: {}", name, thread.id(), failure);
        Some(JobNode::fail_step(
            head,
            FailStep {
                failure,
                cursor: EscalationCursor::function(escalation),
                release: SmallVec::new(),
                continuation: None,
            },
        ))
    }
}

/// Builder for [`FunctionJob`] nodes.
pub struct FunctionJobBuilder {
    name: String,
    thread: Arc<ThreadState>,
    id: Option<JobId>,
    team: TeamSelector,
    safety: bool,
    dependencies: SmallVec<[Arc<ResourceContainer>; 4]>,
    scoped: SmallVec<[Arc<ResourceContainer>; 2]>,
    escalation: Option<Arc<EscalationProcedure>>,
    next: Option<JobNode>,
    kernel: bool,
    setup_error: Option<KernelError>,
}

impl FunctionJobBuilder {
    /// Use an explicit job id instead of a fresh one.
    pub fn id(
        mut self,
        id: JobId,
    ) -> Self {
        self.id = Some(id);
        self
    }

    /// Team responsible for running the job.
    pub fn team(
        mut self,
        team: TeamSelector,
    ) -> Self {
        self.team = team;
        self
    }

    /// Run the job under its thread's safety lock.
    pub fn requires_thread_state_safety(
        mut self,
        safety: bool,
    ) -> Self {
        self.safety = safety;
        self
    }

    /// Declare a function-scoped resource, created now and unloaded once the
    /// job's body has run. Refer to it with [`DependencyRef::function`].
    pub fn function_resource(
        mut self,
        metadata: impl Into<Arc<ResourceMetaData>>,
    ) -> Self {
        let scopes = ScopeContainers {
            process: self.thread.process().containers(),
            thread: self.thread.containers(),
            function: &self.scoped,
        };
        let office = self.thread.process().office().clone();
        match ResourceContainer::new(metadata.into(), ResourceScope::Function, &scopes, &office) {
            Ok(container) => self.scoped.push(container),
            Err(failure) => {
                self.setup_error.get_or_insert(failure);
            },
        }
        self
    }

    /// Depend on a resource; dependencies are indexed in declaration order.
    pub fn depends_on(
        mut self,
        reference: DependencyRef,
    ) -> Self {
        let scopes = ScopeContainers {
            process: self.thread.process().containers(),
            thread: self.thread.containers(),
            function: &self.scoped,
        };
        match scopes.resolve(reference) {
            Ok(container) => self.dependencies.push(container),
            Err(failure) => {
                self.setup_error.get_or_insert(failure);
            },
        }
        self
    }

    /// Function-level escalation procedure.
    pub fn escalation(
        mut self,
        procedure: Arc<EscalationProcedure>,
    ) -> Self {
        self.escalation = Some(procedure);
        self
    }

    /// Node to run after the body succeeds (and after anything it returned).
    pub fn then(
        mut self,
        next: JobNode,
    ) -> Self {
        self.next = Some(next);
        self
    }

    /// Finish the job with its body.
    pub fn build<F>(
        self,
        body: F,
    ) -> JobNode
    where
        F: FnOnce(&mut JobContext<'_>) -> KernelResult<Option<JobNode>> + Send + 'static,
    {
        let head = NodeHead {
            id: self.id.unwrap_or_else(JobId::next),
            thread: self.thread,
            team: self.team,
            safety: self.safety,
        };
        JobNode {
            head,
            kind: JobKind::Function(FunctionJob {
                name: self.name,
                dependencies: self.dependencies,
                scoped: self.scoped,
                escalation: self.escalation,
                body: Box::new(body),
                next: self.next.map(Box::new),
                kernel: self.kernel,
                setup_error: self.setup_error,
            }),
        }
    }
}

/// What a job body can see while it runs.
pub struct JobContext<'a> {
    thread: &'a Arc<ThreadState>,
    job: &'a str,
    dependencies: &'a [Arc<ResourceContainer>],
    activations: &'a mut ActivationSet,
}

impl<'a> JobContext<'a> {
    pub(crate) fn new(
        thread: &'a Arc<ThreadState>,
        job: &'a str,
        dependencies: &'a [Arc<ResourceContainer>],
        activations: &'a mut ActivationSet,
    ) -> Self {
        Self {
            thread,
            job,
            dependencies,
            activations,
        }
    }

    /// Thread the job runs on.
    #[inline]
    pub fn thread(&self) -> &Arc<ThreadState> {
        self.thread
    }

    /// Process the job belongs to.
    #[inline]
    pub fn process(&self) -> &Arc<ProcessState> {
        self.thread.process()
    }

    /// Name of the running job.
    #[inline]
    pub fn job_name(&self) -> &str {
        self.job
    }

    /// Number of declared dependencies.
    #[inline]
    pub fn dependency_count(&self) -> usize {
        self.dependencies.len()
    }

    /// Container of the dependency at `index`.
    pub fn container(
        &self,
        index: usize,
    ) -> KernelResult<&Arc<ResourceContainer>> {
        self.dependencies.get(index).ok_or_else(|| {
            KernelError::InvalidMetaData(format!(
                "job '{}' has no dependency {}",
                self.job, index
            ))
        })
    }

    /// The ready resource of the dependency at `index`.
    pub fn resource<T>(
        &self,
        index: usize,
    ) -> KernelResult<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.container(index)?.resource::<T>()
    }

    /// Start an asynchronous operation on the dependency at `index`.
    ///
    /// Until the handle completes, jobs depending on that resource wait.
    pub fn begin_operation(
        &self,
        index: usize,
    ) -> KernelResult<OperationHandle> {
        self.container(index)?.begin_operation()
    }

    /// Release another node once this step returns.
    pub fn activate(
        &mut self,
        node: JobNode,
    ) {
        self.activations.push(node);
    }

    /// A node spawning a new thread whose chain is built by `initial`.
    /// Return it from the body to spawn before `next` runs.
    pub fn spawn_thread<F>(
        &self,
        initial: F,
    ) -> JobNode
    where
        F: FnOnce(&Arc<ThreadState>) -> JobNode + Send + 'static,
    {
        JobNode::spawn_thread(self.thread, SpawnRequest::new(initial), None)
    }

    pub(crate) fn activations(&mut self) -> &mut ActivationSet {
        &mut *self.activations
    }
}

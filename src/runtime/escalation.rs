//! Escalation: layered failure-handler resolution
//!
//! A failure recorded on a thread is offered to exactly one handler, looked up
//! in this order:
//!
//! 1. the failing function's own [`EscalationProcedure`]
//! 2. the office's procedure
//! 3. the resource-source handler that triggered the process
//! 4. the office's global fallback handler
//!
//! The handler runs as an ordinary job node. If it fails, resolution resumes
//! once, strictly above the level of the failing handler; a failure in that
//! second round is unrecoverable. A failure with no handler is fatal to the
//! process: it is aborted, but its listeners and cleanup still run.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, error, warn};

use crate::runtime::container::ResourceContainer;
use crate::runtime::error::{panic_message, FailureKind, KernelError, KernelResult};
use crate::runtime::job::{ActivationSet, FunctionJob, JobContext, JobNode};
use crate::runtime::state::{ProcessState, ThreadState};

/// Scope at which a handler is bound, in resolution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EscalationLevel {
    /// The failing function's own procedure.
    Function,
    /// The office-wide procedure.
    Office,
    /// The handler registered by whatever triggered the process.
    ResourceSource,
    /// The office's last-resort handler.
    Global,
}

impl EscalationLevel {
    /// Every level, in resolution order.
    pub const ALL: [EscalationLevel; 4] = [
        EscalationLevel::Function,
        EscalationLevel::Office,
        EscalationLevel::ResourceSource,
        EscalationLevel::Global,
    ];
}

/// Handles a failure routed to it.
///
/// Returning a node runs it before the failed chain continues; returning an
/// error re-escalates above this handler's level.
pub trait EscalationHandler: Send + Sync {
    fn handle(
        &self,
        failure: &KernelError,
        context: &mut JobContext<'_>,
    ) -> KernelResult<Option<JobNode>>;
}

impl<F> EscalationHandler for F
where
    F: Fn(&KernelError, &mut JobContext<'_>) -> KernelResult<Option<JobNode>> + Send + Sync,
{
    fn handle(
        &self,
        failure: &KernelError,
        context: &mut JobContext<'_>,
    ) -> KernelResult<Option<JobNode>> {
        self(failure, context)
    }
}

/// Wrap a closure as a shared handler.
pub fn handler_fn<F>(handler: F) -> Arc<dyn EscalationHandler>
where
    F: Fn(&KernelError, &mut JobContext<'_>) -> KernelResult<Option<JobNode>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(handler)
}

/// Which failures a procedure entry handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationMatch {
    /// Every failure.
    Any,
    /// Failures of one kind.
    Kind(FailureKind),
    /// Timeouts of sourcing or operations, including propagated ones.
    Timeout,
}

impl EscalationMatch {
    fn matches(
        &self,
        failure: &KernelError,
    ) -> bool {
        match self {
            EscalationMatch::Any => true,
            EscalationMatch::Kind(kind) => failure.kind() == *kind,
            EscalationMatch::Timeout => failure.is_timeout(),
        }
    }
}

/// Ordered handler bindings for one scope. The first matching entry wins.
#[derive(Default, Clone)]
pub struct EscalationProcedure {
    handlers: Vec<(EscalationMatch, Arc<dyn EscalationHandler>)>,
}

impl fmt::Debug for EscalationProcedure {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|(matcher, _)| matcher))
            .finish()
    }
}

impl EscalationProcedure {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a closure for failures matching `matcher`.
    pub fn on<F>(
        self,
        matcher: EscalationMatch,
        handler: F,
    ) -> Self
    where
        F: Fn(&KernelError, &mut JobContext<'_>) -> KernelResult<Option<JobNode>>
            + Send
            + Sync
            + 'static,
    {
        self.on_handler(matcher, Arc::new(handler))
    }

    /// Bind a shared handler for failures matching `matcher`.
    pub fn on_handler(
        mut self,
        matcher: EscalationMatch,
        handler: Arc<dyn EscalationHandler>,
    ) -> Self {
        self.handlers.push((matcher, handler));
        self
    }

    /// Handler for `failure`, if any entry matches.
    pub fn handler_for(
        &self,
        failure: &KernelError,
    ) -> Option<Arc<dyn EscalationHandler>> {
        self.handlers
            .iter()
            .find(|(matcher, _)| matcher.matches(failure))
            .map(|(_, handler)| handler.clone())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Where resolution of one failure stands.
#[derive(Clone, Default)]
pub(crate) struct EscalationCursor {
    procedure: Option<Arc<EscalationProcedure>>,
    after: Option<EscalationLevel>,
    second_round: bool,
}

impl EscalationCursor {
    pub(crate) fn function(procedure: Option<Arc<EscalationProcedure>>) -> Self {
        Self {
            procedure,
            ..Self::default()
        }
    }

    fn above(
        &self,
        level: EscalationLevel,
    ) -> Self {
        Self {
            procedure: self.procedure.clone(),
            after: Some(level),
            second_round: true,
        }
    }

    fn resolve(
        &self,
        failure: &KernelError,
        process: &ProcessState,
    ) -> Option<(EscalationLevel, Arc<dyn EscalationHandler>)> {
        EscalationLevel::ALL
            .into_iter()
            .filter(|level| self.after.map_or(true, |after| *level > after))
            .find_map(|level| {
                let handler = match level {
                    EscalationLevel::Function => self
                        .procedure
                        .as_ref()
                        .and_then(|procedure| procedure.handler_for(failure)),
                    EscalationLevel::Office => process
                        .office()
                        .escalation()
                        .and_then(|procedure| procedure.handler_for(failure)),
                    EscalationLevel::ResourceSource => process.source_handler().cloned(),
                    EscalationLevel::Global => process.office().global_handler().cloned(),
                };
                handler.map(|handler| (level, handler))
            })
    }
}

/// Payload of a fail-thread node.
pub(crate) struct FailStep {
    pub(crate) failure: KernelError,
    pub(crate) cursor: EscalationCursor,
    /// Function-scoped containers to unload before escalating.
    pub(crate) release: SmallVec<[Arc<ResourceContainer>; 2]>,
    pub(crate) continuation: Option<Box<JobNode>>,
}

impl FailStep {
    pub(crate) fn execute(
        self,
        thread: &Arc<ThreadState>,
        activations: &mut ActivationSet,
    ) -> Option<JobNode> {
        let FailStep {
            failure,
            cursor,
            release,
            continuation,
        } = self;
        let process = thread.process().clone();
        for container in release.iter().rev() {
            container.unload(&process, activations);
        }
        let continuation = continuation.map(|node| *node);

        if process.is_aborted() {
            debug!("{} aborted, dropping failure: {}", process.id(), failure);
            return continuation;
        }

        thread.begin_escalation(&failure);
        process.office().stats().record_escalation();
        match cursor.resolve(&failure, &process) {
            Some((level, handler)) => {
                debug!("{} escalating to {:?} handler: {}", thread.id(), level, failure);
                Some(handler_node(thread, failure, level, handler, cursor, continuation))
            },
            None => {
                fatal(thread, failure, activations);
                continuation
            },
        }
    }
}

fn handler_node(
    thread: &Arc<ThreadState>,
    failure: KernelError,
    level: EscalationLevel,
    handler: Arc<dyn EscalationHandler>,
    cursor: EscalationCursor,
    continuation: Option<JobNode>,
) -> JobNode {
    let owner = thread.clone();
    let mut builder = FunctionJob::kernel_builder(format!("{:?} escalation", level), thread);
    if let Some(continuation) = continuation {
        builder = builder.then(continuation);
    }

    builder.build(move |context| {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&failure, context)))
            .unwrap_or_else(|payload| {
                Err(KernelError::Panicked {
                    job: format!("{:?} escalation handler", level),
                    message: panic_message(payload.as_ref()),
                })
            });

        match outcome {
            Ok(recovery) => {
                owner.end_escalation();
                Ok(recovery)
            },
            Err(cause) => {
                let original = match failure {
                    KernelError::Unrecoverable { original, .. } => original,
                    other => Arc::new(other),
                };
                let failure = KernelError::Unrecoverable {
                    original,
                    cause: Arc::new(cause),
                };
                if cursor.second_round {
                    fatal(&owner, failure, context.activations());
                    Ok(None)
                } else {
                    warn!("{:?} handler failed on {}: {}", level, owner.id(), failure);
                    Ok(Some(JobNode::escalate(
                        &owner,
                        failure,
                        cursor.above(level),
                        None,
                    )))
                }
            },
        }
    })
}

/// A failure no handler took: record it and abort the process.
pub(crate) fn fatal(
    thread: &Arc<ThreadState>,
    failure: KernelError,
    activations: &mut ActivationSet,
) {
    error!("unhandled failure on {}: {}", thread.id(), failure);
    thread.record_unhandled(failure.clone());
    let process = thread.process();
    process.office().stats().record_fatal();
    process.abort(failure, activations);
}

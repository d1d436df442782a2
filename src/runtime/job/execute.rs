//! The single executor for every job node variant.

use std::sync::Arc;

use tracing::trace;

use super::{ActivationSet, JobKind, JobNode};
use crate::runtime::asset::AssetWait;
use crate::runtime::state::{SpawnRequest, ThreadState};

impl JobNode {
    /// Run one step and return the next node of the chain, if any.
    ///
    /// Nodes released as a side effect (resumed waiters, spawned threads,
    /// cleanup jobs) are added to `activations` for the caller to dispatch.
    pub fn execute(
        self,
        activations: &mut ActivationSet,
    ) -> Option<JobNode> {
        let (head, kind) = self.into_parts();
        match kind {
            JobKind::Function(job) => job.execute(head, activations),

            JobKind::Continue {
                delegate,
                continuation,
            } => execute_continue(*delegate, *continuation, activations),

            JobKind::FailThread(step) => step.execute(&head.thread, activations),

            JobKind::SpawnThread {
                request,
                continuation,
            } => execute_spawn(&head.thread, request, continuation.map(|c| *c), activations),

            JobKind::Synchronize { continuation } => {
                let process = head.thread.process();
                {
                    let _barrier = process.main_lock().lock();
                    trace!("{} synchronized with {}", head.thread.id(), process.id());
                }
                continuation.map(|c| *c)
            },

            JobKind::IterateList { mut entries } => {
                let first = entries.pop_front()?;
                if entries.is_empty() {
                    Some(first)
                } else {
                    let rest = JobNode::iterate_entries(&head.thread, entries);
                    Some(JobNode::continue_with(first, rest))
                }
            },

            JobKind::Park { ticket, resume } => match ticket.wait(*resume) {
                AssetWait::Parked => None,
                AssetWait::Ready(node) => Some(node),
            },

            JobKind::Spent => None,
        }
    }
}

/// One step of a `Continue`.
///
/// A delegate that is itself a `Continue` is re-associated instead of being
/// executed, and a delegate that parks carries the continuation with it, so
/// neither left-nested chains nor suspensions grow the stack or lose work.
fn execute_continue(
    delegate: JobNode,
    continuation: JobNode,
    activations: &mut ActivationSet,
) -> Option<JobNode> {
    let (head, kind) = delegate.into_parts();
    match kind {
        // Continue{Continue{a, b}, c} => Continue{a, Continue{b, c}}
        JobKind::Continue {
            delegate: inner,
            continuation: middle,
        } => Some(JobNode::continue_with(
            *inner,
            JobNode::continue_with(*middle, continuation),
        )),

        JobKind::Park { ticket, resume } => Some(JobNode::park(
            ticket,
            JobNode::continue_with(*resume, continuation),
        )),

        kind => match (JobNode { head, kind }).execute(activations) {
            None => Some(continuation),
            Some(next) => Some(JobNode::continue_with(next, continuation)),
        },
    }
}

fn execute_spawn(
    thread: &Arc<ThreadState>,
    request: SpawnRequest,
    continuation: Option<JobNode>,
    activations: &mut ActivationSet,
) -> Option<JobNode> {
    match request.launch(thread.process()) {
        Ok(chain) => {
            trace!("{} spawned {}", thread.id(), chain.thread_state().id());
            activations.push(chain);
            continuation
        },
        Err(failure) => Some(JobNode::fail_thread(thread, failure, continuation)),
    }
}

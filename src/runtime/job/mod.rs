//! Job nodes: continuation-style units of schedulable work
//!
//! Executing a [`JobNode`] runs one step and returns the next node to run, or
//! `None` once its chain segment is complete. Nodes never call their
//! successor; the driver loop in [`driver`] runs the returned node or hands it
//! to the team it declares, so arbitrarily long chains run in constant stack.
//!
//! # Variants
//!
//! - `Function`: a user or kernel step (see [`FunctionJob`])
//! - `Continue`: finish a delegate chain, then run a continuation
//! - `FailThread`: route a failure through escalation, then continue
//! - `SpawnThread`: attach a new thread to the process, then continue
//! - `Synchronize`: take the process main lock as a memory barrier
//! - `IterateList`: drive one chain per entry, in order
//! - `Park`: suspend a node on an asset monitor
//!
//! Wrapper variants (`Continue`, `IterateList`, `Park`) take their thread,
//! team and safety flag from the node they currently drive. Nodes are
//! immutable until executed, so that head is captured once at construction.

pub mod driver;
pub mod execute;
pub mod function;

pub use driver::{dispatch, run_job_loop};
pub use function::{FunctionJob, FunctionJobBuilder, JobBody, JobContext};

use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::runtime::asset::AssetTicket;
use crate::runtime::error::KernelError;
use crate::runtime::escalation::{EscalationCursor, FailStep};
use crate::runtime::ids::JobId;
use crate::runtime::state::{SpawnRequest, ThreadState};
use crate::runtime::team::TeamSelector;

/// Identity, thread, team and safety flag of the step a node drives.
#[derive(Clone)]
pub(crate) struct NodeHead {
    pub(crate) id: JobId,
    pub(crate) thread: Arc<ThreadState>,
    pub(crate) team: TeamSelector,
    pub(crate) safety: bool,
}

impl NodeHead {
    /// Head of a kernel step that mutates thread or process structure.
    pub(crate) fn guarded(thread: &Arc<ThreadState>) -> Self {
        Self {
            id: JobId::next(),
            thread: thread.clone(),
            team: TeamSelector::Any,
            safety: true,
        }
    }
}

pub(crate) enum JobKind {
    Function(FunctionJob),
    Continue {
        delegate: Box<JobNode>,
        continuation: Box<JobNode>,
    },
    FailThread(FailStep),
    SpawnThread {
        request: SpawnRequest,
        continuation: Option<Box<JobNode>>,
    },
    Synchronize {
        continuation: Option<Box<JobNode>>,
    },
    IterateList {
        entries: VecDeque<JobNode>,
    },
    Park {
        ticket: AssetTicket,
        resume: Box<JobNode>,
    },
    /// Left behind once the node's parts have been taken.
    Spent,
}

impl JobKind {
    /// Move every nested node out into `pending`.
    fn detach_into(
        &mut self,
        pending: &mut Vec<JobNode>,
    ) {
        match mem::replace(self, JobKind::Spent) {
            JobKind::Function(mut job) => pending.extend(job.take_next()),
            JobKind::Continue {
                delegate,
                continuation,
            } => {
                pending.push(*delegate);
                pending.push(*continuation);
            },
            JobKind::FailThread(mut step) => pending.extend(step.continuation.take().map(|c| *c)),
            JobKind::SpawnThread { continuation, .. } | JobKind::Synchronize { continuation } => {
                pending.extend(continuation.map(|c| *c))
            },
            JobKind::IterateList { entries } => pending.extend(entries),
            JobKind::Park { resume, .. } => pending.push(*resume),
            JobKind::Spent => {},
        }
    }
}

/// The schedulable unit.
pub struct JobNode {
    pub(crate) head: NodeHead,
    pub(crate) kind: JobKind,
}

impl fmt::Debug for JobNode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("JobNode")
            .field("id", &self.head.id)
            .field("kind", &self.kind_name())
            .field("thread", &self.head.thread.id())
            .field("team", &self.head.team)
            .field("safety", &self.head.safety)
            .finish()
    }
}

// Unexecuted chains can nest arbitrarily deep; take them apart on a work
// list so dropping one never recurses.
impl Drop for JobNode {
    fn drop(&mut self) {
        if matches!(self.kind, JobKind::Spent) {
            return;
        }
        let mut pending = Vec::new();
        self.kind.detach_into(&mut pending);
        while let Some(mut node) = pending.pop() {
            node.kind.detach_into(&mut pending);
        }
    }
}

impl JobNode {
    /// Split into head and kind, leaving a spent node to drop.
    pub(crate) fn into_parts(mut self) -> (NodeHead, JobKind) {
        let kind = mem::replace(&mut self.kind, JobKind::Spent);
        let head = NodeHead {
            id: self.head.id,
            thread: self.head.thread.clone(),
            team: mem::take(&mut self.head.team),
            safety: self.head.safety,
        };
        (head, kind)
    }

    /// Run `delegate` (and everything it produces) to completion, then
    /// `continuation`, whatever the delegate's result.
    ///
    /// The new node holds no reference to any chain that previously ran
    /// `delegate`; earlier work is only reachable through the execute loop.
    pub fn continue_with(
        delegate: JobNode,
        continuation: JobNode,
    ) -> JobNode {
        JobNode {
            head: delegate.head.clone(),
            kind: JobKind::Continue {
                delegate: Box::new(delegate),
                continuation: Box::new(continuation),
            },
        }
    }

    /// Shorthand for [`JobNode::continue_with`].
    #[inline]
    pub fn then(
        self,
        continuation: JobNode,
    ) -> JobNode {
        JobNode::continue_with(self, continuation)
    }

    /// Record `failure` on `thread`, escalate it, then run `continuation`.
    pub fn fail_thread(
        thread: &Arc<ThreadState>,
        failure: KernelError,
        continuation: Option<JobNode>,
    ) -> JobNode {
        JobNode::escalate(thread, failure, EscalationCursor::default(), continuation)
    }

    pub(crate) fn escalate(
        thread: &Arc<ThreadState>,
        failure: KernelError,
        cursor: EscalationCursor,
        continuation: Option<JobNode>,
    ) -> JobNode {
        JobNode::fail_step(
            NodeHead::guarded(thread),
            FailStep {
                failure,
                cursor,
                release: SmallVec::new(),
                continuation: continuation.map(Box::new),
            },
        )
    }

    pub(crate) fn fail_step(
        head: NodeHead,
        step: FailStep,
    ) -> JobNode {
        JobNode {
            head: NodeHead {
                team: TeamSelector::Any,
                safety: true,
                ..head
            },
            kind: JobKind::FailThread(step),
        }
    }

    /// Attach a new thread to `thread`'s process, start it, then continue
    /// the caller with `continuation`.
    pub fn spawn_thread(
        thread: &Arc<ThreadState>,
        request: SpawnRequest,
        continuation: Option<JobNode>,
    ) -> JobNode {
        JobNode {
            head: NodeHead::guarded(thread),
            kind: JobKind::SpawnThread {
                request,
                continuation: continuation.map(Box::new),
            },
        }
    }

    /// Take the process main lock as a barrier, then run `continuation`.
    pub fn synchronize(
        thread: &Arc<ThreadState>,
        continuation: Option<JobNode>,
    ) -> JobNode {
        JobNode {
            head: NodeHead::guarded(thread),
            kind: JobKind::Synchronize {
                continuation: continuation.map(Box::new),
            },
        }
    }

    /// Run each entry's chain to completion, in order.
    pub fn iterate_list(
        thread: &Arc<ThreadState>,
        entries: impl IntoIterator<Item = JobNode>,
    ) -> JobNode {
        JobNode::iterate_entries(thread, entries.into_iter().collect())
    }

    pub(crate) fn iterate_entries(
        thread: &Arc<ThreadState>,
        entries: VecDeque<JobNode>,
    ) -> JobNode {
        let head = match entries.front() {
            Some(first) => first.head.clone(),
            None => NodeHead {
                safety: false,
                ..NodeHead::guarded(thread)
            },
        };
        JobNode {
            head,
            kind: JobKind::IterateList { entries },
        }
    }

    pub(crate) fn park(
        ticket: AssetTicket,
        resume: JobNode,
    ) -> JobNode {
        JobNode {
            head: resume.head.clone(),
            kind: JobKind::Park {
                ticket,
                resume: Box::new(resume),
            },
        }
    }

    /// Id of the step this node currently drives.
    #[inline]
    pub fn id(&self) -> JobId {
        self.head.id
    }

    /// Thread state the current step belongs to.
    #[inline]
    pub fn thread_state(&self) -> &Arc<ThreadState> {
        &self.head.thread
    }

    /// Team responsible for the current step.
    #[inline]
    pub fn responsible_team(&self) -> &TeamSelector {
        &self.head.team
    }

    /// Whether the current step must run under its thread's safety lock.
    #[inline]
    pub fn requires_thread_state_safety(&self) -> bool {
        self.head.safety
    }

    /// Variant name.
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            JobKind::Function(_) => "function",
            JobKind::Continue { .. } => "continue",
            JobKind::FailThread(_) => "fail-thread",
            JobKind::SpawnThread { .. } => "spawn-thread",
            JobKind::Synchronize { .. } => "synchronize",
            JobKind::IterateList { .. } => "iterate-list",
            JobKind::Park { .. } => "park",
            JobKind::Spent => "spent",
        }
    }

    /// Short description of the current step, for task names and logs.
    pub fn describe(&self) -> String {
        let mut node = self;
        loop {
            match &node.kind {
                JobKind::Continue { delegate, .. } => node = delegate,
                JobKind::Park { resume, .. } => node = resume,
                JobKind::IterateList { entries } if !entries.is_empty() => node = &entries[0],
                JobKind::Function(job) => return job.name().to_string(),
                _ => return format!("{} {}", node.kind_name(), node.head.id),
            }
        }
    }

    /// Replace the current step with a failure of its thread.
    ///
    /// Every continuation wrapped around the step is kept, so the rest of
    /// the chain (including the flow's completion) still runs once the
    /// failure has been escalated.
    pub(crate) fn into_failed(
        self,
        failure: KernelError,
    ) -> JobNode {
        enum Frame {
            Continue(JobNode),
            Iterate(Arc<ThreadState>, VecDeque<JobNode>),
        }

        let mut frames = Vec::new();
        let mut node = self;
        let leaf = loop {
            let (head, kind) = node.into_parts();
            match kind {
                JobKind::Continue {
                    delegate,
                    continuation,
                } => {
                    frames.push(Frame::Continue(*continuation));
                    node = *delegate;
                },
                JobKind::Park { resume, .. } => node = *resume,
                JobKind::IterateList { mut entries } if !entries.is_empty() => {
                    let Some(first) = entries.pop_front() else {
                        break JobNode::fail_thread(&head.thread, failure, None);
                    };
                    if !entries.is_empty() {
                        frames.push(Frame::Iterate(head.thread, entries));
                    }
                    node = first;
                },
                JobKind::Function(job) => break job.into_failure(head, failure),
                kind => {
                    let thread = head.thread.clone();
                    drop(JobNode { head, kind });
                    break JobNode::fail_thread(&thread, failure, None);
                },
            }
        };

        let mut failed = leaf;
        while let Some(frame) = frames.pop() {
            failed = match frame {
                Frame::Continue(continuation) => JobNode::continue_with(failed, continuation),
                Frame::Iterate(thread, rest) => {
                    JobNode::continue_with(failed, JobNode::iterate_entries(&thread, rest))
                },
            };
        }
        failed
    }
}

/// Job nodes released by one step, awaiting dispatch.
#[derive(Debug, Default)]
pub struct ActivationSet {
    nodes: Vec<JobNode>,
}

impl ActivationSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node.
    #[inline]
    pub fn push(
        &mut self,
        node: JobNode,
    ) {
        self.nodes.push(node);
    }

    /// Number of nodes awaiting dispatch.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check whether the set is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Take every node out of the set, in activation order.
    pub fn drain(&mut self) -> std::vec::Drain<'_, JobNode> {
        self.nodes.drain(..)
    }

    /// Hand every node to its team.
    pub fn dispatch(&mut self) {
        for node in self.nodes.drain(..) {
            dispatch(node);
        }
    }
}

impl Extend<JobNode> for ActivationSet {
    fn extend<I: IntoIterator<Item = JobNode>>(
        &mut self,
        iter: I,
    ) {
        self.nodes.extend(iter);
    }
}

#[cfg(test)]
mod tests;

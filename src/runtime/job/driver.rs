//! The trampoline that runs job nodes.
//!
//! `run_job_loop` executes a node, then the node it returns, and so on, for as
//! long as each node may run on the current team. A node declaring another
//! team is handed to that team instead. Nothing here recurses: a passive team
//! reached from inside a running loop queues its work on the loop already
//! driving the OS thread.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};

use tracing::error;

use super::{ActivationSet, JobNode};
use crate::runtime::error::{panic_message, KernelError};
use crate::runtime::state::ThreadState;
use crate::runtime::team::TeamId;

thread_local! {
    static DRIVING: RefCell<Option<VecDeque<(JobNode, TeamId)>>> = RefCell::new(None);
}

struct DrivingGuard;

impl Drop for DrivingGuard {
    fn drop(&mut self) {
        let _ = DRIVING.try_with(|driving| driving.borrow_mut().take());
    }
}

/// Hand `node` to the team it declares, via its process's office.
pub fn dispatch(node: JobNode) {
    let office = node.thread_state().process().office().clone();
    office.dispatch(node);
}

/// Drive `node` and its successors on behalf of `team`.
pub fn run_job_loop(
    node: JobNode,
    team: &TeamId,
) {
    let first = DRIVING.with(|driving| {
        let mut driving = driving.borrow_mut();
        match driving.as_mut() {
            Some(queue) => {
                queue.push_back((node, team.clone()));
                None
            },
            None => {
                *driving = Some(VecDeque::new());
                Some(node)
            },
        }
    });
    let Some(node) = first else {
        return;
    };

    let _guard = DrivingGuard;
    drive(node, team);
    while let Some((node, team)) =
        DRIVING.with(|driving| driving.borrow_mut().as_mut().and_then(VecDeque::pop_front))
    {
        drive(node, &team);
    }
}

fn drive(
    mut node: JobNode,
    team: &TeamId,
) {
    let current = Some(team);
    let mut activations = ActivationSet::new();
    loop {
        if !node.responsible_team().accepts(current) {
            dispatch(node);
            break;
        }

        node.thread_state()
            .process()
            .office()
            .stats()
            .record_job();
        let next = execute_guarded(node, &mut activations);
        activations.dispatch();

        match next {
            Some(next) => node = next,
            None => break,
        }
    }
}

/// Execute one step, under the thread's safety lock when it asks for it.
///
/// A panic escaping the step becomes a failure of the step's thread; the
/// rest of that chain is lost, so the thread is then forcibly terminated.
fn execute_guarded(
    node: JobNode,
    activations: &mut ActivationSet,
) -> Option<JobNode> {
    let thread = node.thread_state().clone();
    let id = node.id();

    let outcome = {
        let _guard = node
            .requires_thread_state_safety()
            .then(|| thread.lock().lock());
        panic::catch_unwind(AssertUnwindSafe(|| node.execute(activations)))
    };

    match outcome {
        Ok(next) => next,
        Err(payload) => {
            let failure = KernelError::Panicked {
                job: id.to_string(),
                message: panic_message(payload.as_ref()),
            };
            error!("{} on {} panicked: {}", id, thread.id(), failure);
            let abandon = ThreadState::abandon_node(&thread);
            Some(JobNode::fail_thread(&thread, failure, Some(abandon)))
        },
    }
}

//! Job node unit tests
//!
//! Trampoline execution order, stack-safe chains, function job results and
//! failure routing.

use super::*;
use crate::runtime::error::{KernelError, KernelResult};
use crate::runtime::escalation::{EscalationMatch, EscalationProcedure};
use crate::runtime::office::Office;
use crate::runtime::state::ProcessMetaData;
use crate::runtime::team::TeamSelector;
use crate::runtime::test_support::{drive, fixture, fixture_with, log, record, Log};
use std::sync::atomic::{AtomicUsize, Ordering};

fn entries(log: &Log) -> Vec<String> {
    log.lock().clone()
}

fn counting(
    thread: &Arc<ThreadState>,
    counter: &Arc<AtomicUsize>,
) -> JobNode {
    let counter = counter.clone();
    FunctionJob::builder("count", thread).build(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    })
}

fn recording_office(failures: &Log) -> Office {
    let failures = failures.clone();
    Office::builder("handled")
        .escalation(EscalationProcedure::new().on(EscalationMatch::Any, move |failure, _| {
            failures.lock().push(format!("{:?}", failure.kind()));
            Ok(None)
        }))
        .build()
        .unwrap()
}

#[cfg(test)]
mod chain_tests {
    use super::*;

    #[test]
    fn test_continue_runs_delegate_then_continuation() {
        let fx = fixture();
        let log = log();
        let node = record(&fx.thread, &log, "a").then(record(&fx.thread, &log, "b"));
        assert_eq!(node.kind_name(), "continue");
        assert_eq!(node.describe(), "a");
        drive(node);
        assert_eq!(entries(&log), ["a", "b"]);
    }

    #[test]
    fn test_wrapper_takes_head_of_delegate() {
        let fx = fixture();
        let log = log();
        let first = FunctionJob::builder("first", &fx.thread)
            .team(TeamSelector::team("io"))
            .requires_thread_state_safety(true)
            .build(|_| Ok(None));
        let id = first.id();
        let node = JobNode::continue_with(first, record(&fx.thread, &log, "b"));
        assert_eq!(node.id(), id);
        assert_eq!(node.responsible_team(), &TeamSelector::team("io"));
        assert!(node.requires_thread_state_safety());
        assert!(Arc::ptr_eq(node.thread_state(), &fx.thread));
    }

    #[test]
    fn test_long_right_nested_chain() {
        let fx = fixture();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut node = counting(&fx.thread, &counter);
        for _ in 1..100_000 {
            node = JobNode::continue_with(counting(&fx.thread, &counter), node);
        }
        drive(node);
        assert_eq!(counter.load(Ordering::SeqCst), 100_000);
    }

    #[test]
    fn test_long_left_nested_chain() {
        let fx = fixture();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut node = counting(&fx.thread, &counter);
        for _ in 1..100_000 {
            node = JobNode::continue_with(node, counting(&fx.thread, &counter));
        }
        drive(node);
        assert_eq!(counter.load(Ordering::SeqCst), 100_000);
    }

    #[test]
    fn test_failing_head_discards_long_successor_chain() {
        let failures = log();
        let fx = fixture_with(recording_office(&failures), ProcessMetaData::new("p"));
        let counter = Arc::new(AtomicUsize::new(0));
        let mut successors = counting(&fx.thread, &counter);
        for _ in 1..100_000 {
            successors = counting(&fx.thread, &counter).then(successors);
        }
        let node = FunctionJob::builder("fails", &fx.thread)
            .then(successors)
            .build(|_| Err(KernelError::execution("fails", "boom")));
        drive(node);

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(entries(&failures), ["Execution"]);
    }

    #[test]
    fn test_unexecuted_chains_drop_without_recursion() {
        let fx = fixture();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut left = counting(&fx.thread, &counter);
        let mut right = counting(&fx.thread, &counter);
        for _ in 1..100_000 {
            left = left.then(counting(&fx.thread, &counter));
            right = counting(&fx.thread, &counter).then(right);
        }
        let list = JobNode::iterate_list(&fx.thread, vec![left, right]);
        drop(list);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_left_nested_order_is_preserved() {
        let fx = fixture();
        let log = log();
        let node = JobNode::continue_with(
            JobNode::continue_with(record(&fx.thread, &log, "a"), record(&fx.thread, &log, "b")),
            record(&fx.thread, &log, "c"),
        );
        drive(node);
        assert_eq!(entries(&log), ["a", "b", "c"]);
    }

    #[test]
    fn test_iterate_list_runs_each_chain_in_order() {
        let fx = fixture();
        let log = log();
        let nested = {
            let log = log.clone();
            let thread = fx.thread.clone();
            FunctionJob::builder("a", &fx.thread).build(move |_| {
                log.lock().push("a".to_string());
                Ok(Some(record(&thread, &log, "a.1")))
            })
        };
        let node = JobNode::iterate_list(
            &fx.thread,
            [nested, record(&fx.thread, &log, "b"), record(&fx.thread, &log, "c")],
        );
        assert_eq!(node.describe(), "a");
        drive(node);
        assert_eq!(entries(&log), ["a", "a.1", "b", "c"]);
    }

    #[test]
    fn test_empty_iterate_list_is_a_no_op() {
        let fx = fixture();
        let node = JobNode::iterate_list(&fx.thread, []);
        assert!(!node.requires_thread_state_safety());
        let mut activations = ActivationSet::new();
        assert!(node.execute(&mut activations).is_none());
        assert!(activations.is_empty());
    }

    #[test]
    fn test_long_iterate_list() {
        let fx = fixture();
        let counter = Arc::new(AtomicUsize::new(0));
        let node = JobNode::iterate_list(
            &fx.thread,
            (0..50_000).map(|_| counting(&fx.thread, &counter)),
        );
        drive(node);
        assert_eq!(counter.load(Ordering::SeqCst), 50_000);
    }

    #[test]
    fn test_synchronize_then_continues() {
        let fx = fixture();
        let log = log();
        let node = JobNode::synchronize(&fx.thread, Some(record(&fx.thread, &log, "after")));
        assert!(node.requires_thread_state_safety());
        drive(node);
        assert_eq!(entries(&log), ["after"]);
    }
}

#[cfg(test)]
mod function_tests {
    use super::*;

    #[test]
    fn test_returned_node_runs_before_next() {
        let fx = fixture();
        let log = log();
        let thread = fx.thread.clone();
        let body_log = log.clone();
        let node = FunctionJob::builder("f", &fx.thread)
            .then(record(&fx.thread, &log, "next"))
            .build(move |_| {
                body_log.lock().push("f".to_string());
                Ok(Some(record(&thread, &body_log, "produced")))
            });
        drive(node);
        assert_eq!(entries(&log), ["f", "produced", "next"]);
    }

    #[test]
    fn test_context_exposes_job_and_thread() {
        let fx = fixture();
        let seen = log();
        let sink = seen.clone();
        let expected = fx.thread.id();
        let node = FunctionJob::builder("inspect", &fx.thread).build(move |context| {
            assert_eq!(context.thread().id(), expected);
            assert_eq!(context.dependency_count(), 0);
            assert!(context.container(0).is_err());
            sink.lock().push(context.job_name().to_string());
            Ok(None)
        });
        drive(node);
        assert_eq!(entries(&seen), ["inspect"]);
    }

    #[test]
    fn test_activated_nodes_are_dispatched() {
        let fx = fixture();
        let log = log();
        let thread = fx.thread.clone();
        let body_log = log.clone();
        let node = FunctionJob::builder("parent", &fx.thread).build(move |context| {
            context.activate(record(&thread, &body_log, "side"));
            body_log.lock().push("parent".to_string());
            Ok(None)
        });
        drive(node);
        assert_eq!(entries(&log), ["parent", "side"]);
    }

    #[test]
    fn test_unhandled_error_aborts_process() {
        let fx = fixture();
        let log = log();
        let failing = FunctionJob::builder("fails", &fx.thread)
            .then(record(&fx.thread, &log, "skipped next"))
            .build(|_| Err(KernelError::execution("fails", "boom")));
        drive(failing.then(record(&fx.thread, &log, "skipped continuation")));

        assert!(fx.process.is_aborted());
        assert!(entries(&log).is_empty());
        assert!(matches!(
            fx.process.unhandled_failure(),
            Some(KernelError::Execution { .. })
        ));
        assert!(matches!(
            fx.thread.unhandled_failure(),
            Some(KernelError::Execution { .. })
        ));
        assert_eq!(fx.office.stats().snapshot().fatal_failures, 1);
    }

    #[test]
    fn test_function_handler_recovers_and_chain_continues() {
        let fx = fixture();
        let log = log();
        let handled = log.clone();
        let procedure = EscalationProcedure::new().on(EscalationMatch::Any, move |failure, _| {
            handled.lock().push(format!("handled {}", failure));
            Ok(None)
        });
        let failing = FunctionJob::builder("fails", &fx.thread)
            .escalation(Arc::new(procedure))
            .then(record(&fx.thread, &log, "dropped next"))
            .build(|_| Err(KernelError::execution("fails", "boom")));
        drive(failing.then(record(&fx.thread, &log, "continuation")));

        assert!(!fx.process.is_aborted());
        assert_eq!(
            entries(&log),
            ["handled job 'fails' failed: boom", "continuation"]
        );
        assert_eq!(fx.thread.failure().map(|f| f.to_string()), None);
    }

    #[test]
    fn test_panicking_body_becomes_failure() {
        let failures = log();
        let fx = fixture_with(recording_office(&failures), ProcessMetaData::new("p"));
        let log = log();
        let node = FunctionJob::builder("panics", &fx.thread).build(|_| -> KernelResult<Option<JobNode>> {
            panic!("body panicked");
        });
        drive(node.then(record(&fx.thread, &log, "after")));

        assert_eq!(entries(&failures), ["Execution"]);
        assert_eq!(entries(&log), ["after"]);
        assert!(!fx.process.is_aborted());
    }

    #[test]
    fn test_aborted_process_skips_user_jobs() {
        let fx = fixture();
        let log = log();
        let mut activations = ActivationSet::new();
        fx.process
            .abort(KernelError::execution("x", "stop"), &mut activations);
        drive(record(&fx.thread, &log, "user"));
        assert!(entries(&log).is_empty());
    }
}

#[cfg(test)]
mod failure_routing_tests {
    use super::*;

    #[test]
    fn test_into_failed_keeps_continuations() {
        let failures = log();
        let fx = fixture_with(recording_office(&failures), ProcessMetaData::new("p"));
        let log = log();
        let node = JobNode::continue_with(
            record(&fx.thread, &log, "replaced"),
            record(&fx.thread, &log, "kept"),
        );
        let failed = node.into_failed(KernelError::sourcing("db", "down"));
        assert_eq!(failed.kind_name(), "continue");
        drive(failed);

        assert_eq!(entries(&failures), ["Sourcing"]);
        assert_eq!(entries(&log), ["kept"]);
    }

    #[test]
    fn test_into_failed_keeps_rest_of_iterate_list() {
        let failures = log();
        let fx = fixture_with(recording_office(&failures), ProcessMetaData::new("p"));
        let log = log();
        let node = JobNode::iterate_list(
            &fx.thread,
            [
                record(&fx.thread, &log, "a"),
                record(&fx.thread, &log, "b"),
                record(&fx.thread, &log, "c"),
            ],
        );
        drive(node.into_failed(KernelError::execution("a", "lost")));

        assert_eq!(entries(&failures), ["Execution"]);
        assert_eq!(entries(&log), ["b", "c"]);
    }

    #[test]
    fn test_unknown_team_fails_the_node() {
        let failures = log();
        let fx = fixture_with(recording_office(&failures), ProcessMetaData::new("p"));
        let log = log();
        let elsewhere = FunctionJob::builder("elsewhere", &fx.thread)
            .team(TeamSelector::team("missing"))
            .build(|_| Ok(None));
        drive(elsewhere.then(record(&fx.thread, &log, "after")));

        assert_eq!(entries(&failures), ["Execution"]);
        assert_eq!(entries(&log), ["after"]);
    }

    #[test]
    fn test_fail_thread_node_escalates() {
        let failures = log();
        let fx = fixture_with(recording_office(&failures), ProcessMetaData::new("p"));
        let log = log();
        let node = JobNode::fail_thread(
            &fx.thread,
            KernelError::operation("queue", "rejected"),
            Some(record(&fx.thread, &log, "after")),
        );
        assert_eq!(node.kind_name(), "fail-thread");
        drive(node);

        assert_eq!(entries(&failures), ["Operation"]);
        assert_eq!(entries(&log), ["after"]);
        assert_eq!(fx.office.stats().snapshot().escalations, 1);
    }
}

#[cfg(test)]
mod activation_set_tests {
    use super::*;

    #[test]
    fn test_drain_keeps_activation_order() {
        let fx = fixture();
        let log = log();
        let mut set = ActivationSet::new();
        set.push(record(&fx.thread, &log, "a"));
        set.extend([record(&fx.thread, &log, "b"), record(&fx.thread, &log, "c")]);
        assert_eq!(set.len(), 3);

        let names: Vec<String> = set.drain().map(|node| node.describe()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert!(set.is_empty());
    }

    #[test]
    fn test_dispatch_runs_on_default_team() {
        let fx = fixture();
        let log = log();
        let mut set = ActivationSet::new();
        set.push(record(&fx.thread, &log, "a"));
        set.push(record(&fx.thread, &log, "b"));
        set.dispatch();
        assert_eq!(entries(&log), ["a", "b"]);
        assert!(set.is_empty());
    }
}

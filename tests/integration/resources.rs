use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use jobloom::{
    source_fn, DependencyRef, EscalationMatch, EscalationProcedure, FunctionJob, KernelResult,
    Office, OnePersonTeam, PoolConfig, ProcessMetaData, ProcessRequest, ResourceMetaData,
    ResourcePool, ResourceRef, ResourceSource, SourceContext, WorkerPoolTeam,
};

use crate::common::{entries, log, run, Log};

/// Reports its resource from a background thread after a delay.
struct DelayedSource {
    delay: Duration,
    value: u64,
}

impl ResourceSource for DelayedSource {
    fn source(
        &self,
        context: SourceContext,
    ) -> KernelResult<()> {
        let user = context.user();
        let (delay, value) = (self.delay, self.value);
        thread::spawn(move || {
            thread::sleep(delay);
            user.set_resource(value);
        });
        Ok(())
    }
}

#[derive(Default)]
struct Pool {
    returned: AtomicUsize,
    lost: AtomicUsize,
}

impl ResourcePool for Pool {
    fn return_to_pool(
        &self,
        _resource: ResourceRef,
    ) {
        self.returned.fetch_add(1, Ordering::SeqCst);
    }

    fn lost_to_pool(
        &self,
        _resource: ResourceRef,
    ) {
        self.lost.fetch_add(1, Ordering::SeqCst);
    }
}

fn sweeping_office(failures: &Log) -> Office {
    let failures = failures.clone();
    let pool = WorkerPoolTeam::new(
        "workers",
        PoolConfig {
            num_workers: 2,
            idle_timeout: Duration::from_millis(1),
        },
    )
    .unwrap();
    Office::builder("resources")
        .team(pool)
        .sourcing_sweep(Duration::from_millis(2))
        .operations_sweep(Duration::from_millis(2))
        .escalation(EscalationProcedure::new().on(EscalationMatch::Timeout, move |failure, _| {
            failures.lock().push(failure.to_string());
            Ok(None)
        }))
        .build()
        .unwrap()
}

#[test]
fn test_jobs_resume_once_asynchronous_source_reports() {
    let failures = log();
    let office = sweeping_office(&failures);
    let pool = Arc::new(Pool::default());
    let metadata = ProcessMetaData::new("async").thread_resource(
        ResourceMetaData::new::<u64>(
            "remote",
            Arc::new(DelayedSource {
                delay: Duration::from_millis(20),
                value: 42,
            }),
        )
        .pool(pool.clone()),
    );
    let seen = log();
    let sink = seen.clone();

    run(&office, metadata, move |thread| {
        FunctionJob::builder("consume", thread)
            .depends_on(DependencyRef::thread(0))
            .build(move |context| {
                sink.lock().push(format!("got {}", context.resource::<u64>(0)?));
                Ok(None)
            })
    });

    assert_eq!(entries(&seen), ["got 42"]);
    assert!(entries(&failures).is_empty());
    assert_eq!(pool.returned.load(Ordering::SeqCst), 1);
    assert!(office.stats().snapshot().jobs_parked >= 1);
}

#[test]
fn test_background_sweep_times_out_silent_source() {
    let failures = log();
    let office = sweeping_office(&failures);
    let metadata = ProcessMetaData::new("silent").thread_resource(
        ResourceMetaData::new::<u64>("silent", source_fn(|_| Ok(()))).timeout(Duration::from_millis(10)),
    );
    let seen = log();
    let sink = seen.clone();

    let process = run(&office, metadata, move |thread| {
        FunctionJob::builder("consume", thread)
            .depends_on(DependencyRef::thread(0))
            .build(move |_| {
                sink.lock().push("ran".to_string());
                Ok(None)
            })
    });

    assert!(!process.is_aborted());
    assert!(entries(&seen).is_empty());
    assert_eq!(entries(&failures), ["resource 'silent' timed out after 10ms"]);
}

#[test]
fn test_background_sweep_times_out_stuck_operation() {
    let failures = log();
    let office = sweeping_office(&failures);
    let pool = Arc::new(Pool::default());
    let metadata = ProcessMetaData::new("stuck").thread_resource(
        ResourceMetaData::new::<u64>(
            "queue",
            source_fn(|context| {
                context.set_resource(1u64);
                Ok(())
            }),
        )
        .timeout(Duration::from_millis(10))
        .pool(pool.clone()),
    );
    let handles = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let kept = handles.clone();
    let seen = log();
    let sink = seen.clone();

    run(&office, metadata, move |thread| {
        let start = FunctionJob::builder("start", thread)
            .depends_on(DependencyRef::thread(0))
            .build(move |context| {
                kept.lock().push(context.begin_operation(0)?);
                Ok(None)
            });
        let after = FunctionJob::builder("after", thread)
            .depends_on(DependencyRef::thread(0))
            .build(move |_| {
                sink.lock().push("after".to_string());
                Ok(None)
            });
        start.then(after)
    });

    assert!(entries(&seen).is_empty());
    assert_eq!(entries(&failures), ["resource 'queue' timed out after 10ms"]);
    assert_eq!(pool.lost.load(Ordering::SeqCst), 1);
    assert_eq!(pool.returned.load(Ordering::SeqCst), 0);
    // Settling after the timeout is a no-op
    handles.lock().clear();
}

#[test]
fn test_operation_completed_from_another_thread() {
    let failures = log();
    let office = sweeping_office(&failures);
    let metadata = ProcessMetaData::new("operation").thread_resource(ResourceMetaData::new::<u64>(
        "channel",
        source_fn(|context| {
            context.set_resource(3u64);
            Ok(())
        }),
    ));
    let seen = log();
    let (start_log, after_log) = (seen.clone(), seen.clone());

    run(&office, metadata, move |thread| {
        let start = FunctionJob::builder("send", thread)
            .depends_on(DependencyRef::thread(0))
            .build(move |context| {
                let handle = context.begin_operation(0)?;
                start_log.lock().push("sent".to_string());
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(5));
                    handle.complete();
                });
                Ok(None)
            });
        let after = FunctionJob::builder("ack", thread)
            .depends_on(DependencyRef::thread(0))
            .build(move |context| {
                after_log.lock().push(format!("acked {}", context.resource::<u64>(0)?));
                Ok(None)
            });
        start.then(after)
    });

    assert_eq!(entries(&seen), ["sent", "acked 3"]);
    assert!(entries(&failures).is_empty());
}

#[test]
fn test_racing_completion_wakes_dependent_without_sweeper() {
    // No sweeps: every wake-up has to come from the completion itself
    let office = Office::builder("racing")
        .team(OnePersonTeam::new("worker").unwrap())
        .build()
        .unwrap();
    let acked = Arc::new(AtomicUsize::new(0));

    for round in 0..500usize {
        let metadata = ProcessMetaData::new("race").thread_resource(ResourceMetaData::new::<u64>(
            "channel",
            source_fn(|context| {
                context.set_resource(1u64);
                Ok(())
            }),
        ));
        let counter = acked.clone();
        let process = office
            .invoke_process(ProcessRequest::new(metadata, move |thread| {
                let start = FunctionJob::builder("send", thread)
                    .depends_on(DependencyRef::thread(0))
                    .build(move |context| {
                        let handle = context.begin_operation(0)?;
                        thread::spawn(move || {
                            for _ in 0..round % 64 {
                                std::hint::spin_loop();
                            }
                            handle.complete();
                        });
                        Ok(None)
                    });
                let after = FunctionJob::builder("ack", thread)
                    .depends_on(DependencyRef::thread(0))
                    .build(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(None)
                    });
                start.then(after)
            }))
            .unwrap();
        assert!(
            process.wait_for_completion(Duration::from_secs(5)),
            "round {} never completed",
            round
        );
    }
    assert_eq!(acked.load(Ordering::SeqCst), 500);
}

#[test]
fn test_thread_resource_built_from_process_resource() {
    let failures = log();
    let office = sweeping_office(&failures);
    let metadata = ProcessMetaData::new("layered")
        .process_resource(ResourceMetaData::new::<u64>(
            "base",
            Arc::new(DelayedSource {
                delay: Duration::from_millis(5),
                value: 10,
            }),
        ))
        .thread_resource(
            ResourceMetaData::new::<String>(
                "label",
                source_fn(|context| {
                    let base = context.dependency::<u64>(0)?;
                    context.set_resource(format!("base={}", base));
                    Ok(())
                }),
            )
            .depends_on(DependencyRef::process(0)),
        );
    let seen = log();
    let sink = seen.clone();

    run(&office, metadata, move |thread| {
        FunctionJob::builder("print", thread)
            .depends_on(DependencyRef::thread(0))
            .build(move |context| {
                sink.lock().push(context.resource::<String>(0)?.to_string());
                Ok(None)
            })
    });
    assert_eq!(entries(&seen), ["base=10"]);
}

#[test]
fn test_fifty_millisecond_timeout_fails_waiter_within_sweep_bounds() {
    let failures = log();
    let office = sweeping_office(&failures);
    let metadata = ProcessMetaData::new("deadline").thread_resource(
        ResourceMetaData::new::<u64>("never", source_fn(|_| Ok(()))).timeout(Duration::from_millis(50)),
    );

    let started = std::time::Instant::now();
    let process = run(&office, metadata, |thread| {
        FunctionJob::builder("wait", thread)
            .depends_on(DependencyRef::thread(0))
            .build(|_| Ok(None))
    });
    let elapsed = started.elapsed();

    assert!(process.is_complete());
    assert!(elapsed >= Duration::from_millis(50), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "{:?}", elapsed);
    assert_eq!(entries(&failures), ["resource 'never' timed out after 50ms"]);
}

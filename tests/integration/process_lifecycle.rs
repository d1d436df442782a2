use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jobloom::{
    source_fn, DependencyRef, FunctionJob, JobNode, KernelError, Office, ProcessMetaData,
    ProcessOutcome, ProcessPhase, ProcessRequest, ProcessState, ResourceMetaData, SpawnRequest,
    ThreadState,
};
use parking_lot::Mutex;

use crate::common::{entries, log, passive_office, pool_office, run, step};

#[test]
fn test_process_waits_for_every_thread() {
    let office = pool_office("threads", 4);
    let log = log();
    let spawn_log = log.clone();
    let process = run(&office, ProcessMetaData::new("fan-out"), move |thread| {
        let children = (0..8).map(|i| {
            let child_log = spawn_log.clone();
            JobNode::spawn_thread(
                thread,
                SpawnRequest::new(move |child| step(child, &child_log, &format!("child {}", i))),
                None,
            )
        });
        JobNode::iterate_list(thread, children.collect::<Vec<_>>())
            .then(step(thread, &spawn_log, "parent"))
    });

    assert_eq!(process.phase(), ProcessPhase::Complete);
    assert_eq!(process.thread_count(), 0);
    let entries = entries(&log);
    assert_eq!(entries.len(), 9);
    assert!(entries.contains(&"parent".to_string()));
    assert_eq!(office.stats().snapshot().threads_spawned, 9);
}

#[test]
fn test_listeners_see_outcome_once() {
    let office = passive_office("listeners");
    let calls = Arc::new(AtomicUsize::new(0));
    let outcome = Arc::new(Mutex::new(None));
    let (counter, slot) = (calls.clone(), outcome.clone());

    let request = ProcessRequest::new(ProcessMetaData::new("failing"), |thread| {
        FunctionJob::builder("broken", thread).build(|_| Err(KernelError::execution("broken", "bad input")))
    })
    .with_listener(move |_, outcome| {
        counter.fetch_add(1, Ordering::SeqCst);
        *slot.lock() = Some(outcome.clone());
    });
    let process = office.invoke_process(request).unwrap();

    assert!(process.wait_for_completion(Duration::from_secs(5)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    match outcome.lock().take() {
        Some(ProcessOutcome::Failed(KernelError::Execution { message, .. })) => {
            assert_eq!(message, "bad input")
        },
        other => panic!("unexpected outcome {:?}", other),
    };
}

#[test]
fn test_abort_skips_remaining_user_jobs() {
    let office = passive_office("abort");
    let log = log();
    let chain_log = log.clone();
    let process = run(&office, ProcessMetaData::new("aborting"), move |thread| {
        FunctionJob::builder("fatal", thread)
            .build(|_| Err(KernelError::execution("fatal", "unhandled")))
            .then(step(thread, &chain_log, "skipped"))
    });

    assert!(process.is_aborted());
    assert!(entries(&log).is_empty());
    assert_eq!(office.stats().snapshot().fatal_failures, 1);
    assert_eq!(office.stats().snapshot().processes_failed, 1);
}

#[test]
fn test_process_resource_shared_across_threads() {
    let office = pool_office("shared", 4);
    let sourced = Arc::new(AtomicUsize::new(0));
    let counter = sourced.clone();
    let metadata = ProcessMetaData::new("shared").process_resource(ResourceMetaData::new::<String>(
        "config",
        source_fn(move |context| {
            counter.fetch_add(1, Ordering::SeqCst);
            context.set_resource(String::from("loaded"));
            Ok(())
        }),
    ));
    let seen = log();
    let sink = seen.clone();

    run(&office, metadata, move |thread| {
        let readers = (0..4).map(|_| {
            let sink = sink.clone();
            JobNode::spawn_thread(
                thread,
                SpawnRequest::new(move |child| {
                    FunctionJob::builder("read", child)
                        .depends_on(DependencyRef::process(0))
                        .build(move |context| {
                            sink.lock().push(context.resource::<String>(0)?.to_string());
                            Ok(None)
                        })
                }),
                None,
            )
        });
        JobNode::iterate_list(thread, readers.collect::<Vec<_>>())
    });

    assert_eq!(sourced.load(Ordering::SeqCst), 1);
    assert_eq!(entries(&seen), vec!["loaded"; 4]);
}

#[test]
fn test_stopped_office_rejects_processes() {
    let office = passive_office("stopped");
    office.stop();
    office.stop();
    let result = office.invoke_process(ProcessRequest::new(ProcessMetaData::new("late"), |thread| {
        FunctionJob::builder("never", thread).build(|_| Ok(None))
    }));
    assert!(matches!(result, Err(KernelError::TeamStopped(_))));
}

#[test]
fn test_office_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "[office]\nname = \"configured\"\ndefault_timeout_ms = 250\n\n[team]\nkind = \"pool\"\nname = \"workers\"\nnum_workers = 2\n\n[logging]\nlevel = \"warn\""
    )
    .unwrap();

    let office = Office::from_config_file(file.path()).unwrap();
    assert_eq!(office.name(), "configured");
    assert_eq!(office.default_team().as_str(), "workers");
    assert!(office.team("workers").is_some());

    let log = log();
    let job_log = log.clone();
    run(&office, ProcessMetaData::new("configured"), move |thread| step(thread, &job_log, "ran"));
    assert_eq!(entries(&log), ["ran"]);
}

#[test]
fn test_missing_config_file_reports_path() {
    let error = Office::from_config_file("/nonexistent/jobloom.toml").unwrap_err();
    assert!(format!("{:#}", error).contains("/nonexistent/jobloom.toml"));
}

#[test]
fn test_three_threads_complete_process_once() {
    let office = pool_office("three", 3);
    let completions = Arc::new(AtomicUsize::new(0));
    let unloads = Arc::new(AtomicUsize::new(0));
    let (counter, unloaded) = (completions.clone(), unloads.clone());

    struct CountingPool(Arc<AtomicUsize>);

    impl jobloom::ResourcePool for CountingPool {
        fn return_to_pool(
            &self,
            _resource: jobloom::ResourceRef,
        ) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        fn lost_to_pool(
            &self,
            _resource: jobloom::ResourceRef,
        ) {
        }
    }

    let metadata = ProcessMetaData::new("three").process_resource(
        ResourceMetaData::new::<u32>(
            "shared",
            source_fn(|context| {
                context.set_resource(3u32);
                Ok(())
            }),
        )
        .pool(Arc::new(CountingPool(unloaded))),
    );
    let children: Arc<Mutex<Vec<Arc<ThreadState>>>> = Arc::new(Mutex::new(Vec::new()));
    let owner: Arc<Mutex<Option<Arc<ProcessState>>>> = Arc::new(Mutex::new(None));
    // Thread count and terminated children, as seen by the listener
    let observed = Arc::new(Mutex::new(None));

    let (spawned, slot) = (children.clone(), owner.clone());
    let request = ProcessRequest::new(metadata, move |thread| {
        *slot.lock() = Some(thread.process().clone());
        let spawns = (0..3).map(|_| {
            let spawned = spawned.clone();
            JobNode::spawn_thread(
                thread,
                SpawnRequest::new(move |child| {
                    spawned.lock().push(child.clone());
                    FunctionJob::builder("use", child)
                        .depends_on(DependencyRef::process(0))
                        .build(|context| {
                            context.resource::<u32>(0)?;
                            Ok(None)
                        })
                }),
                None,
            )
        });
        JobNode::iterate_list(thread, spawns.collect::<Vec<_>>())
    })
    .with_listener({
        let (children, observed) = (children.clone(), observed.clone());
        move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            let threads = owner.lock().take().map(|process| process.thread_count());
            let children = children.lock();
            let terminated = children.iter().filter(|child| child.is_terminated()).count();
            *observed.lock() = Some((threads, children.len(), terminated));
        }
    });

    let process = office.invoke_process(request).unwrap();
    assert!(process.wait_for_completion(Duration::from_secs(10)));
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(*observed.lock(), Some((Some(0), 3, 3)));
    assert_eq!(unloads.load(Ordering::SeqCst), 1);
    assert_eq!(office.stats().snapshot().threads_spawned, 4);
    assert!(process.containers()[0].is_unloaded());
}

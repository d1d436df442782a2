//! Fixtures shared by the runtime unit tests.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::runtime::job::{run_job_loop, FunctionJob, JobNode};
use crate::runtime::office::Office;
use crate::runtime::state::{ProcessMetaData, ProcessRequest, ProcessState, ThreadState};
use crate::runtime::team::TeamId;

/// A prepared process whose main flow has not been dispatched, so it stays
/// active for as long as the test needs it.
pub(crate) struct Fixture {
    pub(crate) office: Office,
    pub(crate) process: Arc<ProcessState>,
    pub(crate) thread: Arc<ThreadState>,
    pub(crate) main: Option<JobNode>,
}

pub(crate) fn fixture() -> Fixture {
    fixture_with(
        Office::builder("test").build().unwrap(),
        ProcessMetaData::new("fixture"),
    )
}

pub(crate) fn fixture_with(
    office: Office,
    metadata: ProcessMetaData,
) -> Fixture {
    let slot = Arc::new(Mutex::new(None));
    let captured = slot.clone();
    let request = ProcessRequest::new(metadata, move |thread| {
        *captured.lock() = Some(thread.clone());
        FunctionJob::builder("main", thread).build(|_| Ok(None))
    });
    let (process, main) = office.prepare_process(request).unwrap();
    let thread = slot.lock().take().unwrap();
    Fixture {
        office,
        process,
        thread,
        main: Some(main),
    }
}

pub(crate) type Log = Arc<Mutex<Vec<String>>>;

pub(crate) fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

/// A function job appending `name` to `log`.
pub(crate) fn record(
    thread: &Arc<ThreadState>,
    log: &Log,
    name: &str,
) -> JobNode {
    let log = log.clone();
    let entry = name.to_string();
    FunctionJob::builder(name, thread).build(move |_| {
        log.lock().push(entry);
        Ok(None)
    })
}

/// Drive `node` to completion on the passive team.
pub(crate) fn drive(node: JobNode) {
    run_job_loop(node, &TeamId::new("passive"));
}

//! jobloom: a cooperative job-scheduling and resource-lifecycle kernel
//!
//! Work is expressed as chains of [`JobNode`]s. Executing a node runs one step
//! and returns the next node; a driver loop keeps running returned nodes on
//! the team they select, so chains of any length run in constant stack.
//! Resources are held in scoped [`ResourceContainer`]s that source lazily,
//! park dependent jobs until ready, time out, and are recycled or returned to
//! their pool when their scope ends. Failures escalate through function,
//! office, resource-source and global handlers.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use jobloom::{FunctionJob, Office, ProcessMetaData, ProcessRequest};
//!
//! fn main() -> jobloom::Result<()> {
//!     let office = Office::builder("example").build()?;
//!     let request = ProcessRequest::new(ProcessMetaData::new("hello"), |thread| {
//!         FunctionJob::builder("greet", thread).build(|context| {
//!             tracing::info!("hello from {}", context.thread().id());
//!             Ok(None)
//!         })
//!     });
//!     let process = office.invoke_process(request)?;
//!     process.wait_for_completion(Duration::from_secs(1));
//!     Ok(())
//! }
//! ```

#![warn(rust_2018_idioms)]

pub mod runtime;
pub mod util;

pub use anyhow::{Context, Result};

pub use runtime::asset::{
    Asset, AssetManager, AssetMonitor, AssetTicket, AssetWait, CheckAssetContext,
};
pub use runtime::cleanup::CleanupSequence;
pub use runtime::container::{
    source_fn, DependencyRef, OperationHandle, Readiness, ResourceContainer, ResourceGovernance,
    ResourceMetaData, ResourcePool, ResourceRef, ResourceScope, ResourceSource, ResourceState,
    ResourceUser, SourceContext,
};
pub use runtime::error::{FailureKind, KernelError, KernelResult};
pub use runtime::escalation::{
    handler_fn, EscalationHandler, EscalationLevel, EscalationMatch, EscalationProcedure,
};
pub use runtime::ids::{FlowId, JobId, MonitorId, ProcessId, ThreadId};
pub use runtime::job::{
    dispatch, run_job_loop, ActivationSet, FunctionJob, FunctionJobBuilder, JobContext, JobNode,
};
pub use runtime::office::{KernelStats, Office, OfficeBuilder, StatsSnapshot};
pub use runtime::state::{
    Flow, ProcessCompletionListener, ProcessMetaData, ProcessOutcome, ProcessPhase,
    ProcessRequest, ProcessState, SpawnRequest, ThreadOutcome, ThreadPhase, ThreadState,
};
pub use runtime::team::{
    OnePersonTeam, PassiveTeam, PoolConfig, Task, Team, TeamId, TeamSelector, WorkerPoolTeam,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

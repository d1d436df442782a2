//! The office: teams, escalation defaults and asset managers of one kernel
//!
//! An [`Office`] is the entry point external triggers use. It owns the teams
//! job nodes are dispatched to, the office-level escalation procedure and
//! global fallback handler, the default resource timeout, and the two asset
//! managers sweeping sourcing and operation monitors.
//!
//! ```text
//! trigger ──invoke_process──▶ Office ──dispatch──▶ Team ──run_job_loop──▶ JobNode…
//!                               │
//!                 sourcing / operations AssetManager sweeps
//! ```

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use indexmap::IndexMap;
use tracing::{debug, error, info, warn};

use crate::runtime::asset::AssetManager;
use crate::runtime::error::{KernelError, KernelResult};
use crate::runtime::escalation::{EscalationHandler, EscalationProcedure};
use crate::runtime::job::{run_job_loop, JobContext, JobNode};
use crate::runtime::state::{ProcessRequest, ProcessState};
use crate::runtime::team::{
    OnePersonTeam, PassiveTeam, PoolConfig, Task, Team, TeamId, TeamSelector, WorkerPoolTeam,
};
use crate::util::config::{self, KernelConfig, TeamKind};
use crate::util::logger;

/// Kernel counters.
#[derive(Debug, Default)]
pub struct KernelStats {
    /// Job steps executed.
    pub jobs_executed: AtomicUsize,
    /// Function jobs parked on a monitor.
    pub jobs_parked: AtomicUsize,
    /// Failures routed through escalation.
    pub escalations: AtomicUsize,
    /// Failures no handler took.
    pub fatal_failures: AtomicUsize,
    pub threads_spawned: AtomicUsize,
    pub processes_started: AtomicUsize,
    pub processes_completed: AtomicUsize,
    pub processes_failed: AtomicUsize,
}

impl KernelStats {
    #[inline]
    pub fn record_job(&self) {
        self.jobs_executed.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    pub fn record_park(&self) {
        self.jobs_parked.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    pub fn record_escalation(&self) {
        self.escalations.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    pub fn record_fatal(&self) {
        self.fatal_failures.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    pub fn record_thread_spawned(&self) {
        self.threads_spawned.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    pub fn record_process_started(&self) {
        self.processes_started.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a completed process, `succeeded` when nothing went unhandled.
    #[inline]
    pub fn record_process_completed(
        &self,
        succeeded: bool,
    ) {
        self.processes_completed.fetch_add(1, Ordering::SeqCst);
        if !succeeded {
            self.processes_failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Copy of every counter at one point in time.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            jobs_executed: self.jobs_executed.load(Ordering::SeqCst),
            jobs_parked: self.jobs_parked.load(Ordering::SeqCst),
            escalations: self.escalations.load(Ordering::SeqCst),
            fatal_failures: self.fatal_failures.load(Ordering::SeqCst),
            threads_spawned: self.threads_spawned.load(Ordering::SeqCst),
            processes_started: self.processes_started.load(Ordering::SeqCst),
            processes_completed: self.processes_completed.load(Ordering::SeqCst),
            processes_failed: self.processes_failed.load(Ordering::SeqCst),
        }
    }
}

/// Plain copy of [`KernelStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub jobs_executed: usize,
    pub jobs_parked: usize,
    pub escalations: usize,
    pub fatal_failures: usize,
    pub threads_spawned: usize,
    pub processes_started: usize,
    pub processes_completed: usize,
    pub processes_failed: usize,
}

/// State shared by the office and every process it runs.
pub(crate) struct OfficeCore {
    name: String,
    teams: IndexMap<TeamId, Arc<dyn Team>>,
    default_team: TeamId,
    escalation: Option<Arc<EscalationProcedure>>,
    global_handler: Option<Arc<dyn EscalationHandler>>,
    default_timeout: Option<Duration>,
    sourcing_manager: Arc<AssetManager>,
    operations_manager: Arc<AssetManager>,
    stats: KernelStats,
    stopped: AtomicBool,
}

impl OfficeCore {
    #[inline]
    pub(crate) fn escalation(&self) -> Option<&Arc<EscalationProcedure>> {
        self.escalation.as_ref()
    }

    #[inline]
    pub(crate) fn global_handler(&self) -> Option<&Arc<dyn EscalationHandler>> {
        self.global_handler.as_ref()
    }

    #[inline]
    pub(crate) fn stats(&self) -> &KernelStats {
        &self.stats
    }

    #[inline]
    pub(crate) fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    #[inline]
    pub(crate) fn sourcing_manager(&self) -> &Arc<AssetManager> {
        &self.sourcing_manager
    }

    #[inline]
    pub(crate) fn operations_manager(&self) -> &Arc<AssetManager> {
        &self.operations_manager
    }

    /// Create a process with its main thread and return the main thread's
    /// anchored first chain, not yet dispatched.
    pub(crate) fn prepare_process(
        self: &Arc<Self>,
        request: ProcessRequest,
    ) -> KernelResult<(Arc<ProcessState>, JobNode)> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(KernelError::TeamStopped(self.name.clone()));
        }
        let ProcessRequest {
            metadata,
            source_handler,
            listeners,
            initial,
        } = request;

        let process = ProcessState::new(self.clone(), metadata, source_handler, listeners)?;
        let thread = process.spawn_thread()?;
        let flow = thread.create_flow()?;
        let chain = initial(&thread);
        Ok((process, flow.anchor(chain)))
    }

    /// Hand `node` to the team it selects.
    ///
    /// A node selecting a team this office does not have becomes a failure
    /// of its thread and is run on the default team.
    pub(crate) fn dispatch(
        &self,
        node: JobNode,
    ) {
        let selector = node.responsible_team().clone();
        let (team_id, node) = match selector {
            TeamSelector::Any => (self.default_team.clone(), node),
            TeamSelector::Team(id) if self.teams.contains_key(&id) => (id, node),
            TeamSelector::Team(id) => {
                warn!("office '{}' has no team '{}'", self.name, id);
                let failed = node.into_failed(KernelError::UnknownTeam(id.to_string()));
                (self.default_team.clone(), failed)
            },
        };

        let Some(team) = self.teams.get(&team_id) else {
            error!("office '{}' lost its default team '{}'", self.name, team_id);
            return;
        };
        let driver = team_id.clone();
        let task = Task::new(node.describe(), move || run_job_loop(node, &driver));
        if let Err(failure) = team.assign(task) {
            warn!("team '{}' rejected work: {}", team_id, failure);
        }
    }
}

/// Builder for [`Office`].
pub struct OfficeBuilder {
    name: String,
    teams: IndexMap<TeamId, Arc<dyn Team>>,
    default_team: Option<TeamId>,
    escalation: Option<Arc<EscalationProcedure>>,
    global_handler: Option<Arc<dyn EscalationHandler>>,
    default_timeout: Option<Duration>,
    sourcing_sweep: Option<Duration>,
    operations_sweep: Option<Duration>,
}

impl fmt::Debug for OfficeBuilder {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("OfficeBuilder")
            .field("name", &self.name)
            .field("teams", &self.teams.keys().collect::<Vec<_>>())
            .field("default_team", &self.default_team)
            .field("default_timeout", &self.default_timeout)
            .field("sourcing_sweep", &self.sourcing_sweep)
            .field("operations_sweep", &self.operations_sweep)
            .finish()
    }
}

impl OfficeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            teams: IndexMap::new(),
            default_team: None,
            escalation: None,
            global_handler: None,
            default_timeout: None,
            sourcing_sweep: None,
            operations_sweep: None,
        }
    }

    /// Start from a loaded configuration.
    pub fn from_config(config: &KernelConfig) -> KernelResult<Self> {
        let team_name = config.team.name.clone();
        let team: Arc<dyn Team> = match config.team.kind {
            TeamKind::Passive => Arc::new(PassiveTeam::new(team_name)),
            TeamKind::Dedicated => Arc::new(OnePersonTeam::new(team_name)?),
            TeamKind::Pool => {
                let mut pool = PoolConfig::default();
                if let Some(workers) = config.team.num_workers {
                    pool.num_workers = workers;
                }
                pool.idle_timeout = Duration::from_millis(config.team.idle_timeout_ms);
                Arc::new(WorkerPoolTeam::new(team_name, pool)?)
            },
        };

        let mut builder = Self::new(config.office.name.clone()).shared_team(team);
        builder.default_timeout = config.office.default_timeout();
        builder.sourcing_sweep = config::sweep_interval(config.office.sourcing_sweep_ms);
        builder.operations_sweep = config::sweep_interval(config.office.operations_sweep_ms);
        Ok(builder)
    }

    /// Register a team. The first team registered is the default.
    pub fn team(
        self,
        team: impl Team + 'static,
    ) -> Self {
        self.shared_team(Arc::new(team))
    }

    pub fn shared_team(
        mut self,
        team: Arc<dyn Team>,
    ) -> Self {
        let id = TeamId::new(team.name());
        self.default_team.get_or_insert_with(|| id.clone());
        self.teams.insert(id, team);
        self
    }

    /// Team running nodes that select no team.
    pub fn default_team(
        mut self,
        name: impl Into<String>,
    ) -> Self {
        self.default_team = Some(TeamId::new(name));
        self
    }

    /// Office-level escalation procedure.
    pub fn escalation(
        mut self,
        procedure: EscalationProcedure,
    ) -> Self {
        self.escalation = Some(Arc::new(procedure));
        self
    }

    /// Last-resort handler for failures nothing else takes.
    pub fn global_handler<F>(
        mut self,
        handler: F,
    ) -> Self
    where
        F: Fn(&KernelError, &mut JobContext<'_>) -> KernelResult<Option<JobNode>>
            + Send
            + Sync
            + 'static,
    {
        self.global_handler = Some(Arc::new(handler));
        self
    }

    /// Timeout for resources that declare none.
    pub fn default_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Sweep sourcing monitors on a background thread every `interval`.
    pub fn sourcing_sweep(
        mut self,
        interval: Duration,
    ) -> Self {
        self.sourcing_sweep = Some(interval);
        self
    }

    /// Sweep operation monitors on a background thread every `interval`.
    pub fn operations_sweep(
        mut self,
        interval: Duration,
    ) -> Self {
        self.operations_sweep = Some(interval);
        self
    }

    pub fn build(self) -> KernelResult<Office> {
        let mut teams = self.teams;
        if teams.is_empty() {
            let passive = PassiveTeam::default();
            teams.insert(TeamId::new(passive.name()), Arc::new(passive));
        }
        let default_team = match self.default_team {
            Some(id) => id,
            None => teams
                .keys()
                .next()
                .cloned()
                .ok_or_else(|| KernelError::UnknownTeam(String::new()))?,
        };
        if !teams.contains_key(&default_team) {
            return Err(KernelError::UnknownTeam(default_team.to_string()));
        }

        let sourcing_manager = AssetManager::new(format!("{}-sourcing", self.name));
        let operations_manager = AssetManager::new(format!("{}-operations", self.name));
        for (manager, interval) in [
            (&sourcing_manager, self.sourcing_sweep),
            (&operations_manager, self.operations_sweep),
        ] {
            if let Some(interval) = interval {
                manager
                    .start(interval)
                    .map_err(|e| KernelError::execution(manager.name(), e.to_string()))?;
            }
        }
        for team in teams.values() {
            team.start_working();
        }

        info!(
            "office '{}' ready with {} team(s), default '{}'",
            self.name,
            teams.len(),
            default_team
        );
        Ok(Office {
            core: Arc::new(OfficeCore {
                name: self.name,
                teams,
                default_team,
                escalation: self.escalation,
                global_handler: self.global_handler,
                default_timeout: self.default_timeout,
                sourcing_manager,
                operations_manager,
                stats: KernelStats::default(),
                stopped: AtomicBool::new(false),
            }),
        })
    }
}

/// Entry point of the kernel.
pub struct Office {
    core: Arc<OfficeCore>,
}

impl fmt::Debug for Office {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Office")
            .field("name", &self.core.name)
            .field("teams", &self.core.teams.keys().collect::<Vec<_>>())
            .field("default_team", &self.core.default_team)
            .field("stopped", &self.core.stopped.load(Ordering::SeqCst))
            .finish()
    }
}

impl Office {
    pub fn builder(name: impl Into<String>) -> OfficeBuilder {
        OfficeBuilder::new(name)
    }

    /// Build an office from a configuration.
    pub fn from_config(config: &KernelConfig) -> KernelResult<Office> {
        OfficeBuilder::from_config(config)?.build()
    }

    /// Load a TOML configuration file and build an office from it.
    pub fn from_config_file(path: impl AsRef<Path>) -> anyhow::Result<Office> {
        let path = path.as_ref();
        let config = config::load_config(path)
            .with_context(|| format!("loading office config {}", path.display()))?;
        logger::init_with_level(config.logging.log_level()?);
        let office = Office::from_config(&config)
            .with_context(|| format!("building office '{}'", config.office.name))?;
        Ok(office)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Create a process and dispatch its main thread's first chain.
    pub fn invoke_process(
        &self,
        request: ProcessRequest,
    ) -> KernelResult<Arc<ProcessState>> {
        let (process, chain) = self.core.prepare_process(request)?;
        debug!("invoking {} '{}'", process.id(), process.name());
        self.core.dispatch(chain);
        Ok(process)
    }

    /// Create a process without starting it. Dispatch the returned chain to
    /// start its main thread.
    pub fn prepare_process(
        &self,
        request: ProcessRequest,
    ) -> KernelResult<(Arc<ProcessState>, JobNode)> {
        self.core.prepare_process(request)
    }

    /// Hand a node to its team.
    pub fn dispatch(
        &self,
        node: JobNode,
    ) {
        self.core.dispatch(node);
    }

    #[inline]
    pub fn stats(&self) -> &KernelStats {
        &self.core.stats
    }

    #[inline]
    pub fn sourcing_manager(&self) -> &Arc<AssetManager> {
        &self.core.sourcing_manager
    }

    #[inline]
    pub fn operations_manager(&self) -> &Arc<AssetManager> {
        &self.core.operations_manager
    }

    /// Sweep both asset managers once, now.
    pub fn check_on_assets(&self) {
        self.core.sourcing_manager.check_on_assets();
        self.core.operations_manager.check_on_assets();
    }

    pub fn team(
        &self,
        name: &str,
    ) -> Option<&Arc<dyn Team>> {
        self.core.teams.get(&TeamId::new(name))
    }

    #[inline]
    pub fn default_team(&self) -> &TeamId {
        &self.core.default_team
    }

    /// Stop sweeping and stop every team. Idempotent.
    pub fn stop(&self) {
        if self.core.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.core.sourcing_manager.stop();
        self.core.operations_manager.stop();
        for team in self.core.teams.values() {
            team.stop_working();
        }
        info!("office '{}' stopped", self.core.name);
    }
}

impl Drop for Office {
    fn drop(&mut self) {
        self.stop();
    }
}

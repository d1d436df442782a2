//! The container itself, its assets and operation handles.

use std::any::{type_name, Any};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::{
    ResourceMetaData, ResourceRef, ResourceScope, ResourceUser, ScopeContainers, SourceContext,
};
use crate::runtime::asset::{Asset, AssetMonitor, AssetTicket, CheckAssetContext};
use crate::runtime::error::{panic_message, KernelError, KernelResult};
use crate::runtime::job::{ActivationSet, FunctionJob};
use crate::runtime::office::OfficeCore;
use crate::runtime::state::{ProcessMetaData, ProcessRequest, ProcessState};

/// Result of a readiness check.
#[derive(Debug)]
pub enum Readiness {
    /// The resource and all its dependencies are ready.
    Ready,
    /// Park on the ticket's monitor and check again once released.
    Wait(AssetTicket),
    /// The resource (or a dependency) failed.
    Failed(KernelError),
}

/// Observable container state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Unsourced,
    Sourcing,
    Ready,
    /// Ready, with an asynchronous operation in flight.
    Operating,
    Failed,
    Unloaded,
}

enum ContainerState {
    Unsourced,
    Sourcing {
        since: Instant,
    },
    Ready {
        resource: ResourceRef,
        operation: Option<Instant>,
    },
    Failed {
        failure: KernelError,
        /// Resource held when an operation timed out; lost to its pool.
        resource: Option<ResourceRef>,
    },
    Unloaded,
}

/// Lifecycle holder for one scoped resource instance.
pub struct ResourceContainer {
    metadata: Arc<ResourceMetaData>,
    scope: ResourceScope,
    dependencies: SmallVec<[Arc<ResourceContainer>; 4]>,
    timeout: Option<Duration>,
    sourcing: Arc<AssetMonitor>,
    operations: Arc<AssetMonitor>,
    state: Mutex<ContainerState>,
    pool_settled: AtomicBool,
    self_ref: Weak<ResourceContainer>,
}

impl fmt::Debug for ResourceContainer {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ResourceContainer")
            .field("name", &self.metadata.name)
            .field("scope", &self.scope)
            .field("state", &self.state())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ResourceContainer {
    pub(crate) fn new(
        metadata: Arc<ResourceMetaData>,
        scope: ResourceScope,
        scopes: &ScopeContainers<'_>,
        office: &OfficeCore,
    ) -> KernelResult<Arc<Self>> {
        let dependencies = metadata
            .dependencies
            .iter()
            .map(|reference| scopes.resolve(*reference))
            .collect::<KernelResult<SmallVec<[Arc<ResourceContainer>; 4]>>>()
            .map_err(|failure| {
                KernelError::InvalidMetaData(format!("resource '{}': {}", metadata.name, failure))
            })?;
        let timeout = metadata.timeout.or(office.default_timeout());
        let sourcing_manager = office.sourcing_manager().clone();
        let operations_manager = office.operations_manager().clone();

        Ok(Arc::new_cyclic(|weak: &Weak<Self>| Self {
            metadata,
            scope,
            dependencies,
            timeout,
            sourcing: AssetMonitor::new(Arc::new(SourcingAsset(weak.clone())), sourcing_manager),
            operations: AssetMonitor::new(
                Arc::new(OperationAsset(weak.clone())),
                operations_manager,
            ),
            state: Mutex::new(ContainerState::Unsourced),
            pool_settled: AtomicBool::new(false),
            self_ref: weak.clone(),
        }))
    }

    /// Bound name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Declared object type.
    #[inline]
    pub fn object_type(&self) -> &'static str {
        self.metadata.object_type
    }

    #[inline]
    pub fn scope(&self) -> ResourceScope {
        self.scope
    }

    #[inline]
    pub fn metadata(&self) -> &Arc<ResourceMetaData> {
        &self.metadata
    }

    /// Effective timeout for sourcing and operations.
    #[inline]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    #[inline]
    pub fn sourcing_monitor(&self) -> &Arc<AssetMonitor> {
        &self.sourcing
    }

    #[inline]
    pub fn operations_monitor(&self) -> &Arc<AssetMonitor> {
        &self.operations
    }

    pub fn state(&self) -> ResourceState {
        match &*self.state.lock() {
            ContainerState::Unsourced => ResourceState::Unsourced,
            ContainerState::Sourcing { .. } => ResourceState::Sourcing,
            ContainerState::Ready {
                operation: Some(_), ..
            } => ResourceState::Operating,
            ContainerState::Ready { .. } => ResourceState::Ready,
            ContainerState::Failed { .. } => ResourceState::Failed,
            ContainerState::Unloaded => ResourceState::Unloaded,
        }
    }

    #[inline]
    pub fn is_unloaded(&self) -> bool {
        self.state() == ResourceState::Unloaded
    }

    pub fn failure(&self) -> Option<KernelError> {
        match &*self.state.lock() {
            ContainerState::Failed { failure, .. } => Some(failure.clone()),
            _ => None,
        }
    }

    /// The ready resource, downcast to `T`.
    pub fn resource<T>(&self) -> KernelResult<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let resource = self
            .ready_resource()
            .ok_or_else(|| KernelError::NotReady(self.name().to_string()))?;
        resource
            .downcast::<T>()
            .map_err(|_| KernelError::TypeMismatch {
                name: self.name().to_string(),
                expected: type_name::<T>(),
            })
    }

    fn ready_resource(&self) -> Option<ResourceRef> {
        match &*self.state.lock() {
            ContainerState::Ready { resource, .. } => Some(resource.clone()),
            _ => None,
        }
    }

    /// Check this container and its dependencies, starting sourcing if
    /// everything it depends on is ready.
    pub fn check_ready(&self) -> Readiness {
        for dependency in &self.dependencies {
            match dependency.check_ready() {
                Readiness::Ready => {},
                Readiness::Failed(failure) => {
                    return Readiness::Failed(failure.as_dependency_of(dependency.name()))
                },
                wait => return wait,
            }
        }

        let start = {
            let mut state = self.state.lock();
            match *state {
                ContainerState::Unsourced => {
                    *state = ContainerState::Sourcing {
                        since: Instant::now(),
                    };
                    true
                },
                ContainerState::Sourcing { .. } => false,
                ContainerState::Ready {
                    operation: Some(_), ..
                } => return Readiness::Wait(self.operations.ticket()),
                ContainerState::Ready { .. } => return Readiness::Ready,
                ContainerState::Failed { ref failure, .. } => {
                    return Readiness::Failed(failure.clone())
                },
                ContainerState::Unloaded => {
                    return Readiness::Failed(KernelError::NotReady(self.name().to_string()))
                },
            }
        };
        if start {
            self.start_sourcing();
        }

        match &*self.state.lock() {
            ContainerState::Ready {
                operation: None, ..
            } => Readiness::Ready,
            ContainerState::Ready { .. } => Readiness::Wait(self.operations.ticket()),
            ContainerState::Failed { failure, .. } => Readiness::Failed(failure.clone()),
            ContainerState::Unloaded => {
                Readiness::Failed(KernelError::NotReady(self.name().to_string()))
            },
            _ => Readiness::Wait(self.sourcing.ticket()),
        }
    }

    fn start_sourcing(&self) {
        debug!("sourcing '{}'", self.name());
        let dependencies = self
            .dependencies
            .iter()
            .filter_map(|dependency| dependency.ready_resource())
            .collect();
        let context = SourceContext::new(
            self.name().to_string(),
            ResourceUser::new(self.self_ref.clone()),
            dependencies,
        );

        let source = self.metadata.source.clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| source.source(context)))
            .unwrap_or_else(|payload| {
                Err(KernelError::sourcing(
                    self.name(),
                    panic_message(payload.as_ref()),
                ))
            });
        if let Err(failure) = outcome {
            self.complete_sourcing(Err(failure));
        }
    }

    /// First report wins; anything after a timeout or unload is discarded.
    pub(crate) fn complete_sourcing(
        &self,
        outcome: KernelResult<ResourceRef>,
    ) {
        if let Ok(resource) = &outcome {
            for governance in &self.metadata.governance {
                governance.govern(self.name(), resource);
            }
        }

        let accepted = {
            let mut state = self.state.lock();
            match *state {
                ContainerState::Unsourced | ContainerState::Sourcing { .. } => {
                    *state = match &outcome {
                        Ok(resource) => ContainerState::Ready {
                            resource: resource.clone(),
                            operation: None,
                        },
                        Err(failure) => ContainerState::Failed {
                            failure: failure.clone(),
                            resource: None,
                        },
                    };
                    true
                },
                _ => false,
            }
        };

        let mut activations = ActivationSet::new();
        match outcome {
            Ok(_) if accepted => {
                debug!("'{}' ready", self.name());
                self.sourcing.activate(true, &mut activations);
            },
            Ok(resource) => {
                warn!("discarding late resource for '{}'", self.name());
                for governance in &self.metadata.governance {
                    governance.release(self.name(), &resource);
                }
                self.settle_pool(resource, false);
            },
            Err(failure) if accepted => {
                warn!("sourcing '{}' failed: {}", self.name(), failure);
                self.sourcing.fail(failure, true, &mut activations);
            },
            Err(failure) => trace!("ignoring late failure for '{}': {}", self.name(), failure),
        }
        activations.dispatch();
    }

    /// Mark the resource busy until the returned handle settles.
    pub fn begin_operation(&self) -> KernelResult<OperationHandle> {
        let mut state = self.state.lock();
        match &mut *state {
            ContainerState::Ready {
                operation: slot @ None,
                ..
            } => *slot = Some(Instant::now()),
            _ => return Err(KernelError::NotReady(self.name().to_string())),
        }
        trace!("operation started on '{}'", self.name());
        Ok(OperationHandle {
            container: self.self_ref.clone(),
            settled: false,
        })
    }

    fn end_operation(
        &self,
        failure: Option<KernelError>,
    ) {
        let ended = match &mut *self.state.lock() {
            ContainerState::Ready { operation, .. } => operation.take().is_some(),
            _ => false,
        };
        if !ended {
            return;
        }

        let mut activations = ActivationSet::new();
        match failure {
            None => self.operations.activate(false, &mut activations),
            Some(failure) => {
                warn!("operation on '{}' failed: {}", self.name(), failure);
                self.operations.fail(failure, false, &mut activations);
            },
        }
        activations.dispatch();
    }

    fn check_sourcing(
        &self,
        context: &mut CheckAssetContext<'_>,
    ) -> KernelResult<()> {
        let timed_out = {
            let mut state = self.state.lock();
            let since = match *state {
                ContainerState::Sourcing { since } => since,
                _ => return Ok(()),
            };
            match self.timeout {
                Some(timeout) if context.time().saturating_duration_since(since) >= timeout => {
                    let failure = KernelError::Timeout {
                        name: self.name().to_string(),
                        timeout,
                        during_operation: false,
                    };
                    *state = ContainerState::Failed {
                        failure: failure.clone(),
                        resource: None,
                    };
                    Some(failure)
                },
                _ => None,
            }
        };

        if let Some(failure) = timed_out {
            warn!("{}", failure);
            context.fail_waiters(failure, true);
        }
        Ok(())
    }

    fn check_operation(
        &self,
        context: &mut CheckAssetContext<'_>,
    ) -> KernelResult<()> {
        let operation = match &*self.state.lock() {
            ContainerState::Ready { operation, .. } => Some(*operation),
            _ => None,
        };
        let started = match operation {
            Some(Some(started)) => started,
            Some(None) => {
                // A completion that raced a registration left waiters behind
                if context.waiting() > 0 {
                    context.activate_waiters(false);
                }
                return Ok(());
            },
            None => return Ok(()),
        };
        let timeout = match self.timeout {
            Some(timeout) if context.time().saturating_duration_since(started) >= timeout => {
                timeout
            },
            _ => return Ok(()),
        };

        let failure = KernelError::Timeout {
            name: self.name().to_string(),
            timeout,
            during_operation: true,
        };
        let timed_out = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, ContainerState::Unloaded) {
                ContainerState::Ready {
                    resource,
                    operation: Some(current),
                } if current == started => {
                    *state = ContainerState::Failed {
                        failure: failure.clone(),
                        resource: Some(resource),
                    };
                    true
                },
                other => {
                    *state = other;
                    false
                },
            }
        };

        if timed_out {
            warn!("{}", failure);
            context.fail_waiters(failure, true);
        }
        Ok(())
    }

    /// Permanently fail both monitors, releasing every waiter.
    pub(crate) fn cancel(
        &self,
        failure: &KernelError,
        activations: &mut ActivationSet,
    ) {
        self.sourcing.fail(failure.clone(), true, activations);
        self.operations.fail(failure.clone(), true, activations);
    }

    /// Leave scope. A recyclable resource is recycled by a cleanup job on the
    /// owning process's cleanup sequence; otherwise it goes straight back to
    /// its pool.
    pub(crate) fn unload(
        &self,
        process: &Arc<ProcessState>,
        activations: &mut ActivationSet,
    ) {
        let previous = std::mem::replace(&mut *self.state.lock(), ContainerState::Unloaded);
        match previous {
            ContainerState::Unloaded => return,
            ContainerState::Ready { resource, .. } => {
                self.release_governance(&resource);
                if self.metadata.source.is_recyclable() {
                    self.recycle(resource, process, activations);
                } else {
                    self.settle_pool(resource, true);
                }
            },
            ContainerState::Failed {
                resource: Some(resource),
                ..
            } => {
                self.release_governance(&resource);
                self.settle_pool(resource, false);
            },
            _ => {},
        }
        trace!("'{}' unloaded", self.name());
    }

    fn release_governance(
        &self,
        resource: &ResourceRef,
    ) {
        for governance in &self.metadata.governance {
            governance.release(self.name(), resource);
        }
    }

    fn recycle(
        &self,
        resource: ResourceRef,
        process: &Arc<ProcessState>,
        activations: &mut ActivationSet,
    ) {
        let Some(container) = self.self_ref.upgrade() else {
            return;
        };
        let name = format!("recycle {}", self.name());
        let recycled = resource.clone();
        let request = ProcessRequest::new(ProcessMetaData::new(name.clone()), move |thread| {
            FunctionJob::kernel(name, thread, move |_| {
                let source = container.metadata.source.clone();
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| source.recycle(recycled.clone())))
                    .unwrap_or_else(|payload| {
                        Err(KernelError::Panicked {
                            job: format!("recycle {}", container.name()),
                            message: panic_message(payload.as_ref()),
                        })
                    });
                match outcome {
                    Ok(()) => container.settle_pool(recycled, true),
                    Err(failure) => {
                        warn!("recycling '{}' failed: {}", container.name(), failure);
                        container.settle_pool(recycled, false);
                    },
                }
                Ok(None)
            })
        });

        match process.office().prepare_process(request) {
            Ok((_, node)) => process.cleanup().register_cleanup(node, activations),
            Err(failure) => {
                warn!("cannot recycle '{}': {}", self.name(), failure);
                self.settle_pool(resource, false);
            },
        }
    }

    /// Return to or lose to the pool, at most once per container.
    fn settle_pool(
        &self,
        resource: ResourceRef,
        returned: bool,
    ) {
        let Some(pool) = &self.metadata.pool else {
            return;
        };
        if self.pool_settled.swap(true, Ordering::SeqCst) {
            return;
        }
        if returned {
            trace!("'{}' returned to pool", self.name());
            pool.return_to_pool(resource);
        } else {
            trace!("'{}' lost to pool", self.name());
            pool.lost_to_pool(resource);
        }
    }
}

/// Settles one asynchronous operation. Dropping it unsettled completes it.
pub struct OperationHandle {
    container: Weak<ResourceContainer>,
    settled: bool,
}

impl fmt::Debug for OperationHandle {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("OperationHandle")
            .field("settled", &self.settled)
            .finish()
    }
}

impl OperationHandle {
    /// The operation succeeded; waiting dependents re-check readiness.
    pub fn complete(mut self) {
        self.settle(None);
    }

    /// The operation failed; current waiters fail, later ones may proceed.
    pub fn fail(
        mut self,
        failure: KernelError,
    ) {
        self.settle(Some(failure));
    }

    fn settle(
        &mut self,
        failure: Option<KernelError>,
    ) {
        if std::mem::replace(&mut self.settled, true) {
            return;
        }
        if let Some(container) = self.container.upgrade() {
            container.end_operation(failure);
        }
    }
}

impl Drop for OperationHandle {
    fn drop(&mut self) {
        self.settle(None);
    }
}

struct SourcingAsset(Weak<ResourceContainer>);

impl Asset for SourcingAsset {
    fn check_on_asset(
        &self,
        context: &mut CheckAssetContext<'_>,
    ) -> KernelResult<()> {
        match self.0.upgrade() {
            Some(container) => container.check_sourcing(context),
            None => Ok(()),
        }
    }
}

struct OperationAsset(Weak<ResourceContainer>);

impl Asset for OperationAsset {
    fn check_on_asset(
        &self,
        context: &mut CheckAssetContext<'_>,
    ) -> KernelResult<()> {
        match self.0.upgrade() {
            Some(container) => container.check_operation(context),
            None => Ok(()),
        }
    }
}

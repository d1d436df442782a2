//! Managed resource containers
//!
//! A [`ResourceContainer`] holds one externally-sourced resource bound at
//! function, thread or process scope. Sourcing is asynchronous: the
//! container's [`ResourceSource`] receives a [`SourceContext`] and eventually
//! reports the resource (or a failure) through its [`ResourceUser`]. Jobs that
//! need the resource meanwhile park on the container's sourcing monitor.
//!
//! ```text
//! Unsourced ──check_ready──▶ Sourcing ──set_resource──▶ Ready ◀──▶ Ready (operation in flight)
//!                               │                         │
//!                     set_failure / timeout          operation timeout
//!                               ▼                         ▼
//!                             Failed ◀────────────────────┘
//!            (any) ──scope exit──▶ Unloaded  (recycle / return to pool)
//! ```

pub mod managed;

pub use managed::{OperationHandle, Readiness, ResourceContainer, ResourceState};

use std::any::{type_name, Any};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::runtime::error::{KernelError, KernelResult};

/// A resource instance as the kernel stores it.
pub type ResourceRef = Arc<dyn Any + Send + Sync>;

/// Scope a container is bound at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceScope {
    /// One invocation of a function job.
    Function,
    /// One thread.
    Thread,
    /// The whole process.
    Process,
}

/// Reference to a container by scope and declaration index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DependencyRef {
    pub scope: ResourceScope,
    pub index: usize,
}

impl DependencyRef {
    pub fn process(index: usize) -> Self {
        Self {
            scope: ResourceScope::Process,
            index,
        }
    }

    pub fn thread(index: usize) -> Self {
        Self {
            scope: ResourceScope::Thread,
            index,
        }
    }

    pub fn function(index: usize) -> Self {
        Self {
            scope: ResourceScope::Function,
            index,
        }
    }
}

/// Containers visible when resolving a dependency reference.
///
/// Only containers declared earlier are present, so dependencies can never
/// form a cycle.
pub(crate) struct ScopeContainers<'a> {
    pub(crate) process: &'a [Arc<ResourceContainer>],
    pub(crate) thread: &'a [Arc<ResourceContainer>],
    pub(crate) function: &'a [Arc<ResourceContainer>],
}

impl ScopeContainers<'_> {
    pub(crate) fn resolve(
        &self,
        reference: DependencyRef,
    ) -> KernelResult<Arc<ResourceContainer>> {
        let containers = match reference.scope {
            ResourceScope::Process => self.process,
            ResourceScope::Thread => self.thread,
            ResourceScope::Function => self.function,
        };
        containers.get(reference.index).cloned().ok_or_else(|| {
            KernelError::InvalidMetaData(format!(
                "no {:?} resource at index {}",
                reference.scope, reference.index
            ))
        })
    }
}

/// Creates resource instances.
pub trait ResourceSource: Send + Sync {
    /// Begin sourcing. The resource may be reported before this returns or
    /// later from any thread. An error fails the container immediately.
    fn source(
        &self,
        context: SourceContext,
    ) -> KernelResult<()>;

    /// Whether unloading hands the resource to [`ResourceSource::recycle`].
    fn is_recyclable(&self) -> bool {
        false
    }

    /// Recycle a resource once its scope has ended. Runs as a cleanup job.
    fn recycle(
        &self,
        _resource: ResourceRef,
    ) -> KernelResult<()> {
        Ok(())
    }
}

impl<F> ResourceSource for F
where
    F: Fn(SourceContext) -> KernelResult<()> + Send + Sync,
{
    fn source(
        &self,
        context: SourceContext,
    ) -> KernelResult<()> {
        self(context)
    }
}

/// Wrap a closure as a shared source.
pub fn source_fn<F>(source: F) -> Arc<dyn ResourceSource>
where
    F: Fn(SourceContext) -> KernelResult<()> + Send + Sync + 'static,
{
    Arc::new(source)
}

/// External pool that owns the resources a container borrows.
pub trait ResourcePool: Send + Sync {
    /// The resource is intact and may be reused.
    fn return_to_pool(
        &self,
        resource: ResourceRef,
    );

    /// The resource must not be reused.
    fn lost_to_pool(
        &self,
        resource: ResourceRef,
    );
}

/// Hooks bracketing a resource's ready lifetime.
pub trait ResourceGovernance: Send + Sync {
    fn govern(
        &self,
        name: &str,
        resource: &ResourceRef,
    );

    fn release(
        &self,
        name: &str,
        resource: &ResourceRef,
    );
}

/// Immutable description of one resource binding.
#[derive(Clone)]
pub struct ResourceMetaData {
    pub name: String,
    pub object_type: &'static str,
    pub source: Arc<dyn ResourceSource>,
    pub dependencies: Vec<DependencyRef>,
    pub pool: Option<Arc<dyn ResourcePool>>,
    /// Overrides the office default timeout.
    pub timeout: Option<Duration>,
    pub governance: Vec<Arc<dyn ResourceGovernance>>,
}

impl fmt::Debug for ResourceMetaData {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ResourceMetaData")
            .field("name", &self.name)
            .field("object_type", &self.object_type)
            .field("dependencies", &self.dependencies)
            .field("pooled", &self.pool.is_some())
            .field("timeout", &self.timeout)
            .field("governance", &self.governance.len())
            .finish()
    }
}

impl ResourceMetaData {
    /// Describe a resource of type `T` named `name`.
    pub fn new<T: Any>(
        name: impl Into<String>,
        source: Arc<dyn ResourceSource>,
    ) -> Self {
        Self {
            name: name.into(),
            object_type: type_name::<T>(),
            source,
            dependencies: Vec::new(),
            pool: None,
            timeout: None,
            governance: Vec::new(),
        }
    }

    pub fn depends_on(
        mut self,
        reference: DependencyRef,
    ) -> Self {
        self.dependencies.push(reference);
        self
    }

    pub fn pool(
        mut self,
        pool: Arc<dyn ResourcePool>,
    ) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn governance(
        mut self,
        governance: Arc<dyn ResourceGovernance>,
    ) -> Self {
        self.governance.push(governance);
        self
    }
}

/// Reports the outcome of sourcing to its container.
///
/// Only the first report counts; reports arriving after the container timed
/// out or was unloaded are discarded (a late resource is lost to its pool).
#[derive(Clone)]
pub struct ResourceUser {
    container: Weak<ResourceContainer>,
}

impl fmt::Debug for ResourceUser {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self.container.upgrade() {
            Some(container) => write!(f, "ResourceUser({})", container.name()),
            None => f.write_str("ResourceUser(<dropped>)"),
        }
    }
}

impl ResourceUser {
    pub(crate) fn new(container: Weak<ResourceContainer>) -> Self {
        Self { container }
    }

    /// The resource is ready.
    pub fn set_resource<T>(
        &self,
        resource: T,
    ) where
        T: Any + Send + Sync,
    {
        self.set_shared(Arc::new(resource));
    }

    /// The resource is ready, already shared.
    pub fn set_shared(
        &self,
        resource: ResourceRef,
    ) {
        if let Some(container) = self.container.upgrade() {
            container.complete_sourcing(Ok(resource));
        }
    }

    /// The resource could not be created.
    pub fn set_failure(
        &self,
        failure: KernelError,
    ) {
        if let Some(container) = self.container.upgrade() {
            container.complete_sourcing(Err(failure));
        }
    }
}

/// Handed to [`ResourceSource::source`].
#[derive(Debug)]
pub struct SourceContext {
    name: String,
    user: ResourceUser,
    dependencies: Vec<ResourceRef>,
}

impl SourceContext {
    pub(crate) fn new(
        name: String,
        user: ResourceUser,
        dependencies: Vec<ResourceRef>,
    ) -> Self {
        Self {
            name,
            user,
            dependencies,
        }
    }

    /// Bound name of the resource being sourced.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle for reporting the outcome later, from any thread.
    #[inline]
    pub fn user(&self) -> ResourceUser {
        self.user.clone()
    }

    /// Ready resource of the dependency at `index`.
    pub fn dependency<T>(
        &self,
        index: usize,
    ) -> KernelResult<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let resource = self.dependencies.get(index).cloned().ok_or_else(|| {
            KernelError::InvalidMetaData(format!(
                "resource '{}' has no dependency {}",
                self.name, index
            ))
        })?;
        resource
            .downcast::<T>()
            .map_err(|_| KernelError::TypeMismatch {
                name: self.name.clone(),
                expected: type_name::<T>(),
            })
    }

    /// Report the resource now.
    pub fn set_resource<T>(
        self,
        resource: T,
    ) where
        T: Any + Send + Sync,
    {
        self.user.set_resource(resource);
    }

    /// Report a failure now.
    pub fn set_failure(
        self,
        failure: KernelError,
    ) {
        self.user.set_failure(failure);
    }
}

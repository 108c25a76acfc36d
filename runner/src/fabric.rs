mod local;

pub use local::LocalFabric;

use crate::config::FabricConfig;
use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum FabricError {
    #[error("The fabric was not started")]
    NotStarted,
    #[error("The fabric is already running")]
    AlreadyStarted,
    #[error("Task requests {requested:?} but the fabric only offers {capacity:?}")]
    Infeasible {
        requested: TaskResources,
        capacity: TaskResources,
    },
    #[error("Failed to start the worker pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Failure of a single unit of work
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    #[error("Task failed: {0}")]
    Failed(String),
    #[error("Task panicked: {0}")]
    Panicked(String),
    #[error("Task result was lost before it could be collected")]
    Lost,
}

impl TaskError {
    pub fn failed(message: impl fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }
}

/// Resources one remote task reserves while it runs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskResources {
    pub num_cpus: f64,
    pub num_gpus: f64,
}

impl Default for TaskResources {
    fn default() -> Self {
        Self {
            num_cpus: 1.0,
            num_gpus: 0.0,
        }
    }
}

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// The remote-execution fabric a distributed job drives.
///
/// The fabric only runs opaque tasks. Result transport and ordering are the
/// dispatcher's concern.
pub trait Fabric: Send {
    fn start(&mut self, config: &FabricConfig) -> Result<(), FabricError>;

    fn submit(&self, resources: TaskResources, task: Task) -> Result<(), FabricError>;

    fn shutdown(&mut self);

    fn is_running(&self) -> bool;
}

/// A started fabric, shut down when dropped
pub struct FabricSession<'a> {
    fabric: &'a mut dyn Fabric,
}

impl<'a> FabricSession<'a> {
    pub fn start(fabric: &'a mut dyn Fabric, config: &FabricConfig) -> Result<Self, FabricError> {
        fabric.start(config)?;
        debug!(?config, "Started fabric");

        Ok(Self { fabric })
    }

    pub fn submit(&self, resources: TaskResources, task: Task) -> Result<(), FabricError> {
        self.fabric.submit(resources, task)
    }
}

impl Drop for FabricSession<'_> {
    fn drop(&mut self) {
        self.fabric.shutdown();
        debug!("Shut down fabric");
    }
}

pub type TaskFn<P, R> = Arc<dyn Fn(P) -> Result<R, TaskError> + Send + Sync>;

/// A function that was wrapped for remote execution together with its reservation
pub struct RemoteFunction<P, R> {
    function: TaskFn<P, R>,
    resources: TaskResources,
}

impl<P, R> RemoteFunction<P, R> {
    pub fn resources(&self) -> TaskResources {
        self.resources
    }

    pub fn function(&self) -> &TaskFn<P, R> {
        &self.function
    }
}

impl<P, R> Clone for RemoteFunction<P, R> {
    fn clone(&self) -> Self {
        Self {
            function: self.function.clone(),
            resources: self.resources,
        }
    }
}

/// The unit of work of a job, either plain or already wrapped as remote
pub enum TaskFunction<P, R> {
    Local(TaskFn<P, R>),
    Remote(RemoteFunction<P, R>),
}

impl<P, R> Clone for TaskFunction<P, R> {
    fn clone(&self) -> Self {
        match self {
            Self::Local(function) => Self::Local(function.clone()),
            Self::Remote(remote) => Self::Remote(remote.clone()),
        }
    }
}

impl<P, R> fmt::Debug for TaskFunction<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(_) => f.write_str("TaskFunction::Local"),
            Self::Remote(remote) => f
                .debug_struct("TaskFunction::Remote")
                .field("resources", &remote.resources)
                .finish(),
        }
    }
}

impl<P, R> TaskFunction<P, R> {
    pub fn new<F>(function: F) -> Self
    where
        F: Fn(P) -> Result<R, TaskError> + Send + Sync + 'static,
    {
        Self::Local(Arc::new(function))
    }

    /// wrap for remote execution, a function that is already remote is returned unchanged
    pub fn remote(self, resources: TaskResources) -> Self {
        match self {
            Self::Local(function) => Self::Remote(RemoteFunction {
                function,
                resources,
            }),
            remote => remote,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    pub fn as_remote(&self) -> Option<&RemoteFunction<P, R>> {
        match self {
            Self::Remote(remote) => Some(remote),
            Self::Local(_) => None,
        }
    }

    fn inner(&self) -> &TaskFn<P, R> {
        match self {
            Self::Local(function) => function,
            Self::Remote(remote) => &remote.function,
        }
    }

    /// run synchronously on the calling thread, a panic becomes a `TaskError`
    pub fn call(&self, params: P) -> Result<R, TaskError> {
        call_guarded(self.inner(), params)
    }
}

pub(crate) fn call_guarded<P, R>(function: &TaskFn<P, R>, params: P) -> Result<R, TaskError> {
    panic::catch_unwind(AssertUnwindSafe(|| function(params)))
        .unwrap_or_else(|payload| Err(TaskError::Panicked(panic_message(payload))))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&'static str>()
            .map(|message| (*message).to_owned())
            .unwrap_or_else(|| "unknown panic payload".to_owned()),
    }
}

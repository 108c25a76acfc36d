use crate::{
    arguments::{Argument, ArgumentType, ArgumentValue},
    binding::{BindError, Bindable},
    broadcast::{self, BroadcastError},
    config::{AllocationConfig, FabricConfig, HostCapacity, ResourceLimits},
    definition::JobDefinition,
    dispatch::{
        self, Completions, DispatchError, ExecutionMode, ProgressReporter, RunReport,
        TracingProgress,
    },
    fabric::{Fabric, LocalFabric, TaskError, TaskFunction, TaskResources},
    registry::{Identity, JobMetadata, RegistryBuilder, TypeDeclaration},
    resources::{self, DeviceInventory, GpuAllocation},
};
use std::{collections::BTreeMap, fmt, sync::Arc};
use thiserror::Error;
use tracing::debug;

/// base type every distributed job inherits its resource caps from
pub const DISTRIBUTED_JOB: &str = "flotilla::DistributedJob";

#[derive(Error, Debug)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
}

/// The capability set every constructed job offers
pub trait Job: Send {
    fn definition(&self) -> &JobDefinition;

    fn run(&mut self, context: &JobContext) -> Result<RunReport, DispatchError>;
}

/// A job whose units of work are dispatched to the fabric
pub trait DistributedJob: Send {
    type Params: Send + 'static;
    type Output: Send + 'static;

    fn definition(&self) -> &JobDefinition;

    fn settings(&self) -> &DistributedSettings;

    /// number of tuples `prologue` will produce
    fn job_count(&self) -> usize;

    fn function(&self) -> TaskFunction<Self::Params, Self::Output>;

    fn prologue(&mut self) -> Result<Vec<Self::Params>, JobError>;

    fn epilogue(&mut self, results: &mut Completions<'_, Self::Output>) -> Result<(), JobError>;

    /// called once after binding, before the job is handed out
    fn bound(&mut self) -> Result<(), JobError> {
        Ok(())
    }
}

pub type FabricFactory = Arc<dyn Fn(HostCapacity) -> Box<dyn Fabric> + Send + Sync>;

/// Everything a job needs from its surroundings when it is built and run
#[derive(Clone)]
pub struct JobContext {
    inventory: Arc<dyn DeviceInventory>,
    allocation: Option<AllocationConfig>,
    limits: ResourceLimits,
    host: HostCapacity,
    mode: ExecutionMode,
    fabric: FabricFactory,
    progress: Arc<dyn ProgressReporter>,
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("allocation", &self.allocation)
            .field("limits", &self.limits)
            .field("host", &self.host)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl JobContext {
    pub fn new(inventory: Arc<dyn DeviceInventory>) -> Self {
        let host = HostCapacity::detect(inventory.as_ref());

        Self {
            inventory,
            allocation: None,
            limits: ResourceLimits::default(),
            host,
            mode: ExecutionMode::detect(),
            fabric: Arc::new(|host| -> Box<dyn Fabric> { Box::new(LocalFabric::new(host)) }),
            progress: Arc::new(TracingProgress),
        }
    }

    pub fn with_allocation(mut self, allocation: Option<AllocationConfig>) -> Self {
        self.allocation = allocation;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_host(mut self, host: HostCapacity) -> Self {
        self.host = host;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_fabric<F>(mut self, factory: F) -> Self
    where
        F: Fn(HostCapacity) -> Box<dyn Fabric> + Send + Sync + 'static,
    {
        self.fabric = Arc::new(factory);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn inventory(&self) -> &dyn DeviceInventory {
        self.inventory.as_ref()
    }

    pub fn allocation(&self) -> Option<&AllocationConfig> {
        self.allocation.as_ref()
    }

    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }

    pub fn host(&self) -> HostCapacity {
        self.host
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn progress(&self) -> &dyn ProgressReporter {
        self.progress.as_ref()
    }

    pub fn fabric(&self) -> Box<dyn Fabric> {
        (self.fabric)(self.host)
    }
}

/// declare the distributed base type and its `max-cpu` / `max-gpu` arguments
pub fn declare_distributed_base(builder: &mut RegistryBuilder) {
    builder
        .declare_type(
            TypeDeclaration::new(DISTRIBUTED_JOB)
                .member("max_num_cpu")
                .member("max_num_gpu"),
        )
        .register(
            Identity::new(DISTRIBUTED_JOB, "max_num_cpu"),
            Argument::scalar("max_num_cpu", ArgumentType::Integer)
                .key("max-cpu")
                .help("Maximum number of CPU cores used by this job"),
        )
        .register(
            Identity::new(DISTRIBUTED_JOB, "max_num_gpu"),
            Argument::scalar("max_num_gpu", ArgumentType::Integer)
                .key("max-gpu")
                .help("Maximum number of accelerators used by this job"),
        );
}

/// Resource side of a distributed job, shared by every job type
#[derive(Debug, Clone, PartialEq)]
pub struct DistributedSettings {
    pub limits: ResourceLimits,
    pub parallel: bool,
    pub num_cpus: f64,
    pub allocation: GpuAllocation,
}

impl DistributedSettings {
    /// the accelerator share is computed here, once per constructed job
    pub fn new(metadata: &JobMetadata, inventory: &dyn DeviceInventory) -> Self {
        Self {
            limits: ResourceLimits::default(),
            parallel: metadata.parallel,
            num_cpus: metadata.num_cpus.unwrap_or(1.0),
            allocation: resources::allocate(metadata.gpus, inventory),
        }
    }

    pub fn owns(member: &str) -> bool {
        matches!(member, "max_num_cpu" | "max_num_gpu")
    }

    pub fn assign(&mut self, member: &str, value: ArgumentValue) -> Result<(), BindError> {
        let into_member = |source| BindError::Member {
            member: member.to_owned(),
            source,
        };

        match member {
            "max_num_cpu" => self.limits.max_num_cpu = value.extract().map_err(into_member)?,
            "max_num_gpu" => self.limits.max_num_gpu = value.extract().map_err(into_member)?,
            _ => {
                return Err(BindError::UnknownArgument {
                    argument: member.to_owned(),
                    job_type: DISTRIBUTED_JOB.to_owned(),
                })
            }
        }

        Ok(())
    }

    pub fn task_resources(&self) -> TaskResources {
        TaskResources {
            num_cpus: self.num_cpus,
            num_gpus: self.allocation.as_f64().unwrap_or(0.0),
        }
    }

    /// job caps win over operator caps, both are clamped to the host
    pub fn fabric_config(&self, context: &JobContext) -> FabricConfig {
        FabricConfig::resolve(
            context.allocation(),
            self.limits.or(context.limits()),
            context.host(),
        )
    }

    pub fn mode(&self, context: &JobContext) -> ExecutionMode {
        if self.parallel {
            context.mode()
        } else {
            ExecutionMode::Serial
        }
    }
}

/// Adapts a [`DistributedJob`] to the [`Job`] capability set
pub struct Distributed<J>(J);

impl<J: DistributedJob> Distributed<J> {
    pub fn new(job: J) -> Self {
        Self(job)
    }

    pub fn inner(&self) -> &J {
        &self.0
    }

    pub fn into_inner(self) -> J {
        self.0
    }
}

impl<J: DistributedJob> Job for Distributed<J> {
    fn definition(&self) -> &JobDefinition {
        self.0.definition()
    }

    fn run(&mut self, context: &JobContext) -> Result<RunReport, DispatchError> {
        let settings = self.0.settings();
        let config = settings.fabric_config(context);
        let mode = settings.mode(context);
        let mut fabric = context.fabric();

        dispatch::dispatch(&mut self.0, fabric.as_mut(), &config, mode, context.progress())
    }
}

pub type ArgumentFn = TaskFunction<Vec<ArgumentValue>, ArgumentValue>;

/// A job type made of metadata and one function.
///
/// Each unit of work receives one broadcast tuple, ordered like the declared
/// parameters. Arguments inherited from a base type are available through
/// [`FunctionJob::value`] only.
pub struct FunctionJob {
    definition: JobDefinition,
    metadata: Arc<JobMetadata>,
    settings: DistributedSettings,
    function: ArgumentFn,
    values: BTreeMap<String, ArgumentValue>,
    job_count: usize,
    results: Vec<ArgumentValue>,
}

impl FunctionJob {
    pub fn new(
        definition: JobDefinition,
        metadata: Arc<JobMetadata>,
        function: ArgumentFn,
        inventory: &dyn DeviceInventory,
    ) -> Self {
        let settings = DistributedSettings::new(&metadata, inventory);

        Self {
            definition,
            metadata,
            settings,
            function,
            values: BTreeMap::new(),
            job_count: 0,
            results: Vec::new(),
        }
    }

    pub fn metadata(&self) -> &JobMetadata {
        &self.metadata
    }

    pub fn value(&self, member: &str) -> Option<&ArgumentValue> {
        self.values.get(member)
    }

    pub fn results(&self) -> &[ArgumentValue] {
        &self.results
    }

    fn ordered_values(&self) -> Vec<ArgumentValue> {
        self.metadata
            .parameter_names()
            .map(|member| self.values.get(member).cloned().unwrap_or_default())
            .collect()
    }
}

impl Bindable for FunctionJob {
    fn type_name(&self) -> &str {
        &self.metadata.name
    }

    fn assign(&mut self, member: &str, value: ArgumentValue) -> Result<(), BindError> {
        if DistributedSettings::owns(member) {
            return self.settings.assign(member, value);
        }

        // members inherited from a base are kept by name but never reach the tuple
        self.values.insert(member.to_owned(), value);

        Ok(())
    }
}

impl DistributedJob for FunctionJob {
    type Params = Vec<ArgumentValue>;
    type Output = ArgumentValue;

    fn definition(&self) -> &JobDefinition {
        &self.definition
    }

    fn settings(&self) -> &DistributedSettings {
        &self.settings
    }

    fn job_count(&self) -> usize {
        self.job_count
    }

    fn function(&self) -> ArgumentFn {
        self.function.clone()
    }

    fn prologue(&mut self) -> Result<Vec<Self::Params>, JobError> {
        Ok(broadcast::expand(&self.ordered_values())?)
    }

    fn epilogue(&mut self, results: &mut Completions<'_, Self::Output>) -> Result<(), JobError> {
        self.results.extend(results);

        debug!(
            job = %self.definition.display_name,
            "Collected {} results",
            self.results.len()
        );

        Ok(())
    }

    /// mismatched list lengths are rejected before the job ever runs
    fn bound(&mut self) -> Result<(), JobError> {
        self.job_count = broadcast::tuple_count(&self.ordered_values())?;

        Ok(())
    }
}

impl From<TaskError> for JobError {
    fn from(error: TaskError) -> Self {
        Self::Failed(error.to_string())
    }
}

//! Registry of job types and batch execution of job definitions.

use crate::{
    arguments::ArgumentValue,
    binding::{BindError, Binder, Bindable},
    coercion::{Coercer, CoercionChain},
    collector::{self, CollectorError},
    definition::{self, JobDefinition, JobFileError},
    dispatch::{DispatchError, RunReport},
    fabric::{TaskError, TaskFunction},
    job::{
        self, Distributed, DistributedJob, FunctionJob, Job, JobContext, JobError, DISTRIBUTED_JOB,
    },
    registry::{self, JobMetadata, MetadataRegistry, RegistryBuilder, RegistryError},
};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Job type {0} is already registered")]
    DuplicateJobType(String),
    #[error("Job type {0} is not registered")]
    UnknownJobType(String),
    #[error("Job type does not expose a name")]
    MissingName,
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    JobFile(#[from] JobFileError),
    #[error(transparent)]
    Collector(#[from] CollectorError),
    #[error(transparent)]
    Job(#[from] JobError),
}

pub type Constructor = Arc<
    dyn Fn(JobDefinition, &Binder, &JobContext) -> Result<Box<dyn Job>, SchedulerError>
        + Send
        + Sync,
>;

/// A job type implemented as a struct with bindable members
pub trait JobType: DistributedJob + Bindable + Sized + 'static {
    const NAME: &'static str;

    /// declare the type, its bases and its arguments
    fn declare(builder: &mut RegistryBuilder);

    fn create(definition: JobDefinition, context: &JobContext) -> Result<Self, JobError>;
}

/// Collects job types and declarations during startup
pub struct SchedulerBuilder {
    registry: RegistryBuilder,
    coercers: CoercionChain,
    order: Vec<String>,
    constructors: BTreeMap<String, Constructor>,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        let mut registry = RegistryBuilder::new();
        job::declare_distributed_base(&mut registry);

        Self {
            registry,
            coercers: CoercionChain::default(),
            order: Vec::new(),
            constructors: BTreeMap::new(),
        }
    }

    pub fn registry_mut(&mut self) -> &mut RegistryBuilder {
        &mut self.registry
    }

    pub fn coercer(&mut self, coercer: Box<dyn Coercer>) -> &mut Self {
        self.coercers.register(coercer);
        self
    }

    fn ensure_available(&self, name: &str) -> Result<(), SchedulerError> {
        if name.is_empty() {
            return Err(SchedulerError::MissingName);
        }
        if self.constructors.contains_key(name) {
            return Err(SchedulerError::DuplicateJobType(name.to_owned()));
        }

        Ok(())
    }

    pub fn register_job_type(
        &mut self,
        name: &str,
        constructor: Constructor,
    ) -> Result<&mut Self, SchedulerError> {
        self.ensure_available(name)?;

        debug!("Registered job type {name}");
        self.order.push(name.to_owned());
        self.constructors.insert(name.to_owned(), constructor);

        Ok(self)
    }

    pub fn register<J: JobType>(&mut self) -> Result<&mut Self, SchedulerError> {
        self.ensure_available(J::NAME)?;
        J::declare(&mut self.registry);

        self.register_job_type(
            J::NAME,
            Arc::new(
                |definition: JobDefinition,
                 binder: &Binder,
                 context: &JobContext|
                 -> Result<Box<dyn Job>, SchedulerError> {
                let mut job = J::create(definition.clone(), context)?;
                binder.bind(&definition, &mut job)?;
                job.bound()?;

                Ok(Box::new(Distributed::new(job)) as Box<dyn Job>)
            }),
        )
    }

    /// register a job type made of metadata and one function over argument tuples
    pub fn register_function<F>(
        &mut self,
        metadata: JobMetadata,
        function: F,
    ) -> Result<&mut Self, SchedulerError>
    where
        F: Fn(Vec<ArgumentValue>) -> Result<ArgumentValue, TaskError> + Send + Sync + 'static,
    {
        self.ensure_available(&metadata.name)?;

        let metadata = if metadata.bases.iter().any(|base| base == DISTRIBUTED_JOB) {
            metadata
        } else {
            metadata.base(DISTRIBUTED_JOB)
        };
        let metadata = self.registry.declare_job(metadata);
        let name = metadata.name.clone();
        let function = TaskFunction::new(function);

        self.register_job_type(
            &name,
            Arc::new(
                move |definition: JobDefinition,
                      binder: &Binder,
                      context: &JobContext|
                      -> Result<Box<dyn Job>, SchedulerError> {
                let mut job = FunctionJob::new(
                    definition.clone(),
                    metadata.clone(),
                    function.clone(),
                    context.inventory(),
                );
                binder.bind(&definition, &mut job)?;
                job.bound()?;

                Ok(Box::new(Distributed::new(job)) as Box<dyn Job>)
            }),
        )
    }

    /// freeze the registry, no job type can be added afterwards
    pub fn build(self) -> Result<Scheduler, SchedulerError> {
        let registry = self.registry.build()?;

        Ok(Self::finish(Arc::new(registry), self.coercers, self.order, self.constructors))
    }

    /// freeze the registry and install it for the whole process, the scheduler
    /// binds against the installed instance
    pub fn install(self) -> Result<Scheduler, SchedulerError> {
        let registry = registry::install(self.registry.build()?)?;

        Ok(Self::finish(registry, self.coercers, self.order, self.constructors))
    }

    fn finish(
        registry: Arc<MetadataRegistry>,
        coercers: CoercionChain,
        order: Vec<String>,
        constructors: BTreeMap<String, Constructor>,
    ) -> Scheduler {
        info!("Registered {} job types", order.len());

        Scheduler {
            binder: Binder::new(registry, Arc::new(coercers)),
            order,
            constructors,
        }
    }
}

/// Result of a single job definition in a batch
#[derive(Debug)]
pub struct JobOutcome {
    pub display_name: String,
    pub job_name: String,
    pub source: Option<PathBuf>,
    pub result: Result<RunReport, SchedulerError>,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<JobOutcome>,
    /// job files that could not be read at all
    pub unreadable: Vec<(PathBuf, JobFileError)>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|outcome| outcome.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded() + self.unreadable.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}

/// Frozen set of job types
pub struct Scheduler {
    binder: Binder,
    order: Vec<String>,
    constructors: BTreeMap<String, Constructor>,
}

impl Scheduler {
    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        self.binder.registry()
    }

    /// job type names in registration order
    pub fn list_job_types(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// build and bind the job a definition names
    pub fn construct(
        &self,
        definition: JobDefinition,
        context: &JobContext,
    ) -> Result<Box<dyn Job>, SchedulerError> {
        let constructor = self
            .constructors
            .get(&definition.job_name)
            .ok_or_else(|| SchedulerError::UnknownJobType(definition.job_name.clone()))?;

        constructor(definition, &self.binder, context)
    }

    pub fn run_definition(
        &self,
        definition: JobDefinition,
        context: &JobContext,
    ) -> Result<RunReport, SchedulerError> {
        let mut job = self.construct(definition, context)?;

        Ok(job.run(context)?)
    }

    fn run_one(
        &self,
        definition: JobDefinition,
        source: Option<&Path>,
        context: &JobContext,
    ) -> JobOutcome {
        let display_name = definition.display_name.clone();
        let job_name = definition.job_name.clone();

        info!("Running {display_name} ({job_name})");
        let result = self.run_definition(definition, context);
        if let Err(error) = &result {
            error!("Job {display_name} failed: {error}");
        }

        JobOutcome {
            display_name,
            job_name,
            source: source.map(Path::to_path_buf),
            result,
        }
    }

    /// run every definition, a failing definition does not stop the rest
    pub fn run_job_definitions<I>(&self, definitions: I, context: &JobContext) -> BatchReport
    where
        I: IntoIterator<Item = JobDefinition>,
    {
        let outcomes = definitions
            .into_iter()
            .map(|definition| self.run_one(definition, None, context))
            .collect();

        BatchReport {
            outcomes,
            unreadable: Vec::new(),
        }
    }

    /// expand `patterns` to job files and run every definition in them
    pub fn run_job_files<S: AsRef<str>>(
        &self,
        patterns: &[S],
        context: &JobContext,
    ) -> Result<BatchReport, SchedulerError> {
        let files = collector::expand_all(patterns)?;
        if files.is_empty() {
            warn!("No job files matched the given patterns");
        }

        let mut report = BatchReport::default();
        for (index, file) in files.iter().enumerate() {
            match definition::load_job_file(file) {
                Ok(definitions) => report.outcomes.extend(
                    definitions
                        .into_iter()
                        .map(|definition| self.run_one(definition, Some(file), context)),
                ),
                Err(error) => {
                    error!("Skipping {}: {error}", file.display());
                    report.unreadable.push((file.clone(), error));
                }
            }
            info!("Done with {}/{}", index + 1, files.len());
        }

        Ok(report)
    }
}

#[cfg(test)]
#[path = "scheduler_test.rs"]
mod scheduler_test;

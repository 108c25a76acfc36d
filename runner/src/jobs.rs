//! Job types shipped with the `flotilla` binary.

use crate::{
    arguments::{Argument, ArgumentType, ArgumentValue},
    binding::{BindError, Bindable},
    definition::JobDefinition,
    dispatch::Completions,
    fabric::{TaskError, TaskFunction},
    job::{DistributedJob, DistributedSettings, JobContext, JobError, DISTRIBUTED_JOB},
    pipeline::{Context, Pipeline, Status, Task},
    registry::{JobMetadata, RegistryBuilder},
    scheduler::{JobType, SchedulerBuilder, SchedulerError},
};
use std::{fs, path::PathBuf, sync::Arc};
use tracing::info;

pub fn register_builtin(builder: &mut SchedulerBuilder) -> Result<(), SchedulerError> {
    builder
        .register_function(echo_metadata(), echo)?
        .register::<LineCount>()?;

    Ok(())
}

fn echo_metadata() -> JobMetadata {
    JobMetadata::new("echo")
        .parallel()
        .parameter(
            "message",
            Argument::list("message", ArgumentType::String)
                .help("Messages to print, one task each"),
        )
        .parameter(
            "prefix",
            Argument::scalar("prefix", ArgumentType::String)
                .default_value("")
                .help("Printed in front of every message"),
        )
}

fn echo(tuple: Vec<ArgumentValue>) -> Result<ArgumentValue, TaskError> {
    match tuple.as_slice() {
        [ArgumentValue::String(message), ArgumentValue::String(prefix)] => {
            let line = format!("{prefix}{message}");
            info!("{line}");

            Ok(ArgumentValue::String(line))
        }
        _ => Err(TaskError::failed("echo expects a message and a prefix")),
    }
}

/// Counts the lines of every matched file, one task per file
pub struct LineCount {
    definition: JobDefinition,
    settings: DistributedSettings,
    paths: Vec<PathBuf>,
    skip_empty: bool,
    total: usize,
}

impl LineCount {
    fn metadata() -> JobMetadata {
        JobMetadata::new(Self::NAME)
            .parallel()
            .num_cpus(1.0)
            .base(DISTRIBUTED_JOB)
            .parameter(
                "paths",
                Argument::list("paths", ArgumentType::Path)
                    .required()
                    .allow_glob()
                    .help("Files to count, glob patterns are expanded"),
            )
            .parameter(
                "skip_empty",
                Argument::scalar("skip_empty", ArgumentType::Boolean)
                    .key("skip-empty")
                    .default_value(false)
                    .help("Ignore blank lines"),
            )
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

fn counting_pipeline(skip_empty: bool) -> Pipeline {
    Pipeline::new()
        .task(
            Task::new("read", |context: &Context| match context.get("path") {
                Some(ArgumentValue::Path(path)) => match fs::read_to_string(path) {
                    Ok(contents) => Status::ok(contents),
                    Err(error) => Status::error(format!("{}: {error}", path.display())),
                },
                _ => Status::error("no path given"),
            })
            .output("contents"),
        )
        .task(
            Task::new("count", move |context: &Context| match context.get("contents") {
                Some(ArgumentValue::String(contents)) => Status::ok(
                    contents
                        .lines()
                        .filter(|line| !skip_empty || !line.trim().is_empty())
                        .count() as i64,
                ),
                _ => Status::error("nothing was read"),
            })
            .output("lines"),
        )
}

fn count_lines((path, skip_empty): (PathBuf, bool)) -> Result<usize, TaskError> {
    let context = counting_pipeline(skip_empty)
        .run(Context::from([("path".to_owned(), ArgumentValue::Path(path))]))
        .map_err(TaskError::failed)?;

    match context.get("lines") {
        Some(ArgumentValue::Integer(lines)) => Ok(*lines as usize),
        _ => Err(TaskError::failed("line count missing")),
    }
}

impl Bindable for LineCount {
    fn type_name(&self) -> &str {
        Self::NAME
    }

    fn assign(&mut self, member: &str, value: ArgumentValue) -> Result<(), BindError> {
        if DistributedSettings::owns(member) {
            return self.settings.assign(member, value);
        }

        let into_member = |source| BindError::Member {
            member: member.to_owned(),
            source,
        };

        match member {
            "paths" => self.paths = value.extract().map_err(into_member)?,
            "skip_empty" => self.skip_empty = value.extract().map_err(into_member)?,
            _ => {
                return Err(BindError::UnknownArgument {
                    argument: member.to_owned(),
                    job_type: Self::NAME.to_owned(),
                })
            }
        }

        Ok(())
    }
}

impl JobType for LineCount {
    const NAME: &'static str = "line-count";

    fn declare(builder: &mut RegistryBuilder) {
        builder.declare_job(Self::metadata());
    }

    fn create(definition: JobDefinition, context: &JobContext) -> Result<Self, JobError> {
        Ok(Self {
            definition,
            settings: DistributedSettings::new(&Self::metadata(), context.inventory()),
            paths: Vec::new(),
            skip_empty: false,
            total: 0,
        })
    }
}

impl DistributedJob for LineCount {
    type Params = (PathBuf, bool);
    type Output = usize;

    fn definition(&self) -> &JobDefinition {
        &self.definition
    }

    fn settings(&self) -> &DistributedSettings {
        &self.settings
    }

    fn job_count(&self) -> usize {
        self.paths.len()
    }

    fn function(&self) -> TaskFunction<Self::Params, Self::Output> {
        TaskFunction::Local(Arc::new(count_lines))
    }

    fn prologue(&mut self) -> Result<Vec<Self::Params>, JobError> {
        Ok(self
            .paths
            .iter()
            .map(|path| (path.clone(), self.skip_empty))
            .collect())
    }

    fn epilogue(&mut self, results: &mut Completions<'_, usize>) -> Result<(), JobError> {
        self.total = results.sum();

        info!(
            job = %self.definition.display_name,
            "Counted {} lines in {} files",
            self.total,
            self.paths.len()
        );

        Ok(())
    }
}

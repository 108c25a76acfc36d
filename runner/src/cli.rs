use crate::{
    config::{self, AllocationConfig, ConfigErrors, HostCapacity, ResourceLimits, UNBOUNDED},
    job::JobContext,
    resources::DeviceInventory,
    scheduler::{Scheduler, SchedulerError},
};
use clap::{Parser, Subcommand};
use std::{path::PathBuf, sync::Arc};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "flotilla")]
#[command(version)]
#[command(about = "Run declarative job definitions on a local fabric")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Allocation config to read or write, defaults to the user's config directory
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// List all known job types
    ListJobs,

    /// Run the job definitions of every file matching the patterns
    RunJobs {
        /// Job files or glob patterns
        #[arg(required = true)]
        patterns: Vec<String>,

        /// Maximum number of CPU cores
        #[arg(long, short = 'c')]
        max_cpu: Option<usize>,

        /// Maximum number of accelerators
        #[arg(long, short = 'g')]
        max_gpu: Option<usize>,
    },

    /// Write the allocation config for this host
    GenerateConfig {
        /// Maximum number of CPU cores
        #[arg(long, short = 'c', default_value_t = UNBOUNDED)]
        max_cpu: usize,

        /// Maximum number of accelerators
        #[arg(long, short = 'g', default_value_t = UNBOUNDED)]
        max_gpu: usize,
    },
}

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("{failed} of {total} job definitions failed")]
    Failed { failed: usize, total: usize },
}

impl Cli {
    pub fn config_path(&self) -> Result<PathBuf, ConfigErrors> {
        match &self.config {
            Some(path) => Ok(path.clone()),
            None => config::default_config_path(),
        }
    }
}

pub fn execute(
    cli: Cli,
    scheduler: &Scheduler,
    inventory: Arc<dyn DeviceInventory>,
) -> Result<(), CliError> {
    let config_path = cli.config_path()?;
    debug!("Using allocation config {}", config_path.display());

    match cli.command {
        Command::ListJobs => {
            for name in scheduler.list_job_types() {
                println!("{name}");
            }
        }
        Command::RunJobs {
            patterns,
            max_cpu,
            max_gpu,
        } => {
            let context = JobContext::new(inventory)
                .with_allocation(AllocationConfig::load(&config_path)?)
                .with_limits(ResourceLimits {
                    max_num_cpu: max_cpu,
                    max_num_gpu: max_gpu,
                });

            let report = scheduler.run_job_files(&patterns, &context)?;
            let total = report.outcomes.len() + report.unreadable.len();
            info!("{}/{total} job definitions succeeded", report.succeeded());

            if !report.is_success() {
                return Err(CliError::Failed {
                    failed: report.failed(),
                    total,
                });
            }
        }
        Command::GenerateConfig { max_cpu, max_gpu } => {
            let host = HostCapacity::detect(inventory.as_ref());
            AllocationConfig::generate(max_cpu, max_gpu, host).save(&config_path)?;
        }
    }

    Ok(())
}

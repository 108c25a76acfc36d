use clap::Parser;
use flotilla_runner::{
    cli::{self, Cli},
    jobs,
    resources::StaticInventory,
    scheduler::SchedulerBuilder,
};
use std::{process::exit, sync::Arc};
use tracing::error;
use tracing_subscriber::EnvFilter;
use tracing_unwrap::ResultExt;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // every job type is declared before the registry is frozen and installed
    let mut builder = SchedulerBuilder::new();
    jobs::register_builtin(&mut builder).unwrap_or_log();
    let scheduler = builder.install().unwrap_or_log();

    if let Err(error) = cli::execute(cli, &scheduler, Arc::new(StaticInventory::from_env())) {
        error!("{error}");
        exit(1);
    }
}

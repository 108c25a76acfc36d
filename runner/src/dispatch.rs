//! Two-phase lifecycle of a distributed job.
//!
//! The job's prologue produces every parameter tuple up front, the tuples are
//! run either serially or as remote tasks on a [`Fabric`], and the epilogue
//! consumes results in the order tasks finish.

use crate::{
    config::FabricConfig,
    fabric::{
        call_guarded, Fabric, FabricError, FabricSession, TaskError, TaskFunction, TaskResources,
    },
    job::{DistributedJob, JobError},
};
use std::{env, fs, sync::mpsc};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// setting this to anything but "0" or "" runs every job serially
pub const SERIAL_ENV: &str = "FLOTILLA_SERIAL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Created,
    Initialized,
    Producing,
    Running,
    Collecting,
    Completed,
    Failed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Job {job} declared {declared} units of work but produced {produced}")]
    JobCountMismatch {
        job: String,
        declared: usize,
        produced: usize,
    },
    #[error("Function of job {job} is not wrapped for remote execution")]
    NotRemote { job: String },
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Fabric(#[from] FabricError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Job(#[from] JobError),
}

/// Receives per-item progress of a running job
pub trait ProgressReporter: Send + Sync {
    fn started(&self, _job: &str, _total: usize) {}

    fn advanced(&self, job: &str, completed: usize, total: usize);

    fn finished(&self, _job: &str, _state: DispatchState) {}
}

/// Reports progress through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressReporter for TracingProgress {
    fn started(&self, job: &str, total: usize) {
        info!(job, "Dispatching {total} units of work");
    }

    fn advanced(&self, job: &str, completed: usize, total: usize) {
        info!(job, "Done with {completed}/{total}");
    }

    fn finished(&self, job: &str, state: DispatchState) {
        debug!(job, ?state, "Finished");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// one remote task per parameter tuple
    Parallel,
    /// tuples are called on the caller's thread in production order
    Serial,
}

impl ExecutionMode {
    pub fn detect() -> Self {
        if serial_forced() || debugger_attached() {
            debug!("Running jobs serially");
            Self::Serial
        } else {
            Self::Parallel
        }
    }
}

pub fn serial_forced() -> bool {
    env::var(SERIAL_ENV)
        .map(|value| !matches!(value.trim(), "" | "0"))
        .unwrap_or(false)
}

/// a non zero `TracerPid` means a debugger (or tracer) is attached
pub fn debugger_attached() -> bool {
    fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find_map(|line| line.strip_prefix("TracerPid:"))
                .and_then(|pid| pid.trim().parse::<u32>().ok())
        })
        .map_or(false, |pid| pid != 0)
}

/// Outcome of a completed run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub display_name: String,
    pub state: DispatchState,
    pub completed: usize,
    pub total: usize,
}

/// Results handed to a job's epilogue as tasks complete.
///
/// Iteration stops at the first failed task. The failure is kept and returned
/// as the job's outcome after the epilogue finishes.
pub struct Completions<'a, R> {
    results: Box<dyn Iterator<Item = Result<R, TaskError>> + 'a>,
    job: &'a str,
    total: usize,
    completed: usize,
    failure: Option<TaskError>,
    progress: &'a dyn ProgressReporter,
}

impl<'a, R> Completions<'a, R> {
    fn new(
        results: Box<dyn Iterator<Item = Result<R, TaskError>> + 'a>,
        job: &'a str,
        total: usize,
        progress: &'a dyn ProgressReporter,
    ) -> Self {
        Self {
            results,
            job,
            total,
            completed: 0,
            failure: None,
            progress,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn failure(&self) -> Option<&TaskError> {
        self.failure.as_ref()
    }

    /// consume whatever the epilogue left behind
    fn finish(mut self) -> (usize, Option<TaskError>) {
        while self.next().is_some() {}

        (self.completed, self.failure)
    }
}

impl<R> Iterator for Completions<'_, R> {
    type Item = R;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failure.is_some() {
            return None;
        }

        match self.results.next()? {
            Ok(result) => {
                self.completed += 1;
                self.progress
                    .advanced(self.job, self.completed, self.total);
                Some(result)
            }
            Err(error) => {
                warn!(job = self.job, "Task failed: {error}");
                self.failure = Some(error);
                None
            }
        }
    }
}

/// Results of submitted tasks, in the order they finish
struct PendingTasks<R> {
    receiver: mpsc::Receiver<Result<R, TaskError>>,
    remaining: usize,
}

impl<R> Iterator for PendingTasks<R> {
    type Item = Result<R, TaskError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        // every sender is gone once all tasks finished or were dropped unrun
        Some(self.receiver.recv().unwrap_or(Err(TaskError::Lost)))
    }
}

fn submit_all<P, R>(
    session: &FabricSession<'_>,
    function: &TaskFunction<P, R>,
    params: Vec<P>,
    job: &str,
) -> Result<PendingTasks<R>, DispatchError>
where
    P: Send + 'static,
    R: Send + 'static,
{
    let remote = function.as_remote().ok_or_else(|| ProtocolError::NotRemote {
        job: job.to_owned(),
    })?;
    let (sender, receiver) = mpsc::channel();
    let remaining = params.len();

    for params in params {
        let function = remote.function().clone();
        let sender = sender.clone();

        session.submit(
            remote.resources(),
            Box::new(move || {
                // the receiver only disappears when the run was abandoned
                let _ = sender.send(call_guarded(&function, params));
            }),
        )?;
    }

    debug!(job, "Submitted {remaining} tasks");

    Ok(PendingTasks {
        receiver,
        remaining,
    })
}

struct Lifecycle<'a> {
    job: &'a str,
    state: DispatchState,
}

impl Lifecycle<'_> {
    fn enter(&mut self, state: DispatchState) {
        debug!(job = self.job, "{:?} -> {state:?}", self.state);
        self.state = state;
    }
}

/// Run `job` to completion; the fabric is always shut down before this returns
#[instrument(skip_all, fields(job = %job.definition().display_name))]
pub fn dispatch<J>(
    job: &mut J,
    fabric: &mut dyn Fabric,
    config: &FabricConfig,
    mode: ExecutionMode,
    progress: &dyn ProgressReporter,
) -> Result<RunReport, DispatchError>
where
    J: DistributedJob + ?Sized,
{
    let name = job.definition().display_name.clone();
    let mut lifecycle = Lifecycle {
        job: &name,
        state: DispatchState::Created,
    };

    let outcome = run_phases(job, fabric, config, mode, progress, &mut lifecycle);

    match &outcome {
        Ok(_) => lifecycle.enter(DispatchState::Completed),
        Err(error) => {
            warn!("Job {name} failed: {error}");
            lifecycle.enter(DispatchState::Failed);
        }
    }
    progress.finished(&name, lifecycle.state);

    let (completed, total) = outcome?;

    Ok(RunReport {
        display_name: name.clone(),
        state: lifecycle.state,
        completed,
        total,
    })
}

fn run_phases<J>(
    job: &mut J,
    fabric: &mut dyn Fabric,
    config: &FabricConfig,
    mode: ExecutionMode,
    progress: &dyn ProgressReporter,
    lifecycle: &mut Lifecycle<'_>,
) -> Result<(usize, usize), DispatchError>
where
    J: DistributedJob + ?Sized,
{
    let name = lifecycle.job;

    // dropped on every path out of this function, which shuts the fabric down
    let session = match mode {
        ExecutionMode::Parallel => {
            let session = FabricSession::start(fabric, config)?;
            lifecycle.enter(DispatchState::Initialized);
            Some(session)
        }
        ExecutionMode::Serial => None,
    };

    lifecycle.enter(DispatchState::Producing);
    let params = job.prologue()?;
    let declared = job.job_count();
    if params.len() != declared {
        return Err(ProtocolError::JobCountMismatch {
            job: name.to_owned(),
            declared,
            produced: params.len(),
        }
        .into());
    }
    progress.started(name, declared);

    lifecycle.enter(DispatchState::Running);
    let results: Box<dyn Iterator<Item = Result<J::Output, TaskError>>> = match &session {
        Some(session) => {
            let resources: TaskResources = job.settings().task_resources();
            let function = job.function().remote(resources);
            Box::new(submit_all(session, &function, params, name)?)
        }
        None => {
            let function = job.function();
            Box::new(params.into_iter().map(move |params| function.call(params)))
        }
    };

    lifecycle.enter(DispatchState::Collecting);
    let mut completions = Completions::new(results, name, declared, progress);
    let epilogue = job.epilogue(&mut completions);
    let (completed, failure) = completions.finish();

    if let Some(error) = failure {
        return Err(error.into());
    }
    epilogue?;

    Ok((completed, declared))
}

#[cfg(test)]
#[path = "dispatch_test.rs"]
mod dispatch_test;

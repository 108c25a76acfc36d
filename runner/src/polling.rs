//! Background worker running queued job definitions one at a time.

use crate::{
    definition::JobDefinition,
    job::JobContext,
    scheduler::{JobOutcome, Scheduler},
};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::VecDeque,
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct Queue {
    pending: VecDeque<JobDefinition>,
    stopping: bool,
}

#[derive(Debug, Default)]
struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
    outcomes: Mutex<Vec<JobOutcome>>,
}

/// Strict FIFO execution of scheduled definitions on a single worker thread.
///
/// The worker only looks at the queue once per poll interval, so a freshly
/// scheduled job starts on the next tick at the earliest. Queued jobs are
/// never cancelled; shutting down runs whatever is still pending.
pub struct PollingScheduler {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl PollingScheduler {
    pub fn start(
        scheduler: Arc<Scheduler>,
        context: Arc<JobContext>,
        interval: Duration,
    ) -> io::Result<Self> {
        let shared = Arc::new(Shared::default());
        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("flotilla-poller".to_owned())
                .spawn(move || poll(&shared, &scheduler, &context, interval))?
        };

        debug!("Started polling scheduler with interval {interval:?}");

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    pub fn schedule(&self, definition: JobDefinition) {
        debug!(job = %definition.display_name, "Scheduled");
        self.shared.queue.lock().pending.push_back(definition);
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().pending.len()
    }

    /// outcomes of every job finished since the last call
    pub fn take_outcomes(&self) -> Vec<JobOutcome> {
        std::mem::take(&mut *self.shared.outcomes.lock())
    }

    /// run what is still queued, then stop the worker
    pub fn shutdown(mut self) -> Vec<JobOutcome> {
        self.stop();
        self.take_outcomes()
    }

    fn stop(&mut self) {
        self.shared.queue.lock().stopping = true;
        self.shared.wakeup.notify_all();

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Polling worker panicked");
            }
        }
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll(shared: &Shared, scheduler: &Scheduler, context: &JobContext, interval: Duration) {
    loop {
        let next = {
            let mut queue = shared.queue.lock();
            match queue.pending.pop_front() {
                Some(definition) => definition,
                None if queue.stopping => break,
                None => {
                    shared.wakeup.wait_for(&mut queue, interval);
                    continue;
                }
            }
        };

        // the lock is released while the job runs
        let display_name = next.display_name.clone();
        let result = scheduler.run_definition(next.clone(), context);
        match &result {
            Ok(report) => info!("Finished {display_name}: {}/{}", report.completed, report.total),
            Err(error) => warn!("Job {display_name} failed: {error}"),
        }

        shared.outcomes.lock().push(JobOutcome {
            display_name,
            job_name: next.job_name,
            source: None,
            result,
        });
    }

    debug!("Polling worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arguments::{Argument, ArgumentType, ArgumentValue},
        config::HostCapacity,
        dispatch::ExecutionMode,
        registry::JobMetadata,
        resources::NoDevices,
        scheduler::SchedulerBuilder,
    };
    use std::time::Instant;

    fn setup(calls: Arc<Mutex<Vec<String>>>) -> (Arc<Scheduler>, Arc<JobContext>) {
        let mut builder = SchedulerBuilder::new();
        builder
            .register_function(
                JobMetadata::new("tag")
                    .parameter("name", Argument::scalar("name", ArgumentType::String)),
                move |tuple| {
                    if let Some(ArgumentValue::String(name)) = tuple.first() {
                        calls.lock().push(name.clone());
                    }
                    Ok(ArgumentValue::Unset)
                },
            )
            .unwrap();
        let context = JobContext::new(Arc::new(NoDevices))
            .with_host(HostCapacity { cpus: 1, gpus: 0 })
            .with_mode(ExecutionMode::Serial);

        (Arc::new(builder.build().unwrap()), Arc::new(context))
    }

    fn wait_until(deadline: Duration, condition: impl Fn() -> bool) {
        let start = Instant::now();
        while !condition() && start.elapsed() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn tagged(name: &str) -> JobDefinition {
        JobDefinition::new(name, "tag").parameter("name", name)
    }

    #[test]
    fn jobs_wait_for_the_next_tick_and_run_in_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (scheduler, context) = setup(calls.clone());
        let poller =
            PollingScheduler::start(scheduler, context, Duration::from_millis(300)).unwrap();

        // let the worker find an empty queue and go to sleep
        thread::sleep(Duration::from_millis(50));
        poller.schedule(tagged("J1"));
        poller.schedule(tagged("J2"));

        assert!(calls.lock().is_empty());
        assert_eq!(poller.pending(), 2);

        wait_until(Duration::from_secs(5), || calls.lock().len() == 2);

        assert_eq!(*calls.lock(), vec!["J1".to_owned(), "J2".to_owned()]);
        let outcomes = poller.shutdown();
        assert_eq!(
            outcomes
                .iter()
                .map(|outcome| outcome.display_name.as_str())
                .collect::<Vec<_>>(),
            vec!["J1", "J2"]
        );
        assert!(outcomes.iter().all(JobOutcome::is_success));
    }

    #[test]
    fn shutdown_runs_queued_jobs() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (scheduler, context) = setup(calls.clone());
        let poller = PollingScheduler::start(scheduler, context, Duration::from_secs(60)).unwrap();

        thread::sleep(Duration::from_millis(50));
        poller.schedule(tagged("late"));
        poller.schedule(JobDefinition::new("broken", "missing"));

        let outcomes = poller.shutdown();

        assert_eq!(*calls.lock(), vec!["late".to_owned()]);
        assert_eq!(outcomes.len(), 2);
        assert!(!outcomes[1].is_success());
    }
}

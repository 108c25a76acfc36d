use super::*;
use crate::{
    arguments::{Argument, ArgumentType},
    config::HostCapacity,
    dispatch::ExecutionMode,
    registry::{Identity, TypeDeclaration},
    resources::NoDevices,
};
use parking_lot::Mutex;
use std::fs;

type Calls = Arc<Mutex<Vec<Vec<ArgumentValue>>>>;

fn context() -> JobContext {
    JobContext::new(Arc::new(NoDevices))
        .with_host(HostCapacity { cpus: 2, gpus: 0 })
        .with_mode(ExecutionMode::Serial)
}

fn resize() -> JobMetadata {
    JobMetadata::new("resize")
        .parallel()
        .parameter(
            "width",
            Argument::scalar("width", ArgumentType::Integer).required(),
        )
        .parameter("paths", Argument::list("paths", ArgumentType::String))
}

fn builder(calls: Calls) -> SchedulerBuilder {
    let mut builder = SchedulerBuilder::new();
    builder
        .register_function(resize(), move |tuple| {
            calls.lock().push(tuple.clone());
            Ok(ArgumentValue::List(tuple))
        })
        .unwrap()
        .register_function(JobMetadata::new("noop"), |_| Ok(ArgumentValue::Unset))
        .unwrap()
        .register_function(
            JobMetadata::new("zip")
                .parameter("left", Argument::list("left", ArgumentType::Integer))
                .parameter("right", Argument::list("right", ArgumentType::Integer)),
            |tuple| Ok(ArgumentValue::List(tuple)),
        )
        .unwrap();

    builder
}

fn scheduler() -> (Scheduler, Calls) {
    let calls = Calls::default();

    (builder(calls.clone()).build().unwrap(), calls)
}

#[test]
pub fn job_types_are_listed_in_registration_order() {
    let (scheduler, _) = scheduler();

    assert_eq!(
        scheduler.list_job_types().collect::<Vec<_>>(),
        vec!["resize", "noop", "zip"]
    );
}

#[test]
pub fn duplicate_registration_is_rejected() {
    let mut builder = builder(Calls::default());

    assert!(matches!(
        builder.register_function(JobMetadata::new("noop"), |_| Ok(ArgumentValue::Unset)),
        Err(SchedulerError::DuplicateJobType(name)) if name == "noop"
    ));
}

#[test]
pub fn nameless_job_type_is_rejected() {
    let mut builder = SchedulerBuilder::new();

    assert!(matches!(
        builder.register_function(JobMetadata::new(""), |_| Ok(ArgumentValue::Unset)),
        Err(SchedulerError::MissingName)
    ));
}

#[test]
pub fn unknown_job_type_is_reported() {
    let (scheduler, _) = scheduler();

    assert!(matches!(
        scheduler.run_definition(JobDefinition::new("batch1", "crop"), &context()),
        Err(SchedulerError::UnknownJobType(name)) if name == "crop"
    ));
}

#[test]
pub fn function_job_inherits_resource_caps() {
    let (scheduler, _) = scheduler();

    assert_eq!(
        scheduler.registry().ancestors("resize"),
        &[DISTRIBUTED_JOB.to_owned()]
    );
    assert_eq!(
        scheduler
            .registry()
            .resolve("resize", "max_num_cpu")
            .map(|argument| argument.key.as_str()),
        Some("max-cpu")
    );
}

#[test]
pub fn function_job_binds_members_of_a_declared_base() {
    let calls = Calls::default();
    let recorded = calls.clone();
    let mut builder = SchedulerBuilder::new();
    builder
        .registry_mut()
        .declare_type(TypeDeclaration::new("common").member("verbose"))
        .register(
            Identity::new("common", "verbose"),
            Argument::scalar("verbose", ArgumentType::Boolean).default_value(false),
        );
    builder
        .register_function(
            JobMetadata::new("thumbnail").base("common").parameter(
                "width",
                Argument::scalar("width", ArgumentType::Integer).required(),
            ),
            move |tuple| {
                recorded.lock().push(tuple.clone());
                Ok(ArgumentValue::List(tuple))
            },
        )
        .unwrap();
    let scheduler = builder.build().unwrap();

    let defaulted = JobDefinition::new("quiet", "thumbnail").parameter("width", 256);
    let explicit = JobDefinition::new("loud", "thumbnail")
        .parameter("width", 128)
        .parameter("verbose", true);

    assert!(scheduler.run_definition(defaulted, &context()).is_ok());
    assert!(scheduler.run_definition(explicit, &context()).is_ok());
    assert_eq!(
        *calls.lock(),
        vec![
            vec![ArgumentValue::Integer(256)],
            vec![ArgumentValue::Integer(128)],
        ]
    );
}

#[test]
pub fn resize_runs_one_task_per_path() {
    let (scheduler, calls) = scheduler();
    let definition = JobDefinition::new("batch1", "resize")
        .parameter("width", "256")
        .parameter("paths", vec!["a.jpg", "b.jpg"])
        .parameter("max-cpu", 1);

    let report = scheduler.run_definition(definition, &context()).unwrap();

    assert_eq!(report.completed, 2);
    assert_eq!(
        *calls.lock(),
        vec![
            vec![ArgumentValue::Integer(256), ArgumentValue::from("a.jpg")],
            vec![ArgumentValue::Integer(256), ArgumentValue::from("b.jpg")],
        ]
    );
}

#[test]
pub fn batch_isolates_failures() {
    let (scheduler, calls) = scheduler();
    let definitions = vec![
        JobDefinition::new("no width", "resize").parameter("paths", vec!["a.jpg"]),
        JobDefinition::new("idle", "noop"),
        JobDefinition::new("cropped", "crop"),
        JobDefinition::new("uneven", "zip")
            .parameter("left", vec![1, 2, 3])
            .parameter("right", vec![1, 2]),
    ];

    let report = scheduler.run_job_definitions(definitions, &context());

    assert_eq!(
        report
            .outcomes
            .iter()
            .map(JobOutcome::is_success)
            .collect::<Vec<_>>(),
        vec![false, true, false, false]
    );
    assert!(matches!(
        &report.outcomes[0].result,
        Err(SchedulerError::Bind(BindError::MissingArgument { argument })) if argument == "width"
    ));
    assert!(matches!(
        &report.outcomes[3].result,
        Err(SchedulerError::Job(JobError::Broadcast(_)))
    ));
    assert_eq!(report.failed(), 3);
    assert!(calls.lock().is_empty());
}

#[test]
pub fn job_files_are_expanded_and_run() {
    let (scheduler, calls) = scheduler();
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("a.yaml"),
        "jobs:\n  - display: first\n    job: resize\n    \
         params:\n      width: 64\n      paths: one.jpg\n",
    )
    .unwrap();
    fs::write(
        dir.path().join("b.yaml"),
        "jobs:\n  - display: second\n    job: noop\n",
    )
    .unwrap();
    fs::write(dir.path().join("c.yaml"), "name: nothing\n").unwrap();
    let pattern = format!("{}/*.yaml", dir.path().display());

    let report = scheduler.run_job_files(&[pattern], &context()).unwrap();

    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.outcomes[0].display_name, "first");
    assert_eq!(
        report.outcomes[0].source.as_deref(),
        Some(dir.path().join("a.yaml").as_path())
    );
    assert!(matches!(
        report.unreadable.as_slice(),
        [(_, JobFileError::NoJobs(_))]
    ));
    assert_eq!(
        *calls.lock(),
        vec![vec![ArgumentValue::Integer(64), ArgumentValue::from("one.jpg")]]
    );
}

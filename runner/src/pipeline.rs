use crate::arguments::ArgumentValue;
use std::{collections::BTreeMap, fmt};
use thiserror::Error;
use tracing::{debug, trace};

/// Named values threaded through every task of a pipeline
pub type Context = BTreeMap<String, ArgumentValue>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Task {task} failed: {message}")]
    Failed { task: String, message: String },
    #[error("Task {task} returned {found} values for {expected} outputs")]
    OutputMismatch {
        task: String,
        expected: usize,
        found: usize,
    },
}

/// What a task reports back
#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    Ok(ArgumentValue),
    Error(String),
}

impl Status {
    pub fn ok(value: impl Into<ArgumentValue>) -> Self {
        Self::Ok(value.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

/// Names a task publishes its result under
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Outputs {
    #[default]
    None,
    Single(String),
    /// the result has to be a list with one value per name
    Many(Vec<String>),
}

type TaskFn = Box<dyn Fn(&Context) -> Status + Send + Sync>;

pub struct Task {
    name: String,
    outputs: Outputs,
    function: TaskFn,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

impl Task {
    pub fn new<F>(name: &str, function: F) -> Self
    where
        F: Fn(&Context) -> Status + Send + Sync + 'static,
    {
        Self {
            name: name.to_owned(),
            outputs: Outputs::None,
            function: Box::new(function),
        }
    }

    pub fn output(mut self, name: &str) -> Self {
        self.outputs = Outputs::Single(name.to_owned());
        self
    }

    pub fn outputs(mut self, names: &[&str]) -> Self {
        self.outputs = Outputs::Many(names.iter().map(|name| (*name).to_owned()).collect());
        self
    }

    fn publish(&self, value: ArgumentValue, context: &mut Context) -> Result<(), PipelineError> {
        match &self.outputs {
            Outputs::None => {}
            Outputs::Single(name) => {
                context.insert(name.clone(), value);
            }
            Outputs::Many(names) => {
                let values = match value {
                    ArgumentValue::List(values) if values.len() == names.len() => values,
                    value => {
                        return Err(PipelineError::OutputMismatch {
                            task: self.name.clone(),
                            expected: names.len(),
                            found: value.broadcast_len(),
                        })
                    }
                };
                context.extend(names.iter().cloned().zip(values));
            }
        }

        Ok(())
    }
}

/// Ordered tasks sharing one [`Context`]
#[derive(Debug, Default)]
pub struct Pipeline {
    tasks: Vec<Task>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// run every task in order, the first error status stops the pipeline
    pub fn run(&self, mut context: Context) -> Result<Context, PipelineError> {
        for task in self.tasks.iter() {
            trace!("Running task {}", task.name);

            match (task.function)(&context) {
                Status::Ok(value) => task.publish(value, &mut context)?,
                Status::Error(message) => {
                    debug!("Task {} stopped the pipeline", task.name);
                    return Err(PipelineError::Failed {
                        task: task.name.clone(),
                        message,
                    });
                }
            }
        }

        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn integer(context: &Context, name: &str) -> i64 {
        match context.get(name) {
            Some(ArgumentValue::Integer(value)) => *value,
            _ => 0,
        }
    }

    #[test]
    fn outputs_feed_later_tasks() {
        let pipeline = Pipeline::new()
            .task(Task::new("split", |context| {
                let total = integer(context, "total");
                Status::ok(vec![total / 2, total - total / 2])
            })
            .outputs(&["left", "right"]))
            .task(Task::new("product", |context| {
                Status::ok(integer(context, "left") * integer(context, "right"))
            })
            .output("product"))
            .task(Task::new("check", |_| Status::ok(true)));

        let context = pipeline
            .run(Context::from([("total".to_owned(), ArgumentValue::Integer(7))]))
            .unwrap();

        assert_eq!(context.get("left"), Some(&ArgumentValue::Integer(3)));
        assert_eq!(context.get("right"), Some(&ArgumentValue::Integer(4)));
        assert_eq!(context.get("product"), Some(&ArgumentValue::Integer(12)));
        assert_eq!(context.len(), 4);
    }

    #[test]
    fn error_status_stops_the_pipeline() {
        let pipeline = Pipeline::new()
            .task(Task::new("load", |_| Status::error("missing frame")).output("frame"))
            .task(Task::new("never", |_| Status::ok(1_i64)).output("never"));

        assert_eq!(
            pipeline.run(Context::new()),
            Err(PipelineError::Failed {
                task: "load".to_owned(),
                message: "missing frame".to_owned()
            })
        );
    }

    #[test]
    fn output_count_must_match() {
        let pipeline = Pipeline::new()
            .task(Task::new("pair", |_| Status::ok(vec![1_i64, 2, 3])).outputs(&["a", "b"]));

        assert!(matches!(
            pipeline.run(Context::new()),
            Err(PipelineError::OutputMismatch {
                expected: 2,
                found: 3,
                ..
            })
        ));
    }
}

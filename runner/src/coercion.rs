use crate::{
    arguments::{Argument, ArgumentType, ArgumentValue},
    collector,
};
use serde_yaml::Value;
use std::{fmt, path::PathBuf};
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("argument {argument} cannot take {value} as {expected}: {reason}")]
pub struct CoercionError {
    pub argument: String,
    /// the offending raw value as written in the job definition
    pub value: String,
    pub expected: ArgumentType,
    pub reason: String,
}

impl CoercionError {
    fn new(argument: &Argument, value: &Value, reason: impl Into<String>) -> Self {
        Self {
            argument: argument.key.clone(),
            value: render(value),
            expected: argument.kind,
            reason: reason.into(),
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(value) => value.clone(),
        value => serde_yaml::to_string(value)
            .map(|rendered| rendered.trim_end().to_owned())
            .unwrap_or_else(|_| format!("{value:?}")),
    }
}

/// Build a single typed value from a raw value
pub fn construct(kind: ArgumentType, raw: &Value) -> Result<ArgumentValue, &'static str> {
    match (kind, raw) {
        (_, Value::Tagged(tagged)) => construct(kind, &tagged.value),
        (_, Value::Null) => Err("no value given"),
        (_, Value::Sequence(_)) => Err("expected a single value, found a list"),
        (_, Value::Mapping(_)) => Err("expected a single value, found a mapping"),

        (ArgumentType::String, Value::String(value)) => Ok(ArgumentValue::String(value.clone())),
        (ArgumentType::String, Value::Number(value)) => {
            Ok(ArgumentValue::String(value.to_string()))
        }
        (ArgumentType::String, Value::Bool(value)) => Ok(ArgumentValue::String(value.to_string())),

        (ArgumentType::Integer, Value::Number(value)) => value
            .as_i64()
            .or_else(|| {
                value
                    .as_f64()
                    .filter(|float| float.fract() == 0.0 && float.abs() < i64::MAX as f64)
                    .map(|float| float as i64)
            })
            .map(ArgumentValue::Integer)
            .ok_or("not an integer"),
        (ArgumentType::Integer, Value::String(value)) => value
            .trim()
            .parse()
            .map(ArgumentValue::Integer)
            .map_err(|_| "not an integer"),

        (ArgumentType::Float, Value::Number(value)) => value
            .as_f64()
            .map(ArgumentValue::Float)
            .ok_or("not a number"),
        (ArgumentType::Float, Value::String(value)) => value
            .trim()
            .parse()
            .map(ArgumentValue::Float)
            .map_err(|_| "not a number"),

        (ArgumentType::Boolean, Value::Bool(value)) => Ok(ArgumentValue::Boolean(*value)),
        (ArgumentType::Boolean, Value::String(value)) => {
            match value.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(ArgumentValue::Boolean(true)),
                "false" | "no" | "off" | "0" => Ok(ArgumentValue::Boolean(false)),
                _ => Err("not a boolean"),
            }
        }

        (ArgumentType::Path, Value::String(value)) => Ok(ArgumentValue::Path(PathBuf::from(value))),

        _ => Err("unsupported value"),
    }
}

/// One pluggable conversion strategy of the chain
pub trait Coercer: Send + Sync {
    fn name(&self) -> &'static str;

    /// lower runs first
    fn priority(&self) -> u32;

    fn can_coerce(&self, argument: &Argument) -> bool;

    fn coerce(&self, argument: &Argument, value: &Value) -> Result<ArgumentValue, CoercionError>;
}

/// Expands path patterns into every matching file
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobCoercer;

impl Coercer for GlobCoercer {
    fn name(&self) -> &'static str {
        "glob"
    }

    fn priority(&self) -> u32 {
        0
    }

    fn can_coerce(&self, argument: &Argument) -> bool {
        argument.allow_glob && argument.kind == ArgumentType::Path
    }

    fn coerce(&self, argument: &Argument, value: &Value) -> Result<ArgumentValue, CoercionError> {
        let patterns = match value {
            Value::Sequence(values) => values.as_slice(),
            value => std::slice::from_ref(value),
        };

        let mut paths = Vec::new();
        for pattern in patterns {
            let text = pattern
                .as_str()
                .ok_or_else(|| {
                    CoercionError::new(argument, pattern, "a pattern must be a string")
                })?;
            let matched = collector::expand(text)
                .map_err(|error| CoercionError::new(argument, pattern, error.to_string()))?;

            trace!("{text} matched {} paths", matched.len());
            paths.extend(matched.into_iter().map(ArgumentValue::Path));
        }

        Ok(ArgumentValue::List(paths))
    }
}

/// Element-wise conversion for multi-value arguments
#[derive(Debug, Clone, Copy, Default)]
pub struct ListCoercer;

impl Coercer for ListCoercer {
    fn name(&self) -> &'static str {
        "list"
    }

    fn priority(&self) -> u32 {
        1
    }

    fn can_coerce(&self, argument: &Argument) -> bool {
        argument.cardinality.is_list()
    }

    fn coerce(&self, argument: &Argument, value: &Value) -> Result<ArgumentValue, CoercionError> {
        let values = match value {
            Value::Sequence(values) => values.as_slice(),
            value => std::slice::from_ref(value),
        };

        values
            .iter()
            .map(|element| {
                construct(argument.kind, element)
                    .map_err(|reason| CoercionError::new(argument, element, reason))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(ArgumentValue::List)
    }
}

/// Fallback that builds the semantic type straight from the raw value
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericCoercer;

impl Coercer for GenericCoercer {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn priority(&self) -> u32 {
        u32::MAX
    }

    fn can_coerce(&self, _argument: &Argument) -> bool {
        true
    }

    fn coerce(&self, argument: &Argument, value: &Value) -> Result<ArgumentValue, CoercionError> {
        construct(argument.kind, value)
            .map_err(|reason| CoercionError::new(argument, value, reason))
    }
}

/// Ordered set of coercers, the first applicable one by ascending priority wins
pub struct CoercionChain {
    coercers: Vec<Box<dyn Coercer>>,
}

impl fmt::Debug for CoercionChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.coercers.iter().map(|coercer| (coercer.name(), coercer.priority())))
            .finish()
    }
}

impl Default for CoercionChain {
    fn default() -> Self {
        let mut chain = Self::empty();
        chain.register(Box::new(GlobCoercer));
        chain.register(Box::new(ListCoercer));
        chain.register(Box::new(GenericCoercer));
        chain
    }
}

impl CoercionChain {
    pub fn empty() -> Self {
        Self {
            coercers: Vec::new(),
        }
    }

    /// coercers with equal priority keep their registration order
    pub fn register(&mut self, coercer: Box<dyn Coercer>) -> &mut Self {
        self.coercers.push(coercer);
        self.coercers.sort_by_key(|coercer| coercer.priority());
        self
    }

    pub fn select(&self, argument: &Argument) -> Option<&dyn Coercer> {
        self.coercers
            .iter()
            .find(|coercer| coercer.can_coerce(argument))
            .map(Box::as_ref)
    }

    pub fn coerce(
        &self,
        argument: &Argument,
        value: &Value,
    ) -> Result<ArgumentValue, CoercionError> {
        match self.select(argument) {
            Some(coercer) => {
                trace!(argument = %argument.key, coercer = coercer.name(), "Coercing argument");
                coercer.coerce(argument, value)
            }
            None => Err(CoercionError::new(argument, value, "no coercer accepts this argument")),
        }
    }
}

use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("expected {expected}, found {found}")]
pub struct ValueError {
    pub expected: &'static str,
    pub found: ArgumentValue,
}

/// How many values an argument accepts
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Cardinality {
    Scalar,
    /// a list that has to be supplied as a list
    ListRequired,
    /// a list where a single scalar is accepted and wrapped
    ListOptional,
}

impl Cardinality {
    pub fn is_list(&self) -> bool {
        !matches!(self, Self::Scalar)
    }
}

/// Semantic type of a single argument element
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArgumentType {
    String,
    Integer,
    Float,
    Boolean,
    Path,
}

impl fmt::Display for ArgumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Path => "path",
        };

        f.write_str(name)
    }
}

/// A typed argument value after coercion
#[derive(Clone, Debug, PartialEq, Default)]
pub enum ArgumentValue {
    #[default]
    Unset,
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Path(PathBuf),
    List(Vec<ArgumentValue>),
}

impl ArgumentValue {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::String(_) => "string",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Boolean(_) => "boolean",
            Self::Path(_) => "path",
            Self::List(_) => "list",
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Self::List(_))
    }

    /// number of values this argument contributes to a broadcast
    pub fn broadcast_len(&self) -> usize {
        match self {
            Self::List(values) => values.len(),
            _ => 1,
        }
    }

    pub fn extract<T: FromArgument>(self) -> Result<T, ValueError> {
        T::from_argument(self)
    }
}

impl fmt::Display for ArgumentValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unset => f.write_str("<unset>"),
            Self::String(value) => write!(f, "{value:?}"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Boolean(value) => write!(f, "{value}"),
            Self::Path(value) => write!(f, "{}", value.display()),
            Self::List(values) => {
                f.write_str("[")?;
                for (index, value) in values.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<&str> for ArgumentValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for ArgumentValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for ArgumentValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for ArgumentValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for ArgumentValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<PathBuf> for ArgumentValue {
    fn from(value: PathBuf) -> Self {
        Self::Path(value)
    }
}

impl<T: Into<ArgumentValue>> From<Vec<T>> for ArgumentValue {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

/// Conversion out of a bound `ArgumentValue` into a member's field type
pub trait FromArgument: Sized {
    fn from_argument(value: ArgumentValue) -> Result<Self, ValueError>;
}

macro_rules! from_argument {
    ($target:ty, $variant:ident, $expected:literal) => {
        impl FromArgument for $target {
            fn from_argument(value: ArgumentValue) -> Result<Self, ValueError> {
                match value {
                    ArgumentValue::$variant(inner) => Ok(inner),
                    found => Err(ValueError {
                        expected: $expected,
                        found,
                    }),
                }
            }
        }
    };
}

from_argument!(String, String, "string");
from_argument!(i64, Integer, "integer");
from_argument!(f64, Float, "float");
from_argument!(bool, Boolean, "boolean");
from_argument!(PathBuf, Path, "path");

impl FromArgument for usize {
    fn from_argument(value: ArgumentValue) -> Result<Self, ValueError> {
        match value {
            ArgumentValue::Integer(inner) if inner >= 0 => Ok(inner as usize),
            found => Err(ValueError {
                expected: "non-negative integer",
                found,
            }),
        }
    }
}

impl<T: FromArgument> FromArgument for Option<T> {
    fn from_argument(value: ArgumentValue) -> Result<Self, ValueError> {
        match value {
            ArgumentValue::Unset => Ok(None),
            value => T::from_argument(value).map(Some),
        }
    }
}

impl<T: FromArgument> FromArgument for Vec<T> {
    fn from_argument(value: ArgumentValue) -> Result<Self, ValueError> {
        match value {
            ArgumentValue::List(values) => values.into_iter().map(T::from_argument).collect(),
            // an unset optional list binds as empty
            ArgumentValue::Unset => Ok(Vec::new()),
            found => Err(ValueError {
                expected: "list",
                found,
            }),
        }
    }
}

/// Descriptor for one externally settable job argument.
///
/// Created once when a job type is declared and never mutated afterwards. The
/// `name` is the member the value is assigned to, `key` is what a job
/// definition uses to refer to it.
#[derive(Clone, Debug, PartialEq)]
pub struct Argument {
    pub name: String,
    pub key: String,
    pub cardinality: Cardinality,
    pub kind: ArgumentType,
    pub required: bool,
    pub default: ArgumentValue,
    /// expand path patterns into every matching file
    pub allow_glob: bool,
    pub help: Option<String>,
}

impl Argument {
    pub fn scalar(name: &str, kind: ArgumentType) -> Self {
        Self {
            name: name.to_owned(),
            key: name.to_owned(),
            cardinality: Cardinality::Scalar,
            kind,
            required: false,
            default: ArgumentValue::Unset,
            allow_glob: false,
            help: None,
        }
    }

    /// list arguments are optional (a scalar gets wrapped) until marked required
    pub fn list(name: &str, kind: ArgumentType) -> Self {
        Self {
            cardinality: Cardinality::ListOptional,
            default: ArgumentValue::List(Vec::new()),
            ..Self::scalar(name, kind)
        }
    }

    pub fn key(mut self, key: &str) -> Self {
        self.key = key.to_owned();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        if self.cardinality == Cardinality::ListOptional {
            self.cardinality = Cardinality::ListRequired;
        }
        self
    }

    pub fn cardinality(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    pub fn default_value(mut self, value: impl Into<ArgumentValue>) -> Self {
        self.default = value.into();
        self
    }

    pub fn allow_glob(mut self) -> Self {
        self.allow_glob = true;
        self
    }

    pub fn help(mut self, help: &str) -> Self {
        self.help = Some(help.to_owned());
        self
    }
}

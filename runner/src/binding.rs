//! Populating a job's declared members from a [`JobDefinition`].
//!
//! Binding enumerates every public member visible on the job's type, resolves
//! its descriptor through the registry and coerces the raw value (or applies
//! the default). All values are computed before the first assignment, so a
//! failing argument leaves the target untouched.

use crate::{
    arguments::{ArgumentValue, Cardinality, ValueError},
    coercion::{CoercionChain, CoercionError},
    definition::JobDefinition,
    registry::MetadataRegistry,
};
use serde_yaml::Value;
use std::{borrow::Cow, collections::BTreeSet, sync::Arc};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BindError {
    #[error("Argument {argument} is required but not provided")]
    MissingArgument { argument: String },
    #[error("Argument {argument} is a list but not provided as a list")]
    InvalidShape { argument: String },
    #[error(transparent)]
    Coercion(#[from] CoercionError),
    #[error("Argument {argument} is not known to job type {job_type}")]
    UnknownArgument { argument: String, job_type: String },
    #[error("Type {0} was never declared")]
    UnknownType(String),
    #[error("Member {member} rejected its value: {source}")]
    Member { member: String, source: ValueError },
}

/// A job (or part of one) whose members can be assigned by name
pub trait Bindable {
    /// registry name of the concrete type
    fn type_name(&self) -> &str;

    fn assign(&mut self, member: &str, value: ArgumentValue) -> Result<(), BindError>;
}

/// Member values in assignment order
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BoundArguments {
    values: Vec<(String, ArgumentValue)>,
}

impl BoundArguments {
    pub fn get(&self, member: &str) -> Option<&ArgumentValue> {
        self.values
            .iter()
            .find(|(known, _)| known == member)
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgumentValue)> {
        self.values
            .iter()
            .map(|(member, value)| (member.as_str(), value))
    }
}

impl IntoIterator for BoundArguments {
    type Item = (String, ArgumentValue);
    type IntoIter = std::vec::IntoIter<(String, ArgumentValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

#[derive(Clone, Debug)]
pub struct Binder {
    registry: Arc<MetadataRegistry>,
    coercers: Arc<CoercionChain>,
}

impl Binder {
    pub fn new(registry: Arc<MetadataRegistry>, coercers: Arc<CoercionChain>) -> Self {
        Self { registry, coercers }
    }

    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    /// compute every member value of `type_name` without assigning anything
    pub fn resolve_arguments(
        &self,
        type_name: &str,
        definition: &JobDefinition,
    ) -> Result<BoundArguments, BindError> {
        if !self.registry.contains_type(type_name) {
            return Err(BindError::UnknownType(type_name.to_owned()));
        }

        let mut bound = BoundArguments::default();
        let mut recognized = BTreeSet::new();

        for member in self.registry.members(type_name) {
            let Some(argument) = self.registry.resolve(type_name, member) else {
                trace!("{type_name}.{member} has no argument");
                continue;
            };
            recognized.insert(argument.key.as_str());

            let value = match definition.parameters.get(&argument.key) {
                None if argument.required => {
                    return Err(BindError::MissingArgument {
                        argument: argument.key.clone(),
                    })
                }
                None => argument.default.clone(),
                Some(raw) => {
                    let raw = match (argument.cardinality, raw) {
                        (_, Value::Sequence(_)) | (Cardinality::Scalar, _) => Cow::Borrowed(raw),
                        (Cardinality::ListRequired, _) => {
                            return Err(BindError::InvalidShape {
                                argument: argument.key.clone(),
                            })
                        }
                        (Cardinality::ListOptional, scalar) => {
                            Cow::Owned(Value::Sequence(vec![scalar.clone()]))
                        }
                    };

                    self.coercers.coerce(argument, &raw)?
                }
            };

            bound.values.push((member.to_owned(), value));
        }

        if let Some(unknown) = definition
            .parameters
            .keys()
            .find(|key| !recognized.contains(key.as_str()))
        {
            return Err(BindError::UnknownArgument {
                argument: unknown.clone(),
                job_type: type_name.to_owned(),
            });
        }

        Ok(bound)
    }

    /// bind `definition` into `target`, failing fast on the first bad argument
    pub fn bind(
        &self,
        definition: &JobDefinition,
        target: &mut dyn Bindable,
    ) -> Result<(), BindError> {
        let type_name = target.type_name().to_owned();
        let bound = self.resolve_arguments(&type_name, definition)?;

        debug!(
            job = %definition.display_name,
            "Binding {} arguments into {type_name}",
            bound.len()
        );

        for (member, value) in bound {
            target.assign(&member, value)?;
        }

        Ok(())
    }
}

#[cfg(test)]
#[path = "binding_test.rs"]
mod binding_test;

//! Process-wide side table of argument descriptors and job metadata.
//!
//! Declarations are collected in a [`RegistryBuilder`] during program startup
//! and frozen into a [`MetadataRegistry`] before any job is bound. The frozen
//! registry is read-only, so it can be shared between threads without locks.

use crate::arguments::Argument;
use itertools::Itertools;
use once_cell::sync::OnceCell;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use thiserror::Error;
use tracing::debug;

static REGISTRY: OnceCell<Arc<MetadataRegistry>> = OnceCell::new();

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("type {owner} names unknown base {base}")]
    UnknownBase { owner: String, base: String },
    #[error("type {0} inherits from itself")]
    CyclicHierarchy(String),
    #[error("no consistent resolution order exists for {0}")]
    InconsistentHierarchy(String),
    #[error("the process-wide registry was already installed")]
    AlreadyInstalled,
}

/// Stable identity of a declared member: (declaring type, member name)
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identity {
    pub owner: String,
    pub member: String,
}

impl Identity {
    pub fn new(owner: &str, member: &str) -> Self {
        Self {
            owner: owner.to_owned(),
            member: member.to_owned(),
        }
    }
}

/// A type together with its direct bases (in declaration order) and members
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeDeclaration {
    pub name: String,
    pub bases: Vec<String>,
    pub members: Vec<String>,
}

impl TypeDeclaration {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            bases: Vec::new(),
            members: Vec::new(),
        }
    }

    pub fn base(mut self, base: &str) -> Self {
        self.bases.push(base.to_owned());
        self
    }

    pub fn member(mut self, member: &str) -> Self {
        if !self.members.iter().any(|known| known == member) {
            self.members.push(member.to_owned());
        }
        self
    }
}

/// Accelerator request declared by a job type
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub enum GpuRequirement {
    #[default]
    None,
    /// an explicit share of accelerator units
    Share(f64),
    /// a memory requirement in MB, converted into a share at job construction
    VramMb(u64),
}

/// Metadata attached to a job type when it is declared
#[derive(Clone, Debug, PartialEq)]
pub struct JobMetadata {
    pub name: String,
    pub parallel: bool,
    pub num_cpus: Option<f64>,
    pub gpus: GpuRequirement,
    pub bases: Vec<String>,
    /// parameters in declaration order, this order is the tuple order
    pub parameters: Vec<(String, Argument)>,
}

impl JobMetadata {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            parallel: false,
            num_cpus: None,
            gpus: GpuRequirement::None,
            bases: Vec::new(),
            parameters: Vec::new(),
        }
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn num_cpus(mut self, num_cpus: f64) -> Self {
        self.num_cpus = Some(num_cpus);
        self
    }

    pub fn num_gpus(mut self, num_gpus: f64) -> Self {
        self.gpus = GpuRequirement::Share(num_gpus);
        self
    }

    pub fn vram_mb(mut self, vram_mb: u64) -> Self {
        // an explicit share always wins over a memory requirement
        if !matches!(self.gpus, GpuRequirement::Share(_)) {
            self.gpus = GpuRequirement::VramMb(vram_mb);
        }
        self
    }

    pub fn base(mut self, base: &str) -> Self {
        self.bases.push(base.to_owned());
        self
    }

    pub fn parameter(mut self, member: &str, argument: Argument) -> Self {
        self.parameters.retain(|(known, _)| known != member);
        self.parameters.push((member.to_owned(), argument));
        self
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.parameters.iter().map(|(member, _)| member.as_str())
    }
}

/// Mutable collection of declarations, only used during startup
#[derive(Clone, Debug, Default)]
pub struct RegistryBuilder {
    types: BTreeMap<String, TypeDeclaration>,
    arguments: BTreeMap<String, BTreeMap<String, Argument>>,
    jobs: BTreeMap<String, Arc<JobMetadata>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// declaring a type twice replaces the earlier declaration
    pub fn declare_type(&mut self, declaration: TypeDeclaration) -> &mut Self {
        self.types.insert(declaration.name.clone(), declaration);
        self
    }

    /// store a descriptor, a second registration for the same identity overwrites
    pub fn register(&mut self, identity: Identity, argument: Argument) -> &mut Self {
        if let Some(previous) = self
            .arguments
            .entry(identity.owner.clone())
            .or_default()
            .insert(identity.member.clone(), argument)
        {
            debug!(
                owner = %identity.owner,
                member = %identity.member,
                key = %previous.key,
                "Overwrote argument registration"
            );
        }
        self
    }

    /// declare a job type: its type, its parameters as arguments and its metadata
    pub fn declare_job(&mut self, metadata: JobMetadata) -> Arc<JobMetadata> {
        let declaration = metadata
            .bases
            .iter()
            .fold(TypeDeclaration::new(&metadata.name), |declaration, base| {
                declaration.base(base)
            });
        let declaration = metadata
            .parameter_names()
            .fold(declaration, |declaration, member| declaration.member(member));

        self.declare_type(declaration);
        for (member, argument) in metadata.parameters.iter() {
            self.register(Identity::new(&metadata.name, member), argument.clone());
        }

        let metadata = Arc::new(metadata);
        self.jobs.insert(metadata.name.clone(), metadata.clone());

        metadata
    }

    pub fn job(&self, name: &str) -> Option<&Arc<JobMetadata>> {
        self.jobs.get(name)
    }

    /// freeze the declarations and precompute every resolution order
    pub fn build(mut self) -> Result<MetadataRegistry, RegistryError> {
        // descriptors registered for undeclared types or members still have to be enumerable
        for (owner, members) in self.arguments.iter() {
            let declaration = self
                .types
                .entry(owner.clone())
                .or_insert_with(|| TypeDeclaration::new(owner));
            for member in members.keys() {
                if !declaration.members.contains(member) {
                    declaration.members.push(member.clone());
                }
            }
        }

        for declaration in self.types.values() {
            if let Some(base) = declaration
                .bases
                .iter()
                .find(|base| !self.types.contains_key(*base))
            {
                return Err(RegistryError::UnknownBase {
                    owner: declaration.name.clone(),
                    base: base.clone(),
                });
            }
        }

        let mut orders = BTreeMap::new();
        for name in self.types.keys() {
            linearize(name, &self.types, &mut orders, &mut BTreeSet::new())?;
        }

        Ok(MetadataRegistry {
            types: self.types,
            arguments: self.arguments,
            jobs: self.jobs,
            orders,
        })
    }
}

/// C3 linearization of `name`, memoized in `orders`
fn linearize(
    name: &str,
    types: &BTreeMap<String, TypeDeclaration>,
    orders: &mut BTreeMap<String, Vec<String>>,
    visiting: &mut BTreeSet<String>,
) -> Result<Vec<String>, RegistryError> {
    if let Some(order) = orders.get(name) {
        return Ok(order.clone());
    }
    if !visiting.insert(name.to_owned()) {
        return Err(RegistryError::CyclicHierarchy(name.to_owned()));
    }

    let bases = types
        .get(name)
        .map(|declaration| declaration.bases.clone())
        .unwrap_or_default();

    let mut sequences = Vec::with_capacity(bases.len() + 1);
    for base in bases.iter() {
        sequences.push(linearize(base, types, orders, visiting)?);
    }
    sequences.push(bases);

    let mut order = vec![name.to_owned()];
    loop {
        sequences.retain(|sequence| !sequence.is_empty());
        if sequences.is_empty() {
            break;
        }

        let head = sequences
            .iter()
            .map(|sequence| &sequence[0])
            .find(|head| {
                !sequences
                    .iter()
                    .any(|sequence| sequence[1..].contains(*head))
            })
            .cloned()
            .ok_or_else(|| RegistryError::InconsistentHierarchy(name.to_owned()))?;

        for sequence in sequences.iter_mut() {
            if sequence[0] == head {
                sequence.remove(0);
            }
        }
        order.push(head);
    }

    visiting.remove(name);
    orders.insert(name.to_owned(), order.clone());

    Ok(order)
}

/// Frozen, read-only registry
#[derive(Clone, Debug)]
pub struct MetadataRegistry {
    types: BTreeMap<String, TypeDeclaration>,
    arguments: BTreeMap<String, BTreeMap<String, Argument>>,
    jobs: BTreeMap<String, Arc<JobMetadata>>,
    orders: BTreeMap<String, Vec<String>>,
}

impl MetadataRegistry {
    /// descriptor declared directly on `owner`, ignoring ancestors
    pub fn declared(&self, owner: &str, member: &str) -> Option<&Argument> {
        self.arguments
            .get(owner)
            .and_then(|members| members.get(member))
    }

    /// Find the descriptor for `member` as seen from `owner`.
    ///
    /// The type's own registrations win. Otherwise every ancestor is asked in
    /// resolution order, each one resolving recursively through its own
    /// ancestors, and the first hit is returned.
    pub fn resolve(&self, owner: &str, member: &str) -> Option<&Argument> {
        if let Some(argument) = self.declared(owner, member) {
            return Some(argument);
        }

        self.ancestors(owner)
            .iter()
            .find_map(|ancestor| self.resolve(ancestor, member))
    }

    /// resolution order of `owner`, starting with `owner` itself
    pub fn resolution_order(&self, owner: &str) -> &[String] {
        self.orders.get(owner).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn ancestors(&self, owner: &str) -> &[String] {
        self.resolution_order(owner).get(1..).unwrap_or(&[])
    }

    pub fn contains_type(&self, owner: &str) -> bool {
        self.types.contains_key(owner)
    }

    /// every public member visible on `owner`, own members first
    pub fn members(&self, owner: &str) -> Vec<&str> {
        self.resolution_order(owner)
            .iter()
            .filter_map(|name| self.types.get(name))
            .flat_map(|declaration| declaration.members.iter())
            .map(String::as_str)
            .filter(|member| !member.starts_with('_'))
            .unique()
            .collect()
    }

    pub fn job(&self, name: &str) -> Option<&Arc<JobMetadata>> {
        self.jobs.get(name)
    }

    pub fn job_names(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }
}

/// install the registry for the whole process, this can only happen once
pub fn install(registry: MetadataRegistry) -> Result<Arc<MetadataRegistry>, RegistryError> {
    REGISTRY
        .try_insert(Arc::new(registry))
        .map(Arc::clone)
        .map_err(|_| RegistryError::AlreadyInstalled)
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod registry_test;

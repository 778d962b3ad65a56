//! Pluggable computations that fill property slots on demand.
//!
//! Factories are registered per property type in a [`TaskFactoryRegistry`]. Once
//! configured, the registry is frozen behind a [`TaskProvider`], which hands out
//! one task instance per [`PropertyId`] and remembers it for the rest of the run.

use std::any::TypeId;
use std::fmt::{self, Debug};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::group::SourceGroup;
use crate::property::{Property, PropertyId, PropertyResult};
use crate::source::Source;

/// Computes properties of an individual source.
pub trait SourceTask: Send + Sync {
    fn compute_properties(&self, source: &mut Source) -> PropertyResult<()>;
}

/// Computes properties that need the whole group, e.g. a joint model fit.
///
/// The task may write into the group's store, into members' stores, or both.
pub trait GroupTask: Send + Sync {
    fn compute_properties(&self, group: &mut SourceGroup) -> PropertyResult<()>;
}

#[derive(Clone)]
pub enum Task {
    Source(Arc<dyn SourceTask>),
    Group(Arc<dyn GroupTask>),
}

impl Task {
    pub fn source<T: SourceTask + 'static>(task: T) -> Self {
        Task::Source(Arc::new(task))
    }

    pub fn group<T: GroupTask + 'static>(task: T) -> Self {
        Task::Group(Arc::new(task))
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Task::Group(_))
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Source(_) => write!(f, "Task::Source(*)"),
            Task::Group(_) => write!(f, "Task::Group(*)"),
        }
    }
}

/// Type tag of a property, without the instance index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyType {
    pub type_id: TypeId,
    pub type_name: &'static str,
}

impl PropertyType {
    pub fn of<T: Property>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }
}

impl From<&PropertyId> for PropertyType {
    fn from(id: &PropertyId) -> Self {
        Self {
            type_id: id.type_id(),
            type_name: id.type_name(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("A task factory producing {property} is already registered")]
    DuplicateFactory { property: &'static str },
    #[error("Task factory configuration failed: {0}")]
    Configuration(String),
}

pub type TaskResult<T> = Result<T, TaskError>;

pub trait TaskFactory: Send + Sync {
    /// Property types this factory can build tasks for.
    fn produces(&self) -> Vec<PropertyType>;

    /// Reads factory settings; called once, before the registry is frozen.
    fn configure(&mut self, _config: &Config) -> TaskResult<()> {
        Ok(())
    }

    /// Returns `None` when this particular instance index is not supported.
    fn create_task(&self, id: &PropertyId) -> Option<Task>;
}

#[derive(Default)]
pub struct TaskFactoryRegistry {
    factories: Vec<Box<dyn TaskFactory>>,
    by_type: HashMap<TypeId, usize>,
}

impl TaskFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` for every type it produces.
    ///
    /// Nothing is registered if any of those types already has a factory.
    pub fn register_factory<F: TaskFactory + 'static>(&mut self, factory: F) -> TaskResult<()> {
        let produced = factory.produces();
        if let Some(duplicate) = produced
            .iter()
            .find(|property_type| self.by_type.contains_key(&property_type.type_id))
        {
            return Err(TaskError::DuplicateFactory {
                property: duplicate.type_name,
            });
        }

        let factory_idx = self.factories.len();
        self.factories.push(Box::new(factory));
        for property_type in produced {
            self.by_type.insert(property_type.type_id, factory_idx);
        }

        Ok(())
    }

    pub fn configure(&mut self, config: &Config) -> TaskResult<()> {
        for factory in self.factories.iter_mut() {
            factory.configure(config)?;
        }
        Ok(())
    }

    pub fn factory_for(&self, id: &PropertyId) -> Option<&dyn TaskFactory> {
        let factory_idx = *self.by_type.get(&id.type_id())?;
        Some(self.factories[factory_idx].as_ref())
    }

    pub fn produces(&self, property_type: &PropertyType) -> bool {
        self.by_type.contains_key(&property_type.type_id)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl Debug for TaskFactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFactoryRegistry")
            .field("factories", &self.factories.len())
            .field("property_types", &self.by_type.len())
            .finish()
    }
}

/// Resolves property ids to tasks, creating each task at most once.
#[derive(Debug)]
pub struct TaskProvider {
    registry: TaskFactoryRegistry,
    tasks: Mutex<HashMap<PropertyId, Option<Task>>>,
}

impl TaskProvider {
    pub fn new(registry: TaskFactoryRegistry) -> Self {
        Self {
            registry,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn empty() -> Self {
        Self::new(TaskFactoryRegistry::default())
    }

    pub fn registry(&self) -> &TaskFactoryRegistry {
        &self.registry
    }

    /// Task for `id`, asking its factory only the first time.
    ///
    /// The factory runs without the cache lock held, so it may consult the
    /// provider itself.
    pub fn task(&self, id: &PropertyId) -> Option<Task> {
        if let Some(cached) = self.tasks.lock().get(id) {
            return cached.clone();
        }

        let task = self
            .registry
            .factory_for(id)
            .and_then(|factory| factory.create_task(id));
        debug!(
            property = %id,
            found = task.is_some(),
            group = task.as_ref().is_some_and(Task::is_group),
            "Resolved task"
        );

        self.tasks.lock().entry(*id).or_insert(task).clone()
    }

    pub fn source_task(&self, id: &PropertyId) -> Option<Arc<dyn SourceTask>> {
        match self.task(id)? {
            Task::Source(task) => Some(task),
            Task::Group(_) => None,
        }
    }

    pub fn group_task(&self, id: &PropertyId) -> Option<Arc<dyn GroupTask>> {
        match self.task(id)? {
            Task::Group(task) => Some(task),
            Task::Source(_) => None,
        }
    }
}

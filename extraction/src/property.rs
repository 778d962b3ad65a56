//! Typed property slots and the store that owns their values.
//!
//! A property is any `'static + Send + Sync + Debug` value. It is addressed by a
//! [`PropertyId`]: the Rust type of the value plus an instance index, so the same
//! type can be attached several times to one object (one per aperture, per
//! measurement frame, ...).

use std::any::{Any, TypeId};
use std::cmp::Ordering;
use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};

use hashbrown::HashMap;
use thiserror::Error;

use crate::resource_cache::ResourceError;

pub trait Property: Any + Send + Sync + Debug {
    fn as_any(&self) -> &dyn Any;
    fn type_name(&self) -> &'static str;
}

impl<T> Property for T
where
    T: Any + Send + Sync + Debug,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Key of one property slot.
///
/// The type name is carried only for diagnostics; equality, hashing and ordering
/// use the type tag and the index.
#[derive(Clone, Copy)]
pub struct PropertyId {
    type_id: TypeId,
    type_name: &'static str,
    index: u32,
}

impl PropertyId {
    pub fn of<T: Property>() -> Self {
        Self::indexed::<T>(0)
    }

    pub fn indexed<T: Property>(index: u32) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            index,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is<T: Property>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }
}

impl PartialEq for PropertyId {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.index == other.index
    }
}

impl Eq for PropertyId {}

impl Hash for PropertyId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        self.index.hash(state);
    }
}

impl PartialOrd for PropertyId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PropertyId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.type_id
            .cmp(&other.type_id)
            .then(self.index.cmp(&other.index))
    }
}

impl Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.type_name.rsplit("::").next().unwrap_or(self.type_name);
        write!(f, "{}#{}", short, self.index)
    }
}

impl Debug for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PropertyId({})", self)
    }
}

#[derive(Debug, Error)]
pub enum PropertyError {
    #[error("Property {property} not found and no task can produce it")]
    NotFound { property: String },
    #[error("Property {property} holds a {actual}, not the requested type")]
    TypeMismatch {
        property: String,
        actual: &'static str,
    },
    #[error("Task computing {property} failed: {message}")]
    Task { property: String, message: String },
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

impl PropertyError {
    pub fn not_found(id: &PropertyId) -> Self {
        PropertyError::NotFound {
            property: id.to_string(),
        }
    }

    pub fn task(id: &PropertyId, message: impl Into<String>) -> Self {
        PropertyError::Task {
            property: id.to_string(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PropertyError::NotFound { .. })
    }
}

pub type PropertyResult<T> = Result<T, PropertyError>;

/// Owns the property values of one object.
#[derive(Debug, Default)]
pub struct PropertyStore {
    values: HashMap<PropertyId, Box<dyn Property>>,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self, id: &PropertyId) -> bool {
        self.values.contains_key(id)
    }

    pub fn get_dyn(&self, id: &PropertyId) -> Option<&dyn Property> {
        self.values.get(id).map(|value| value.as_ref())
    }

    pub fn get<T: Property>(&self, id: &PropertyId) -> PropertyResult<&T> {
        let value = self
            .get_dyn(id)
            .ok_or_else(|| PropertyError::not_found(id))?;
        downcast(id, value)
    }

    /// Replaces any previous value wholesale.
    pub fn set_dyn(&mut self, id: PropertyId, value: Box<dyn Property>) {
        debug_assert_eq!(
            value.as_ref().as_any().type_id(),
            id.type_id(),
            "value type does not match the slot {id}"
        );
        self.values.insert(id, value);
    }

    pub fn set<T: Property>(&mut self, index: u32, value: T) {
        self.set_dyn(PropertyId::indexed::<T>(index), Box::new(value));
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

pub(crate) fn downcast<'a, T: Property>(
    id: &PropertyId,
    value: &'a dyn Property,
) -> PropertyResult<&'a T> {
    value
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| PropertyError::TypeMismatch {
            property: id.to_string(),
            actual: value.type_name(),
        })
}

/// Anything that carries properties and can compute missing ones on demand.
///
/// The methods are object safe; typed access lives in [`PropertyHolderExt`].
pub trait PropertyHolder {
    /// Returns the cached value or computes it through the task graph.
    fn property_dyn(&mut self, id: &PropertyId) -> PropertyResult<&dyn Property>;

    fn set_property_dyn(&mut self, id: PropertyId, value: Box<dyn Property>);

    /// Reports only what is already cached; never runs a task.
    fn is_property_set(&self, id: &PropertyId) -> bool;
}

pub trait PropertyHolderExt: PropertyHolder {
    fn get_property<T: Property>(&mut self, index: u32) -> PropertyResult<&T> {
        let id = PropertyId::indexed::<T>(index);
        let value = self.property_dyn(&id)?;
        downcast(&id, value)
    }

    fn set_property<T: Property>(&mut self, index: u32, value: T) {
        self.set_property_dyn(PropertyId::indexed::<T>(index), Box::new(value));
    }

    fn has_property<T: Property>(&self, index: u32) -> bool {
        self.is_property_set(&PropertyId::indexed::<T>(index))
    }
}

impl<H: PropertyHolder + ?Sized> PropertyHolderExt for H {}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Flux(f64);

    #[derive(Debug, PartialEq)]
    struct Centroid {
        x: f64,
        y: f64,
    }

    #[test]
    fn ids_compare_by_type_and_index() {
        assert_eq!(PropertyId::of::<Flux>(), PropertyId::indexed::<Flux>(0));
        assert_ne!(PropertyId::of::<Flux>(), PropertyId::indexed::<Flux>(1));
        assert_ne!(PropertyId::of::<Flux>(), PropertyId::of::<Centroid>());
        assert!(PropertyId::of::<Flux>().is::<Flux>());
        assert_eq!(PropertyId::indexed::<Flux>(3).to_string(), "Flux#3");
    }

    #[test]
    fn store_overwrites_wholesale() {
        let mut store = PropertyStore::new();
        assert!(!store.is_set(&PropertyId::of::<Flux>()));

        store.set(0, Flux(1.0));
        store.set(0, Flux(2.0));
        store.set(1, Flux(7.0));

        assert_eq!(store.len(), 2);
        assert_eq!(
            store.get::<Flux>(&PropertyId::of::<Flux>()).unwrap(),
            &Flux(2.0)
        );
        assert_eq!(
            store.get::<Flux>(&PropertyId::indexed::<Flux>(1)).unwrap(),
            &Flux(7.0)
        );
    }

    #[test]
    fn missing_and_mistyped_lookups_fail() {
        let mut store = PropertyStore::new();
        store.set(0, Centroid { x: 1.0, y: 2.0 });

        let err = store.get::<Flux>(&PropertyId::of::<Flux>()).unwrap_err();
        assert!(err.is_not_found());

        let value = store.get_dyn(&PropertyId::of::<Centroid>()).unwrap();
        let err = downcast::<Flux>(&PropertyId::of::<Centroid>(), value).unwrap_err();
        assert!(matches!(err, PropertyError::TypeMismatch { .. }));
    }
}

use std::fmt::{self, Debug};
use std::sync::Arc;

use common::id_type;

use crate::property::{
    Property, PropertyError, PropertyHolder, PropertyId, PropertyResult, PropertyStore,
};
use crate::task::TaskProvider;

id_type!(SourceId);

/// A detected object. Upstream stages attach its raw data as properties; everything
/// else is computed lazily by source tasks and cached here.
pub struct Source {
    id: SourceId,
    store: PropertyStore,
    provider: Arc<TaskProvider>,
}

impl Source {
    pub fn new(provider: Arc<TaskProvider>) -> Self {
        Self {
            id: SourceId::unique(),
            store: PropertyStore::new(),
            provider,
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn provider(&self) -> &Arc<TaskProvider> {
        &self.provider
    }

    pub fn store(&self) -> &PropertyStore {
        &self.store
    }

    /// Makes sure `id` is cached, running the source task if needed.
    ///
    /// `Ok(false)` means no source task exists or it did not produce the value.
    pub(crate) fn resolve(&mut self, id: &PropertyId) -> PropertyResult<bool> {
        if self.store.is_set(id) {
            return Ok(true);
        }

        let Some(task) = self.provider.source_task(id) else {
            return Ok(false);
        };
        task.compute_properties(self)?;

        Ok(self.store.is_set(id))
    }
}

impl PropertyHolder for Source {
    fn property_dyn(&mut self, id: &PropertyId) -> PropertyResult<&dyn Property> {
        if !self.resolve(id)? {
            return Err(PropertyError::not_found(id));
        }
        self.store
            .get_dyn(id)
            .ok_or_else(|| PropertyError::not_found(id))
    }

    fn set_property_dyn(&mut self, id: PropertyId, value: Box<dyn Property>) {
        self.store.set_dyn(id, value);
    }

    fn is_property_set(&self, id: &PropertyId) -> bool {
        self.store.is_set(id)
    }
}

impl Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("id", &self.id)
            .field("properties", &self.store.len())
            .finish()
    }
}

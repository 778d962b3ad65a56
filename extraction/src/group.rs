//! Groups of sources that have to be processed together.
//!
//! A [`SourceGroup`] owns its members. Each [`Member`] wraps the
//! [`Source`] and a member-local store for values that group tasks attach to the
//! member in the context of this particular group. Requests on a member are
//! resolved through [`EntangledSource`], which borrows the group and remembers
//! the member index, so a member can always fall back to the group it belongs to.

use std::fmt::{self, Debug};
use std::sync::Arc;

use common::id_type;

use crate::property::{
    Property, PropertyError, PropertyHolder, PropertyId, PropertyResult, PropertyStore,
};
use crate::source::Source;
use crate::task::TaskProvider;

id_type!(GroupId);

#[derive(Debug)]
pub struct Member {
    source: Source,
    store: PropertyStore,
}

impl Member {
    fn new(source: Source) -> Self {
        Self {
            source,
            store: PropertyStore::new(),
        }
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut Source {
        &mut self.source
    }

    /// Values attached to this member by group tasks.
    pub fn store(&self) -> &PropertyStore {
        &self.store
    }

    pub fn into_source(self) -> Source {
        self.source
    }
}

/// Where a member request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Found {
    Member,
    Group,
    Source,
}

pub struct SourceGroup {
    id: GroupId,
    members: Vec<Member>,
    store: PropertyStore,
    provider: Arc<TaskProvider>,
}

impl SourceGroup {
    pub fn new(provider: Arc<TaskProvider>) -> Self {
        Self {
            id: GroupId::unique(),
            members: Vec::new(),
            store: PropertyStore::new(),
            provider,
        }
    }

    /// Opens a singleton group sharing the source's task provider.
    pub fn with_source(source: Source) -> Self {
        let mut group = Self::new(source.provider().clone());
        group.members.push(Member::new(source));
        group
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn provider(&self) -> &Arc<TaskProvider> {
        &self.provider
    }

    pub fn store(&self) -> &PropertyStore {
        &self.store
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn sources(&self) -> impl Iterator<Item = &Source> {
        self.members.iter().map(Member::source)
    }

    pub fn sources_mut(&mut self) -> impl Iterator<Item = &mut Source> {
        self.members.iter_mut().map(Member::source_mut)
    }

    pub fn add_source(&mut self, source: Source) {
        self.members.push(Member::new(source));
        self.membership_changed();
    }

    /// Moves every member of `other` into this group; `other` is consumed.
    pub fn merge(&mut self, other: SourceGroup) {
        self.members.extend(other.members);
        self.membership_changed();
    }

    pub fn remove_source(&mut self, index: usize) -> Source {
        assert!(index < self.members.len(), "member index out of range");

        let member = self.members.remove(index);
        self.membership_changed();
        member.source
    }

    pub fn into_sources(self) -> Vec<Source> {
        self.members.into_iter().map(Member::into_source).collect()
    }

    /// Delegating view of one member.
    pub fn member(&mut self, index: usize) -> EntangledSource<'_> {
        assert!(index < self.members.len(), "member index out of range");
        EntangledSource { group: self, index }
    }

    /// Resolves `id` for the member at `index`.
    ///
    /// Lookup order: member-local store, group store, the wrapped source (cached or
    /// computed by a source task), then a group task run against the whole group.
    pub fn member_property(
        &mut self,
        index: usize,
        id: &PropertyId,
    ) -> PropertyResult<&dyn Property> {
        assert!(index < self.members.len(), "member index out of range");

        let value = match self.resolve_member(index, id)? {
            Some(Found::Member) => self.members[index].store.get_dyn(id),
            Some(Found::Group) => self.store.get_dyn(id),
            Some(Found::Source) => self.members[index].source.store().get_dyn(id),
            None => None,
        };

        value.ok_or_else(|| PropertyError::not_found(id))
    }

    fn resolve_member(&mut self, index: usize, id: &PropertyId) -> PropertyResult<Option<Found>> {
        if let Some(found) = self.cached_for_member(index, id) {
            return Ok(Some(found));
        }
        if self.members[index].source.resolve(id)? {
            return Ok(Some(Found::Source));
        }

        let Some(task) = self.provider.group_task(id) else {
            return Ok(None);
        };
        task.compute_properties(self)?;

        Ok(self.cached_for_member(index, id))
    }

    fn cached_for_member(&self, index: usize, id: &PropertyId) -> Option<Found> {
        if self.members[index].store.is_set(id) {
            Some(Found::Member)
        } else if self.store.is_set(id) {
            Some(Found::Group)
        } else {
            None
        }
    }

    fn resolve_group(&mut self, id: &PropertyId) -> PropertyResult<bool> {
        if self.store.is_set(id) {
            return Ok(true);
        }

        let Some(task) = self.provider.group_task(id) else {
            return Ok(false);
        };
        task.compute_properties(self)?;

        Ok(self.store.is_set(id))
    }

    // group-scoped results describe the old membership
    fn membership_changed(&mut self) {
        self.store.clear();
        for member in self.members.iter_mut() {
            member.store.clear();
        }
    }
}

impl PropertyHolder for SourceGroup {
    fn property_dyn(&mut self, id: &PropertyId) -> PropertyResult<&dyn Property> {
        if !self.resolve_group(id)? {
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

impl Debug for SourceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceGroup")
            .field("id", &self.id)
            .field("members", &self.members)
            .field("properties", &self.store.len())
            .finish()
    }
}

/// A group member seen together with its group.
///
/// Writes go to the member-local store; reads follow
/// [`SourceGroup::member_property`].
pub struct EntangledSource<'a> {
    group: &'a mut SourceGroup,
    index: usize,
}

impl EntangledSource<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn source(&self) -> &Source {
        &self.group.members[self.index].source
    }

    pub fn source_mut(&mut self) -> &mut Source {
        &mut self.group.members[self.index].source
    }

    pub fn group(&self) -> &SourceGroup {
        self.group
    }
}

impl PropertyHolder for EntangledSource<'_> {
    fn property_dyn(&mut self, id: &PropertyId) -> PropertyResult<&dyn Property> {
        self.group.member_property(self.index, id)
    }

    fn set_property_dyn(&mut self, id: PropertyId, value: Box<dyn Property>) {
        self.group.members[self.index].store.set_dyn(id, value);
    }

    fn is_property_set(&self, id: &PropertyId) -> bool {
        self.group.cached_for_member(self.index, id).is_some()
            || self.group.members[self.index].source.is_property_set(id)
    }
}

impl Debug for EntangledSource<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntangledSource")
            .field("group", &self.group.id)
            .field("index", &self.index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::property::PropertyHolderExt;
    use crate::task::{
        GroupTask, PropertyType, SourceTask, Task, TaskFactory, TaskFactoryRegistry,
    };

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Flux(f64);

    /// Flux fitted jointly over all members.
    #[derive(Debug, PartialEq)]
    struct FittedFlux(f64);

    /// Total flux of the group, group-level only.
    #[derive(Debug, PartialEq)]
    struct GroupFlux(f64);

    #[derive(Debug, PartialEq)]
    struct DoubleFlux(f64);

    struct FitTask {
        runs: Arc<AtomicUsize>,
    }

    impl GroupTask for FitTask {
        fn compute_properties(&self, group: &mut SourceGroup) -> PropertyResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);

            let mut total = 0.0;
            for index in 0..group.len() {
                let flux = group.member(index).get_property::<Flux>(0)?.0;
                total += flux;
            }
            for index in 0..group.len() {
                let flux = group.member(index).get_property::<Flux>(0)?.0;
                group
                    .member(index)
                    .set_property(0, FittedFlux(flux / total));
            }
            group.set_property(0, GroupFlux(total));

            Ok(())
        }
    }

    struct DoubleTask;

    impl SourceTask for DoubleTask {
        fn compute_properties(&self, source: &mut Source) -> PropertyResult<()> {
            let flux = source.get_property::<Flux>(0)?.0;
            source.set_property(0, DoubleFlux(flux * 2.0));
            Ok(())
        }
    }

    struct Factory {
        runs: Arc<AtomicUsize>,
    }

    impl TaskFactory for Factory {
        fn produces(&self) -> Vec<PropertyType> {
            vec![
                PropertyType::of::<FittedFlux>(),
                PropertyType::of::<GroupFlux>(),
                PropertyType::of::<DoubleFlux>(),
            ]
        }

        fn create_task(&self, id: &PropertyId) -> Option<Task> {
            if id.is::<DoubleFlux>() {
                Some(Task::source(DoubleTask))
            } else {
                Some(Task::group(FitTask {
                    runs: self.runs.clone(),
                }))
            }
        }
    }

    fn provider(runs: &Arc<AtomicUsize>) -> Arc<TaskProvider> {
        let mut registry = TaskFactoryRegistry::new();
        registry
            .register_factory(Factory { runs: runs.clone() })
            .unwrap();
        Arc::new(TaskProvider::new(registry))
    }

    fn source(provider: &Arc<TaskProvider>, flux: f64) -> Source {
        let mut source = Source::new(provider.clone());
        source.set_property(0, Flux(flux));
        source
    }

    fn pair(runs: &Arc<AtomicUsize>) -> SourceGroup {
        let provider = provider(runs);
        let mut group = SourceGroup::with_source(source(&provider, 1.0));
        group.add_source(source(&provider, 3.0));
        group
    }

    #[test]
    fn group_task_runs_once_for_all_members() -> anyhow::Result<()> {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut group = pair(&runs);

        assert_eq!(group.member(0).get_property::<FittedFlux>(0)?, &FittedFlux(0.25));
        assert_eq!(group.member(1).get_property::<FittedFlux>(0)?, &FittedFlux(0.75));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // group-level value is visible through every member and the group itself
        assert_eq!(group.member(1).get_property::<GroupFlux>(0)?, &GroupFlux(4.0));
        assert_eq!(group.get_property::<GroupFlux>(0)?, &GroupFlux(4.0));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        Ok(())
    }

    #[test]
    fn source_values_win_over_group_tasks() -> anyhow::Result<()> {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut group = pair(&runs);

        assert_eq!(group.member(1).get_property::<Flux>(0)?, &Flux(3.0));
        assert_eq!(group.member(1).get_property::<DoubleFlux>(0)?, &DoubleFlux(6.0));
        assert!(group.members()[1].source().has_property::<DoubleFlux>(0));
        assert!(group.members()[1].store().is_empty());
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        Ok(())
    }

    #[test]
    fn member_writes_stay_in_group_context() -> anyhow::Result<()> {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut group = pair(&runs);

        group.member(0).set_property(0, FittedFlux(9.0));
        assert!(group.member(0).has_property::<FittedFlux>(0));
        assert!(!group.members()[0].source().has_property::<FittedFlux>(0));

        let source = group.remove_source(0);
        assert!(!source.has_property::<FittedFlux>(0));
        assert_eq!(group.len(), 1);

        Ok(())
    }

    #[test]
    fn membership_changes_clear_group_results() -> anyhow::Result<()> {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut group = pair(&runs);
        let provider = group.provider().clone();

        assert_eq!(group.get_property::<GroupFlux>(0)?, &GroupFlux(4.0));
        group.member(0).get_property::<DoubleFlux>(0)?;

        group.add_source(source(&provider, 4.0));
        assert!(!group.has_property::<GroupFlux>(0));
        assert!(group.members().iter().all(|member| member.store().is_empty()));
        assert!(group.members()[0].source().has_property::<DoubleFlux>(0));

        assert_eq!(group.get_property::<GroupFlux>(0)?, &GroupFlux(8.0));
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        let other = SourceGroup::with_source(source(&provider, 2.0));
        group.merge(other);
        assert_eq!(group.len(), 4);
        assert_eq!(group.get_property::<GroupFlux>(0)?, &GroupFlux(10.0));
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        Ok(())
    }

    #[test]
    fn unknown_member_property_is_not_found() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut group = pair(&runs);

        #[derive(Debug)]
        struct Missing;

        let err = group.member(0).get_property::<Missing>(0).unwrap_err();
        assert!(err.is_not_found());
        let err = group.get_property::<Missing>(0).unwrap_err();
        assert!(err.is_not_found());
    }
}

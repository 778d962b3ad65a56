//! Clustering of the source stream into groups that are measured together.

use std::sync::Arc;

use tracing::{debug, info};

use crate::group::SourceGroup;
use crate::pipeline::{PipelineEmitter, PipelineReceiver, PipelineResult, ProcessSourcesEvent};
use crate::property::{PropertyHolderExt, PropertyId, PropertyResult};
use crate::source::Source;

/// Pairwise test deciding whether two sources belong to the same group.
pub trait GroupingCriteria: Send + Sync {
    fn should_group(&self, first: &mut Source, second: &mut Source) -> PropertyResult<bool>;

    /// Properties the test reads, so an upstream prefetcher can compute them early.
    fn required_properties(&self) -> Vec<PropertyId> {
        Vec::new()
    }
}

/// Decides which sources a [`ProcessSourcesEvent`] releases.
pub trait SelectionCriteria: Send + Sync {
    fn must_be_processed(&self, source: &mut Source) -> PropertyResult<bool>;

    fn required_properties(&self) -> Vec<PropertyId> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SelectAllCriteria;

impl SelectionCriteria for SelectAllCriteria {
    fn must_be_processed(&self, _source: &mut Source) -> PropertyResult<bool> {
        Ok(true)
    }
}

/// Every source ends up alone in its group.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGroupingCriteria;

impl GroupingCriteria for NoGroupingCriteria {
    fn should_group(&self, _first: &mut Source, _second: &mut Source) -> PropertyResult<bool> {
        Ok(false)
    }
}

fn group_matches(
    criteria: &dyn GroupingCriteria,
    source: &mut Source,
    group: &mut SourceGroup,
) -> PropertyResult<bool> {
    for member in group.sources_mut() {
        if criteria.should_group(source, member)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn group_selected(
    criteria: &dyn SelectionCriteria,
    group: &mut SourceGroup,
) -> PropertyResult<bool> {
    for member in group.sources_mut() {
        if criteria.must_be_processed(member)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Evaluates `event` on every group before anything moves, so a failing
/// criterion leaves the open groups as they were.
fn selected_groups<'a>(
    groups: impl Iterator<Item = &'a mut SourceGroup>,
    event: &ProcessSourcesEvent,
) -> PropertyResult<Vec<bool>> {
    groups
        .map(|group| group_selected(event.criteria(), group))
        .collect()
}

/// Removes the selected entries, keeping the relative order on both sides.
fn take_selected<T>(entries: &mut Vec<T>, selected: &[bool]) -> Vec<T> {
    assert_eq!(entries.len(), selected.len());

    let mut released = Vec::new();
    let mut kept = Vec::with_capacity(entries.len());
    for (entry, &selected) in entries.drain(..).zip(selected) {
        if selected {
            released.push(entry);
        } else {
            kept.push(entry);
        }
    }
    *entries = kept;

    released
}

/// Incrementally groups sources with a pairwise criterion.
///
/// With a hard limit, a source only joins or merges groups as long as the
/// resulting group stays within the limit; `0` disables the limit.
pub struct SourceGrouping {
    criteria: Arc<dyn GroupingCriteria>,
    hard_limit: usize,
    groups: Vec<SourceGroup>,
    emitter: PipelineEmitter<SourceGroup>,
}

impl SourceGrouping {
    pub fn new(criteria: Arc<dyn GroupingCriteria>, hard_limit: usize) -> Self {
        Self {
            criteria,
            hard_limit,
            groups: Vec::new(),
            emitter: PipelineEmitter::new(),
        }
    }

    pub fn hard_limit(&self) -> usize {
        self.hard_limit
    }

    pub fn emitter_mut(&mut self) -> &mut PipelineEmitter<SourceGroup> {
        &mut self.emitter
    }

    pub fn required_properties(&self) -> Vec<PropertyId> {
        self.criteria.required_properties()
    }

    pub fn open_groups(&self) -> impl Iterator<Item = &SourceGroup> {
        self.groups.iter()
    }

    pub fn open_group_count(&self) -> usize {
        self.groups.len()
    }

    fn limited(&self) -> bool {
        self.hard_limit > 0
    }
}

impl PipelineReceiver<Source> for SourceGrouping {
    fn receive_source(&mut self, mut source: Source) -> PipelineResult<()> {
        let limited = self.limited();
        let criteria = self.criteria.as_ref();

        // size of the group the source would end up in, itself included
        let mut matched_size = 1;
        let mut matched = Vec::new();
        for (group_idx, group) in self.groups.iter_mut().enumerate() {
            if limited {
                if matched_size >= self.hard_limit {
                    break;
                }
                if matched_size + group.len() > self.hard_limit {
                    continue;
                }
            }

            if group_matches(criteria, &mut source, group)? {
                matched_size += group.len();
                matched.push(group_idx);
            }
        }

        let Some((&target_idx, others)) = matched.split_first() else {
            debug!(source = %source.id(), "Opening new group");
            self.groups.push(SourceGroup::with_source(source));
            return Ok(());
        };

        let mut absorbed: Vec<SourceGroup> = others
            .iter()
            .rev()
            .map(|&group_idx| self.groups.remove(group_idx))
            .collect();
        absorbed.reverse();

        let target = &mut self.groups[target_idx];
        target.add_source(source);
        if !absorbed.is_empty() {
            debug!(merged = absorbed.len(), group = %target.id(), "Merging groups");
        }
        for other in absorbed {
            target.merge(other);
        }
        assert!(!limited || target.len() <= self.hard_limit);

        Ok(())
    }

    fn receive_process_signal(&mut self, event: &ProcessSourcesEvent) -> PipelineResult<()> {
        let selected = selected_groups(self.groups.iter_mut(), event)?;
        let released = take_selected(&mut self.groups, &selected);
        info!(
            released = released.len(),
            open = self.groups.len(),
            "Releasing source groups"
        );

        for group in released {
            self.emitter.send_source(group)?;
        }
        self.emitter.send_process_signal(event)
    }
}

/// Key shared by sources split from the same detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DetectionId(pub u64);

/// Groups sources by their [`DetectionId`] instead of a pairwise criterion.
pub struct SplitSourcesGrouping {
    groups: Vec<(DetectionId, SourceGroup)>,
    emitter: PipelineEmitter<SourceGroup>,
}

impl Default for SplitSourcesGrouping {
    fn default() -> Self {
        Self::new()
    }
}

impl SplitSourcesGrouping {
    pub fn new() -> Self {
        Self {
            groups: Vec::new(),
            emitter: PipelineEmitter::new(),
        }
    }

    pub fn emitter_mut(&mut self) -> &mut PipelineEmitter<SourceGroup> {
        &mut self.emitter
    }

    pub fn required_properties(&self) -> Vec<PropertyId> {
        vec![PropertyId::of::<DetectionId>()]
    }

    pub fn open_group_count(&self) -> usize {
        self.groups.len()
    }
}

impl PipelineReceiver<Source> for SplitSourcesGrouping {
    fn receive_source(&mut self, mut source: Source) -> PipelineResult<()> {
        let key = *source.get_property::<DetectionId>(0)?;

        match self.groups.iter_mut().find(|(group_key, _)| *group_key == key) {
            Some((_, group)) => group.add_source(source),
            None => self.groups.push((key, SourceGroup::with_source(source))),
        }

        Ok(())
    }

    fn receive_process_signal(&mut self, event: &ProcessSourcesEvent) -> PipelineResult<()> {
        let selected = selected_groups(self.groups.iter_mut().map(|(_, group)| group), event)?;
        let released = take_selected(&mut self.groups, &selected);
        info!(
            released = released.len(),
            open = self.groups.len(),
            "Releasing split source groups"
        );

        for (_, group) in released {
            self.emitter.send_source(group)?;
        }
        self.emitter.send_process_signal(event)
    }
}

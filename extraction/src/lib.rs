//! Demand-driven property computation and the pipeline plumbing around it.
//!
//! Detected sources carry typed properties that are computed lazily by tasks and
//! cached for the lifetime of the source. Sources are clustered into groups,
//! prefetched concurrently while keeping their order, and measured with the help
//! of a bounded cache of open files.

pub mod config;
pub mod group;
pub mod grouping;
pub mod image;
pub mod pipeline;
pub mod prefetch;
pub mod property;
pub mod resource_cache;
pub mod source;
pub mod task;


pub use config::Config;
pub use group::{EntangledSource, GroupId, SourceGroup};
pub use grouping::{
    GroupingCriteria, NoGroupingCriteria, SelectAllCriteria, SelectionCriteria, SourceGrouping,
    SplitSourcesGrouping,
};
pub use pipeline::{
    PipelineEmitter, PipelineError, PipelineReceiver, ProcessSourcesEvent, StageMessage,
};
pub use prefetch::Prefetcher;
pub use property::{
    Property, PropertyError, PropertyHolder, PropertyHolderExt, PropertyId, PropertyResult,
};
pub use resource_cache::{FileManager, ResourceCache, ResourceError, ResourceHandle};
pub use source::{Source, SourceId};
pub use task::{GroupTask, SourceTask, Task, TaskFactory, TaskFactoryRegistry, TaskProvider};

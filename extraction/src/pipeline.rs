//! Typed wiring between pipeline stages.
//!
//! A stage owns the objects it receives and passes them on through its
//! [`PipelineEmitter`]. Control flows on the same path as data: a
//! [`ProcessSourcesEvent`] asks downstream grouping to release whatever matches
//! its selection criteria.

use std::fmt::{self, Debug};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;
use tracing::trace;

use crate::grouping::SelectionCriteria;
use crate::property::PropertyError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Property(#[from] PropertyError),
    #[error("Next pipeline stage is already set")]
    NextStageAlreadySet,
    #[error("Downstream channel is disconnected")]
    Disconnected,
    #[error("Prefetch job {ticket} panicked: {message}")]
    JobPanicked { ticket: u64, message: String },
    #[error("Prefetch output thread panicked")]
    OutputThreadPanicked,
    #[error("Failed to start prefetch output thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("Prefetcher is already stopped")]
    Stopped,
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Flush request carrying the criteria that pick the sources to release.
#[derive(Clone)]
pub struct ProcessSourcesEvent {
    criteria: Arc<dyn SelectionCriteria>,
}

impl ProcessSourcesEvent {
    pub fn new(criteria: Arc<dyn SelectionCriteria>) -> Self {
        Self { criteria }
    }

    pub fn criteria(&self) -> &dyn SelectionCriteria {
        self.criteria.as_ref()
    }
}

impl Debug for ProcessSourcesEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSourcesEvent").finish_non_exhaustive()
    }
}

pub trait PipelineReceiver<T>: Send {
    /// Takes ownership of an object from the previous stage.
    fn receive_source(&mut self, source: T) -> PipelineResult<()>;

    fn receive_process_signal(&mut self, event: &ProcessSourcesEvent) -> PipelineResult<()>;
}

pub type Observer<T> = Box<dyn FnMut(&T) + Send>;

/// Sending half of a stage: one owning next stage plus any number of observers.
pub struct PipelineEmitter<T> {
    next: Option<Box<dyn PipelineReceiver<T>>>,
    observers: Vec<Observer<T>>,
}

impl<T> Default for PipelineEmitter<T> {
    fn default() -> Self {
        Self {
            next: None,
            observers: Vec::new(),
        }
    }
}

impl<T> PipelineEmitter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects the single owning next stage.
    pub fn set_next_stage<R>(&mut self, next: R) -> PipelineResult<()>
    where
        R: PipelineReceiver<T> + 'static,
    {
        self.set_next_stage_boxed(Box::new(next))
    }

    pub fn set_next_stage_boxed(
        &mut self,
        next: Box<dyn PipelineReceiver<T>>,
    ) -> PipelineResult<()> {
        if self.next.is_some() {
            return Err(PipelineError::NextStageAlreadySet);
        }
        self.next = Some(next);
        Ok(())
    }

    pub fn has_next_stage(&self) -> bool {
        self.next.is_some()
    }

    /// Observers see every emitted object before the next stage takes it.
    pub fn add_observer<F>(&mut self, observer: F)
    where
        F: FnMut(&T) + Send + 'static,
    {
        self.observers.push(Box::new(observer));
    }

    pub fn send_source(&mut self, source: T) -> PipelineResult<()> {
        for observer in self.observers.iter_mut() {
            observer(&source);
        }

        match self.next.as_mut() {
            Some(next) => next.receive_source(source),
            None => {
                trace!("No next stage, dropping emitted object");
                Ok(())
            }
        }
    }

    pub fn send_process_signal(&mut self, event: &ProcessSourcesEvent) -> PipelineResult<()> {
        match self.next.as_mut() {
            Some(next) => next.receive_process_signal(event),
            None => Ok(()),
        }
    }
}

impl<T> Debug for PipelineEmitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineEmitter")
            .field("connected", &self.next.is_some())
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[derive(Debug)]
pub enum StageMessage<T> {
    Source(T),
    ProcessSources(ProcessSourcesEvent),
}

/// Terminal stage forwarding everything into a channel.
#[derive(Debug)]
pub struct ChannelReceiver<T> {
    sender: Sender<StageMessage<T>>,
}

impl<T> ChannelReceiver<T> {
    pub fn unbounded() -> (Self, Receiver<StageMessage<T>>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (Self { sender }, receiver)
    }

    pub fn bounded(capacity: usize) -> (Self, Receiver<StageMessage<T>>) {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        (Self { sender }, receiver)
    }
}

impl<T: Send> PipelineReceiver<T> for ChannelReceiver<T> {
    fn receive_source(&mut self, source: T) -> PipelineResult<()> {
        self.sender
            .send(StageMessage::Source(source))
            .map_err(|_| PipelineError::Disconnected)
    }

    fn receive_process_signal(&mut self, event: &ProcessSourcesEvent) -> PipelineResult<()> {
        self.sender
            .send(StageMessage::ProcessSources(event.clone()))
            .map_err(|_| PipelineError::Disconnected)
    }
}

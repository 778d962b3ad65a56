//! Concurrent property prefetching with in-order re-emission.
//!
//! Every received object gets a ticket and is handed to the worker pool, which
//! computes the requested properties. A single output thread releases objects and
//! control signals strictly in the order they were received, waiting on the head
//! of the queue when a later object finishes first.

use std::any::Any;
use std::collections::{BTreeSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use rayon::ThreadPool;
use tracing::{debug, error, trace};

use crate::pipeline::{
    PipelineEmitter, PipelineError, PipelineReceiver, PipelineResult, ProcessSourcesEvent,
};
use crate::property::{PropertyError, PropertyHolder, PropertyId};

#[cfg(test)]
mod tests;

// Upper bound on any single wait; wakeups normally come from the condvars.
const POLL_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy)]
enum Received {
    Source(u64),
    ProcessSources,
}

struct QueueState<T> {
    received: VecDeque<Received>,
    // `None` marks a job that failed; its slot is released without emitting
    finished: HashMap<u64, Option<T>>,
    events: VecDeque<ProcessSourcesEvent>,
    in_flight: usize,
    failure: Option<PipelineError>,
}

impl<T> QueueState<T> {
    fn record(&mut self, result: PipelineResult<()>) {
        if let Err(err) = result {
            error!(%err, "Prefetch stage failure");
            if self.failure.is_none() {
                self.failure = Some(err);
            }
        }
    }
}

struct Shared<T> {
    queue: Mutex<QueueState<T>>,
    new_output: Condvar,
    slot_freed: Condvar,
    drained: Condvar,
    stop: AtomicBool,
    emitter: Mutex<PipelineEmitter<T>>,
}

impl<T> Shared<T> {
    fn finish(&self, ticket: u64, result: PipelineResult<T>) {
        let mut queue = self.queue.lock();
        match result {
            Ok(object) => {
                queue.finished.insert(ticket, Some(object));
            }
            Err(err) => {
                queue.finished.insert(ticket, None);
                queue.record(Err(err));
            }
        }
        drop(queue);

        self.new_output.notify_one();
    }

    fn output_loop(&self) {
        debug!("Starting prefetch output loop");

        let mut queue = self.queue.lock();
        loop {
            self.drain(&mut queue);

            if queue.received.is_empty() {
                self.drained.notify_all();
                if self.stop.load(Ordering::Acquire) {
                    break;
                }
            }

            self.new_output.wait_for(&mut queue, POLL_INTERVAL);
        }

        debug!("Stopping prefetch output loop");
    }

    /// Emits from the head of the queue until it reaches an unfinished object.
    ///
    /// The head entry is popped only after it was handed downstream, so an empty
    /// queue means everything received has been emitted.
    fn drain(&self, queue: &mut MutexGuard<'_, QueueState<T>>) {
        while let Some(&front) = queue.received.front() {
            let sent = match front {
                Received::ProcessSources => match queue.events.pop_front() {
                    Some(event) => {
                        trace!("Releasing process signal");
                        MutexGuard::unlocked(queue, || {
                            self.emitter.lock().send_process_signal(&event)
                        })
                    }
                    None => Ok(()),
                },
                Received::Source(ticket) => {
                    let Some(finished) = queue.finished.remove(&ticket) else {
                        trace!(ticket, "Head of queue not finished yet");
                        break;
                    };
                    match finished {
                        Some(object) => {
                            trace!(ticket, "Releasing object");
                            MutexGuard::unlocked(queue, || {
                                self.emitter.lock().send_source(object)
                            })
                        }
                        None => Ok(()),
                    }
                }
            };

            queue.received.pop_front();
            if let Received::Source(_) = front {
                queue.in_flight -= 1;
                self.slot_freed.notify_one();
            }
            queue.record(sent);
        }
    }
}

/// Pipeline stage that computes a set of properties ahead of the next stage.
///
/// `max_queue_size` bounds the number of objects between receipt and emission;
/// `0` leaves it unbounded.
pub struct Prefetcher<T: PropertyHolder + Send + 'static> {
    pool: Arc<ThreadPool>,
    max_queue_size: usize,
    prefetch_set: BTreeSet<PropertyId>,
    prefetch_list: Arc<Vec<PropertyId>>,
    next_ticket: u64,
    shared: Arc<Shared<T>>,
    output_thread: Option<JoinHandle<()>>,
}

impl<T: PropertyHolder + Send + 'static> Prefetcher<T> {
    pub fn new(pool: Arc<ThreadPool>, max_queue_size: usize) -> PipelineResult<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState {
                received: VecDeque::new(),
                finished: HashMap::new(),
                events: VecDeque::new(),
                in_flight: 0,
                failure: None,
            }),
            new_output: Condvar::new(),
            slot_freed: Condvar::new(),
            drained: Condvar::new(),
            stop: AtomicBool::new(false),
            emitter: Mutex::new(PipelineEmitter::new()),
        });

        let output_shared = shared.clone();
        let output_thread = std::thread::Builder::new()
            .name("prefetch-output".to_string())
            .spawn(move || output_shared.output_loop())
            .map_err(PipelineError::Spawn)?;

        Ok(Self {
            pool,
            max_queue_size,
            prefetch_set: BTreeSet::new(),
            prefetch_list: Arc::new(Vec::new()),
            next_ticket: 0,
            shared,
            output_thread: Some(output_thread),
        })
    }

    pub fn set_next_stage<R>(&mut self, next: R) -> PipelineResult<()>
    where
        R: PipelineReceiver<T> + 'static,
    {
        self.shared.emitter.lock().set_next_stage(next)
    }

    pub fn add_observer<F>(&mut self, observer: F)
    where
        F: FnMut(&T) + Send + 'static,
    {
        self.shared.emitter.lock().add_observer(observer);
    }

    /// Adds `id` to the properties computed for every object received from now on.
    pub fn request_property(&mut self, id: PropertyId) {
        if self.prefetch_set.insert(id) {
            debug!(property = %id, "Requesting prefetch");
            self.prefetch_list = Arc::new(self.prefetch_set.iter().copied().collect());
        }
    }

    pub fn request_properties(&mut self, ids: impl IntoIterator<Item = PropertyId>) {
        for id in ids {
            self.request_property(id);
        }
    }

    pub fn prefetch_set(&self) -> &BTreeSet<PropertyId> {
        &self.prefetch_set
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    /// Blocks until everything received so far has been emitted.
    ///
    /// Returns the first failure recorded since the last report.
    pub fn synchronize(&self) -> PipelineResult<()> {
        let mut queue = self.shared.queue.lock();
        while !queue.received.is_empty() && self.output_thread.is_some() {
            self.shared.drained.wait_for(&mut queue, POLL_INTERVAL);
        }

        match queue.failure.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drains everything already accepted, then stops the output thread.
    pub fn wait(&mut self) -> PipelineResult<()> {
        if let Some(output_thread) = self.output_thread.take() {
            {
                let _queue = self.shared.queue.lock();
                self.shared.stop.store(true, Ordering::Release);
            }
            self.shared.new_output.notify_all();

            let joined = output_thread.join();

            // jobs may still hold `shared`; downstream stages shut down on this thread
            let downstream = std::mem::take(&mut *self.shared.emitter.lock());
            drop(downstream);

            if joined.is_err() {
                return Err(PipelineError::OutputThreadPanicked);
            }
        }

        match self.shared.queue.lock().failure.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn take_ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }
}

fn prefetch<T: PropertyHolder>(
    object: &mut T,
    properties: &[PropertyId],
) -> Result<(), PropertyError> {
    for id in properties {
        object.property_dyn(id)?;
    }
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl<T: PropertyHolder + Send + 'static> PipelineReceiver<T> for Prefetcher<T> {
    fn receive_source(&mut self, mut object: T) -> PipelineResult<()> {
        if self.output_thread.is_none() {
            return Err(PipelineError::Stopped);
        }

        let ticket = self.take_ticket();
        {
            let mut queue = self.shared.queue.lock();
            while self.max_queue_size > 0 && queue.in_flight >= self.max_queue_size {
                self.shared.slot_freed.wait_for(&mut queue, POLL_INTERVAL);
            }
            queue.in_flight += 1;
            queue.received.push_back(Received::Source(ticket));
        }

        let shared = self.shared.clone();
        let properties = self.prefetch_list.clone();
        self.pool.spawn(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| prefetch(&mut object, &properties)));
            let result = match outcome {
                Ok(Ok(())) => Ok(object),
                Ok(Err(err)) => Err(PipelineError::Property(err)),
                Err(payload) => Err(PipelineError::JobPanicked {
                    ticket,
                    message: panic_message(payload.as_ref()),
                }),
            };
            shared.finish(ticket, result);
        });

        Ok(())
    }

    fn receive_process_signal(&mut self, event: &ProcessSourcesEvent) -> PipelineResult<()> {
        if self.output_thread.is_none() {
            return Err(PipelineError::Stopped);
        }

        {
            let mut queue = self.shared.queue.lock();
            queue.received.push_back(Received::ProcessSources);
            queue.events.push_back(event.clone());
        }
        self.shared.new_output.notify_one();
        debug!("Process signal received");

        Ok(())
    }
}

impl<T: PropertyHolder + Send + 'static> Drop for Prefetcher<T> {
    fn drop(&mut self) {
        if self.output_thread.is_some() {
            if let Err(err) = self.wait() {
                error!(%err, "Prefetcher stopped with a failure");
            }
        }
    }
}

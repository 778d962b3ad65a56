use std::sync::atomic::AtomicUsize;
use std::thread::sleep;

use crossbeam_channel::Receiver;
use rand::Rng;

use super::*;
use crate::grouping::SelectAllCriteria;
use crate::pipeline::{ChannelReceiver, StageMessage};
use crate::property::{PropertyHolderExt, PropertyResult};
use crate::source::Source;
use crate::task::{
    PropertyType, SourceTask, Task, TaskFactory, TaskFactoryRegistry, TaskProvider,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Serial(u32);

#[derive(Debug)]
struct Measured(u32);

/// Emitted sequence, sources by serial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Seen {
    Source(u32),
    Signal,
}

struct MeasureTask {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    max_latency_ms: u64,
}

impl SourceTask for MeasureTask {
    fn compute_properties(&self, source: &mut Source) -> PropertyResult<()> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);

        let serial = source.get_property::<Serial>(0)?.0;
        if self.max_latency_ms > 0 {
            let latency = rand::rng().random_range(0..=self.max_latency_ms);
            sleep(Duration::from_millis(latency));
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        match serial {
            3 => Err(PropertyError::task(
                &PropertyId::of::<Measured>(),
                "saturated pixels",
            )),
            5 => panic!("corrupted detection"),
            _ => {
                source.set_property(0, Measured(serial * 10));
                Ok(())
            }
        }
    }
}

#[derive(Default)]
struct Concurrency {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

struct MeasureFactory {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    max_latency_ms: u64,
}

impl TaskFactory for MeasureFactory {
    fn produces(&self) -> Vec<PropertyType> {
        vec![PropertyType::of::<Measured>()]
    }

    fn create_task(&self, _id: &PropertyId) -> Option<Task> {
        Some(Task::source(MeasureTask {
            active: self.active.clone(),
            peak: self.peak.clone(),
            max_latency_ms: self.max_latency_ms,
        }))
    }
}

fn provider(concurrency: &Concurrency, max_latency_ms: u64) -> Arc<TaskProvider> {
    let mut registry = TaskFactoryRegistry::new();
    registry
        .register_factory(MeasureFactory {
            active: concurrency.active.clone(),
            peak: concurrency.peak.clone(),
            max_latency_ms,
        })
        .unwrap();
    Arc::new(TaskProvider::new(registry))
}

fn pool(threads: usize) -> Arc<ThreadPool> {
    Arc::new(
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .unwrap(),
    )
}

fn source(provider: &Arc<TaskProvider>, serial: u32) -> Source {
    let mut source = Source::new(provider.clone());
    source.set_property(0, Serial(serial));
    source
}

fn signal() -> ProcessSourcesEvent {
    ProcessSourcesEvent::new(Arc::new(SelectAllCriteria))
}

fn prefetcher(
    threads: usize,
    max_queue_size: usize,
) -> (Prefetcher<Source>, Receiver<StageMessage<Source>>) {
    let mut prefetcher = Prefetcher::new(pool(threads), max_queue_size).unwrap();
    let (sink, rx) = ChannelReceiver::unbounded();
    prefetcher.set_next_stage(sink).unwrap();
    (prefetcher, rx)
}

fn seen(rx: &Receiver<StageMessage<Source>>) -> Vec<Seen> {
    rx.try_iter()
        .map(|message| match message {
            StageMessage::Source(mut source) => {
                Seen::Source(source.get_property::<Serial>(0).map(|s| s.0).unwrap())
            }
            StageMessage::ProcessSources(_) => Seen::Signal,
        })
        .collect()
}

fn feed(prefetcher: &mut Prefetcher<Source>, provider: &Arc<TaskProvider>, serials: &[u32]) {
    for &serial in serials {
        prefetcher
            .receive_source(source(provider, serial))
            .unwrap();
    }
}

#[test]
fn test_emits_in_receive_order_with_random_latency() -> anyhow::Result<()> {
    common::log_setup::setup_test_logging();

    let concurrency = Concurrency::default();
    let provider = provider(&concurrency, 3);
    let (mut prefetcher, rx) = prefetcher(4, 0);
    prefetcher.request_property(PropertyId::of::<Measured>());

    let mut expected = Vec::new();
    for serial in 0..200u32 {
        // skip the serials the task refuses to measure
        let serial = serial + 10;
        prefetcher.receive_source(source(&provider, serial))?;
        expected.push(Seen::Source(serial));
        if serial % 17 == 0 {
            prefetcher.receive_process_signal(&signal())?;
            expected.push(Seen::Signal);
        }
    }
    prefetcher.wait()?;

    assert_eq!(seen(&rx), expected);
    Ok(())
}

#[test]
fn test_prefetched_properties_are_cached_on_emission() -> anyhow::Result<()> {
    let concurrency = Concurrency::default();
    let provider = provider(&concurrency, 0);
    let (mut prefetcher, rx) = prefetcher(2, 0);
    prefetcher.request_properties([PropertyId::of::<Measured>(), PropertyId::of::<Serial>()]);
    assert_eq!(prefetcher.prefetch_set().len(), 2);

    feed(&mut prefetcher, &provider, &[11, 12]);
    prefetcher.synchronize()?;

    for message in rx.try_iter() {
        let StageMessage::Source(source) = message else {
            panic!("unexpected signal");
        };
        assert!(source.has_property::<Measured>(0));
    }

    prefetcher.wait()?;
    Ok(())
}

#[test]
fn test_empty_prefetch_set_keeps_signal_order() -> anyhow::Result<()> {
    let concurrency = Concurrency::default();
    let provider = provider(&concurrency, 0);
    let (mut prefetcher, rx) = prefetcher(3, 0);

    prefetcher.receive_process_signal(&signal())?;
    feed(&mut prefetcher, &provider, &[1, 2]);
    prefetcher.receive_process_signal(&signal())?;
    feed(&mut prefetcher, &provider, &[3]);
    prefetcher.wait()?;

    assert_eq!(
        seen(&rx),
        vec![
            Seen::Signal,
            Seen::Source(1),
            Seen::Source(2),
            Seen::Signal,
            Seen::Source(3),
        ]
    );
    assert_eq!(concurrency.peak.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn test_queue_size_bounds_work_in_flight() -> anyhow::Result<()> {
    let concurrency = Concurrency::default();
    let provider = provider(&concurrency, 2);
    let (mut prefetcher, rx) = prefetcher(4, 2);
    prefetcher.request_property(PropertyId::of::<Measured>());

    let serials: Vec<u32> = (10..40).collect();
    feed(&mut prefetcher, &provider, &serials);
    prefetcher.wait()?;

    assert!(concurrency.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(seen(&rx).len(), serials.len());
    Ok(())
}

#[test]
fn test_failed_jobs_are_surfaced_and_skipped() {
    common::log_setup::setup_test_logging();

    let concurrency = Concurrency::default();
    let provider = provider(&concurrency, 0);
    let (mut prefetcher, rx) = prefetcher(1, 0);
    prefetcher.request_property(PropertyId::of::<Measured>());

    feed(&mut prefetcher, &provider, &[0, 1, 2, 3, 4, 5, 6]);
    prefetcher.receive_process_signal(&signal()).unwrap();

    let err = prefetcher.wait().unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Property(_) | PipelineError::JobPanicked { .. }
    ));

    assert_eq!(
        seen(&rx),
        vec![
            Seen::Source(0),
            Seen::Source(1),
            Seen::Source(2),
            Seen::Source(4),
            Seen::Source(6),
            Seen::Signal,
        ]
    );
}

#[test]
fn test_synchronize_flushes_without_stopping() -> anyhow::Result<()> {
    let concurrency = Concurrency::default();
    let provider = provider(&concurrency, 1);
    let (mut prefetcher, rx) = prefetcher(2, 0);
    prefetcher.request_property(PropertyId::of::<Measured>());

    feed(&mut prefetcher, &provider, &[10, 11, 12]);
    prefetcher.synchronize()?;
    assert_eq!(rx.len(), 3);

    feed(&mut prefetcher, &provider, &[13]);
    prefetcher.wait()?;
    assert_eq!(rx.len(), 4);

    let err = prefetcher
        .receive_source(source(&provider, 14))
        .unwrap_err();
    assert!(matches!(err, PipelineError::Stopped));
    Ok(())
}

#[test]
fn test_downstream_failure_is_reported() {
    let concurrency = Concurrency::default();
    let provider = provider(&concurrency, 0);
    let (mut prefetcher, rx) = prefetcher(1, 0);
    drop(rx);

    feed(&mut prefetcher, &provider, &[10]);
    let err = prefetcher.wait().unwrap_err();
    assert!(matches!(err, PipelineError::Disconnected));
}

#[test]
fn test_chained_stages_drain_on_shared_single_worker() -> anyhow::Result<()> {
    let concurrency = Concurrency::default();
    let provider = provider(&concurrency, 0);
    let pool = pool(1);

    let (sink, rx) = ChannelReceiver::unbounded();
    let mut downstream = Prefetcher::new(pool.clone(), 1)?;
    downstream.request_property(PropertyId::of::<Measured>());
    downstream.set_next_stage(sink)?;

    let mut upstream = Prefetcher::new(pool, 1)?;
    upstream.request_property(PropertyId::of::<Measured>());
    upstream.set_next_stage(downstream)?;

    let mut expected = Vec::new();
    for serial in 10..210u32 {
        upstream.receive_source(source(&provider, serial))?;
        expected.push(Seen::Source(serial));
        if serial % 50 == 0 {
            upstream.receive_process_signal(&signal())?;
            expected.push(Seen::Signal);
        }
    }
    upstream.wait()?;

    // the downstream stage was shut down by `wait` on this thread
    assert_eq!(seen(&rx), expected);

    drop(upstream);
    assert!(rx.is_empty());
    Ok(())
}

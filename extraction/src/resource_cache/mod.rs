//! Bounded cache of expensive-to-open resources such as FITS files.
//!
//! Instances are checked out through a [`ResourceHandle`]; dropping the handle
//! returns the instance to an idle queue of its key. Whenever more instances are
//! open than allowed, the least recently released idle instance across all keys
//! is closed. Checked-out instances are owned by their handle and never evicted.

use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::fs::{File, OpenOptions};
use std::hash::Hash;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;


pub const DEFAULT_MAX_OPEN_FILES: usize = 500;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Failed to open {key}: {source}")]
    Open {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O on {key} failed: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

pub type ResourceResult<T> = Result<T, ResourceError>;

pub trait ResourceOpener: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Debug + Send + Sync + 'static;
    type Resource: Send + 'static;

    fn open(&self, key: &Self::Key) -> ResourceResult<Self::Resource>;
}

struct Instance<R> {
    id: u64,
    resource: R,
}

struct CacheState<K, R> {
    idle: HashMap<K, VecDeque<Instance<R>>>,
    // oldest release first
    release_order: VecDeque<(K, u64)>,
    open_count: usize,
    next_id: u64,
}

impl<K: Clone + Eq + Hash, R> CacheState<K, R> {
    fn take_idle(&mut self, key: &K) -> Option<Instance<R>> {
        let queue = self.idle.get_mut(key)?;
        let instance = queue.pop_back()?;
        if queue.is_empty() {
            self.idle.remove(key);
        }

        let position = self
            .release_order
            .iter()
            .rposition(|(k, id)| *id == instance.id && k == key);
        if let Some(position) = position {
            self.release_order.remove(position);
        }

        Some(instance)
    }

    fn release(&mut self, key: K, instance: Instance<R>) {
        self.release_order.push_back((key.clone(), instance.id));
        self.idle.entry(key).or_default().push_back(instance);
    }

    /// Detaches idle instances until `max_open` is respected or nothing idle is left.
    fn evict(&mut self, max_open: usize) -> Vec<Instance<R>> {
        let mut evicted = Vec::new();

        while self.open_count > max_open {
            let Some((key, id)) = self.release_order.pop_front() else {
                break;
            };
            let Some(queue) = self.idle.get_mut(&key) else {
                continue;
            };
            let Some(position) = queue.iter().position(|instance| instance.id == id) else {
                continue;
            };

            if let Some(instance) = queue.remove(position) {
                evicted.push(instance);
                self.open_count -= 1;
            }
            if queue.is_empty() {
                self.idle.remove(&key);
            }
        }

        evicted
    }

    fn idle_count(&self) -> usize {
        self.idle.values().map(VecDeque::len).sum()
    }
}

pub struct ResourceCache<O: ResourceOpener> {
    opener: O,
    max_open: usize,
    state: Mutex<CacheState<O::Key, O::Resource>>,
}

impl<O: ResourceOpener> ResourceCache<O> {
    pub fn new(opener: O, max_open: usize) -> Self {
        Self {
            opener,
            max_open,
            state: Mutex::new(CacheState {
                idle: HashMap::new(),
                release_order: VecDeque::new(),
                open_count: 0,
                next_id: 0,
            }),
        }
    }

    pub fn opener(&self) -> &O {
        &self.opener
    }

    pub fn max_open(&self) -> usize {
        self.max_open
    }

    /// Checks out an instance for `key`, reusing the most recently released one.
    pub fn acquire(self: &Arc<Self>, key: O::Key) -> ResourceResult<ResourceHandle<O>> {
        let instance = self.checkout(&key)?;

        Ok(ResourceHandle {
            cache: Arc::clone(self),
            key,
            instance: Some(instance),
        })
    }

    /// Instances currently open, idle or checked out.
    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle_count()
    }

    /// Closes every idle instance. Checked-out instances are left alone.
    pub fn close_all(&self) {
        let closed: Vec<Instance<O::Resource>> = {
            let mut state = self.state.lock();
            state.release_order.clear();
            let closed: Vec<_> = state
                .idle
                .drain()
                .flat_map(|(_, queue)| queue)
                .collect();
            state.open_count -= closed.len();
            closed
        };

        debug!(closed = closed.len(), "Closed idle resources");
        drop(closed);
    }

    fn checkout(&self, key: &O::Key) -> ResourceResult<Instance<O::Resource>> {
        let (id, evicted) = {
            let mut state = self.state.lock();
            if let Some(instance) = state.take_idle(key) {
                return Ok(instance);
            }

            state.open_count += 1;
            state.next_id += 1;
            let id = state.next_id;
            (id, state.evict(self.max_open))
        };
        self.log_evicted(&evicted);
        drop(evicted);

        debug!(key = ?key, "Opening resource");
        match self.opener.open(key) {
            Ok(resource) => Ok(Instance { id, resource }),
            Err(err) => {
                self.state.lock().open_count -= 1;
                Err(err)
            }
        }
    }

    fn release(&self, key: O::Key, instance: Instance<O::Resource>) {
        let evicted = {
            let mut state = self.state.lock();
            state.release(key, instance);
            state.evict(self.max_open)
        };
        self.log_evicted(&evicted);
    }

    fn close_instance(&self, instance: Instance<O::Resource>) {
        drop(instance);
        self.state.lock().open_count -= 1;
    }

    fn log_evicted(&self, evicted: &[Instance<O::Resource>]) {
        if !evicted.is_empty() {
            debug!(
                evicted = evicted.len(),
                max_open = self.max_open,
                "Evicting least recently used resources"
            );
        }
    }
}

impl<O: ResourceOpener + Debug> Debug for ResourceCache<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ResourceCache")
            .field("opener", &self.opener)
            .field("max_open", &self.max_open)
            .field("open_count", &state.open_count)
            .field("idle_count", &state.idle_count())
            .finish()
    }
}

/// Exclusive use of one open instance. Dropping it makes the instance idle.
pub struct ResourceHandle<O: ResourceOpener> {
    cache: Arc<ResourceCache<O>>,
    key: O::Key,
    instance: Option<Instance<O::Resource>>,
}

impl<O: ResourceOpener> ResourceHandle<O> {
    pub fn key(&self) -> &O::Key {
        &self.key
    }

    pub fn is_open(&self) -> bool {
        self.instance.is_some()
    }

    /// Reopens the resource first if the handle was closed.
    pub fn resource(&mut self) -> ResourceResult<&mut O::Resource> {
        let instance = match self.instance.take() {
            Some(instance) => instance,
            None => self.cache.checkout(&self.key)?,
        };

        Ok(&mut self.instance.insert(instance).resource)
    }

    /// Closes the instance now instead of returning it to the idle queue.
    pub fn close(&mut self) {
        if let Some(instance) = self.instance.take() {
            debug!(key = ?self.key, "Closing resource");
            self.cache.close_instance(instance);
        }
    }
}

impl<O: ResourceOpener> Drop for ResourceHandle<O> {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            self.cache.release(self.key.clone(), instance);
        }
    }
}

impl<O: ResourceOpener> Debug for ResourceHandle<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("key", &self.key)
            .field("open", &self.is_open())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FileOpener {
    pub writable: bool,
}

impl ResourceOpener for FileOpener {
    type Key = PathBuf;
    type Resource = File;

    fn open(&self, path: &PathBuf) -> ResourceResult<File> {
        OpenOptions::new()
            .read(true)
            .write(self.writable)
            .open(path)
            .map_err(|source| ResourceError::Open {
                key: path.display().to_string(),
                source,
            })
    }
}

pub type FileManager = ResourceCache<FileOpener>;

impl FileManager {
    pub fn read_only(max_open: usize) -> Self {
        Self::new(FileOpener { writable: false }, max_open)
    }

    pub fn read_write(max_open: usize) -> Self {
        Self::new(FileOpener { writable: true }, max_open)
    }

    /// Read-only manager bounded by `resources.max_open_files`.
    pub fn from_config(config: &Config) -> Self {
        Self::read_only(config.resources.max_open_files)
    }
}

pub type FileHandle = ResourceHandle<FileOpener>;

impl FileHandle {
    /// Fills `buf` from `offset`.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> ResourceResult<()> {
        let key = self.key.display().to_string();
        let file = self.resource()?;

        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(buf))
            .map_err(|source| ResourceError::Io { key, source })
    }
}

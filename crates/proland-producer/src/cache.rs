//! Tile cache with reference counting and LRU eviction.
//!
//! A cache maps `(producer, level, tx, ty)` to at most one [`Tile`]. Tiles with
//! a non-zero use count are never evicted. Unused tiles stay resident, in the
//! order in which their use count last dropped to zero, until the storage runs
//! out of slots. Several producers may share one cache; each registers and
//! receives its own [`ProducerId`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use proland_core::{Error, Result, TileCoord};
use serde::{Deserialize, Serialize};

use crate::cpu_storage::CpuTileStorage;
use crate::deferred::DeferredSlotRelease;
use crate::producer::{release_acquired, WeakProducer};
use crate::storage::{SlotId, TileStorage};
use crate::task::{CreateTileTask, Deadline, TaskState};
use crate::tile::Tile;

/// Identity of a producer inside the cache it is registered with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProducerId(pub u32);

impl std::fmt::Display for ProducerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "producer#{}", self.0)
    }
}

/// Full identity of a tile in a cache.
pub type TileKey = (ProducerId, TileCoord);

/// Configuration for a cache backed by a CPU storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileCacheConfig {
    /// Name used in log messages.
    pub name: String,
    /// Slot width and height in samples.
    pub tile_size: u32,
    /// Channels per sample.
    pub channels: u32,
    /// Number of slots.
    pub capacity: usize,
}

impl Default for TileCacheConfig {
    fn default() -> Self {
        Self {
            name: "cache".to_string(),
            tile_size: 101,
            channels: 1,
            capacity: 256,
        }
    }
}

impl TileCacheConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub const fn with_tile_size(mut self, tile_size: u32) -> Self {
        self.tile_size = tile_size;
        self
    }

    pub const fn with_channels(mut self, channels: u32) -> Self {
        self.channels = channels;
        self
    }

    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Cache counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub failures: u64,
    /// Tiles with a non-zero use count.
    pub used: usize,
    /// Resident tiles with a zero use count.
    pub unused: usize,
    /// Slots waiting for an in-flight task before release.
    pub deferred: usize,
}

/// Result of [`TileCache::get_tile`].
pub(crate) struct Acquired {
    pub tile: Arc<Tile>,
    /// Set when the caller must start a new create-tile task for the tile.
    pub new_task: Option<Arc<CreateTileTask>>,
}

struct Entry {
    tile: Arc<Tile>,
    /// Position in the unused LRU when the use count is zero.
    lru_stamp: Option<u64>,
    /// Invalidated while in use; the next `get_tile` re-creates it.
    stale: bool,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<TileKey, Entry>,
    unused: BTreeMap<u64, TileKey>,
    next_stamp: u64,
    deferred: DeferredSlotRelease,
    stats: CacheStats,
    failed_once: HashSet<TileKey>,
}

type Released = Vec<(WeakProducer, Arc<Tile>)>;

/// A bounded, reference-counted tile cache over one storage.
pub struct TileCache {
    name: String,
    storage: Arc<dyn TileStorage>,
    next_producer: AtomicU32,
    state: Mutex<CacheState>,
}

impl TileCache {
    /// Create a new cache over a storage.
    pub fn new(name: impl Into<String>, storage: Arc<dyn TileStorage>) -> Self {
        let name = name.into();
        tracing::info!(
            cache = %name,
            capacity = storage.capacity(),
            tile_size = storage.tile_size(),
            "Created tile cache"
        );
        Self {
            name,
            storage,
            next_producer: AtomicU32::new(0),
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Create a cache over a new [`CpuTileStorage`] of `f32` samples.
    pub fn from_config(config: &TileCacheConfig) -> Self {
        let storage = CpuTileStorage::<f32>::new(config.tile_size, config.channels, config.capacity);
        Self::new(config.name.clone(), Arc::new(storage))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage(&self) -> &Arc<dyn TileStorage> {
        &self.storage
    }

    /// The storage as its concrete type.
    pub fn storage_as<T: TileStorage>(&self) -> Option<&T> {
        self.storage.as_any().downcast_ref::<T>()
    }

    /// Register a producer and return its id in this cache.
    pub fn register_producer(&self) -> ProducerId {
        ProducerId(self.next_producer.fetch_add(1, Ordering::Relaxed))
    }

    /// Get a tile, creating it if needed.
    ///
    /// An existing tile gets its use count bumped and is revived from the LRU
    /// if it was unused. A missing tile gets a fresh slot, evicting the least
    /// recently used unused tile when the storage is full, and a new task that
    /// the caller must start.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub(crate) fn get_tile(
        &self,
        producer: ProducerId,
        coord: TileCoord,
        deadline: Deadline,
    ) -> Result<Acquired> {
        let key = (producer, coord);
        let mut released = Released::new();
        let result = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            if let Some(entry) = state.entries.get_mut(&key) {
                if let Some(stamp) = entry.lru_stamp.take() {
                    state.unused.remove(&stamp);
                }
                entry.tile.acquire();
                state.stats.hits += 1;
                let tile = Arc::clone(&entry.tile);
                let new_task = if entry.stale {
                    entry.stale = false;
                    let previous = tile.task();
                    if let Some(acquired) = previous.try_cancel() {
                        released.extend(acquired);
                    }
                    let after = previous.writes_pending().then_some(previous);
                    let task = CreateTileTask::new(producer, coord, tile.slot(), deadline, after);
                    tile.replace_task(Arc::clone(&task));
                    tracing::trace!(cache = %self.name, %coord, "Recreating stale tile");
                    Some(task)
                } else {
                    tile.task().lower_deadline(deadline);
                    None
                };
                Ok(Acquired { tile, new_task })
            } else {
                match self.allocate_slot(state, &mut released) {
                    Ok(slot) => {
                        let task = CreateTileTask::new(producer, coord, slot, deadline, None);
                        let tile = Arc::new(Tile::new(Arc::clone(&task)));
                        state.entries.insert(
                            key,
                            Entry {
                                tile: Arc::clone(&tile),
                                lru_stamp: None,
                                stale: false,
                            },
                        );
                        state.stats.misses += 1;
                        tracing::trace!(cache = %self.name, %coord, %slot, "Created tile");
                        Ok(Acquired {
                            tile,
                            new_task: Some(task),
                        })
                    }
                    Err(e) => Err(e),
                }
            }
        };
        release_acquired(released);
        result
    }

    fn allocate_slot(&self, state: &mut CacheState, released: &mut Released) -> Result<SlotId> {
        state.deferred.process(self.storage.as_ref());
        loop {
            match self.storage.new_slot() {
                Ok(slot) => return Ok(slot),
                Err(e) if e.is_recoverable() => {
                    if !self.evict_lru(state, released) {
                        tracing::warn!(
                            cache = %self.name,
                            capacity = self.storage.capacity(),
                            deferred = state.deferred.pending_count(),
                            "Tile cache exhausted: every tile is in use"
                        );
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Evict the least recently used tile whose slot is not being written.
    fn evict_lru(&self, state: &mut CacheState, released: &mut Released) -> bool {
        let mut victim = None;
        for (&stamp, key) in &state.unused {
            let Some(entry) = state.entries.get(key) else {
                continue;
            };
            let task = entry.tile.task();
            if task.pending_writer().is_some() {
                continue;
            }
            match task.state() {
                TaskState::Done | TaskState::Failed => {}
                TaskState::Pending => match task.try_cancel() {
                    Some(acquired) => released.extend(acquired),
                    None => continue,
                },
                TaskState::Created | TaskState::Running => continue,
            }
            victim = Some((stamp, *key));
            break;
        }
        let Some((stamp, key)) = victim else {
            return false;
        };
        state.unused.remove(&stamp);
        if let Some(entry) = state.entries.remove(&key) {
            self.storage.delete_slot(entry.tile.slot());
            tracing::trace!(cache = %self.name, coord = %key.1, "Evicted tile");
        }
        state.stats.evictions += 1;
        true
    }

    /// Non-allocating lookup.
    ///
    /// With `include_cache` false, unused tiles are hidden. With `done` true,
    /// tiles whose task has not completed are hidden. The use count is not
    /// changed.
    pub fn find_tile(
        &self,
        producer: ProducerId,
        coord: TileCoord,
        include_cache: bool,
        done: bool,
    ) -> Option<Arc<Tile>> {
        let state = self.state.lock();
        let entry = state.entries.get(&(producer, coord))?;
        if !include_cache && entry.lru_stamp.is_some() {
            return None;
        }
        if done && !entry.tile.is_ready() {
            return None;
        }
        Some(Arc::clone(&entry.tile))
    }

    /// Release one use of a tile.
    ///
    /// At zero the tile joins the LRU of unused tiles. Tiles no longer mapped
    /// by the cache (failed or invalidated) are only decremented.
    ///
    /// # Panics
    /// Panics if the tile has no users.
    pub fn put_tile(&self, tile: &Arc<Tile>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if tile.release() > 0 {
            return;
        }
        let key = (tile.producer_id(), tile.coord());
        if let Some(entry) = state.entries.get_mut(&key) {
            if Arc::ptr_eq(&entry.tile, tile) {
                let stamp = state.next_stamp;
                state.next_stamp += 1;
                entry.lru_stamp = Some(stamp);
                state.unused.insert(stamp, key);
            }
        }
    }

    /// Record the outcome of a task.
    ///
    /// A failed tile is removed so the next `get_tile` retries. Its slot is
    /// freed once no earlier task of the tile still writes it. Results of
    /// tasks the tile no longer points to are discarded.
    pub(crate) fn complete(&self, task: &Arc<CreateTileTask>, result: &Result<()>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let key = (task.producer_id(), task.coord());
        let current = state
            .entries
            .get(&key)
            .is_some_and(|e| Arc::ptr_eq(&e.tile.task(), task));

        if let Err(e) = result {
            state.stats.failures += 1;
            if state.failed_once.insert(key) {
                tracing::warn!(cache = %self.name, coord = %key.1, error = %e, "Tile creation failed");
            } else {
                tracing::debug!(cache = %self.name, coord = %key.1, error = %e, "Tile creation failed again");
            }
            if current {
                if let Some(entry) = state.entries.remove(&key) {
                    if let Some(stamp) = entry.lru_stamp {
                        state.unused.remove(&stamp);
                    }
                    if task.writes_pending() {
                        state.deferred.queue(entry.tile.slot(), Arc::clone(task));
                    } else {
                        self.storage.delete_slot(entry.tile.slot());
                    }
                }
            }
        } else if !current {
            tracing::trace!(cache = %self.name, coord = %key.1, "Discarding result of superseded task");
        }
        state.deferred.process(self.storage.as_ref());
    }

    /// Drop a tile whose task could not be started.
    pub(crate) fn abort(&self, tile: &Arc<Tile>, task: &Arc<CreateTileTask>, error: &Error) {
        let released = task.finish(&Err(Error::TaskFailed(error.to_string())));
        debug_assert!(released.is_empty());
        self.complete(task, &Err(Error::TaskFailed(error.to_string())));
        tracing::debug!(cache = %self.name, coord = %tile.coord(), "Aborted tile creation");
    }

    /// Mark one tile stale. Returns false if the tile is not resident.
    ///
    /// An unused tile is dropped at once. A tile in use keeps its contents
    /// until the next `get_tile`, which schedules a new task; a task already
    /// running for it finishes and its result is discarded.
    pub fn invalidate_tile(&self, producer: ProducerId, coord: TileCoord) -> bool {
        let mut released = Released::new();
        let found = {
            let mut guard = self.state.lock();
            self.invalidate_locked(&mut guard, (producer, coord), &mut released)
        };
        release_acquired(released);
        found
    }

    /// Mark every tile of one producer stale.
    pub fn invalidate_producer(&self, producer: ProducerId) {
        self.invalidate_where(|key| key.0 == producer);
    }

    /// Mark every tile stale.
    pub fn invalidate_all(&self) {
        self.invalidate_where(|_| true);
    }

    fn invalidate_where(&self, filter: impl Fn(&TileKey) -> bool) {
        let mut released = Released::new();
        {
            let mut guard = self.state.lock();
            let keys: Vec<TileKey> = guard.entries.keys().copied().filter(|k| filter(k)).collect();
            tracing::debug!(cache = %self.name, tiles = keys.len(), "Invalidating tiles");
            for key in keys {
                self.invalidate_locked(&mut guard, key, &mut released);
            }
        }
        release_acquired(released);
    }

    fn invalidate_locked(&self, state: &mut CacheState, key: TileKey, released: &mut Released) -> bool {
        let Some(entry) = state.entries.get_mut(&key) else {
            return false;
        };
        if entry.tile.users() > 0 {
            entry.stale = true;
            return true;
        }
        let Some(entry) = state.entries.remove(&key) else {
            return false;
        };
        if let Some(stamp) = entry.lru_stamp {
            state.unused.remove(&stamp);
        }
        let task = entry.tile.task();
        if let Some(acquired) = task.try_cancel() {
            released.extend(acquired);
            self.storage.delete_slot(entry.tile.slot());
        } else if task.writes_pending() {
            state.deferred.queue(entry.tile.slot(), task);
        } else {
            self.storage.delete_slot(entry.tile.slot());
        }
        true
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            used: state.entries.len() - state.unused.len(),
            unused: state.unused.len(),
            deferred: state.deferred.pending_count(),
            ..state.stats
        }
    }

    /// Number of resident tiles.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

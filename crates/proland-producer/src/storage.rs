//! Fixed-capacity slot pools shared by every tile storage.

use std::any::Any;

use parking_lot::Mutex;
use proland_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Index of one slot in a tile storage pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub u32);

impl SlotId {
    /// Position of the slot in the pool.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// A fixed pool of equally sized tile slots.
///
/// Tile size and capacity never change after construction. A slot returned
/// by [`TileStorage::new_slot`] belongs to exactly one tile until it is given
/// back with [`TileStorage::delete_slot`]; its contents are undefined after that.
pub trait TileStorage: Send + Sync + 'static {
    /// Width and height of a slot, in samples.
    fn tile_size(&self) -> u32;

    /// Total number of slots.
    fn capacity(&self) -> usize;

    /// Number of slots not handed out.
    fn free_slots(&self) -> usize;

    /// Take a free slot, or fail with [`Error::Exhausted`].
    fn new_slot(&self) -> Result<SlotId>;

    /// Return a slot to the free list.
    fn delete_slot(&self, slot: SlotId);

    /// Access to the concrete storage for layers and samplers.
    fn as_any(&self) -> &dyn Any;
}

/// Free-list bookkeeping for a fixed number of slots.
///
/// Slots are handed out in index order; released slots are re-used first.
#[derive(Debug)]
pub struct SlotPool {
    capacity: usize,
    inner: Mutex<PoolState>,
}

#[derive(Debug)]
struct PoolState {
    free_list: Vec<u32>,
    in_use: Vec<bool>,
}

impl SlotPool {
    /// Create a new pool with every slot free.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(PoolState {
                free_list: (0..capacity as u32).rev().collect(),
                in_use: vec![false; capacity],
            }),
        }
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free_list.len()
    }

    /// Take a free slot.
    pub fn allocate(&self) -> Result<SlotId> {
        let mut inner = self.inner.lock();
        let index = inner.free_list.pop().ok_or(Error::Exhausted {
            capacity: self.capacity,
        })?;
        inner.in_use[index as usize] = true;
        Ok(SlotId(index))
    }

    /// Give a slot back.
    ///
    /// # Panics
    /// Panics if the slot is out of range or already free.
    pub fn release(&self, slot: SlotId) {
        let mut inner = self.inner.lock();
        assert!(
            slot.index() < self.capacity && inner.in_use[slot.index()],
            "{slot} released twice or never allocated"
        );
        inner.in_use[slot.index()] = false;
        inner.free_list.push(slot.0);
    }

    pub fn is_in_use(&self, slot: SlotId) -> bool {
        self.inner
            .lock()
            .in_use
            .get(slot.index())
            .copied()
            .unwrap_or(false)
    }
}

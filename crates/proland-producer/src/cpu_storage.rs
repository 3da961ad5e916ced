//! Tile storage backed by host memory.

use std::any::Any;

use bytemuck::Pod;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use proland_core::Result;

use crate::storage::{SlotId, SlotPool, TileStorage};

/// A pool of typed host buffers, one of `tile_size² × channels` elements per slot.
pub struct CpuTileStorage<T: Pod + Send + Sync> {
    tile_size: u32,
    channels: u32,
    pool: SlotPool,
    slots: Vec<RwLock<Vec<T>>>,
}

impl<T: Pod + Send + Sync> CpuTileStorage<T> {
    /// Create a new storage with zero-filled slots.
    pub fn new(tile_size: u32, channels: u32, capacity: usize) -> Self {
        let len = (tile_size as usize).pow(2) * channels as usize;
        let slots = (0..capacity)
            .map(|_| RwLock::new(vec![T::zeroed(); len]))
            .collect();
        tracing::debug!(
            tile_size,
            channels,
            capacity,
            bytes = len * capacity * std::mem::size_of::<T>(),
            "Created CPU tile storage"
        );
        Self {
            tile_size,
            channels,
            pool: SlotPool::new(capacity),
            slots,
        }
    }

    pub const fn channels(&self) -> u32 {
        self.channels
    }

    /// Number of elements in one slot.
    pub fn slot_len(&self) -> usize {
        (self.tile_size as usize).pow(2) * self.channels as usize
    }

    /// Read access to a slot's samples.
    pub fn read(&self, slot: SlotId) -> RwLockReadGuard<'_, Vec<T>> {
        self.slots[slot.index()].read()
    }

    /// Write access to a slot's samples.
    ///
    /// Only the create-tile step that owns the slot may write.
    pub fn write(&self, slot: SlotId) -> RwLockWriteGuard<'_, Vec<T>> {
        self.slots[slot.index()].write()
    }
}

impl<T: Pod + Send + Sync> TileStorage for CpuTileStorage<T> {
    fn tile_size(&self) -> u32 {
        self.tile_size
    }

    fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    fn free_slots(&self) -> usize {
        self.pool.free_count()
    }

    fn new_slot(&self) -> Result<SlotId> {
        self.pool.allocate()
    }

    fn delete_slot(&self, slot: SlotId) {
        self.pool.release(slot);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_have_requested_layout() {
        let storage = CpuTileStorage::<f32>::new(4, 2, 3);
        assert_eq!(storage.tile_size(), 4);
        assert_eq!(storage.capacity(), 3);
        assert_eq!(storage.slot_len(), 32);
        let slot = storage.new_slot().unwrap();
        assert_eq!(storage.read(slot).len(), 32);
        assert_eq!(storage.free_slots(), 2);
    }

    #[test]
    fn writes_are_visible_to_readers() {
        let storage = CpuTileStorage::<i16>::new(2, 1, 1);
        let slot = storage.new_slot().unwrap();
        storage.write(slot).copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(storage.read(slot).as_slice(), &[1, 2, 3, 4]);
        storage.delete_slot(slot);
        assert_eq!(storage.free_slots(), 1);
    }

    #[test]
    fn downcasts_through_trait_object() {
        let storage: Box<dyn TileStorage> = Box::new(CpuTileStorage::<u8>::new(8, 4, 1));
        assert!(storage.as_any().downcast_ref::<CpuTileStorage<u8>>().is_some());
        assert!(storage.as_any().downcast_ref::<CpuTileStorage<f32>>().is_none());
    }
}

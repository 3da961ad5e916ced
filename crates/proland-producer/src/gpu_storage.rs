//! Tile storage backed by the layers of one GPU array texture.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use proland_core::{Error, Result};

use crate::gpu::{FrameBufferHandle, GpuBackend, TextureFormat, TextureHandle};
use crate::storage::{SlotId, SlotPool, TileStorage};

/// Sent to subscribers every time a slot's layer is written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotChanged {
    pub slot: SlotId,
    /// Value of the storage change counter after this write.
    pub change: u64,
}

/// A pool of array-texture layers, one per slot.
pub struct GpuTileStorage {
    backend: Arc<dyn GpuBackend>,
    texture: TextureHandle,
    format: TextureFormat,
    tile_size: u32,
    pool: SlotPool,
    changes: AtomicU64,
    subscribers: Mutex<Vec<Sender<SlotChanged>>>,
}

impl GpuTileStorage {
    /// Create a new storage, allocating its array texture on the backend.
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        tile_size: u32,
        capacity: usize,
        format: TextureFormat,
    ) -> Result<Self> {
        let texture =
            backend.create_texture_array(format, tile_size, tile_size, capacity as u32)?;
        tracing::debug!(tile_size, capacity, ?format, "Created GPU tile storage");
        Ok(Self {
            backend,
            texture,
            format,
            tile_size,
            pool: SlotPool::new(capacity),
            changes: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub const fn texture(&self) -> TextureHandle {
        self.texture
    }

    pub const fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    /// Copy a framebuffer rectangle into the slot's layer.
    pub fn copy_pixels(
        &self,
        slot: SlotId,
        framebuffer: FrameBufferHandle,
        origin: (u32, u32),
        size: (u32, u32),
    ) -> Result<()> {
        self.check_slot(slot)?;
        self.backend
            .copy_to_layer(framebuffer, origin, size, self.texture, slot.0)?;
        self.notify(slot);
        Ok(())
    }

    /// Upload tightly packed texels into the slot's layer.
    pub fn write_slot(&self, slot: SlotId, pixels: &[u8]) -> Result<()> {
        self.check_slot(slot)?;
        self.backend.write_layer(self.texture, slot.0, pixels)?;
        self.notify(slot);
        Ok(())
    }

    /// Read the slot's layer back to host memory.
    pub fn get_image(&self, slot: SlotId) -> Result<Vec<u8>> {
        self.check_slot(slot)?;
        self.backend.read_layer(self.texture, slot.0)
    }

    /// Receive a [`SlotChanged`] for every subsequent write.
    pub fn subscribe(&self) -> Receiver<SlotChanged> {
        let (tx, rx) = channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Number of writes since creation.
    pub fn change_count(&self) -> u64 {
        self.changes.load(Ordering::Acquire)
    }

    fn check_slot(&self, slot: SlotId) -> Result<()> {
        if slot.index() >= self.pool.capacity() {
            return Err(Error::OutOfBounds(format!(
                "{slot} in a storage of {} slots",
                self.pool.capacity()
            )));
        }
        Ok(())
    }

    fn notify(&self, slot: SlotId) {
        let change = self.changes.fetch_add(1, Ordering::AcqRel) + 1;
        // Drop subscribers whose receiver is gone.
        self.subscribers
            .lock()
            .retain(|tx| tx.send(SlotChanged { slot, change }).is_ok());
    }
}

impl TileStorage for GpuTileStorage {
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

impl Drop for GpuTileStorage {
    fn drop(&mut self) {
        self.backend.release_texture(self.texture);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HostBackend;

    fn storage() -> GpuTileStorage {
        GpuTileStorage::new(Arc::new(HostBackend::new()), 2, 2, TextureFormat::R8).unwrap()
    }

    #[test]
    fn writes_notify_subscribers() {
        let storage = storage();
        let rx = storage.subscribe();
        let slot = storage.new_slot().unwrap();
        storage.write_slot(slot, &[9, 8, 7, 6]).unwrap();
        assert_eq!(rx.try_recv().unwrap(), SlotChanged { slot, change: 1 });
        assert_eq!(storage.get_image(slot).unwrap(), vec![9, 8, 7, 6]);
        assert_eq!(storage.change_count(), 1);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let storage = storage();
        drop(storage.subscribe());
        let slot = storage.new_slot().unwrap();
        storage.write_slot(slot, &[0; 4]).unwrap();
        assert!(storage.subscribers.lock().is_empty());
    }

    #[test]
    fn copy_pixels_from_framebuffer() {
        let backend = Arc::new(HostBackend::new());
        let storage =
            GpuTileStorage::new(backend.clone(), 2, 1, TextureFormat::R8).unwrap();
        let fb = backend.create_framebuffer(TextureFormat::R8, 2, 2).unwrap();
        backend.draw_pixels(fb, (0, 0), (2, 2), &[1, 1, 2, 2]).unwrap();
        let slot = storage.new_slot().unwrap();
        storage.copy_pixels(slot, fb, (0, 0), (2, 2)).unwrap();
        assert_eq!(storage.get_image(slot).unwrap(), vec![1, 1, 2, 2]);
        assert!(storage.copy_pixels(SlotId(5), fb, (0, 0), (2, 2)).is_err());
    }
}

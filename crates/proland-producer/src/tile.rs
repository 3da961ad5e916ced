//! Reference-counted tiles.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use proland_core::TileCoord;

use crate::cache::ProducerId;
use crate::storage::SlotId;
use crate::task::CreateTileTask;

/// A tile of one producer, bound to one storage slot.
///
/// The use count is explicit: every successful `get_tile` must be matched by
/// exactly one `put_tile`. The count is only modified by the owning cache.
pub struct Tile {
    producer: ProducerId,
    coord: TileCoord,
    slot: SlotId,
    users: AtomicU32,
    task: Mutex<Arc<CreateTileTask>>,
}

impl Tile {
    pub(crate) fn new(task: Arc<CreateTileTask>) -> Self {
        Self {
            producer: task.producer_id(),
            coord: task.coord(),
            slot: task.slot(),
            users: AtomicU32::new(1),
            task: Mutex::new(task),
        }
    }

    pub const fn producer_id(&self) -> ProducerId {
        self.producer
    }

    pub const fn coord(&self) -> TileCoord {
        self.coord
    }

    pub const fn level(&self) -> u32 {
        self.coord.level
    }

    pub const fn tx(&self) -> u32 {
        self.coord.tx
    }

    pub const fn ty(&self) -> u32 {
        self.coord.ty
    }

    pub const fn slot(&self) -> SlotId {
        self.slot
    }

    /// The task that produces (or produced) the current contents.
    pub fn task(&self) -> Arc<CreateTileTask> {
        Arc::clone(&self.task.lock())
    }

    /// True once the current task has completed successfully.
    pub fn is_ready(&self) -> bool {
        self.task.lock().is_done()
    }

    pub fn users(&self) -> u32 {
        self.users.load(Ordering::Acquire)
    }

    pub(crate) fn acquire(&self) {
        self.users.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement the use count and return the new value.
    ///
    /// # Panics
    /// Panics if the count is already zero.
    pub(crate) fn release(&self) -> u32 {
        let previous = self.users.load(Ordering::Acquire);
        assert!(
            previous > 0,
            "put_tile on tile {} with zero users",
            self.coord
        );
        self.users.store(previous - 1, Ordering::Release);
        previous - 1
    }

    pub(crate) fn replace_task(&self, task: Arc<CreateTileTask>) -> Arc<CreateTileTask> {
        std::mem::replace(&mut *self.task.lock(), task)
    }
}

impl std::fmt::Debug for Tile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tile")
            .field("producer", &self.producer)
            .field("coord", &self.coord)
            .field("slot", &self.slot)
            .field("users", &self.users())
            .field("ready", &self.is_ready())
            .finish()
    }
}

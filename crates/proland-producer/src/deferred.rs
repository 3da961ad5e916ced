//! Deferred slot release for tiles dropped while their task is in flight.
//!
//! A slot cannot go back to the free list while a create-tile task may still
//! write into it. Such slots are parked here with the task that holds them and
//! released once that task has finished, successfully or not.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::storage::{SlotId, TileStorage};
use crate::task::CreateTileTask;

/// A slot waiting for its writer to finish.
pub struct PendingRelease {
    pub slot: SlotId,
    /// Task that may still write into the slot, directly or through an
    /// earlier writer.
    pub task: Arc<CreateTileTask>,
}

/// Queue of slots released once their task has finished.
#[derive(Default)]
pub struct DeferredSlotRelease {
    pending: VecDeque<PendingRelease>,
}

impl DeferredSlotRelease {
    /// Create a new, empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a slot until `task` finishes.
    pub fn queue(&mut self, slot: SlotId, task: Arc<CreateTileTask>) {
        tracing::trace!(%slot, coord = %task.coord(), "Deferring slot release");
        self.pending.push_back(PendingRelease { slot, task });
    }

    /// Release every slot whose task has finished. Returns how many were freed.
    ///
    /// Tasks finish in any order, so the whole queue is scanned.
    pub fn process(&mut self, storage: &dyn TileStorage) -> usize {
        let before = self.pending.len();
        self.pending.retain(|p| {
            if p.task.writes_pending() {
                true
            } else {
                storage.delete_slot(p.slot);
                false
            }
        });
        before - self.pending.len()
    }

    /// Get the number of pending releases.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if `slot` is parked here.
    pub fn contains(&self, slot: SlotId) -> bool {
        self.pending.iter().any(|p| p.slot == slot)
    }
}

//! Tile layers: extra steps a producer runs on its own slots.

use proland_core::{Result, TileCoord};

use crate::producer::Producer;
use crate::storage::{SlotId, TileStorage};
use crate::task::{CreateTileTask, TaskBuilder};

/// An additive step run by a host producer after its own `do_create_tile`.
///
/// Layers run in registration order and write over the same slot. A layer
/// that needs tiles from other producers acquires them in
/// [`start_create_tile`](TileLayer::start_create_tile); they are released with
/// the host's own acquisitions once the task has run.
pub trait TileLayer: Send + Sync {
    fn name(&self) -> &str;

    /// Producers this layer reads from.
    fn referenced_producers(&self) -> Vec<Producer> {
        Vec::new()
    }

    fn start_create_tile(&self, _coord: TileCoord, _builder: &mut TaskBuilder) -> Result<()> {
        Ok(())
    }

    /// Modify the slot that the host producer just filled.
    fn do_create_tile(
        &self,
        coord: TileCoord,
        slot: SlotId,
        storage: &dyn TileStorage,
        task: &CreateTileTask,
    ) -> Result<()>;

    fn stop_create_tile(&self, _coord: TileCoord) {}
}

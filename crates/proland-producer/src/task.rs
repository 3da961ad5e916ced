//! Create-tile tasks, deadlines and the builder used by `start_create_tile`.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use proland_core::{Result, TileCoord};
use serde::{Deserialize, Serialize};

use crate::cache::ProducerId;
use crate::producer::{Producer, WeakProducer};
use crate::storage::SlotId;
use crate::tile::Tile;

/// Unique id of a create-tile task.
pub type TaskId = u64;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Frame by which a task should have completed.
///
/// `0` means "this frame", a positive value is a frame number, and
/// [`Deadline::BACKGROUND`] is used for prefetching.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Deadline(u32);

impl Deadline {
    pub const IMMEDIATE: Self = Self(0);
    pub const BACKGROUND: Self = Self(u32::MAX);

    /// Deadline at the given frame number.
    pub const fn frame(frame: u32) -> Self {
        Self(frame)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// Returns true if a task with this deadline must run during `frame`.
    pub const fn is_due(self, frame: u32) -> bool {
        self.0 <= frame
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::IMMEDIATE
    }
}

/// Life cycle of a create-tile task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskState {
    /// Created by the cache; `start_create_tile` has not finished yet.
    Created = 0,
    /// Waiting for the scheduler.
    Pending = 1,
    Running = 2,
    Done = 3,
    Failed = 4,
}

impl TaskState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Pending,
            2 => Self::Running,
            3 => Self::Done,
            _ => Self::Failed,
        }
    }

    /// Done or failed.
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Whether a pending task can run now.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// A dependency has not finished yet.
    Waiting,
    /// A dependency failed; the task must fail without running.
    DependencyFailed(String),
}

#[derive(Default)]
struct TaskLinks {
    producer: Option<WeakProducer>,
    dependencies: Vec<Arc<CreateTileTask>>,
    /// Earlier task writing the same slot; ordering only.
    after: Option<Arc<CreateTileTask>>,
    acquired: Vec<(WeakProducer, Arc<Tile>)>,
}

/// The work that populates one tile's slot.
pub struct CreateTileTask {
    id: TaskId,
    producer_id: ProducerId,
    coord: TileCoord,
    slot: SlotId,
    deadline: AtomicU32,
    state: AtomicU8,
    links: Mutex<TaskLinks>,
    error: Mutex<Option<String>>,
}

impl CreateTileTask {
    pub(crate) fn new(
        producer_id: ProducerId,
        coord: TileCoord,
        slot: SlotId,
        deadline: Deadline,
        after: Option<Arc<Self>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            producer_id,
            coord,
            slot,
            deadline: AtomicU32::new(deadline.value()),
            state: AtomicU8::new(TaskState::Created as u8),
            links: Mutex::new(TaskLinks {
                after,
                ..TaskLinks::default()
            }),
            error: Mutex::new(None),
        })
    }

    pub const fn id(&self) -> TaskId {
        self.id
    }

    pub const fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    pub const fn coord(&self) -> TileCoord {
        self.coord
    }

    pub const fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn deadline(&self) -> Deadline {
        Deadline(self.deadline.load(Ordering::Acquire))
    }

    /// Move the deadline earlier; later deadlines are ignored.
    pub fn lower_deadline(&self, deadline: Deadline) {
        self.deadline.fetch_min(deadline.value(), Ordering::AcqRel);
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_done(&self) -> bool {
        self.state() == TaskState::Done
    }

    pub fn is_failed(&self) -> bool {
        self.state() == TaskState::Failed
    }

    /// Not yet done or failed; the slot may still be written.
    pub fn is_in_flight(&self) -> bool {
        !self.state().is_finished()
    }

    /// Earlier task of the same slot that may still write it.
    pub fn pending_writer(&self) -> Option<Arc<Self>> {
        let after = self.links.lock().after.clone()?;
        after.writes_pending().then_some(after)
    }

    /// This task or an earlier writer of its slot may still write it.
    pub fn writes_pending(&self) -> bool {
        self.is_in_flight() || self.pending_writer().is_some()
    }

    /// Failure message, if the task failed.
    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    /// Producer that runs this task, if it is still alive.
    pub fn producer(&self) -> Option<Producer> {
        self.links.lock().producer.as_ref().and_then(WeakProducer::upgrade)
    }

    /// Tasks that must finish before this one starts.
    pub fn dependencies(&self) -> Vec<Arc<Self>> {
        let links = self.links.lock();
        links
            .dependencies
            .iter()
            .chain(links.after.iter())
            .cloned()
            .collect()
    }

    /// A tile acquired by `start_create_tile`, looked up by owner and coordinate.
    pub fn acquired_tile(&self, producer: ProducerId, coord: TileCoord) -> Option<Arc<Tile>> {
        self.links
            .lock()
            .acquired
            .iter()
            .map(|(_, tile)| tile)
            .find(|tile| tile.producer_id() == producer && tile.coord() == coord)
            .cloned()
    }

    /// A tile acquired through `producer` by `start_create_tile`.
    ///
    /// Unlike [`acquired_tile`](Self::acquired_tile) this also finds tiles
    /// that `producer` forwarded to one of its delegates.
    pub fn acquired_from(&self, producer: &Producer, coord: TileCoord) -> Option<Arc<Tile>> {
        self.links
            .lock()
            .acquired
            .iter()
            .find(|(owner, tile)| owner.is(producer) && tile.coord() == coord)
            .map(|(_, tile)| Arc::clone(tile))
    }

    /// Check dependencies of a pending task.
    ///
    /// A task never fails while an earlier writer of its slot is in flight.
    pub fn readiness(&self) -> Readiness {
        if self.pending_writer().is_some() {
            return Readiness::Waiting;
        }
        let links = self.links.lock();
        for dep in &links.dependencies {
            match dep.state() {
                TaskState::Done => {}
                TaskState::Failed => {
                    return Readiness::DependencyFailed(format!(
                        "dependency {} failed",
                        dep.coord()
                    ))
                }
                _ => return Readiness::Waiting,
            }
        }
        Readiness::Ready
    }

    /// Record what `start_create_tile` acquired and hand the task to schedulers.
    pub(crate) fn bind(&self, producer: WeakProducer, builder: TaskBuilder) {
        let mut links = self.links.lock();
        links.producer = Some(producer);
        links.dependencies = builder.dependencies;
        links.acquired = builder
            .acquired
            .into_iter()
            .map(|(p, tile)| (p.downgrade(), tile))
            .collect();
        drop(links);
        self.state
            .store(TaskState::Pending as u8, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn mark_pending(&self) {
        self.state.store(TaskState::Pending as u8, Ordering::Release);
    }

    /// Claim the task for execution. Only one caller wins.
    pub(crate) fn try_start(&self) -> bool {
        self.state
            .compare_exchange(
                TaskState::Pending as u8,
                TaskState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Cancel a task that no scheduler has started yet.
    ///
    /// Returns the acquired tiles to release, or `None` if the task is
    /// already running, finished or still being started.
    pub(crate) fn try_cancel(&self) -> Option<Vec<(WeakProducer, Arc<Tile>)>> {
        self.state
            .compare_exchange(
                TaskState::Pending as u8,
                TaskState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()?;
        Some(self.finish(&Err(proland_core::Error::TaskFailed(format!(
            "task for {} cancelled",
            self.coord
        )))))
    }

    /// Mark the task finished and detach everything it was holding.
    ///
    /// An earlier writer still in flight stays linked so the slot is not
    /// released under it. Returns the acquired tiles so the caller can
    /// release them.
    pub(crate) fn finish(&self, result: &Result<()>) -> Vec<(WeakProducer, Arc<Tile>)> {
        let writer = self.pending_writer();
        let acquired = {
            let mut links = self.links.lock();
            links.dependencies.clear();
            links.after = writer;
            std::mem::take(&mut links.acquired)
        };
        let state = match result {
            Ok(()) => TaskState::Done,
            Err(e) => {
                *self.error.lock() = Some(e.to_string());
                TaskState::Failed
            }
        };
        self.state.store(state as u8, Ordering::Release);
        acquired
    }
}

impl std::fmt::Debug for CreateTileTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreateTileTask")
            .field("id", &self.id)
            .field("producer", &self.producer_id)
            .field("coord", &self.coord)
            .field("slot", &self.slot)
            .field("deadline", &self.deadline())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Collects the delegate tiles and dependencies of a task being started.
///
/// Every tile acquired here is released once the task has run.
pub struct TaskBuilder {
    coord: TileCoord,
    deadline: Deadline,
    dependencies: Vec<Arc<CreateTileTask>>,
    acquired: Vec<(Producer, Arc<Tile>)>,
}

impl TaskBuilder {
    pub(crate) const fn new(coord: TileCoord, deadline: Deadline) -> Self {
        Self {
            coord,
            deadline,
            dependencies: Vec::new(),
            acquired: Vec::new(),
        }
    }

    /// Coordinate of the tile being created.
    pub const fn coord(&self) -> TileCoord {
        self.coord
    }

    pub const fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// Get a tile from `producer` with this task's deadline and depend on its task.
    pub fn acquire(&mut self, producer: &Producer, coord: TileCoord) -> Result<Arc<Tile>> {
        let tile = producer.get_tile(coord, self.deadline)?;
        let task = tile.task();
        if !task.is_done() {
            self.add_dependency(task);
        }
        self.acquired.push((producer.clone(), Arc::clone(&tile)));
        Ok(tile)
    }

    /// Depend on a task without holding its tile.
    pub fn add_dependency(&mut self, task: Arc<CreateTileTask>) {
        if !self.dependencies.iter().any(|t| t.id() == task.id()) {
            self.dependencies.push(task);
        }
    }

    pub fn acquired_count(&self) -> usize {
        self.acquired.len()
    }

    /// Give back every tile acquired so far.
    pub(crate) fn release_all(self) {
        for (producer, tile) in self.acquired {
            producer.put_tile(&tile);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlines_order_and_due() {
        assert!(Deadline::IMMEDIATE < Deadline::frame(3));
        assert!(Deadline::frame(3) < Deadline::BACKGROUND);
        assert!(Deadline::IMMEDIATE.is_due(0));
        assert!(Deadline::frame(3).is_due(3));
        assert!(!Deadline::frame(4).is_due(3));
        assert!(!Deadline::BACKGROUND.is_due(u32::MAX - 1));
    }

    #[test]
    fn deadline_only_moves_earlier() {
        let task = CreateTileTask::new(
            ProducerId(0),
            TileCoord::ROOT,
            SlotId(0),
            Deadline::frame(10),
            None,
        );
        task.lower_deadline(Deadline::frame(20));
        assert_eq!(task.deadline(), Deadline::frame(10));
        task.lower_deadline(Deadline::frame(2));
        assert_eq!(task.deadline(), Deadline::frame(2));
    }

    #[test]
    fn unbound_task_cannot_start() {
        let task = CreateTileTask::new(
            ProducerId(0),
            TileCoord::ROOT,
            SlotId(0),
            Deadline::IMMEDIATE,
            None,
        );
        assert_eq!(task.state(), TaskState::Created);
        assert!(!task.try_start());
        assert!(task.is_in_flight());
    }

    #[test]
    fn waits_for_earlier_writer_of_same_slot() {
        let earlier = CreateTileTask::new(
            ProducerId(0),
            TileCoord::ROOT,
            SlotId(0),
            Deadline::IMMEDIATE,
            None,
        );
        let later = CreateTileTask::new(
            ProducerId(0),
            TileCoord::ROOT,
            SlotId(0),
            Deadline::IMMEDIATE,
            Some(Arc::clone(&earlier)),
        );
        assert_eq!(later.readiness(), Readiness::Waiting);
        earlier.finish(&Err(proland_core::Error::TaskFailed("boom".into())));
        // A failed earlier writer only orders the slot; it does not fail the later task.
        assert_eq!(later.readiness(), Readiness::Ready);
        assert_eq!(earlier.error().as_deref(), Some("Tile creation failed: boom"));
    }

    fn pending(coord: TileCoord, after: Option<Arc<CreateTileTask>>) -> Arc<CreateTileTask> {
        let task = CreateTileTask::new(ProducerId(0), coord, SlotId(0), Deadline::IMMEDIATE, after);
        task.mark_pending();
        task
    }

    #[test]
    fn failed_dependency_waits_for_earlier_writer() {
        let earlier = pending(TileCoord::ROOT, None);
        assert!(earlier.try_start());
        let dependency = pending(TileCoord::new(1, 0, 0), None);
        dependency.finish(&Err(proland_core::Error::TaskFailed("missing".into())));

        let later = pending(TileCoord::ROOT, Some(Arc::clone(&earlier)));
        later.links.lock().dependencies.push(dependency);
        assert_eq!(later.readiness(), Readiness::Waiting);

        earlier.finish(&Ok(()));
        assert!(matches!(later.readiness(), Readiness::DependencyFailed(_)));
    }

    #[test]
    fn finished_task_keeps_running_writer() {
        let earlier = pending(TileCoord::ROOT, None);
        assert!(earlier.try_start());
        let later = pending(TileCoord::ROOT, Some(Arc::clone(&earlier)));
        assert!(later.try_cancel().is_some());

        assert!(!later.is_in_flight());
        assert!(later.writes_pending());
        assert_eq!(later.pending_writer().map(|t| t.id()), Some(earlier.id()));

        earlier.finish(&Ok(()));
        assert!(!later.writes_pending());
        assert!(later.pending_writer().is_none());
    }
}

//! Tile producers and the handle through which they are used.
//!
//! A producer turns a `(level, tx, ty, slot)` request into a populated slot.
//! Implementors provide the [`TileProducer`] hooks; everything else (cache
//! access, delegation, layers, running tasks) is done by the [`Producer`]
//! handle.
//!
//! Create-tile protocol for one task:
//! 1. `start_create_tile` acquires delegate tiles through a [`TaskBuilder`],
//!    then every layer's start hook runs.
//! 2. `begin_create_tile` once per batch of tasks of this producer.
//! 3. `do_create_tile`, then every layer's `do_create_tile` in order.
//! 4. `end_create_tile` once per batch.
//! 5. `stop_create_tile`; the tiles acquired in step 1 are released.

use std::any::Any;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use proland_core::{Error, Result, TileCoord};

use crate::cache::{ProducerId, TileCache};
use crate::graph::TaskGraph;
use crate::layer::TileLayer;
use crate::scheduler::Scheduler;
use crate::storage::SlotId;
use crate::task::{CreateTileTask, Deadline, Readiness, TaskBuilder};
use crate::tile::Tile;
use crate::zrange::ZRangeReader;

/// State shared by every producer: identity, cache registration and layers.
pub struct ProducerBase {
    id: ProducerId,
    name: String,
    cache: Arc<TileCache>,
    border: u32,
    root_quad_size: RwLock<f64>,
    layers: RwLock<Vec<Arc<dyn TileLayer>>>,
}

impl ProducerBase {
    /// Create a new base registered with `cache`.
    pub fn new(name: impl Into<String>, cache: Arc<TileCache>) -> Self {
        let id = cache.register_producer();
        Self {
            id,
            name: name.into(),
            cache,
            border: 0,
            root_quad_size: RwLock::new(0.0),
            layers: RwLock::new(Vec::new()),
        }
    }

    /// Samples around each tile that overlap its neighbors.
    #[must_use]
    pub const fn with_border(mut self, border: u32) -> Self {
        self.border = border;
        self
    }

    #[must_use]
    pub fn with_root_quad_size(self, size: f64) -> Self {
        *self.root_quad_size.write() = size;
        self
    }

    pub const fn id(&self) -> ProducerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn cache(&self) -> &Arc<TileCache> {
        &self.cache
    }

    pub const fn border(&self) -> u32 {
        self.border
    }

    /// Slot size of the backing storage, border included.
    pub fn tile_size(&self) -> u32 {
        self.cache.storage().tile_size()
    }

    /// Physical size of the root quad this producer covers.
    pub fn root_quad_size(&self) -> f64 {
        *self.root_quad_size.read()
    }

    pub fn set_root_quad_size(&self, size: f64) {
        *self.root_quad_size.write() = size;
    }

    pub fn layers(&self) -> Vec<Arc<dyn TileLayer>> {
        self.layers.read().clone()
    }

    pub fn add_layer(&self, layer: Arc<dyn TileLayer>) {
        tracing::debug!(producer = %self.name, layer = layer.name(), "Added layer");
        self.layers.write().push(layer);
    }
}

/// The hooks a concrete producer implements.
pub trait TileProducer: Send + Sync + 'static {
    fn base(&self) -> &ProducerBase;

    /// Access to the concrete producer.
    fn as_any(&self) -> &dyn Any;

    /// Whether this producer can produce the tile at all.
    fn has_tile(&self, coord: TileCoord) -> bool {
        coord.is_valid()
    }

    /// Another producer that answers every request for `coord`.
    fn delegate(&self, _coord: TileCoord) -> Option<Producer> {
        None
    }

    /// Producers this one reads from (its layers' are added by the handle).
    fn referenced_producers(&self) -> Vec<Producer> {
        Vec::new()
    }

    /// Whether `do_create_tile` must run on the render thread.
    fn uses_gpu(&self) -> bool {
        false
    }

    /// Elevation range access, for producers of height tiles.
    fn z_range_reader(&self) -> Option<&dyn ZRangeReader> {
        None
    }

    /// Acquire the tiles the new tile is computed from.
    fn start_create_tile(
        &self,
        _this: &Producer,
        _coord: TileCoord,
        _builder: &mut TaskBuilder,
    ) -> Result<()> {
        Ok(())
    }

    /// Bind execution context for a batch of tasks.
    fn begin_create_tile(&self) -> Result<()> {
        Ok(())
    }

    /// Fill `slot` with the tile's data.
    fn do_create_tile(&self, coord: TileCoord, slot: SlotId, task: &CreateTileTask) -> Result<()>;

    /// Restore the context bound by `begin_create_tile`.
    fn end_create_tile(&self) -> Result<()> {
        Ok(())
    }

    fn stop_create_tile(&self, _coord: TileCoord) {}
}

/// Outcome of running one task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Not runnable now (dependencies pending) or claimed by someone else.
    Skipped,
    Done,
    Failed,
}

/// Shared handle to a producer.
#[derive(Clone)]
pub struct Producer(Arc<dyn TileProducer>);

/// Non-owning producer handle.
#[derive(Clone)]
pub struct WeakProducer(Weak<dyn TileProducer>);

impl WeakProducer {
    pub fn upgrade(&self) -> Option<Producer> {
        self.0.upgrade().map(Producer)
    }

    /// Whether this handle points at `producer`.
    pub fn is(&self, producer: &Producer) -> bool {
        std::ptr::addr_eq(self.0.as_ptr(), Arc::as_ptr(&producer.0))
    }
}

impl Producer {
    /// Create a new handle owning `producer`.
    pub fn new<P: TileProducer>(producer: P) -> Self {
        Self(Arc::new(producer))
    }

    pub fn from_arc(producer: Arc<dyn TileProducer>) -> Self {
        Self(producer)
    }

    pub fn downgrade(&self) -> WeakProducer {
        WeakProducer(Arc::downgrade(&self.0))
    }

    /// The concrete producer, if it has type `P`.
    pub fn downcast_ref<P: TileProducer>(&self) -> Option<&P> {
        self.0.as_any().downcast_ref::<P>()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn inner(&self) -> &dyn TileProducer {
        self.0.as_ref()
    }

    pub fn base(&self) -> &ProducerBase {
        self.0.base()
    }

    pub fn id(&self) -> ProducerId {
        self.base().id()
    }

    pub fn name(&self) -> &str {
        self.base().name()
    }

    pub fn cache(&self) -> &Arc<TileCache> {
        self.base().cache()
    }

    pub fn border(&self) -> u32 {
        self.base().border()
    }

    pub fn tile_size(&self) -> u32 {
        self.base().tile_size()
    }

    pub fn root_quad_size(&self) -> f64 {
        self.base().root_quad_size()
    }

    pub fn uses_gpu(&self) -> bool {
        self.0.uses_gpu()
    }

    pub fn add_layer(&self, layer: Arc<dyn TileLayer>) {
        self.base().add_layer(layer);
    }

    pub fn z_range_reader(&self) -> Option<&dyn ZRangeReader> {
        self.0.z_range_reader()
    }

    /// Whether the tile exists, following delegates.
    pub fn has_tile(&self, coord: TileCoord) -> bool {
        match self.0.delegate(coord) {
            Some(delegate) => delegate.has_tile(coord),
            None => self.0.has_tile(coord),
        }
    }

    /// Non-allocating lookup, following delegates.
    pub fn find_tile(&self, coord: TileCoord, include_cache: bool, done: bool) -> Option<Arc<Tile>> {
        match self.0.delegate(coord) {
            Some(delegate) => delegate.find_tile(coord, include_cache, done),
            None => self.cache().find_tile(self.id(), coord, include_cache, done),
        }
    }

    /// Get a tile and hold one use of it until [`put_tile`](Self::put_tile).
    ///
    /// A new tile's task is started (its delegate tiles acquired) before this
    /// returns; it runs once a scheduler receives [`task_graph`](Self::task_graph).
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn get_tile(&self, coord: TileCoord, deadline: Deadline) -> Result<Arc<Tile>> {
        if let Some(delegate) = self.0.delegate(coord) {
            return delegate.get_tile(coord, deadline);
        }
        if !self.0.has_tile(coord) {
            return Err(Error::NotFound(format!("{} has no tile {coord}", self.name())));
        }
        let acquired = self.cache().get_tile(self.id(), coord, deadline)?;
        if let Some(task) = acquired.new_task {
            self.start_task(&acquired.tile, &task, deadline)?;
        }
        Ok(acquired.tile)
    }

    fn start_task(&self, tile: &Arc<Tile>, task: &Arc<CreateTileTask>, deadline: Deadline) -> Result<()> {
        let coord = tile.coord();
        let mut builder = TaskBuilder::new(coord, deadline);
        let mut result = self.0.start_create_tile(self, coord, &mut builder);
        if result.is_ok() {
            for layer in self.base().layers() {
                result = layer.start_create_tile(coord, &mut builder);
                if result.is_err() {
                    break;
                }
            }
        }
        match result {
            Ok(()) => {
                task.bind(self.downgrade(), builder);
                Ok(())
            }
            Err(e) => {
                builder.release_all();
                self.cache().abort(tile, task, &e);
                Err(e)
            }
        }
    }

    /// Release one use of a tile obtained from [`get_tile`](Self::get_tile).
    pub fn put_tile(&self, tile: &Arc<Tile>) {
        match self.0.delegate(tile.coord()) {
            Some(delegate) => delegate.put_tile(tile),
            None => self.cache().put_tile(tile),
        }
    }

    /// Schedule a tile with a background deadline without holding it.
    ///
    /// Returns false if the tile could not be allocated.
    pub fn prefetch_tile(&self, coord: TileCoord, scheduler: &dyn Scheduler) -> bool {
        match self.get_tile(coord, Deadline::BACKGROUND) {
            Ok(tile) => {
                let graph = TaskGraph::for_tile(&tile);
                if !graph.is_empty() {
                    scheduler.schedule(graph);
                }
                self.put_tile(&tile);
                true
            }
            Err(e) => {
                tracing::debug!(producer = %self.name(), %coord, error = %e, "Prefetch skipped");
                false
            }
        }
    }

    /// The tasks that must run for `tile` to become ready.
    pub fn task_graph(&self, tile: &Arc<Tile>) -> TaskGraph {
        TaskGraph::for_tile(tile)
    }

    /// Mark one tile stale.
    pub fn invalidate_tile(&self, coord: TileCoord) -> bool {
        match self.0.delegate(coord) {
            Some(delegate) => delegate.invalidate_tile(coord),
            None => self.cache().invalidate_tile(self.id(), coord),
        }
    }

    /// Mark every tile of this producer stale.
    pub fn invalidate_tiles(&self) {
        tracing::debug!(producer = %self.name(), "Invalidating all tiles");
        self.cache().invalidate_producer(self.id());
    }

    /// Producers this one and its layers read from.
    pub fn referenced_producers(&self) -> Vec<Producer> {
        let mut producers = self.0.referenced_producers();
        for layer in self.base().layers() {
            producers.extend(layer.referenced_producers());
        }
        producers
    }

    pub(crate) fn begin_batch(&self) -> Result<()> {
        self.0.begin_create_tile()
    }

    pub(crate) fn end_batch(&self) -> Result<()> {
        self.0.end_create_tile()
    }

    /// Run one task of this producer if it is runnable.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub(crate) fn execute(&self, task: &Arc<CreateTileTask>) -> TaskOutcome {
        match task.readiness() {
            Readiness::Waiting => return TaskOutcome::Skipped,
            Readiness::DependencyFailed(reason) => {
                if !task.try_start() {
                    return TaskOutcome::Skipped;
                }
                tracing::debug!(producer = %self.name(), coord = %task.coord(), %reason, "Skipping tile");
                return self.finish_task(task, Err(Error::TaskFailed(reason)));
            }
            Readiness::Ready => {}
        }
        if !task.try_start() {
            return TaskOutcome::Skipped;
        }

        let coord = task.coord();
        let slot = task.slot();
        let mut result = self.0.do_create_tile(coord, slot, task);
        let layers = self.base().layers();
        if result.is_ok() {
            let storage = self.cache().storage();
            for layer in &layers {
                result = layer.do_create_tile(coord, slot, storage.as_ref(), task);
                if result.is_err() {
                    break;
                }
            }
        }
        self.0.stop_create_tile(coord);
        for layer in &layers {
            layer.stop_create_tile(coord);
        }
        self.finish_task(task, result)
    }

    /// Fail a task that could not be run.
    pub(crate) fn fail_task(&self, task: &Arc<CreateTileTask>, reason: String) -> TaskOutcome {
        if !task.try_start() {
            return TaskOutcome::Skipped;
        }
        self.finish_task(task, Err(Error::TaskFailed(reason)))
    }

    fn finish_task(&self, task: &Arc<CreateTileTask>, result: Result<()>) -> TaskOutcome {
        let acquired = task.finish(&result);
        self.cache().complete(task, &result);
        release_acquired(acquired);
        if result.is_ok() {
            tracing::trace!(producer = %self.name(), coord = %task.coord(), "Created tile");
            TaskOutcome::Done
        } else {
            TaskOutcome::Failed
        }
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("name", &self.name())
            .field("id", &self.id())
            .finish()
    }
}

/// Put back tiles a finished or cancelled task was holding.
pub(crate) fn release_acquired(acquired: Vec<(WeakProducer, Arc<Tile>)>) {
    for (producer, tile) in acquired {
        if let Some(producer) = producer.upgrade() {
            producer.put_tile(&tile);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_storage::CpuTileStorage;
    use crate::scheduler::InlineScheduler;
    use crate::storage::TileStorage;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Writes `level * 100 + tx * 10 + ty` into every sample.
    struct CountingProducer {
        base: ProducerBase,
        created: AtomicUsize,
        fail: Mutex<Option<TileCoord>>,
    }

    impl CountingProducer {
        fn new(capacity: usize) -> Self {
            let storage = Arc::new(CpuTileStorage::<f32>::new(2, 1, capacity));
            let cache = Arc::new(TileCache::new("counting", storage));
            Self {
                base: ProducerBase::new("counting", cache),
                created: AtomicUsize::new(0),
                fail: Mutex::new(None),
            }
        }
    }

    impl TileProducer for CountingProducer {
        fn base(&self) -> &ProducerBase {
            &self.base
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn do_create_tile(&self, coord: TileCoord, slot: SlotId, _task: &CreateTileTask) -> Result<()> {
            if *self.fail.lock() == Some(coord) {
                return Err(Error::Io(std::io::Error::other("bad strip")));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            let storage = self
                .base
                .cache()
                .storage_as::<CpuTileStorage<f32>>()
                .ok_or_else(|| Error::InvalidData("storage type".into()))?;
            let value = (coord.level * 100 + coord.tx * 10 + coord.ty) as f32;
            storage.write(slot).fill(value);
            Ok(())
        }
    }

    /// Sums its parent tile from a delegate into its own slot.
    struct ChildProducer {
        base: ProducerBase,
        source: Producer,
    }

    impl TileProducer for ChildProducer {
        fn base(&self) -> &ProducerBase {
            &self.base
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn referenced_producers(&self) -> Vec<Producer> {
            vec![self.source.clone()]
        }

        fn start_create_tile(&self, _this: &Producer, coord: TileCoord, builder: &mut TaskBuilder) -> Result<()> {
            builder.acquire(&self.source, coord)?;
            Ok(())
        }

        fn do_create_tile(&self, coord: TileCoord, slot: SlotId, task: &CreateTileTask) -> Result<()> {
            let source_tile = task
                .acquired_tile(self.source.id(), coord)
                .ok_or_else(|| Error::NotFound("source tile".into()))?;
            let source = self.source.cache().storage_as::<CpuTileStorage<f32>>().unwrap();
            let own = self.base.cache().storage_as::<CpuTileStorage<f32>>().unwrap();
            let value = source.read(source_tile.slot())[0];
            own.write(slot).fill(value + 1.0);
            Ok(())
        }
    }

    struct AddLayer;

    impl TileLayer for AddLayer {
        fn name(&self) -> &str {
            "add"
        }

        fn do_create_tile(
            &self,
            _coord: TileCoord,
            slot: SlotId,
            storage: &dyn TileStorage,
            _task: &CreateTileTask,
        ) -> Result<()> {
            let storage = storage.as_any().downcast_ref::<CpuTileStorage<f32>>().unwrap();
            storage.write(slot).iter_mut().for_each(|v| *v += 0.5);
            Ok(())
        }
    }

    fn value(producer: &Producer, tile: &Tile) -> f32 {
        producer
            .cache()
            .storage_as::<CpuTileStorage<f32>>()
            .unwrap()
            .read(tile.slot())[0]
    }

    #[test]
    fn eviction_under_pressure() {
        let p = Producer::new(CountingProducer::new(2));
        let a = p.get_tile(TileCoord::new(0, 0, 0), Deadline::IMMEDIATE).unwrap();
        let b = p.get_tile(TileCoord::new(1, 0, 0), Deadline::IMMEDIATE).unwrap();
        p.put_tile(&a);
        p.put_tile(&b);
        let c = p.get_tile(TileCoord::new(1, 0, 1), Deadline::IMMEDIATE).unwrap();

        assert!(p.find_tile(a.coord(), false, false).is_none());
        assert!(p.find_tile(b.coord(), false, false).is_none());
        assert!(p.find_tile(a.coord(), true, false).is_none());
        assert!(Arc::ptr_eq(&p.find_tile(c.coord(), false, false).unwrap(), &c));
        // The evicted tile's task never ran.
        assert!(a.task().is_failed());
    }

    #[test]
    fn unscheduled_tile_is_not_ready() {
        let p = Producer::new(CountingProducer::new(1));
        let tile = p.get_tile(TileCoord::ROOT, Deadline::IMMEDIATE).unwrap();
        assert!(p.find_tile(TileCoord::ROOT, true, true).is_none());
        let pending = p.find_tile(TileCoord::ROOT, true, false).unwrap();
        assert!(!pending.is_ready());

        InlineScheduler.schedule(p.task_graph(&tile));
        assert!(p.find_tile(TileCoord::ROOT, true, true).is_some());
        assert_eq!(value(&p, &tile), 0.0);
    }

    #[test]
    fn invalidate_schedules_new_task() {
        let p = Producer::new(CountingProducer::new(1));
        let tile = p.get_tile(TileCoord::new(1, 1, 0), Deadline::IMMEDIATE).unwrap();
        InlineScheduler.schedule(p.task_graph(&tile));
        p.put_tile(&tile);

        let counting = p.downcast_ref::<CountingProducer>().unwrap();
        assert_eq!(counting.created.load(Ordering::SeqCst), 1);
        assert!(p.invalidate_tile(tile.coord()));

        let again = p.get_tile(tile.coord(), Deadline::IMMEDIATE).unwrap();
        let graph = p.task_graph(&again);
        assert_eq!(graph.len(), 1);
        InlineScheduler.schedule(graph);
        assert_eq!(counting.created.load(Ordering::SeqCst), 2);
        assert!(again.is_ready());
        assert_eq!(value(&p, &again), 110.0);
    }

    #[test]
    fn failed_tile_is_removed_and_retried() {
        let p = Producer::new(CountingProducer::new(1));
        let counting = p.downcast_ref::<CountingProducer>().unwrap();
        *counting.fail.lock() = Some(TileCoord::ROOT);

        let tile = p.get_tile(TileCoord::ROOT, Deadline::IMMEDIATE).unwrap();
        InlineScheduler.schedule(p.task_graph(&tile));
        assert!(tile.task().is_failed());
        assert!(p.find_tile(TileCoord::ROOT, true, false).is_none());
        assert_eq!(p.cache().storage().free_slots(), 1);
        p.put_tile(&tile);

        *counting.fail.lock() = None;
        let retry = p.get_tile(TileCoord::ROOT, Deadline::IMMEDIATE).unwrap();
        InlineScheduler.schedule(p.task_graph(&retry));
        assert!(retry.is_ready());
    }

    #[test]
    fn composite_acquires_and_releases_source_tiles() {
        let source = Producer::new(CountingProducer::new(4));
        let cache = Arc::new(TileCache::new(
            "child",
            Arc::new(CpuTileStorage::<f32>::new(2, 1, 4)),
        ));
        let child = Producer::new(ChildProducer {
            base: ProducerBase::new("child", cache),
            source: source.clone(),
        });
        child.add_layer(Arc::new(AddLayer));

        let coord = TileCoord::new(2, 3, 1);
        let tile = child.get_tile(coord, Deadline::IMMEDIATE).unwrap();
        let held = source.find_tile(coord, false, false).unwrap();
        assert_eq!(held.users(), 1);

        let graph = child.task_graph(&tile);
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.edges().len(), 1);
        InlineScheduler.schedule(graph);

        assert!(tile.is_ready());
        assert_eq!(value(&child, &tile), 231.0 + 1.0 + 0.5);
        assert_eq!(held.users(), 0);
        assert_eq!(child.referenced_producers().len(), 1);
    }

    #[test]
    fn failed_dependency_fails_dependent_without_running() {
        let source = Producer::new(CountingProducer::new(4));
        source
            .downcast_ref::<CountingProducer>()
            .unwrap()
            .fail
            .lock()
            .replace(TileCoord::ROOT);
        let cache = Arc::new(TileCache::new(
            "child",
            Arc::new(CpuTileStorage::<f32>::new(2, 1, 4)),
        ));
        let child = Producer::new(ChildProducer {
            base: ProducerBase::new("child", cache),
            source: source.clone(),
        });

        let tile = child.get_tile(TileCoord::ROOT, Deadline::IMMEDIATE).unwrap();
        InlineScheduler.schedule(child.task_graph(&tile));
        assert!(tile.task().is_failed());
        assert_eq!(child.cache().storage().free_slots(), 4);
        assert_eq!(source.cache().storage().free_slots(), 4);
    }

    struct Forwarding {
        base: ProducerBase,
        target: Producer,
    }

    impl TileProducer for Forwarding {
        fn base(&self) -> &ProducerBase {
            &self.base
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn delegate(&self, coord: TileCoord) -> Option<Producer> {
            (coord.level >= 1).then(|| self.target.clone())
        }

        fn do_create_tile(&self, _coord: TileCoord, _slot: SlotId, _task: &CreateTileTask) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn delegate_answers_forwarded_coordinates() {
        let target = Producer::new(CountingProducer::new(2));
        let cache = Arc::new(TileCache::new(
            "forwarding",
            Arc::new(CpuTileStorage::<f32>::new(2, 1, 2)),
        ));
        let p = Producer::new(Forwarding {
            base: ProducerBase::new("forwarding", cache),
            target: target.clone(),
        });

        let coord = TileCoord::new(1, 1, 1);
        let tile = p.get_tile(coord, Deadline::IMMEDIATE).unwrap();
        assert!(target.find_tile(coord, false, false).is_some());
        assert!(p.cache().is_empty());
        p.put_tile(&tile);
        assert_eq!(tile.users(), 0);

        let root = p.get_tile(TileCoord::ROOT, Deadline::IMMEDIATE).unwrap();
        assert_eq!(p.cache().len(), 1);
        p.put_tile(&root);
    }

    #[test]
    fn prefetch_leaves_tile_unused_in_cache() {
        let p = Producer::new(CountingProducer::new(2));
        assert!(p.prefetch_tile(TileCoord::ROOT, &InlineScheduler));
        let tile = p.find_tile(TileCoord::ROOT, true, true).unwrap();
        assert_eq!(tile.users(), 0);
        assert!(p.find_tile(TileCoord::ROOT, false, false).is_none());
    }

    #[test]
    fn missing_tile_is_not_found() {
        let p = Producer::new(CountingProducer::new(1));
        let err = p.get_tile(TileCoord::new(1, 2, 0), Deadline::IMMEDIATE).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}

//! Tile producer framework for the Proland pipeline.
//!
//! This crate provides:
//! - Fixed-capacity tile storages on the host ([`CpuTileStorage`]) and on the
//!   GPU ([`GpuTileStorage`]) behind the opaque [`GpuBackend`] collaborator
//! - A reference-counted [`TileCache`] with LRU eviction of unused tiles
//! - The [`TileProducer`] hooks, delegates and [`TileLayer`]s
//! - Create-tile tasks, [`TaskGraph`] values and the schedulers that run them
//! - [`ZRangeReader`], the elevation range hook height producers expose

pub mod cache;
pub mod cpu_storage;
pub mod deferred;
pub mod gpu;
pub mod gpu_storage;
pub mod graph;
pub mod layer;
pub mod producer;
pub mod scheduler;
pub mod storage;
pub mod task;
pub mod tile;
pub mod zrange;

pub use cache::{CacheStats, ProducerId, TileCache, TileCacheConfig};
pub use cpu_storage::CpuTileStorage;
pub use gpu::{FrameBufferFactory, FrameBufferHandle, GpuBackend, HostBackend, TextureFormat, TextureHandle};
pub use gpu_storage::{GpuTileStorage, SlotChanged};
pub use graph::{TaskGraph, TaskNode};
pub use layer::TileLayer;
pub use producer::{Producer, ProducerBase, TaskOutcome, TileProducer, WeakProducer};
pub use scheduler::{FrameScheduler, InlineScheduler, RunReport, Scheduler, SchedulerConfig};
pub use storage::{SlotId, TileStorage};
pub use task::{CreateTileTask, Deadline, TaskBuilder, TaskId, TaskState};
pub use tile::Tile;
pub use zrange::ZRangeReader;

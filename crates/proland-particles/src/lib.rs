//! Particles for the Proland tile pipeline.
//!
//! A [`ParticleProducer`] composes [`ParticleLayer`]s over a single packed
//! [`ParticleStorage`]: every layer owns a record at a fixed byte offset of
//! each particle and reads it through a [`LayerView`]. Stock layers:
//! - [`LifeCycleLayer`]: fade in, active and fade out phases, intensity and
//!   removal of expired particles
//! - [`WorldLayer`]: world positions integrated from velocities

pub mod life_cycle;
pub mod producer;
pub mod storage;
pub mod world;

pub use life_cycle::{LifeCycleConfig, LifeCycleLayer, LifePhase};
pub use producer::{ParticleLayer, ParticleProducer, ParticleProducerConfig, ParticleUpdate};
pub use storage::{
    particle_size, GpuParticleBuffer, LayerView, ParticleId, ParticleStorage, ParticleStorageConfig,
};
pub use world::{WorldLayer, WorldLayerConfig};

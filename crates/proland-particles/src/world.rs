//! World-space particle positions and velocities.

use std::any::Any;

use bytemuck::{Pod, Zeroable};
use glam::{DVec3, Vec3};
use serde::{Deserialize, Serialize};

use crate::producer::ParticleLayer;
use crate::storage::{LayerView, ParticleId, ParticleStorage};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldLayerConfig {
    /// Multiplier applied to every velocity.
    pub speed_factor: f64,
    pub paused: bool,
}

impl Default for WorldLayerConfig {
    fn default() -> Self {
        Self {
            speed_factor: 1.0,
            paused: false,
        }
    }
}

impl WorldLayerConfig {
    pub const fn with_speed_factor(mut self, factor: f64) -> Self {
        self.speed_factor = factor;
        self
    }

    pub const fn with_paused(mut self, paused: bool) -> Self {
        self.paused = paused;
        self
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct WorldRecord {
    position: [f64; 3],
    velocity: [f32; 3],
    _padding: f32,
}

/// Integrates particle positions from their velocities.
#[derive(Debug)]
pub struct WorldLayer {
    config: WorldLayerConfig,
    view: LayerView<WorldRecord>,
}

impl Default for WorldLayer {
    fn default() -> Self {
        Self::new(WorldLayerConfig::default())
    }
}

impl WorldLayer {
    pub const fn new(config: WorldLayerConfig) -> Self {
        Self {
            config,
            view: LayerView::new(0),
        }
    }

    pub const fn offset(&self) -> usize {
        self.view.offset()
    }

    pub const fn is_paused(&self) -> bool {
        self.config.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.config.paused = paused;
    }

    pub fn set_speed_factor(&mut self, factor: f64) {
        self.config.speed_factor = factor;
    }

    pub fn position(&self, storage: &ParticleStorage, id: ParticleId) -> Option<DVec3> {
        self.view.read(storage, id).map(|r| DVec3::from(r.position))
    }

    pub fn velocity(&self, storage: &ParticleStorage, id: ParticleId) -> Option<Vec3> {
        self.view.read(storage, id).map(|r| Vec3::from(r.velocity))
    }

    pub fn set_position(&self, storage: &mut ParticleStorage, id: ParticleId, position: DVec3) {
        if let Some(record) = self.view.write(storage, id) {
            record.position = position.to_array();
        }
    }

    pub fn set_velocity(&self, storage: &mut ParticleStorage, id: ParticleId, velocity: Vec3) {
        if let Some(record) = self.view.write(storage, id) {
            record.velocity = velocity.to_array();
        }
    }
}

impl ParticleLayer for WorldLayer {
    fn name(&self) -> &str {
        "world"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn record_size(&self) -> usize {
        std::mem::size_of::<WorldRecord>()
    }

    fn record_align(&self) -> usize {
        std::mem::align_of::<WorldRecord>()
    }

    fn set_offset(&mut self, offset: usize) {
        self.view = LayerView::new(offset);
    }

    fn move_particles(&mut self, storage: &mut ParticleStorage, dt: f64) {
        if self.config.paused {
            return;
        }
        let step = dt * self.config.speed_factor;
        let view = self.view;
        storage.for_each_mut(|_, data| {
            if let Some(record) = view.get_mut(data) {
                let velocity = Vec3::from(record.velocity).as_dvec3();
                record.position = (DVec3::from(record.position) + velocity * step).to_array();
            }
        });
    }
}

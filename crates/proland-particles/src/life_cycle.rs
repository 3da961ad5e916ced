//! Particle life cycle: fade in, active, fade out.

use std::any::Any;

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::producer::ParticleLayer;
use crate::storage::{LayerView, ParticleId, ParticleStorage};

/// Durations of the life cycle phases, in seconds.
///
/// An infinite `active` duration keeps particles alive until they are
/// killed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifeCycleConfig {
    pub fade_in: f32,
    pub active: f32,
    pub fade_out: f32,
}

impl Default for LifeCycleConfig {
    fn default() -> Self {
        Self {
            fade_in: 1.0,
            active: 10.0,
            fade_out: 1.0,
        }
    }
}

impl LifeCycleConfig {
    pub const fn with_fade_in(mut self, seconds: f32) -> Self {
        self.fade_in = seconds;
        self
    }

    pub const fn with_active(mut self, seconds: f32) -> Self {
        self.active = seconds;
        self
    }

    pub const fn with_fade_out(mut self, seconds: f32) -> Self {
        self.fade_out = seconds;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifePhase {
    FadingIn,
    Active,
    FadingOut,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct LifeRecord {
    birth: f32,
    /// Start of the fade out.
    death: f32,
    /// Intensity when the fade out started.
    death_intensity: f32,
    _padding: f32,
}

/// Tracks the age of every particle and deletes particles whose fade out is
/// over.
#[derive(Debug)]
pub struct LifeCycleLayer {
    config: LifeCycleConfig,
    time: f64,
    view: LayerView<LifeRecord>,
}

impl Default for LifeCycleLayer {
    fn default() -> Self {
        Self::new(LifeCycleConfig::default())
    }
}

impl LifeCycleLayer {
    pub const fn new(config: LifeCycleConfig) -> Self {
        Self {
            config,
            time: 0.0,
            view: LayerView::new(0),
        }
    }

    pub const fn config(&self) -> &LifeCycleConfig {
        &self.config
    }

    /// Seconds elapsed since creation.
    pub const fn time(&self) -> f64 {
        self.time
    }

    pub const fn offset(&self) -> usize {
        self.view.offset()
    }

    fn now(&self) -> f32 {
        self.time as f32
    }

    fn fade_in_intensity(&self, record: &LifeRecord, now: f32) -> f32 {
        if self.config.fade_in > 0.0 {
            ((now - record.birth) / self.config.fade_in).clamp(0.0, 1.0)
        } else {
            1.0
        }
    }

    fn phase_of(&self, record: &LifeRecord, now: f32) -> LifePhase {
        if now >= record.death {
            LifePhase::FadingOut
        } else if now - record.birth < self.config.fade_in {
            LifePhase::FadingIn
        } else {
            LifePhase::Active
        }
    }

    fn intensity_of(&self, record: &LifeRecord, now: f32) -> f32 {
        match self.phase_of(record, now) {
            LifePhase::FadingIn => self.fade_in_intensity(record, now),
            LifePhase::Active => 1.0,
            LifePhase::FadingOut if self.config.fade_out > 0.0 => {
                let t = (now - record.death) / self.config.fade_out;
                record.death_intensity * (1.0 - t).clamp(0.0, 1.0)
            }
            LifePhase::FadingOut => 0.0,
        }
    }

    pub fn phase(&self, storage: &ParticleStorage, id: ParticleId) -> Option<LifePhase> {
        let record = self.view.read(storage, id)?;
        Some(self.phase_of(record, self.now()))
    }

    /// Opacity of a particle, in `[0, 1]`.
    pub fn intensity(&self, storage: &ParticleStorage, id: ParticleId) -> Option<f32> {
        let record = self.view.read(storage, id)?;
        Some(self.intensity_of(record, self.now()))
    }

    /// Seconds since the particle was created.
    pub fn age(&self, storage: &ParticleStorage, id: ParticleId) -> Option<f32> {
        Some(self.now() - self.view.read(storage, id)?.birth)
    }

    /// Start fading a particle out now, from its current intensity.
    pub fn kill(&self, storage: &mut ParticleStorage, id: ParticleId) {
        let now = self.now();
        let Some(record) = self.view.read(storage, id).copied() else {
            return;
        };
        if now >= record.death {
            return;
        }
        let intensity = self.intensity_of(&record, now);
        if let Some(record) = self.view.write(storage, id) {
            record.death = now;
            record.death_intensity = intensity;
        }
    }
}

impl ParticleLayer for LifeCycleLayer {
    fn name(&self) -> &str {
        "life_cycle"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn record_size(&self) -> usize {
        std::mem::size_of::<LifeRecord>()
    }

    fn record_align(&self) -> usize {
        std::mem::align_of::<LifeRecord>()
    }

    fn set_offset(&mut self, offset: usize) {
        self.view = LayerView::new(offset);
    }

    fn init_particle(&self, particle: &mut [u8]) {
        let now = self.now();
        let death = now + self.config.fade_in + self.config.active;
        if let Some(record) = self.view.get_mut(particle) {
            *record = LifeRecord {
                birth: now,
                death,
                death_intensity: 1.0,
                _padding: 0.0,
            };
        }
    }

    fn move_particles(&mut self, _storage: &mut ParticleStorage, dt: f64) {
        self.time += dt;
    }

    fn remove_old_particles(&mut self, storage: &mut ParticleStorage) -> usize {
        let now = self.now();
        let fade_out = self.config.fade_out;
        let view = self.view;
        storage.retain(|_, data| view.get(data).map_or(true, |r| now - r.death < fade_out))
    }
}

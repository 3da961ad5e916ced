//! Particle producers: one packed pool shared by a stack of layers.
//!
//! Each layer owns a record inside every particle. Records are laid out
//! consecutively in layer order, each aligned to its own alignment, and each
//! layer learns its byte offset once at composition.

use std::any::Any;

use proland_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::life_cycle::{LifeCycleConfig, LifeCycleLayer};
use crate::storage::{ParticleId, ParticleStorage, ParticleStorageConfig};
use crate::world::{WorldLayer, WorldLayerConfig};

/// Largest record alignment a layer may ask for.
pub const MAX_RECORD_ALIGN: usize = 8;

/// A per-particle behavior with its own record in every particle.
pub trait ParticleLayer: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Access to the concrete layer.
    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Bytes of this layer's record.
    fn record_size(&self) -> usize;

    fn record_align(&self) -> usize {
        MAX_RECORD_ALIGN
    }

    /// Called once, when the producer lays out the records.
    fn set_offset(&mut self, offset: usize);

    /// Fill this layer's record of a new particle.
    fn init_particle(&self, _particle: &mut [u8]) {}

    /// Advance the particles by `dt` seconds.
    fn move_particles(&mut self, _storage: &mut ParticleStorage, _dt: f64) {}

    /// Delete the particles this layer is done with.
    fn remove_old_particles(&mut self, _storage: &mut ParticleStorage) -> usize {
        0
    }

    /// Number of particles this layer wants to add this step.
    fn add_new_particles(&mut self, _storage: &ParticleStorage, _dt: f64) -> usize {
        0
    }

    /// Set up the particles allocated for this layer's last request; they
    /// are already initialized by every layer.
    fn place_new_particles(&mut self, _storage: &mut ParticleStorage, _ids: &[ParticleId]) {}
}

/// Counts of one [`ParticleProducer::update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParticleUpdate {
    pub removed: usize,
    pub added: usize,
    /// Particles requested but not allocated because the pool was full.
    pub dropped: usize,
}

/// Builds a producer with the stock layers from a descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticleProducerConfig {
    pub name: String,
    pub storage: ParticleStorageConfig,
    pub life_cycle: Option<LifeCycleConfig>,
    pub world: Option<WorldLayerConfig>,
}

/// A particle pool and the layers that drive it.
pub struct ParticleProducer {
    name: String,
    layers: Vec<Box<dyn ParticleLayer>>,
    storage: ParticleStorage,
}

impl ParticleProducer {
    /// Lay out the records of `layers` and allocate the pool.
    pub fn new(
        name: impl Into<String>,
        config: &ParticleStorageConfig,
        mut layers: Vec<Box<dyn ParticleLayer>>,
    ) -> Result<Self> {
        let name = name.into();
        let mut offset: usize = 0;
        for layer in &mut layers {
            let align = layer.record_align();
            if !align.is_power_of_two() || align > MAX_RECORD_ALIGN {
                return Err(Error::Format(format!(
                    "{name}: layer {} needs alignment {align}",
                    layer.name()
                )));
            }
            offset = offset.next_multiple_of(align);
            layer.set_offset(offset);
            tracing::debug!(producer = %name, layer = layer.name(), offset, size = layer.record_size(), "Placed particle layer");
            offset += layer.record_size();
        }
        let storage = ParticleStorage::from_config(config, offset);
        Ok(Self {
            name,
            layers,
            storage,
        })
    }

    pub fn from_config(config: &ParticleProducerConfig) -> Result<Self> {
        let mut layers: Vec<Box<dyn ParticleLayer>> = Vec::new();
        if let Some(life_cycle) = &config.life_cycle {
            layers.push(Box::new(LifeCycleLayer::new(life_cycle.clone())));
        }
        if let Some(world) = &config.world {
            layers.push(Box::new(WorldLayer::new(world.clone())));
        }
        Self::new(config.name.clone(), &config.storage, layers)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn storage(&self) -> &ParticleStorage {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut ParticleStorage {
        &mut self.storage
    }

    pub fn layers(&self) -> impl Iterator<Item = &dyn ParticleLayer> {
        self.layers.iter().map(AsRef::as_ref)
    }

    /// First layer of type `L`.
    pub fn layer<L: ParticleLayer>(&self) -> Option<&L> {
        self.layers.iter().find_map(|l| l.as_any().downcast_ref::<L>())
    }

    pub fn layer_mut<L: ParticleLayer>(&mut self) -> Option<&mut L> {
        self.layers
            .iter_mut()
            .find_map(|l| l.as_any_mut().downcast_mut::<L>())
    }

    /// Both the first layer of type `L` and the pool.
    pub fn layer_and_storage_mut<L: ParticleLayer>(&mut self) -> Option<(&mut L, &mut ParticleStorage)> {
        let layer = self
            .layers
            .iter_mut()
            .find_map(|l| l.as_any_mut().downcast_mut::<L>())?;
        Some((layer, &mut self.storage))
    }

    /// Allocate a particle and let every layer initialize its record.
    pub fn new_particle(&mut self) -> Result<ParticleId> {
        let id = self.storage.new_particle()?;
        if let Some(data) = self.storage.data_mut(id) {
            for layer in &self.layers {
                layer.init_particle(data);
            }
        }
        Ok(id)
    }

    pub fn delete_particle(&mut self, id: ParticleId) -> Result<()> {
        self.storage.delete_particle(id)
    }

    /// Advance every layer by `dt` seconds: move, remove the particles that
    /// are done, then add the new ones each layer asks for.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn update(&mut self, dt: f64) -> ParticleUpdate {
        let mut report = ParticleUpdate::default();
        for layer in &mut self.layers {
            layer.move_particles(&mut self.storage, dt);
        }
        for layer in &mut self.layers {
            report.removed += layer.remove_old_particles(&mut self.storage);
        }
        for i in 0..self.layers.len() {
            let wanted = self.layers[i].add_new_particles(&self.storage, dt);
            if wanted == 0 {
                continue;
            }
            let mut ids = Vec::with_capacity(wanted);
            for _ in 0..wanted {
                match self.new_particle() {
                    Ok(id) => ids.push(id),
                    Err(_) => break,
                }
            }
            report.added += ids.len();
            report.dropped += wanted - ids.len();
            self.layers[i].place_new_particles(&mut self.storage, &ids);
        }
        if report.dropped > 0 {
            tracing::debug!(producer = %self.name, dropped = report.dropped, "Particle pool full");
        }
        tracing::trace!(
            producer = %self.name,
            live = self.storage.len(),
            removed = report.removed,
            added = report.added,
            "Updated particles"
        );
        report
    }
}

impl std::fmt::Debug for ParticleProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParticleProducer")
            .field("name", &self.name)
            .field("layers", &self.layers().map(|l| l.name()).collect::<Vec<_>>())
            .field("storage", &self.storage)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LayerView;

    /// Adds `rate` particles per step, each tagged with its step number.
    struct Emitter {
        rate: usize,
        step: u32,
        view: LayerView<u32>,
        placed: Vec<ParticleId>,
    }

    impl Emitter {
        fn new(rate: usize) -> Self {
            Self {
                rate,
                step: 0,
                view: LayerView::new(0),
                placed: Vec::new(),
            }
        }
    }

    impl ParticleLayer for Emitter {
        fn name(&self) -> &str {
            "emitter"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }

        fn record_size(&self) -> usize {
            4
        }

        fn record_align(&self) -> usize {
            4
        }

        fn set_offset(&mut self, offset: usize) {
            self.view = LayerView::new(offset);
        }

        fn add_new_particles(&mut self, _storage: &ParticleStorage, _dt: f64) -> usize {
            self.step += 1;
            self.rate
        }

        fn place_new_particles(&mut self, storage: &mut ParticleStorage, ids: &[ParticleId]) {
            for &id in ids {
                *self.view.write(storage, id).unwrap() = self.step;
            }
            self.placed.extend_from_slice(ids);
        }
    }

    struct Wide;

    impl ParticleLayer for Wide {
        fn name(&self) -> &str {
            "wide"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }

        fn record_size(&self) -> usize {
            16
        }

        fn record_align(&self) -> usize {
            16
        }

        fn set_offset(&mut self, _offset: usize) {}
    }

    #[test]
    fn layers_get_consecutive_aligned_offsets() {
        let producer = ParticleProducer::new(
            "rain",
            &ParticleStorageConfig::default().with_capacity(4),
            vec![
                Box::new(Emitter::new(0)),
                Box::new(WorldLayer::default()),
                Box::new(LifeCycleLayer::default()),
            ],
        )
        .unwrap();
        let world = producer.layer::<WorldLayer>().unwrap();
        let life = producer.layer::<LifeCycleLayer>().unwrap();
        assert_eq!(world.offset(), 8);
        assert_eq!(life.offset(), 8 + world.record_size());
        assert_eq!(
            producer.storage().layer_bytes(),
            life.offset() + life.record_size()
        );
    }

    #[test]
    fn over_aligned_layers_are_rejected() {
        let result = ParticleProducer::new("bad", &ParticleStorageConfig::default(), vec![Box::new(Wide)]);
        assert!(matches!(result, Err(Error::Format(_))));
    }

    #[test]
    fn update_adds_until_the_pool_is_full() {
        let mut producer = ParticleProducer::new(
            "sparks",
            &ParticleStorageConfig::default().with_capacity(5),
            vec![Box::new(Emitter::new(3))],
        )
        .unwrap();
        assert_eq!(
            producer.update(0.1),
            ParticleUpdate {
                removed: 0,
                added: 3,
                dropped: 0
            }
        );
        let report = producer.update(0.1);
        assert_eq!((report.added, report.dropped), (2, 1));
        assert_eq!(producer.storage().len(), 5);

        let emitter = producer.layer::<Emitter>().unwrap();
        let steps: Vec<u32> = emitter
            .placed
            .iter()
            .map(|&id| *emitter.view.read(producer.storage(), id).unwrap())
            .collect();
        assert_eq!(steps, vec![1, 1, 1, 2, 2]);
    }

    #[test]
    fn descriptor_builds_the_stock_layers() {
        let config: ParticleProducerConfig = serde_json::from_str(
            r#"{
                "name": "snow",
                "storage": { "capacity": 16, "pack": true },
                "life_cycle": { "fade_in": 0.5, "active": 2.0, "fade_out": 0.5 },
                "world": { "speed_factor": 2.0 }
            }"#,
        )
        .unwrap();
        let producer = ParticleProducer::from_config(&config).unwrap();
        assert_eq!(producer.name(), "snow");
        assert!(producer.storage().is_packed());
        assert_eq!(producer.storage().capacity(), 16);
        assert_eq!(producer.layers().count(), 2);
        assert!(producer.layer::<WorldLayer>().is_some());
    }
}

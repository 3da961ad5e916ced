//! The residual producer: elevation residual tiles read from a residual file.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;
use proland_core::constants::ELEVATION_BORDER;
use proland_core::{Error, Result, TileCoord};
use proland_producer::{
    CpuTileStorage, CreateTileTask, Producer, ProducerBase, SlotId, TileCache, TileCacheConfig,
    TileProducer, TileStorage,
};
use serde::{Deserialize, Serialize};

use super::file::{AccessMode, ResidualFile};
use super::format::ResidualHeader;
use super::scratch::{ScratchBuffers, ScratchPool};
use super::strip;
use crate::upsample::upsample;

/// Configuration for a [`ResidualProducer`] with its own cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResidualProducerConfig {
    pub name: String,
    /// Residual file to read.
    pub path: Option<PathBuf>,
    pub access: AccessMode,
    /// User factor applied on top of the file's scale.
    pub z_scale: f32,
    /// Tiles kept in the cache.
    pub capacity: usize,
    pub root_quad_size: f64,
}

impl Default for ResidualProducerConfig {
    fn default() -> Self {
        Self {
            name: "residuals".to_string(),
            path: None,
            access: AccessMode::Shared,
            z_scale: 1.0,
            capacity: 64,
            root_quad_size: 1.0,
        }
    }
}

impl ResidualProducerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub const fn with_access(mut self, access: AccessMode) -> Self {
        self.access = access;
        self
    }

    pub const fn with_z_scale(mut self, z_scale: f32) -> Self {
        self.z_scale = z_scale;
        self
    }

    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub const fn with_root_quad_size(mut self, size: f64) -> Self {
        self.root_quad_size = size;
        self
    }
}

/// Produces residual tiles of `(tileSize + 5)²` elevation deltas.
///
/// The file's root tile `(rootLevel, rootTx, rootTy)` is served at quadtree
/// level `rootLevel`, with every packed level below `minLevel` folded into it;
/// quadtree level `rootLevel + k` reads file level `minLevel + k`. Requests
/// outside the file's region go to the first sub-producer that has the tile.
pub struct ResidualProducer {
    base: ProducerBase,
    file: ResidualFile,
    z_scale: f32,
    scratch: ScratchPool,
    sub_producers: RwLock<Vec<Producer>>,
    overrides: RwLock<HashMap<TileCoord, Arc<[f32]>>>,
}

impl ResidualProducer {
    /// Create a new producer over `cache`, whose storage must hold `f32`
    /// tiles of `tileSize + 5` samples.
    pub fn new(name: impl Into<String>, cache: Arc<TileCache>, file: ResidualFile) -> Result<Self> {
        let samples = file.header().tile_size + 5;
        let Some(storage) = cache.storage_as::<CpuTileStorage<f32>>() else {
            return Err(Error::Format(format!(
                "residual cache {} needs an f32 CPU storage",
                cache.name()
            )));
        };
        if storage.tile_size() != samples || storage.channels() != 1 {
            return Err(Error::Format(format!(
                "residual tiles of {samples} samples do not fit {}x{} slots of {} channels",
                storage.tile_size(),
                storage.tile_size(),
                storage.channels()
            )));
        }
        Ok(Self {
            base: ProducerBase::new(name, cache).with_border(ELEVATION_BORDER),
            file,
            z_scale: 1.0,
            scratch: ScratchPool::default(),
            sub_producers: RwLock::new(Vec::new()),
            overrides: RwLock::new(HashMap::new()),
        })
    }

    /// Open the configured file with a cache of its own.
    pub fn from_config(config: &ResidualProducerConfig) -> Result<Self> {
        let path = config
            .path
            .as_ref()
            .ok_or_else(|| Error::NotFound(format!("residual file for {}", config.name)))?;
        let file = ResidualFile::open(path, config.access)?;
        let cache = Arc::new(TileCache::from_config(
            &TileCacheConfig::default()
                .with_name(config.name.clone())
                .with_tile_size(file.header().tile_size + 5)
                .with_capacity(config.capacity),
        ));
        let producer = Self::new(config.name.clone(), cache, file)?.with_z_scale(config.z_scale);
        producer.base.set_root_quad_size(config.root_quad_size);
        Ok(producer)
    }

    #[must_use]
    pub const fn with_z_scale(mut self, z_scale: f32) -> Self {
        self.z_scale = z_scale;
        self
    }

    pub const fn file(&self) -> &ResidualFile {
        &self.file
    }

    pub const fn header(&self) -> &ResidualHeader {
        self.file.header()
    }

    pub const fn z_scale(&self) -> f32 {
        self.z_scale
    }

    /// Factor from stored samples to elevation.
    pub fn sample_scale(&self) -> f32 {
        self.header().scale * self.z_scale
    }

    /// Packed file levels folded into the root level.
    pub const fn delta_level(&self) -> u32 {
        self.file.header().min_level
    }

    /// Samples per tile row, borders included.
    pub const fn samples(&self) -> u32 {
        self.file.header().tile_size + 5
    }

    /// The quadtree tile this producer's file is rooted at.
    pub const fn root(&self) -> TileCoord {
        let h = self.file.header();
        TileCoord::new(h.root_level, h.root_tx, h.root_ty)
    }

    /// Whether this producer's own file has the tile, sub-producers aside.
    pub fn covers(&self, coord: TileCoord) -> bool {
        let root = self.root();
        if !coord.is_valid() || coord.level < root.level {
            return false;
        }
        let depth = coord.level - root.level;
        depth + self.delta_level() <= self.header().max_level
            && (coord.tx >> depth, coord.ty >> depth) == (root.tx, root.ty)
    }

    /// Refine a region with another residual producer sharing this cache.
    pub fn add_sub_producer(&self, sub: Producer) -> Result<()> {
        if !Arc::ptr_eq(sub.cache(), self.base.cache()) {
            return Err(Error::InvalidData(format!(
                "sub-producer {} must share the cache of {}",
                sub.name(),
                self.base.name()
            )));
        }
        tracing::debug!(producer = %self.base.name(), sub = %sub.name(), "Added residual sub-producer");
        self.sub_producers.write().push(sub);
        Ok(())
    }

    pub fn sub_producers(&self) -> Vec<Producer> {
        self.sub_producers.read().clone()
    }

    /// Read, decode and scale the residuals of quadtree tile `coord`.
    ///
    /// Returns `(tileSize + 5)²` samples, row-major. Edited tiles come from
    /// memory instead of the file.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn read_tile(&self, coord: TileCoord) -> Result<Vec<f32>> {
        if !self.covers(coord) {
            return Err(Error::NotFound(format!(
                "{} has no residual tile {coord}",
                self.base.name()
            )));
        }
        if let Some(values) = self.overrides.read().get(&coord) {
            return Ok(values.to_vec());
        }
        let root = self.root();
        let depth = coord.level - root.level;
        let header = self.header();
        let mut scratch = self.scratch.acquire();

        if depth == 0 && self.delta_level() > 0 {
            let mut samples = header.samples_at(0) as usize;
            let mut z = vec![0.0; samples * samples];
            self.add_file_tile(0, 0, 0, &mut z, &mut scratch)?;
            for level in 1..=self.delta_level() {
                let child_samples = header.samples_at(level) as usize;
                let mut child = vec![0.0; child_samples * child_samples];
                upsample(&z, samples, (0, 0), &mut child, child_samples)?;
                self.add_file_tile(level, 0, 0, &mut child, &mut scratch)?;
                z = child;
                samples = child_samples;
            }
            return Ok(z);
        }

        let n = self.samples() as usize;
        let mut out = vec![0.0; n * n];
        let level = depth + self.delta_level();
        let tx = coord.tx - (root.tx << depth);
        let ty = coord.ty - (root.ty << depth);
        self.add_file_tile(level, tx, ty, &mut out, &mut scratch)?;
        Ok(out)
    }

    /// Add the scaled samples of file tile `(level, tx, ty)` to `out`.
    fn add_file_tile(
        &self,
        level: u32,
        tx: u32,
        ty: u32,
        out: &mut [f32],
        scratch: &mut ScratchBuffers,
    ) -> Result<()> {
        let entry = self.file.entry(level, tx, ty)?;
        if entry.size == 0 {
            return Ok(());
        }
        let id = self.header().tile_id(level, tx, ty);
        let n = self.header().samples_at(level);
        if out.len() != (n * n) as usize {
            return Err(Error::InvalidData(format!(
                "{} samples for residual tile ({level}, {tx}, {ty}) of {n}x{n}",
                out.len()
            )));
        }
        let ScratchBuffers {
            compressed,
            samples,
        } = scratch;
        self.file.read_payload(id, compressed)?;
        strip::decode_into(compressed, (n, n), samples)?;
        let factor = self.sample_scale();
        for (o, &s) in out.iter_mut().zip(samples.iter()) {
            *o += f32::from(s) * factor;
        }
        Ok(())
    }

    /// Serve `values` for `coord` instead of the file's residuals.
    pub(crate) fn set_override(&self, coord: TileCoord, values: Vec<f32>) -> Result<()> {
        let n = self.samples() as usize;
        if values.len() != n * n {
            return Err(Error::InvalidData(format!(
                "{} samples for a {n}x{n} residual tile",
                values.len()
            )));
        }
        self.overrides.write().insert(coord, values.into());
        Ok(())
    }

    /// Drop every edited tile, returning their coordinates.
    pub(crate) fn clear_overrides(&self) -> Vec<TileCoord> {
        self.overrides.write().drain().map(|(coord, _)| coord).collect()
    }

    /// Edited tiles currently served from memory.
    pub fn overridden(&self) -> Vec<TileCoord> {
        let mut coords: Vec<_> = self.overrides.read().keys().copied().collect();
        coords.sort_unstable_by_key(|c| (c.level, c.ty, c.tx));
        coords
    }

    pub fn override_tile(&self, coord: TileCoord) -> Option<Arc<[f32]>> {
        self.overrides.read().get(&coord).cloned()
    }
}

impl TileProducer for ResidualProducer {
    fn base(&self) -> &ProducerBase {
        &self.base
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn has_tile(&self, coord: TileCoord) -> bool {
        self.covers(coord) || self.sub_producers.read().iter().any(|s| s.has_tile(coord))
    }

    fn delegate(&self, coord: TileCoord) -> Option<Producer> {
        if self.covers(coord) {
            return None;
        }
        self.sub_producers
            .read()
            .iter()
            .find(|s| s.has_tile(coord))
            .cloned()
    }

    fn referenced_producers(&self) -> Vec<Producer> {
        self.sub_producers()
    }

    fn do_create_tile(&self, coord: TileCoord, slot: SlotId, _task: &CreateTileTask) -> Result<()> {
        let values = self.read_tile(coord)?;
        let storage = self
            .base
            .cache()
            .storage_as::<CpuTileStorage<f32>>()
            .ok_or_else(|| Error::Format("residual storage is not an f32 CPU storage".into()))?;
        storage.write(slot).copy_from_slice(&values);
        tracing::trace!(producer = %self.base.name(), %coord, "Loaded residual tile");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::residual::writer::ResidualWriter;
    use proland_producer::{Deadline, InlineScheduler, Scheduler};

    fn producer_for(writer: &ResidualWriter, capacity: usize) -> ResidualProducer {
        let file = ResidualFile::from_bytes(writer.to_bytes().unwrap().into()).unwrap();
        let samples = file.header().tile_size + 5;
        let cache = Arc::new(TileCache::new(
            "residuals",
            Arc::new(CpuTileStorage::<f32>::new(samples, 1, capacity)),
        ));
        ResidualProducer::new("residuals", cache, file).unwrap()
    }

    #[test]
    fn constant_tile_is_scaled() {
        let mut writer = ResidualWriter::new(ResidualHeader::new(0, 0, 6, 2.0));
        writer.set_tile(0, 0, 0, &[100; 121]).unwrap();
        let p = Producer::new(producer_for(&writer, 2));

        let tile = p.get_tile(TileCoord::ROOT, Deadline::IMMEDIATE).unwrap();
        InlineScheduler.schedule(p.task_graph(&tile));
        assert!(tile.is_ready());
        let storage = p.cache().storage_as::<CpuTileStorage<f32>>().unwrap();
        let data = storage.read(tile.slot());
        assert_eq!(data.len(), 121);
        assert!(data.iter().all(|&v| v == 200.0));
    }

    #[test]
    fn decode_reproduces_encoded_samples() {
        let header = ResidualHeader::new(0, 1, 4, 0.5);
        let mut writer = ResidualWriter::new(header);
        let samples: Vec<i16> = (0..81).map(|i| i * 3 - 100).collect();
        writer.set_tile(1, 1, 0, &samples).unwrap();
        let residuals = producer_for(&writer, 4).with_z_scale(3.0);

        let values = residuals.read_tile(TileCoord::new(1, 1, 0)).unwrap();
        for (v, s) in values.iter().zip(&samples) {
            assert_eq!(*v, f32::from(*s) * 1.5);
        }
        // Never written: all zeros.
        assert!(residuals
            .read_tile(TileCoord::new(1, 0, 1))
            .unwrap()
            .iter()
            .all(|&v| v == 0.0));
    }

    #[test]
    fn has_tile_follows_root_and_depth() {
        let header = ResidualHeader::new(0, 1, 4, 1.0).with_root(2, 1, 2);
        let residuals = producer_for(&ResidualWriter::new(header), 2);
        assert!(residuals.covers(TileCoord::new(2, 1, 2)));
        assert!(residuals.covers(TileCoord::new(3, 3, 5)));
        assert!(!residuals.covers(TileCoord::new(3, 4, 5)));
        assert!(!residuals.covers(TileCoord::new(4, 6, 10)));
        assert!(!residuals.covers(TileCoord::new(1, 0, 1)));
    }

    #[test]
    fn packed_levels_fold_into_the_root() {
        // Level 0 holds a 2-sample tile, level 1 the 4-sample root tile.
        let header = ResidualHeader::new(1, 1, 4, 1.0);
        let mut writer = ResidualWriter::new(header);
        writer.set_tile(0, 0, 0, &[10; 49]).unwrap();
        let mut fine = vec![0i16; 81];
        fine[40] = 3;
        writer.set_tile(1, 0, 0, &fine).unwrap();
        let residuals = producer_for(&writer, 2);

        assert_eq!(residuals.delta_level(), 1);
        assert!(!residuals.covers(TileCoord::new(1, 0, 0)));
        let values = residuals.read_tile(TileCoord::ROOT).unwrap();
        assert_eq!(values.len(), 81);
        assert_eq!(values[0], 10.0);
        assert_eq!(values[40], 13.0);
    }

    #[test]
    fn sub_producer_answers_outside_the_main_file() {
        let main_header = ResidualHeader::new(0, 1, 4, 1.0);
        let mut main_writer = ResidualWriter::new(main_header);
        main_writer.set_tile(0, 0, 0, &[1; 81]).unwrap();
        let main = producer_for(&main_writer, 8);

        let sub_header = ResidualHeader::new(0, 0, 4, 1.0).with_root(2, 3, 0);
        let mut sub_writer = ResidualWriter::new(sub_header);
        sub_writer.set_tile(0, 0, 0, &[7; 81]).unwrap();
        let sub_file = ResidualFile::from_bytes(sub_writer.to_bytes().unwrap().into()).unwrap();
        let sub = ResidualProducer::new("sub", Arc::clone(main.base.cache()), sub_file).unwrap();
        main.add_sub_producer(Producer::new(sub)).unwrap();
        let p = Producer::new(main);

        let coord = TileCoord::new(2, 3, 0);
        assert!(p.has_tile(coord));
        assert!(!p.has_tile(TileCoord::new(2, 2, 0)));
        let tile = p.get_tile(coord, Deadline::IMMEDIATE).unwrap();
        InlineScheduler.schedule(p.task_graph(&tile));
        let storage = p.cache().storage_as::<CpuTileStorage<f32>>().unwrap();
        assert_eq!(storage.read(tile.slot())[0], 7.0);
        assert_eq!(p.referenced_producers().len(), 1);
        p.put_tile(&tile);
        assert_eq!(p.cache().storage().free_slots(), 7);
    }

    #[test]
    fn foreign_cache_sub_producer_is_rejected() {
        let header = ResidualHeader::new(0, 0, 4, 1.0);
        let main = producer_for(&ResidualWriter::new(header), 2);
        let other = producer_for(&ResidualWriter::new(header.with_root(1, 0, 0)), 2);
        assert!(main.add_sub_producer(Producer::new(other)).is_err());
    }

    #[test]
    fn corrupt_payload_fails_the_task() {
        let header = ResidualHeader::new(0, 0, 6, 1.0);
        let mut writer = ResidualWriter::new(header);
        writer.set_payload(0, b"not a tiff".to_vec()).unwrap();
        let p = Producer::new(producer_for(&writer, 1));

        let tile = p.get_tile(TileCoord::ROOT, Deadline::IMMEDIATE).unwrap();
        InlineScheduler.schedule(p.task_graph(&tile));
        assert!(tile.task().is_failed());
        assert!(p.find_tile(TileCoord::ROOT, true, false).is_none());
    }
}

//! The elevation producer: upsampled parents plus residuals.
//!
//! Tile `(level, tx, ty)` is the 4-tap upsampling of its parent's quarter
//! plus the residual tile of the same coordinate, then every attached layer
//! in order. Level 0 has no parent and is its residual tile.

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;
use proland_core::constants::ELEVATION_BORDER;
use proland_core::{Error, Result, TileCoord};
use proland_producer::{
    CpuTileStorage, CreateTileTask, FrameBufferFactory, FrameBufferHandle, GpuBackend,
    GpuTileStorage, Producer, ProducerBase, SlotId, TaskBuilder, TextureFormat, Tile, TileCache,
    TileProducer, TileStorage, ZRangeReader,
};
use serde::{Deserialize, Serialize};

use crate::upsample::{child_offset, upsample};

/// Where elevation tiles are stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElevationOutput {
    /// `f32` host buffers.
    #[default]
    Cpu,
    /// Layers of an `R32F` array texture, written through a framebuffer.
    Gpu,
}

/// Configuration for an [`ElevationProducer`] with its own cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElevationProducerConfig {
    pub name: String,
    /// Tile size without borders; slots hold `tile_size + 5` samples per row.
    pub tile_size: u32,
    pub capacity: usize,
    /// Deepest level produced.
    pub max_level: u32,
    pub root_quad_size: f64,
    pub output: ElevationOutput,
}

impl Default for ElevationProducerConfig {
    fn default() -> Self {
        Self {
            name: "elevation".to_string(),
            tile_size: 24,
            capacity: 128,
            max_level: 16,
            root_quad_size: 1.0,
            output: ElevationOutput::Cpu,
        }
    }
}

impl ElevationProducerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub const fn with_tile_size(mut self, tile_size: u32) -> Self {
        self.tile_size = tile_size;
        self
    }

    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub const fn with_max_level(mut self, max_level: u32) -> Self {
        self.max_level = max_level;
        self
    }

    pub const fn with_root_quad_size(mut self, size: f64) -> Self {
        self.root_quad_size = size;
        self
    }

    pub const fn with_output(mut self, output: ElevationOutput) -> Self {
        self.output = output;
        self
    }
}

/// Read a slot of `f32` samples from a CPU storage or an `R32F` GPU storage.
pub fn read_samples(storage: &dyn TileStorage, slot: SlotId) -> Result<Vec<f32>> {
    if let Some(cpu) = storage.as_any().downcast_ref::<CpuTileStorage<f32>>() {
        return Ok(cpu.read(slot).clone());
    }
    if let Some(gpu) = storage.as_any().downcast_ref::<GpuTileStorage>() {
        check_gpu_format(gpu)?;
        let bytes = gpu.get_image(slot)?;
        return Ok(bytemuck::pod_collect_to_vec::<u8, f32>(&bytes));
    }
    Err(Error::Format("elevation storage must hold f32 samples".into()))
}

/// Overwrite a slot of `f32` samples in a CPU storage or an `R32F` GPU storage.
pub fn write_samples(storage: &dyn TileStorage, slot: SlotId, values: &[f32]) -> Result<()> {
    if let Some(cpu) = storage.as_any().downcast_ref::<CpuTileStorage<f32>>() {
        let mut data = cpu.write(slot);
        if data.len() != values.len() {
            return Err(Error::InvalidData(format!(
                "{} samples for a slot of {}",
                values.len(),
                data.len()
            )));
        }
        data.copy_from_slice(values);
        return Ok(());
    }
    if let Some(gpu) = storage.as_any().downcast_ref::<GpuTileStorage>() {
        check_gpu_format(gpu)?;
        return gpu.write_slot(slot, bytemuck::cast_slice(values));
    }
    Err(Error::Format("elevation storage must hold f32 samples".into()))
}

fn check_gpu_format(storage: &GpuTileStorage) -> Result<()> {
    if storage.format() == TextureFormat::R32F {
        Ok(())
    } else {
        Err(Error::Format(format!(
            "elevation textures must be R32F, not {:?}",
            storage.format()
        )))
    }
}

/// Reconstructs elevation tiles from residuals, level by level.
pub struct ElevationProducer {
    base: ProducerBase,
    residuals: Option<Producer>,
    tile_size: u32,
    max_level: u32,
    framebuffers: Option<Arc<FrameBufferFactory>>,
    batch_framebuffer: Mutex<Option<FrameBufferHandle>>,
}

impl ElevationProducer {
    /// Create a new producer over `cache`.
    ///
    /// The storage must hold `tile_size + 5` samples per row, either as `f32`
    /// host buffers or as an `R32F` GPU storage; GPU output is written through
    /// framebuffers of the storage's backend.
    pub fn new(
        name: impl Into<String>,
        cache: Arc<TileCache>,
        residuals: Option<Producer>,
        tile_size: u32,
    ) -> Result<Self> {
        let samples = tile_size + 5;
        if tile_size == 0 || tile_size % 2 != 0 {
            return Err(Error::Format(format!(
                "elevation tile size {tile_size} must be even"
            )));
        }
        let storage = cache.storage();
        if storage.tile_size() != samples {
            return Err(Error::Format(format!(
                "elevation tiles of {samples} samples do not fit slots of {}",
                storage.tile_size()
            )));
        }
        let framebuffers = if let Some(gpu) = storage.as_any().downcast_ref::<GpuTileStorage>() {
            check_gpu_format(gpu)?;
            Some(Arc::new(FrameBufferFactory::new(Arc::clone(gpu.backend()))))
        } else if let Some(cpu) = storage.as_any().downcast_ref::<CpuTileStorage<f32>>() {
            if cpu.channels() != 1 {
                return Err(Error::Format("elevation tiles have one channel".into()));
            }
            None
        } else {
            return Err(Error::Format("elevation storage must hold f32 samples".into()));
        };
        if let Some(residuals) = &residuals {
            if residuals.tile_size() != samples {
                return Err(Error::Format(format!(
                    "residual tiles of {} samples cannot refine elevation tiles of {samples}",
                    residuals.tile_size()
                )));
            }
        }
        Ok(Self {
            base: ProducerBase::new(name, cache).with_border(ELEVATION_BORDER),
            residuals,
            tile_size,
            max_level: proland_core::constants::MAX_LEVEL,
            framebuffers,
            batch_framebuffer: Mutex::new(None),
        })
    }

    /// Create a producer with its own cache.
    ///
    /// GPU output needs a `backend`.
    pub fn from_config(
        config: &ElevationProducerConfig,
        residuals: Option<Producer>,
        backend: Option<Arc<dyn GpuBackend>>,
    ) -> Result<Self> {
        let samples = config.tile_size + 5;
        let storage: Arc<dyn TileStorage> = match config.output {
            ElevationOutput::Cpu => Arc::new(CpuTileStorage::<f32>::new(samples, 1, config.capacity)),
            ElevationOutput::Gpu => {
                let backend = backend.ok_or_else(|| {
                    Error::Gpu(format!("{} needs a GPU backend", config.name))
                })?;
                Arc::new(GpuTileStorage::new(
                    backend,
                    samples,
                    config.capacity,
                    TextureFormat::R32F,
                )?)
            }
        };
        let cache = Arc::new(TileCache::new(config.name.clone(), storage));
        let producer = Self::new(config.name.clone(), cache, residuals, config.tile_size)?
            .with_max_level(config.max_level);
        producer.base.set_root_quad_size(config.root_quad_size);
        Ok(producer)
    }

    #[must_use]
    pub const fn with_max_level(mut self, max_level: u32) -> Self {
        self.max_level = max_level;
        self
    }

    /// Share a framebuffer factory with other GPU producers.
    #[must_use]
    pub fn with_framebuffers(mut self, factory: Arc<FrameBufferFactory>) -> Self {
        if self.framebuffers.is_some() {
            self.framebuffers = Some(factory);
        }
        self
    }

    /// Tile size without borders.
    pub const fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub const fn max_level(&self) -> u32 {
        self.max_level
    }

    pub const fn residuals(&self) -> Option<&Producer> {
        self.residuals.as_ref()
    }

    /// Samples of one of this producer's tiles.
    pub fn read_tile(&self, tile: &Tile) -> Result<Vec<f32>> {
        read_samples(self.base.cache().storage().as_ref(), tile.slot())
    }

    fn samples(&self) -> usize {
        (self.tile_size + 5) as usize
    }

    fn write_tile(&self, slot: SlotId, values: &[f32]) -> Result<()> {
        let storage = self.base.cache().storage();
        let Some(factory) = &self.framebuffers else {
            return write_samples(storage.as_ref(), slot, values);
        };
        let gpu = storage
            .as_any()
            .downcast_ref::<GpuTileStorage>()
            .ok_or_else(|| Error::Gpu("elevation storage is not a GPU storage".into()))?;
        let n = self.samples() as u32;
        let framebuffer = match *self.batch_framebuffer.lock() {
            Some(fb) => fb,
            None => factory.get(TextureFormat::R32F, n, n)?,
        };
        factory
            .backend()
            .draw_pixels(framebuffer, (0, 0), (n, n), bytemuck::cast_slice(values))?;
        gpu.copy_pixels(slot, framebuffer, (0, 0), (n, n))
    }
}

impl TileProducer for ElevationProducer {
    fn base(&self) -> &ProducerBase {
        &self.base
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn has_tile(&self, coord: TileCoord) -> bool {
        coord.is_valid() && coord.level <= self.max_level
    }

    fn referenced_producers(&self) -> Vec<Producer> {
        self.residuals.iter().cloned().collect()
    }

    fn uses_gpu(&self) -> bool {
        self.framebuffers.is_some()
    }

    fn z_range_reader(&self) -> Option<&dyn ZRangeReader> {
        Some(self)
    }

    fn start_create_tile(&self, this: &Producer, coord: TileCoord, builder: &mut TaskBuilder) -> Result<()> {
        if let Some(parent) = coord.parent() {
            builder.acquire(this, parent)?;
        }
        if let Some(residuals) = &self.residuals {
            if residuals.has_tile(coord) {
                builder.acquire(residuals, coord)?;
            }
        }
        Ok(())
    }

    fn begin_create_tile(&self) -> Result<()> {
        if let Some(factory) = &self.framebuffers {
            let n = self.samples() as u32;
            *self.batch_framebuffer.lock() = Some(factory.get(TextureFormat::R32F, n, n)?);
        }
        Ok(())
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn do_create_tile(&self, coord: TileCoord, slot: SlotId, task: &CreateTileTask) -> Result<()> {
        let n = self.samples();
        let mut z = vec![0.0f32; n * n];

        if let Some(parent) = coord.parent() {
            let parent_tile = task
                .acquired_tile(self.base.id(), parent)
                .ok_or_else(|| Error::NotFound(format!("parent {parent} of {coord}")))?;
            let parent_values = self.read_tile(&parent_tile)?;
            upsample(&parent_values, n, child_offset(coord, self.tile_size), &mut z, n)?;
        }

        if let Some(residuals) = &self.residuals {
            if let Some(tile) = task.acquired_from(residuals, coord) {
                let storage = residuals
                    .cache()
                    .storage_as::<CpuTileStorage<f32>>()
                    .ok_or_else(|| Error::Format("residual storage is not an f32 CPU storage".into()))?;
                for (z, r) in z.iter_mut().zip(storage.read(tile.slot()).iter()) {
                    *z += r;
                }
            }
        }

        self.write_tile(slot, &z)?;
        tracing::trace!(producer = %self.base.name(), %coord, "Created elevation tile");
        Ok(())
    }

    fn end_create_tile(&self) -> Result<()> {
        self.batch_framebuffer.lock().take();
        Ok(())
    }
}

impl ZRangeReader for ElevationProducer {
    fn z_range(&self, tile: &Tile) -> Option<(f32, f32)> {
        if !tile.is_ready() {
            return None;
        }
        let values = self.read_tile(tile).ok()?;
        let n = self.samples();
        let border = ELEVATION_BORDER as usize;
        let inner = border..=border + self.tile_size as usize;
        let mut range = (f32::INFINITY, f32::NEG_INFINITY);
        for row in values.chunks_exact(n).skip(border).take(inner.clone().count()) {
            for &v in &row[inner.clone()] {
                range.0 = range.0.min(v);
                range.1 = range.1.max(v);
            }
        }
        Some(range)
    }

    fn height_at(&self, tile: &Tile, u: f64, v: f64) -> Option<f32> {
        if !tile.is_ready() {
            return None;
        }
        let values = self.read_tile(tile).ok()?;
        let n = self.samples();
        let s = f64::from(self.tile_size);
        let border = f64::from(ELEVATION_BORDER);
        let x = (border + u.clamp(0.0, 1.0) * s).min((n - 2) as f64);
        let y = (border + v.clamp(0.0, 1.0) * s).min((n - 2) as f64);
        let (x0, y0) = (x.floor() as usize, y.floor() as usize);
        let (fx, fy) = ((x - x0 as f64) as f32, (y - y0 as f64) as f32);
        let at = |i: usize, j: usize| values[j * n + i];
        let top = at(x0, y0) * (1.0 - fx) + at(x0 + 1, y0) * fx;
        let bottom = at(x0, y0 + 1) * (1.0 - fx) + at(x0 + 1, y0 + 1) * fx;
        Some(top * (1.0 - fy) + bottom * fy)
    }
}

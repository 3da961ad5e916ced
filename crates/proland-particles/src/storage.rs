//! Packed particle pool.
//!
//! Particles live in one contiguous buffer of fixed-size records. Each record
//! holds the layer data of the particle followed by an 8-byte back-index: the
//! position of the particle in the index vector. The index vector lists the
//! free records first and the allocated ones after them, so allocation and
//! deletion are swaps at the boundary between the two parts.
//!
//! With packing enabled the free part is a min-heap over record addresses and
//! allocations always return the lowest free record, keeping live particles
//! at the start of the buffer.

use std::marker::PhantomData;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use bytemuck::Pod;
use hashbrown::HashMap;
use proland_core::{Error, Result};
use proland_producer::{GpuBackend, TextureFormat, TextureHandle};
use serde::{Deserialize, Serialize};

const BACK_INDEX_BYTES: usize = 8;

/// Record size for `layer_bytes` bytes of layer data.
pub const fn particle_size(layer_bytes: usize) -> usize {
    layer_bytes.div_ceil(8) * 8 + BACK_INDEX_BYTES
}

/// Handle to a particle record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParticleId(pub u32);

impl ParticleId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Pool parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticleStorageConfig {
    pub capacity: usize,
    /// Allocate the lowest free record first.
    pub pack: bool,
}

impl Default for ParticleStorageConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            pack: false,
        }
    }
}

impl ParticleStorageConfig {
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub const fn with_pack(mut self, pack: bool) -> Self {
        self.pack = pack;
        self
    }
}

/// Per-particle data mirrored in a GPU texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuParticleBuffer {
    pub format: TextureFormat,
    /// Texels per particle.
    pub components: u32,
    pub texture: TextureHandle,
}

/// Typed view of one layer's record inside each particle.
pub struct LayerView<T> {
    offset: usize,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for LayerView<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for LayerView<T> {}

impl<T> std::fmt::Debug for LayerView<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerView").field("offset", &self.offset).finish()
    }
}

impl<T: Pod> LayerView<T> {
    pub const fn new(offset: usize) -> Self {
        Self {
            offset,
            _record: PhantomData,
        }
    }

    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// The record inside the layer data of one particle.
    ///
    /// `None` if the record does not fit or is misaligned.
    pub fn get<'a>(&self, particle: &'a [u8]) -> Option<&'a T> {
        let bytes = particle.get(self.offset..self.offset + std::mem::size_of::<T>())?;
        bytemuck::try_from_bytes(bytes).ok()
    }

    pub fn get_mut<'a>(&self, particle: &'a mut [u8]) -> Option<&'a mut T> {
        let bytes = particle.get_mut(self.offset..self.offset + std::mem::size_of::<T>())?;
        bytemuck::try_from_bytes_mut(bytes).ok()
    }

    pub fn read<'a>(&self, storage: &'a ParticleStorage, id: ParticleId) -> Option<&'a T> {
        self.get(storage.data(id)?)
    }

    pub fn write<'a>(&self, storage: &'a mut ParticleStorage, id: ParticleId) -> Option<&'a mut T> {
        self.get_mut(storage.data_mut(id)?)
    }
}

/// Fixed-capacity pool of particle records.
pub struct ParticleStorage {
    capacity: usize,
    layer_bytes: usize,
    particle_size: usize,
    pack: bool,
    /// Record bytes; `u64` words keep every record 8-byte aligned.
    data: Vec<u64>,
    /// Record indices, free ones in `..free`.
    index: Vec<u32>,
    free: usize,
    gpu: HashMap<String, (Arc<dyn GpuBackend>, GpuParticleBuffer)>,
}

impl ParticleStorage {
    /// Create a new pool of `capacity` records with `layer_bytes` of layer
    /// data each.
    pub fn new(capacity: usize, layer_bytes: usize, pack: bool) -> Self {
        let particle_size = particle_size(layer_bytes);
        let mut storage = Self {
            capacity,
            layer_bytes,
            particle_size,
            pack,
            data: vec![0; capacity * particle_size / 8],
            index: (0..capacity as u32).collect(),
            free: capacity,
            gpu: HashMap::new(),
        };
        for i in 0..capacity {
            storage.set_back_index(storage.index[i], i);
        }
        tracing::debug!(
            capacity,
            particle_size,
            pack,
            bytes = capacity * particle_size,
            "Created particle storage"
        );
        storage
    }

    pub fn from_config(config: &ParticleStorageConfig, layer_bytes: usize) -> Self {
        Self::new(config.capacity, layer_bytes, config.pack)
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes of layer data per particle.
    pub const fn layer_bytes(&self) -> usize {
        self.layer_bytes
    }

    /// Bytes per record, back-index included.
    pub const fn particle_size(&self) -> usize {
        self.particle_size
    }

    pub const fn is_packed(&self) -> bool {
        self.pack
    }

    pub const fn free_count(&self) -> usize {
        self.free
    }

    pub const fn len(&self) -> usize {
        self.capacity - self.free
    }

    pub const fn is_empty(&self) -> bool {
        self.free == self.capacity
    }

    /// Byte offset of a record in the pool.
    pub const fn address(&self, id: ParticleId) -> usize {
        id.index() * self.particle_size
    }

    fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.data)
    }

    /// The whole pool, for uploads.
    pub fn as_bytes(&self) -> &[u8] {
        self.bytes()
    }

    /// Position of a record in the index vector, as stored in the record.
    pub fn back_index(&self, id: ParticleId) -> usize {
        let end = self.address(id) + self.particle_size;
        LittleEndian::read_u64(&self.bytes()[end - BACK_INDEX_BYTES..end]) as usize
    }

    fn set_back_index(&mut self, record: u32, position: usize) {
        let end = self.address(ParticleId(record)) + self.particle_size;
        LittleEndian::write_u64(&mut self.bytes_mut()[end - BACK_INDEX_BYTES..end], position as u64);
    }

    pub fn is_allocated(&self, id: ParticleId) -> bool {
        id.index() < self.capacity && self.back_index(id) >= self.free
    }

    /// Layer data of a record.
    pub fn data(&self, id: ParticleId) -> Option<&[u8]> {
        if id.index() >= self.capacity {
            return None;
        }
        let start = self.address(id);
        Some(&self.bytes()[start..start + self.layer_bytes])
    }

    pub fn data_mut(&mut self, id: ParticleId) -> Option<&mut [u8]> {
        if id.index() >= self.capacity {
            return None;
        }
        let start = self.address(id);
        let len = self.layer_bytes;
        Some(&mut self.bytes_mut()[start..start + len])
    }

    fn swap_entries(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.index.swap(a, b);
        self.set_back_index(self.index[a], a);
        self.set_back_index(self.index[b], b);
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.index[parent] <= self.index[pos] {
                break;
            }
            self.swap_entries(parent, pos);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize, len: usize) {
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.index[right] < self.index[left] {
                right
            } else {
                left
            };
            if self.index[pos] <= self.index[child] {
                break;
            }
            self.swap_entries(pos, child);
            pos = child;
        }
    }

    /// Allocate a record with zeroed layer data.
    pub fn new_particle(&mut self) -> Result<ParticleId> {
        if self.free == 0 {
            return Err(Error::Exhausted {
                capacity: self.capacity,
            });
        }
        if self.pack {
            self.swap_entries(0, self.free - 1);
            self.sift_down(0, self.free - 1);
        }
        self.free -= 1;
        let id = ParticleId(self.index[self.free]);
        if let Some(data) = self.data_mut(id) {
            data.fill(0);
        }
        Ok(id)
    }

    fn release_at(&mut self, position: usize) {
        self.swap_entries(position, self.free);
        self.free += 1;
        if self.pack {
            self.sift_up(self.free - 1);
        }
    }

    /// Return a record to the free part of the pool.
    pub fn delete_particle(&mut self, id: ParticleId) -> Result<()> {
        if id.index() >= self.capacity {
            return Err(Error::OutOfBounds(format!(
                "particle {} in a pool of {}",
                id.0, self.capacity
            )));
        }
        let position = self.back_index(id);
        if position < self.free {
            return Err(Error::InvalidData(format!("particle {} is not allocated", id.0)));
        }
        self.release_at(position);
        Ok(())
    }

    /// Allocated particles, in index vector order.
    pub fn particles(&self) -> impl Iterator<Item = ParticleId> + '_ {
        self.index[self.free..].iter().map(|&i| ParticleId(i))
    }

    /// Visit the layer data of every allocated particle.
    pub fn for_each_mut(&mut self, mut f: impl FnMut(ParticleId, &mut [u8])) {
        let len = self.layer_bytes;
        for position in self.free..self.capacity {
            let id = ParticleId(self.index[position]);
            let start = self.address(id);
            f(id, &mut self.bytes_mut()[start..start + len]);
        }
    }

    /// Delete every particle for which `keep` returns false.
    ///
    /// Each allocated particle is visited exactly once. Returns the number of
    /// deleted particles.
    pub fn retain(&mut self, mut keep: impl FnMut(ParticleId, &mut [u8]) -> bool) -> usize {
        let mut removed = 0;
        let mut position = self.free;
        while position < self.capacity {
            let id = ParticleId(self.index[position]);
            let start = self.address(id);
            let len = self.layer_bytes;
            if !keep(id, &mut self.bytes_mut()[start..start + len]) {
                // The entry swapped in was already visited.
                self.release_at(position);
                removed += 1;
            }
            position += 1;
        }
        removed
    }

    /// Delete every particle.
    pub fn clear(&mut self) {
        self.retain(|_, _| false);
    }

    /// Create a GPU texture holding `components` texels of `format` per
    /// particle, replacing any previous one named `name`.
    pub fn init_gpu_storage(
        &mut self,
        backend: &Arc<dyn GpuBackend>,
        name: &str,
        format: TextureFormat,
        components: u32,
    ) -> Result<GpuParticleBuffer> {
        if matches!(format, TextureFormat::R32I) {
            return Err(Error::Format(format!(
                "unsupported particle storage format {format:?}"
            )));
        }
        if components == 0 {
            return Err(Error::InvalidData(format!("{name}: zero components per particle")));
        }
        let width = self.capacity as u32 * components;
        let texture = backend.create_texture_array(format, width, 1, 1)?;
        let buffer = GpuParticleBuffer {
            format,
            components,
            texture,
        };
        if let Some((old_backend, old)) = self.gpu.insert(name.to_string(), (Arc::clone(backend), buffer)) {
            old_backend.release_texture(old.texture);
        }
        tracing::debug!(name, ?format, components, width, "Created particle GPU storage");
        Ok(buffer)
    }

    pub fn gpu_storage(&self, name: &str) -> Option<GpuParticleBuffer> {
        self.gpu.get(name).map(|(_, buffer)| *buffer)
    }

    /// Upload the texels of every record to a GPU storage.
    pub fn write_gpu_storage(&self, name: &str, texels: &[u8]) -> Result<()> {
        let (backend, buffer) = self
            .gpu
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("particle GPU storage {name}")))?;
        backend.write_layer(buffer.texture, 0, texels)
    }
}

impl Drop for ParticleStorage {
    fn drop(&mut self) {
        for (backend, buffer) in self.gpu.values() {
            backend.release_texture(buffer.texture);
        }
    }
}

impl std::fmt::Debug for ParticleStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParticleStorage")
            .field("capacity", &self.capacity)
            .field("particle_size", &self.particle_size)
            .field("allocated", &self.len())
            .field("pack", &self.pack)
            .finish_non_exhaustive()
    }
}

//! Opaque GPU collaborator interface.
//!
//! Producers never talk to a graphics API directly. Textures and framebuffers
//! are opaque handles created and consumed through [`GpuBackend`]; the render
//! thread that owns the real device implements it. [`HostBackend`] keeps every
//! image in host memory for headless runs and tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use proland_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Pixel formats of array textures and framebuffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureFormat {
    R8,
    RG8,
    RGBA8,
    R16F,
    RG16F,
    RGBA16F,
    R32F,
    RG32F,
    RGBA32F,
    R32I,
}

impl TextureFormat {
    /// Number of bytes in a single texel.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::R8 => 1,
            Self::RG8 | Self::R16F => 2,
            Self::RGBA8 | Self::RG16F | Self::R32F | Self::R32I => 4,
            Self::RGBA16F | Self::RG32F => 8,
            Self::RGBA32F => 16,
        }
    }

    /// Number of channels per texel.
    pub const fn components(self) -> usize {
        match self {
            Self::R8 | Self::R16F | Self::R32F | Self::R32I => 1,
            Self::RG8 | Self::RG16F | Self::RG32F => 2,
            Self::RGBA8 | Self::RGBA16F | Self::RGBA32F => 4,
        }
    }
}

/// Handle to an array texture owned by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

/// Handle to an offscreen framebuffer owned by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameBufferHandle(pub u64);

/// Operations the tile pipeline needs from the render thread.
pub trait GpuBackend: Send + Sync {
    /// Create an array texture with `layers` layers of `width × height` texels.
    fn create_texture_array(
        &self,
        format: TextureFormat,
        width: u32,
        height: u32,
        layers: u32,
    ) -> Result<TextureHandle>;

    fn release_texture(&self, texture: TextureHandle);

    /// Create an offscreen framebuffer with one color attachment.
    fn create_framebuffer(
        &self,
        format: TextureFormat,
        width: u32,
        height: u32,
    ) -> Result<FrameBufferHandle>;

    fn release_framebuffer(&self, framebuffer: FrameBufferHandle);

    /// Render a rectangle of texels into a framebuffer.
    ///
    /// Stands in for the full-screen pass a producer issues; `pixels` holds
    /// the tightly packed result of that pass.
    fn draw_pixels(
        &self,
        framebuffer: FrameBufferHandle,
        origin: (u32, u32),
        size: (u32, u32),
        pixels: &[u8],
    ) -> Result<()>;

    /// Read back a rectangle of a framebuffer.
    fn read_pixels(
        &self,
        framebuffer: FrameBufferHandle,
        origin: (u32, u32),
        size: (u32, u32),
    ) -> Result<Vec<u8>>;

    /// Copy a framebuffer rectangle into the origin of one texture layer.
    fn copy_to_layer(
        &self,
        framebuffer: FrameBufferHandle,
        origin: (u32, u32),
        size: (u32, u32),
        texture: TextureHandle,
        layer: u32,
    ) -> Result<()>;

    /// Upload a whole layer.
    fn write_layer(&self, texture: TextureHandle, layer: u32, pixels: &[u8]) -> Result<()>;

    /// Read back a whole layer.
    fn read_layer(&self, texture: TextureHandle, layer: u32) -> Result<Vec<u8>>;
}

#[derive(Debug)]
struct HostImage {
    format: TextureFormat,
    width: u32,
    height: u32,
    layers: u32,
    data: Vec<u8>,
}

impl HostImage {
    fn new(format: TextureFormat, width: u32, height: u32, layers: u32) -> Self {
        let len = format.bytes_per_pixel() * (width * height * layers) as usize;
        Self {
            format,
            width,
            height,
            layers,
            data: vec![0; len],
        }
    }

    fn row_bytes(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    fn layer_bytes(&self) -> usize {
        self.row_bytes() * self.height as usize
    }

    fn check_rect(&self, origin: (u32, u32), size: (u32, u32)) -> Result<()> {
        if origin.0 + size.0 > self.width || origin.1 + size.1 > self.height {
            return Err(Error::OutOfBounds(format!(
                "rectangle {origin:?}+{size:?} outside {}x{} image",
                self.width, self.height
            )));
        }
        Ok(())
    }

    fn rect_rows(&self, layer: u32, origin: (u32, u32), size: (u32, u32)) -> impl Iterator<Item = std::ops::Range<usize>> + '_ {
        let bpp = self.format.bytes_per_pixel();
        let base = layer as usize * self.layer_bytes();
        (origin.1..origin.1 + size.1).map(move |y| {
            let start = base + y as usize * self.row_bytes() + origin.0 as usize * bpp;
            start..start + size.0 as usize * bpp
        })
    }
}

/// A [`GpuBackend`] that keeps every image in host memory.
#[derive(Debug, Default)]
pub struct HostBackend {
    next_handle: AtomicU64,
    textures: Mutex<HashMap<u64, HostImage>>,
    framebuffers: Mutex<HashMap<u64, HostImage>>,
}

impl HostBackend {
    /// Create a new host backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live textures and framebuffers.
    pub fn resource_count(&self) -> usize {
        self.textures.lock().len() + self.framebuffers.lock().len()
    }

    fn next(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed) + 1
    }
}

fn missing(kind: &str, id: u64) -> Error {
    Error::NotFound(format!("{kind} #{id}"))
}

impl GpuBackend for HostBackend {
    fn create_texture_array(
        &self,
        format: TextureFormat,
        width: u32,
        height: u32,
        layers: u32,
    ) -> Result<TextureHandle> {
        let id = self.next();
        self.textures
            .lock()
            .insert(id, HostImage::new(format, width, height, layers));
        Ok(TextureHandle(id))
    }

    fn release_texture(&self, texture: TextureHandle) {
        self.textures.lock().remove(&texture.0);
    }

    fn create_framebuffer(
        &self,
        format: TextureFormat,
        width: u32,
        height: u32,
    ) -> Result<FrameBufferHandle> {
        let id = self.next();
        self.framebuffers
            .lock()
            .insert(id, HostImage::new(format, width, height, 1));
        Ok(FrameBufferHandle(id))
    }

    fn release_framebuffer(&self, framebuffer: FrameBufferHandle) {
        self.framebuffers.lock().remove(&framebuffer.0);
    }

    fn draw_pixels(
        &self,
        framebuffer: FrameBufferHandle,
        origin: (u32, u32),
        size: (u32, u32),
        pixels: &[u8],
    ) -> Result<()> {
        let mut framebuffers = self.framebuffers.lock();
        let image = framebuffers
            .get_mut(&framebuffer.0)
            .ok_or_else(|| missing("framebuffer", framebuffer.0))?;
        image.check_rect(origin, size)?;
        let row_len = size.0 as usize * image.format.bytes_per_pixel();
        if pixels.len() != row_len * size.1 as usize {
            return Err(Error::InvalidData(format!(
                "expected {} bytes of pixels, got {}",
                row_len * size.1 as usize,
                pixels.len()
            )));
        }
        let rows: Vec<_> = image.rect_rows(0, origin, size).collect();
        for (row, src) in rows.into_iter().zip(pixels.chunks_exact(row_len)) {
            image.data[row].copy_from_slice(src);
        }
        Ok(())
    }

    fn read_pixels(
        &self,
        framebuffer: FrameBufferHandle,
        origin: (u32, u32),
        size: (u32, u32),
    ) -> Result<Vec<u8>> {
        let framebuffers = self.framebuffers.lock();
        let image = framebuffers
            .get(&framebuffer.0)
            .ok_or_else(|| missing("framebuffer", framebuffer.0))?;
        image.check_rect(origin, size)?;
        Ok(image
            .rect_rows(0, origin, size)
            .flat_map(|row| image.data[row].iter().copied())
            .collect())
    }

    fn copy_to_layer(
        &self,
        framebuffer: FrameBufferHandle,
        origin: (u32, u32),
        size: (u32, u32),
        texture: TextureHandle,
        layer: u32,
    ) -> Result<()> {
        let pixels = self.read_pixels(framebuffer, origin, size)?;
        let mut textures = self.textures.lock();
        let image = textures
            .get_mut(&texture.0)
            .ok_or_else(|| missing("texture", texture.0))?;
        if layer >= image.layers {
            return Err(Error::OutOfBounds(format!(
                "layer {layer} of {}-layer texture",
                image.layers
            )));
        }
        image.check_rect((0, 0), size)?;
        let row_len = size.0 as usize * image.format.bytes_per_pixel();
        let rows: Vec<_> = image.rect_rows(layer, (0, 0), size).collect();
        for (row, src) in rows.into_iter().zip(pixels.chunks_exact(row_len)) {
            image.data[row].copy_from_slice(src);
        }
        Ok(())
    }

    fn write_layer(&self, texture: TextureHandle, layer: u32, pixels: &[u8]) -> Result<()> {
        let mut textures = self.textures.lock();
        let image = textures
            .get_mut(&texture.0)
            .ok_or_else(|| missing("texture", texture.0))?;
        let len = image.layer_bytes();
        if layer >= image.layers || pixels.len() != len {
            return Err(Error::OutOfBounds(format!(
                "write of {} bytes to layer {layer} ({len} bytes, {} layers)",
                pixels.len(),
                image.layers
            )));
        }
        let start = layer as usize * len;
        image.data[start..start + len].copy_from_slice(pixels);
        Ok(())
    }

    fn read_layer(&self, texture: TextureHandle, layer: u32) -> Result<Vec<u8>> {
        let textures = self.textures.lock();
        let image = textures
            .get(&texture.0)
            .ok_or_else(|| missing("texture", texture.0))?;
        if layer >= image.layers {
            return Err(Error::OutOfBounds(format!(
                "layer {layer} of {}-layer texture",
                image.layers
            )));
        }
        let len = image.layer_bytes();
        let start = layer as usize * len;
        Ok(image.data[start..start + len].to_vec())
    }
}

/// Framebuffers shared by value: one per `(format, width, height)`.
pub struct FrameBufferFactory {
    backend: Arc<dyn GpuBackend>,
    framebuffers: Mutex<HashMap<(TextureFormat, u32, u32), FrameBufferHandle>>,
}

impl FrameBufferFactory {
    /// Create a new factory over a backend.
    pub fn new(backend: Arc<dyn GpuBackend>) -> Self {
        Self {
            backend,
            framebuffers: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    /// The framebuffer for this format and size, created on first use.
    pub fn get(&self, format: TextureFormat, width: u32, height: u32) -> Result<FrameBufferHandle> {
        let mut framebuffers = self.framebuffers.lock();
        if let Some(&fb) = framebuffers.get(&(format, width, height)) {
            return Ok(fb);
        }
        let fb = self.backend.create_framebuffer(format, width, height)?;
        tracing::debug!(?format, width, height, "Created framebuffer");
        framebuffers.insert((format, width, height), fb);
        Ok(fb)
    }

    pub fn len(&self) -> usize {
        self.framebuffers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for FrameBufferFactory {
    fn drop(&mut self) {
        for (_, fb) in self.framebuffers.get_mut().drain() {
            self.backend.release_framebuffer(fb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_caches_by_format_and_size() {
        let backend = Arc::new(HostBackend::new());
        let factory = FrameBufferFactory::new(backend.clone());
        let a = factory.get(TextureFormat::R32F, 16, 16).unwrap();
        let b = factory.get(TextureFormat::R32F, 16, 16).unwrap();
        let c = factory.get(TextureFormat::RGBA8, 16, 16).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(factory.len(), 2);
        drop(factory);
        assert_eq!(backend.resource_count(), 0);
    }

    #[test]
    fn framebuffer_rect_copies_into_layer() {
        let backend = HostBackend::new();
        let fb = backend.create_framebuffer(TextureFormat::R8, 4, 4).unwrap();
        let tex = backend
            .create_texture_array(TextureFormat::R8, 2, 2, 3)
            .unwrap();
        backend.draw_pixels(fb, (1, 1), (2, 2), &[1, 2, 3, 4]).unwrap();
        backend.copy_to_layer(fb, (1, 1), (2, 2), tex, 2).unwrap();
        assert_eq!(backend.read_layer(tex, 2).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(backend.read_layer(tex, 0).unwrap(), vec![0; 4]);
    }

    #[test]
    fn out_of_range_rect_is_rejected() {
        let backend = HostBackend::new();
        let fb = backend.create_framebuffer(TextureFormat::R8, 2, 2).unwrap();
        assert!(backend.read_pixels(fb, (1, 1), (2, 2)).is_err());
    }
}

//! Encoding residual pyramids into the residual file format.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use proland_core::{Error, Result};

use super::format::{OffsetTable, ResidualHeader, TileEntry};
use super::strip::{self, Compression};

/// Builds a residual file tile by tile.
///
/// Tiles never set are written with an empty payload and read back as zeros.
#[derive(Debug, Clone)]
pub struct ResidualWriter {
    header: ResidualHeader,
    compression: Compression,
    payloads: Vec<Vec<u8>>,
}

impl ResidualWriter {
    /// Create a new writer for a pyramid with this header.
    pub fn new(header: ResidualHeader) -> Self {
        let count = header.tile_count();
        Self {
            header,
            compression: Compression::default(),
            payloads: vec![Vec::new(); count],
        }
    }

    #[must_use]
    pub const fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub const fn header(&self) -> &ResidualHeader {
        &self.header
    }

    /// Encode the stored samples of file tile `(level, tx, ty)`.
    ///
    /// `samples` holds `samples_at(level)²` values, row-major.
    pub fn set_tile(&mut self, level: u32, tx: u32, ty: u32, samples: &[i16]) -> Result<()> {
        if !self.header.contains(level, tx, ty) {
            return Err(Error::OutOfBounds(format!(
                "residual tile ({level}, {tx}, {ty}) outside levels 0..={}",
                self.header.max_level
            )));
        }
        let n = self.header.samples_at(level);
        if samples.len() != (n * n) as usize {
            return Err(Error::InvalidData(format!(
                "{} samples for a {n}x{n} residual tile",
                samples.len()
            )));
        }
        let id = self.header.tile_id(level, tx, ty);
        self.payloads[id] = strip::encode(n, n, samples, self.compression)?;
        Ok(())
    }

    /// Quantize elevation residuals by the header scale and store them.
    pub fn set_tile_f32(&mut self, level: u32, tx: u32, ty: u32, values: &[f32]) -> Result<()> {
        let samples = quantize(values, self.header.scale);
        self.set_tile(level, tx, ty, &samples)
    }

    /// Store an already encoded payload for table entry `id`.
    pub fn set_payload(&mut self, id: usize, payload: Vec<u8>) -> Result<()> {
        let count = self.payloads.len();
        let slot = self
            .payloads
            .get_mut(id)
            .ok_or_else(|| Error::OutOfBounds(format!("tile id {id} in a table of {count}")))?;
        *slot = payload;
        Ok(())
    }

    pub fn write_to(&self, mut writer: impl Write) -> Result<()> {
        self.header.write(&mut writer)?;
        let mut entries = Vec::with_capacity(self.payloads.len());
        let mut offset = 0u64;
        for payload in &self.payloads {
            let size = payload.len() as u64;
            if offset + size > u64::from(u32::MAX) {
                return Err(Error::Format(
                    "residual payloads exceed the 4 GiB offset range".into(),
                ));
            }
            entries.push(TileEntry {
                offset: offset as u32,
                size: size as u32,
            });
            offset += size;
        }
        OffsetTable::new(entries).write(&mut writer)?;
        for payload in &self.payloads {
            writer.write_all(payload)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.write_to(&mut bytes)?;
        Ok(bytes)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.write_to(BufWriter::new(File::create(path)?))?;
        tracing::info!(path = %path.display(), tiles = self.payloads.len(), "Saved residual file");
        Ok(())
    }
}

/// Round `values / scale` to the nearest representable sample.
pub fn quantize(values: &[f32], scale: f32) -> Vec<i16> {
    values
        .iter()
        .map(|&v| {
            let q = if scale == 0.0 { 0.0 } else { (v / scale).round() };
            q.clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
        })
        .collect()
}

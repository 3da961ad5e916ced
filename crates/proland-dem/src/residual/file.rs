//! Access to the payloads of one residual file.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use proland_core::{Error, Result};
use serde::{Deserialize, Serialize};

use super::format::{OffsetTable, ResidualHeader, TileEntry};

/// How payload reads reach the file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    /// One handle, reads serialized by a mutex.
    #[default]
    Shared,
    /// Open the file for every read.
    PerCall,
    /// Load the whole file into memory at open.
    Memory,
}

enum Source {
    Shared(Mutex<File>),
    PerCall,
    Memory(Arc<[u8]>),
}

/// An opened residual file: header, offset table and payload access.
pub struct ResidualFile {
    path: Option<PathBuf>,
    header: ResidualHeader,
    table: OffsetTable,
    source: Source,
}

impl ResidualFile {
    /// Open a file on disk, checking every table entry against its length.
    pub fn open(path: impl AsRef<Path>, mode: AccessMode) -> Result<Self> {
        let path = path.as_ref();
        if mode == AccessMode::Memory {
            let bytes: Arc<[u8]> = std::fs::read(path)?.into();
            let mut file = Self::from_bytes(bytes)?;
            file.path = Some(path.to_path_buf());
            return Ok(file);
        }

        let file = File::open(path)?;
        let len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let header = ResidualHeader::read(&mut reader)?;
        let table = OffsetTable::read(&mut reader, &header)?;
        let data_start = header.data_start() as u64;
        table.check_bounds(len.saturating_sub(data_start))?;
        let source = match mode {
            AccessMode::Shared => Source::Shared(Mutex::new(reader.into_inner())),
            _ => Source::PerCall,
        };
        tracing::info!(
            path = %path.display(),
            ?mode,
            levels = header.max_level + 1,
            tile_size = header.tile_size,
            "Opened residual file"
        );
        Ok(Self {
            path: Some(path.to_path_buf()),
            header,
            table,
            source,
        })
    }

    /// Use a residual file already held in memory.
    pub fn from_bytes(bytes: Arc<[u8]>) -> Result<Self> {
        let mut reader: &[u8] = &bytes;
        let header = ResidualHeader::read(&mut reader)?;
        let table = OffsetTable::read(&mut reader, &header)?;
        let data_len = bytes.len().saturating_sub(header.data_start());
        table.check_bounds(data_len as u64)?;
        Ok(Self {
            path: None,
            header,
            table,
            source: Source::Memory(bytes),
        })
    }

    pub const fn header(&self) -> &ResidualHeader {
        &self.header
    }

    pub const fn table(&self) -> &OffsetTable {
        &self.table
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub const fn access_mode(&self) -> AccessMode {
        match self.source {
            Source::Shared(_) => AccessMode::Shared,
            Source::PerCall => AccessMode::PerCall,
            Source::Memory(_) => AccessMode::Memory,
        }
    }

    /// Table entry of file tile `(level, tx, ty)`.
    pub fn entry(&self, level: u32, tx: u32, ty: u32) -> Result<TileEntry> {
        if !self.header.contains(level, tx, ty) {
            return Err(Error::NotFound(format!(
                "residual tile ({level}, {tx}, {ty}) outside the file's pyramid"
            )));
        }
        self.table.get(self.header.tile_id(level, tx, ty))
    }

    /// Read the payload of table entry `id` into `buf`, replacing its contents.
    pub fn read_payload(&self, id: usize, buf: &mut Vec<u8>) -> Result<()> {
        let entry = self.table.get(id)?;
        buf.clear();
        buf.resize(entry.size as usize, 0);
        if entry.size == 0 {
            return Ok(());
        }
        let start = self.header.data_start() as u64 + u64::from(entry.offset);
        match &self.source {
            Source::Shared(file) => {
                let mut file = file.lock();
                file.seek(SeekFrom::Start(start))?;
                file.read_exact(buf)?;
            }
            Source::PerCall => {
                let path = self
                    .path
                    .as_deref()
                    .ok_or_else(|| Error::NotFound("residual file path".into()))?;
                let mut file = File::open(path)?;
                file.seek(SeekFrom::Start(start))?;
                file.read_exact(buf)?;
            }
            Source::Memory(bytes) => {
                let range = start as usize..start as usize + buf.len();
                let payload = bytes.get(range).ok_or_else(|| {
                    Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("payload of tile {id} past the end of the file"),
                    ))
                })?;
                buf.copy_from_slice(payload);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ResidualFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResidualFile")
            .field("path", &self.path)
            .field("header", &self.header)
            .field("access", &self.access_mode())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::residual::writer::ResidualWriter;

    fn single_tile_file() -> Vec<u8> {
        let header = ResidualHeader::new(0, 0, 6, 2.0);
        let mut writer = ResidualWriter::new(header);
        writer.set_tile(0, 0, 0, &vec![100; 121]).unwrap();
        writer.to_bytes().unwrap()
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("proland-{}-{name}.res", std::process::id()))
    }

    #[test]
    fn every_access_mode_reads_the_same_payload() {
        let bytes = single_tile_file();
        let path = temp_path("access");
        std::fs::write(&path, &bytes).unwrap();

        let mut payloads = Vec::new();
        for mode in [AccessMode::Shared, AccessMode::PerCall, AccessMode::Memory] {
            let file = ResidualFile::open(&path, mode).unwrap();
            assert_eq!(file.access_mode(), mode);
            let mut buf = Vec::new();
            file.read_payload(0, &mut buf).unwrap();
            payloads.push(buf);
        }
        std::fs::remove_file(&path).unwrap();
        assert_eq!(payloads[0], payloads[1]);
        assert_eq!(payloads[1], payloads[2]);
        assert!(!payloads[0].is_empty());
    }

    #[test]
    fn truncated_file_is_rejected_at_open() {
        let bytes = single_tile_file();
        let cut: Arc<[u8]> = bytes[..bytes.len() - 1].into();
        assert!(matches!(ResidualFile::from_bytes(cut), Err(Error::Io(_))));
    }

    #[test]
    fn entries_outside_the_pyramid_are_not_found() {
        let file = ResidualFile::from_bytes(single_tile_file().into()).unwrap();
        assert!(file.entry(0, 0, 0).is_ok());
        assert!(matches!(file.entry(1, 0, 0), Err(Error::NotFound(_))));
    }
}

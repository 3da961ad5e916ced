//! Residual elevation pyramids.
//!
//! A residual file stores, for every tile of an elevation quadtree, the
//! difference between the tile and the upsampled parent. Tiles are TIFF
//! strips of signed 16-bit samples indexed by an offset table.

pub mod edit;
pub mod file;
pub mod format;
pub mod producer;
pub mod scratch;
pub mod strip;
pub mod writer;

pub use edit::{EditReport, ResidualEditor};
pub use file::{AccessMode, ResidualFile};
pub use format::{OffsetTable, ResidualHeader, TileEntry, HEADER_SIZE, MAX_TILE_SIZE};
pub use producer::{ResidualProducer, ResidualProducerConfig};
pub use scratch::{ScratchBuffers, ScratchPool};
pub use strip::Compression;
pub use writer::{quantize, ResidualWriter};

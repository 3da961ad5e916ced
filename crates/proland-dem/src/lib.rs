//! Elevation reconstruction for the Proland tile pipeline.
//!
//! This crate provides:
//! - The residual file format, its writer and the [`ResidualProducer`] with
//!   sub-producers refining parts of the pyramid
//! - [`ResidualEditor`], an in-memory overlay of edited residual tiles
//! - The 4-tap upsampling kernel shared by the producers and the editor
//! - [`ElevationProducer`], which rebuilds elevation tiles level by level
//! - [`AmplitudeNoiseLayer`], procedural detail on top of elevation tiles

pub mod elevation;
pub mod noise_layer;
pub mod residual;
pub mod upsample;

pub use elevation::{ElevationOutput, ElevationProducer, ElevationProducerConfig};
pub use noise_layer::{AmplitudeNoiseLayer, NoiseLayerConfig};
pub use residual::{
    AccessMode, Compression, EditReport, ResidualEditor, ResidualFile, ResidualHeader,
    ResidualProducer, ResidualProducerConfig, ResidualWriter,
};

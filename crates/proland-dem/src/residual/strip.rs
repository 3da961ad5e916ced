//! Single-image TIFF strips of signed 16-bit samples.
//!
//! Every residual payload is a complete TIFF file holding one grey image.
//! Decoding is bounded by the image size the caller expects: files declaring
//! other dimensions are rejected before any strip is inflated.

use std::io::Cursor;

use proland_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, compression as codec, TiffEncoder};
use tiff::TiffError;

/// Strip compression used when encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    None,
    #[default]
    Deflate,
}

fn tiff_error(e: TiffError) -> Error {
    match e {
        TiffError::IoError(e) => Error::Io(e),
        other => Error::Format(format!("residual strip: {other}")),
    }
}

/// Encode a `width × height` image of signed 16-bit samples.
pub fn encode(width: u32, height: u32, samples: &[i16], compression: Compression) -> Result<Vec<u8>> {
    if samples.len() != width as usize * height as usize {
        return Err(Error::InvalidData(format!(
            "{} samples for a {width}x{height} image",
            samples.len()
        )));
    }
    let mut out = Cursor::new(Vec::new());
    {
        let mut encoder = TiffEncoder::new(&mut out).map_err(tiff_error)?;
        match compression {
            Compression::None => encoder.write_image::<colortype::GrayI16>(width, height, samples),
            Compression::Deflate => encoder.write_image_with_compression::<colortype::GrayI16, _>(
                width,
                height,
                codec::Deflate::default(),
                samples,
            ),
        }
        .map_err(tiff_error)?;
    }
    Ok(out.into_inner())
}

/// Decode a `width × height` strip image into `out`.
///
/// `out` keeps its capacity between calls.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn decode_into(data: &[u8], (width, height): (u32, u32), out: &mut Vec<i16>) -> Result<()> {
    let count = width as usize * height as usize;
    let mut limits = Limits::default();
    limits.decoding_buffer_size = count * 2;
    limits.intermediate_buffer_size = data.len().max(count * 2);

    let mut decoder = Decoder::new(Cursor::new(data))
        .map_err(tiff_error)?
        .with_limits(limits);
    let dimensions = decoder.dimensions().map_err(tiff_error)?;
    if dimensions != (width, height) {
        return Err(Error::Format(format!(
            "strip image is {}x{}, expected {width}x{height}",
            dimensions.0, dimensions.1
        )));
    }
    match decoder.read_image().map_err(tiff_error)? {
        DecodingResult::I16(samples) if samples.len() >= count => {
            out.clear();
            out.extend_from_slice(&samples[..count]);
            Ok(())
        }
        DecodingResult::I16(samples) => Err(Error::Format(format!(
            "{} samples for a {width}x{height} image",
            samples.len()
        ))),
        _ => Err(Error::Format(
            "expected one signed 16-bit sample per pixel".into(),
        )),
    }
}

/// Decode a `width × height` strip image into a new vector.
pub fn decode(data: &[u8], dimensions: (u32, u32)) -> Result<Vec<i16>> {
    let mut samples = Vec::new();
    decode_into(data, dimensions, &mut samples)?;
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use byteorder::{BigEndian, WriteBytesExt};

    use super::*;

    fn ramp(n: usize) -> Vec<i16> {
        (0..n).map(|i| (i as i16 - 60) * 37).collect()
    }

    #[test]
    fn deflate_strip_round_trips() {
        let samples = ramp(11 * 11);
        let bytes = encode(11, 11, &samples, Compression::Deflate).unwrap();
        assert!(bytes.starts_with(b"II") || bytes.starts_with(b"MM"));
        assert_eq!(decode(&bytes, (11, 11)).unwrap(), samples);
    }

    #[test]
    fn uncompressed_strip_decodes() {
        let samples = [-2i16, -1, 0, 1];
        let bytes = encode(2, 2, &samples, Compression::None).unwrap();
        assert!(bytes.len() >= 8);
        assert_eq!(decode(&bytes, (2, 2)).unwrap(), samples);
    }

    /// A big-endian file with two uncompressed strips, offsets stored out of line.
    fn big_endian_two_strips(samples: &[i16; 4]) -> Vec<u8> {
        const SHORT: u16 = 3;
        const LONG: u16 = 4;
        let mut out = Vec::new();
        out.extend_from_slice(b"MM");
        out.write_u16::<BigEndian>(42).unwrap();
        out.write_u32::<BigEndian>(8).unwrap();
        let entries = 9u16;
        let offsets_at = 8 + 2 + 12 * u32::from(entries) + 4;
        let counts_at = offsets_at + 8;
        let strips_at = counts_at + 8;
        let entry = |out: &mut Vec<u8>, tag: u16, ty: u16, count: u32, value: u32| {
            out.write_u16::<BigEndian>(tag).unwrap();
            out.write_u16::<BigEndian>(ty).unwrap();
            out.write_u32::<BigEndian>(count).unwrap();
            if ty == SHORT && count == 1 {
                out.write_u16::<BigEndian>(value as u16).unwrap();
                out.write_u16::<BigEndian>(0).unwrap();
            } else {
                out.write_u32::<BigEndian>(value).unwrap();
            }
        };
        out.write_u16::<BigEndian>(entries).unwrap();
        entry(&mut out, 256, LONG, 1, 2); // width
        entry(&mut out, 257, LONG, 1, 2); // height
        entry(&mut out, 258, SHORT, 1, 16); // bits per sample
        entry(&mut out, 259, SHORT, 1, 1); // no compression
        entry(&mut out, 262, SHORT, 1, 1); // black is zero
        entry(&mut out, 273, LONG, 2, offsets_at);
        entry(&mut out, 278, LONG, 1, 1); // rows per strip
        entry(&mut out, 279, LONG, 2, counts_at);
        entry(&mut out, 339, SHORT, 1, 2); // signed samples
        out.write_u32::<BigEndian>(0).unwrap();
        out.write_u32::<BigEndian>(strips_at).unwrap();
        out.write_u32::<BigEndian>(strips_at + 4).unwrap();
        out.write_u32::<BigEndian>(4).unwrap();
        out.write_u32::<BigEndian>(4).unwrap();
        for &s in samples {
            out.write_i16::<BigEndian>(s).unwrap();
        }
        out
    }

    #[test]
    fn big_endian_multi_strip_decodes() {
        let samples = [7i16, -300, 12000, -1];
        assert_eq!(decode(&big_endian_two_strips(&samples), (2, 2)).unwrap(), samples);
    }

    #[test]
    fn truncated_strip_fails() {
        let bytes = encode(11, 11, &ramp(121), Compression::None).unwrap();
        let err = decode(&bytes[..bytes.len() / 2], (11, 11)).unwrap_err();
        assert!(matches!(err, Error::Io(_) | Error::Format(_)), "{err:?}");
    }

    #[test]
    fn unsigned_samples_are_rejected() {
        let mut out = Cursor::new(Vec::new());
        TiffEncoder::new(&mut out)
            .unwrap()
            .write_image::<colortype::Gray16>(2, 2, &[0u16; 4])
            .unwrap();
        assert!(matches!(decode(out.get_ref(), (2, 2)), Err(Error::Format(_))));
    }

    #[test]
    fn oversized_images_are_rejected_before_inflating() {
        let bytes = encode(64, 64, &vec![1; 64 * 64], Compression::Deflate).unwrap();
        let mut out = Vec::new();
        let err = decode_into(&bytes, (11, 11), &mut out).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
        assert!(out.is_empty());
    }

    #[test]
    fn not_a_tiff_is_rejected() {
        assert!(decode(b"PK\x03\x04rest", (1, 1)).is_err());
    }

    #[test]
    fn sample_count_must_match_size() {
        assert!(encode(3, 3, &[0; 8], Compression::None).is_err());
    }
}

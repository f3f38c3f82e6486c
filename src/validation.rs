//! Frame validation utilities for captured and repaired output.
//!
//! Used by the integration tests against virtual cameras and by unit tests to
//! check that repaired frames are decodable JPEG streams.

use std::time::Duration;

use crate::repair::{segments, RepairedImage, DHT, HUFFMAN_TABLE, HUFFMAN_TABLE_LEN, SOS};
use crate::sink::FramePair;
use crate::traits::{CameraError, FrameMetadata, Result};

/// Validates the header layout of a JPEG stream.
///
/// The stream must start with SOI, its header segments must reach SOS with a
/// DHT segment somewhere before it, and the stream must end with EOI.
///
/// # Errors
///
/// Returns `InvalidFrame` naming the first structural problem found.
pub fn validate_jpeg_structure(data: &[u8]) -> Result<()> {
    if data.get(..2) != Some(&[0xFF, 0xD8][..]) {
        return Err(CameraError::InvalidFrame("missing SOI marker".to_owned()));
    }

    let markers: Vec<(usize, u8)> = segments(data).collect();
    match markers.last() {
        Some(&(_, SOS)) => {}
        Some(&(pos, marker)) => {
            return Err(CameraError::InvalidFrame(format!(
                "header ends with marker {marker:#04x} at {pos} instead of start-of-scan"
            )));
        }
        None => {
            return Err(CameraError::InvalidFrame(
                "no header segments after SOI".to_owned(),
            ));
        }
    }

    if !markers.iter().any(|&(_, marker)| marker == DHT) {
        return Err(CameraError::InvalidFrame(
            "no Huffman table before start-of-scan".to_owned(),
        ));
    }

    if !data.ends_with(&[0xFF, 0xD9]) {
        return Err(CameraError::InvalidFrame("missing EOI marker".to_owned()));
    }

    Ok(())
}

/// Validates that `image` is `original` with the Huffman table spliced in.
///
/// # Errors
///
/// Returns `InvalidFrame` if the length is not `original.len() + 420` or the
/// bytes around the split point differ from `original`.
pub fn validate_repaired(image: &RepairedImage, original: &[u8]) -> Result<()> {
    let bytes = image.as_bytes();
    if bytes.len() != original.len() + HUFFMAN_TABLE_LEN {
        return Err(CameraError::InvalidFrame(format!(
            "repaired length {} != {} + {HUFFMAN_TABLE_LEN}",
            bytes.len(),
            original.len()
        )));
    }

    let split = image.split();
    let (head, rest) = bytes.split_at(split);
    let (table, tail) = rest.split_at(HUFFMAN_TABLE_LEN);
    if head != original.get(..split).unwrap_or_default()
        || table != HUFFMAN_TABLE
        || tail != original.get(split..).unwrap_or_default()
    {
        return Err(CameraError::InvalidFrame(format!(
            "repaired frame does not splice the table at {split}"
        )));
    }

    Ok(())
}

/// Validates that frame sequence numbers increment by exactly 1.
///
/// # Errors
///
/// Returns `InvalidFrame` if:
/// - The slice is empty
/// - Any sequence number doesn't increment by exactly 1 from the previous
pub fn validate_frame_sequence(frames: &[FrameMetadata]) -> Result<()> {
    if frames.is_empty() {
        return Err(CameraError::InvalidFrame(
            "Cannot validate empty frame sequence".to_owned(),
        ));
    }

    for (i, window) in frames.windows(2).enumerate() {
        let [prev, curr] = window else { continue };
        let expected = prev.sequence.wrapping_add(1);
        if curr.sequence != expected {
            return Err(CameraError::InvalidFrame(format!(
                "Frame sequence gap at index {}: expected {expected}, got {}",
                i + 1,
                curr.sequence
            )));
        }
    }

    Ok(())
}

/// Validates that both frames of a pair were captured within `max_skew`.
///
/// # Errors
///
/// Returns `InvalidFrame` if the timestamp difference exceeds `max_skew`.
pub fn validate_pair_skew(pair: &FramePair, max_skew: Duration) -> Result<()> {
    let skew = pair.skew();
    if skew > max_skew {
        return Err(CameraError::InvalidFrame(format!(
            "pair {} skew {skew:?} exceeds {max_skew:?}",
            pair.index
        )));
    }
    Ok(())
}

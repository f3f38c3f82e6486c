//! Huffman table injection for MJPEG frames.
//!
//! The target sensors emit motion-JPEG frames without a DHT segment, relying
//! on the decoder to substitute the standard tables from ITU-T T.81 annex K.
//! Most decoders do not, so [`repair`] splices the standard tables in front of
//! the start-of-scan marker.

use tracing::warn;

/// Length of [`HUFFMAN_TABLE`] in bytes.
pub const HUFFMAN_TABLE_LEN: usize = 420;

/// DHT segment carrying the four standard luminance/chrominance DC and AC tables.
pub const HUFFMAN_TABLE: [u8; HUFFMAN_TABLE_LEN] = [
    0xFF, 0xC4, 0x01, 0xA2, 0x00, 0x00, 0x01, 0x05, 0x01, 0x01, 0x01, 0x01, //
    0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x02, //
    0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x01, 0x00, 0x03, //
    0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, //
    0x0A, 0x0B, 0x10, 0x00, 0x02, 0x01, 0x03, 0x03, 0x02, 0x04, 0x03, 0x05, //
    0x05, 0x04, 0x04, 0x00, 0x00, 0x01, 0x7D, 0x01, 0x02, 0x03, 0x00, 0x04, //
    0x11, 0x05, 0x12, 0x21, 0x31, 0x41, 0x06, 0x13, 0x51, 0x61, 0x07, 0x22, //
    0x71, 0x14, 0x32, 0x81, 0x91, 0xA1, 0x08, 0x23, 0x42, 0xB1, 0xC1, 0x15, //
    0x52, 0xD1, 0xF0, 0x24, 0x33, 0x62, 0x72, 0x82, 0x09, 0x0A, 0x16, 0x17, //
    0x18, 0x19, 0x1A, 0x25, 0x26, 0x27, 0x28, 0x29, 0x2A, 0x34, 0x35, 0x36, //
    0x37, 0x38, 0x39, 0x3A, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49, 0x4A, //
    0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59, 0x5A, 0x63, 0x64, 0x65, 0x66, //
    0x67, 0x68, 0x69, 0x6A, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79, 0x7A, //
    0x83, 0x84, 0x85, 0x86, 0x87, 0x88, 0x89, 0x8A, 0x92, 0x93, 0x94, 0x95, //
    0x96, 0x97, 0x98, 0x99, 0x9A, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7, 0xA8, //
    0xA9, 0xAA, 0xB2, 0xB3, 0xB4, 0xB5, 0xB6, 0xB7, 0xB8, 0xB9, 0xBA, 0xC2, //
    0xC3, 0xC4, 0xC5, 0xC6, 0xC7, 0xC8, 0xC9, 0xCA, 0xD2, 0xD3, 0xD4, 0xD5, //
    0xD6, 0xD7, 0xD8, 0xD9, 0xDA, 0xE1, 0xE2, 0xE3, 0xE4, 0xE5, 0xE6, 0xE7, //
    0xE8, 0xE9, 0xEA, 0xF1, 0xF2, 0xF3, 0xF4, 0xF5, 0xF6, 0xF7, 0xF8, 0xF9, //
    0xFA, 0x11, 0x00, 0x02, 0x01, 0x02, 0x04, 0x04, 0x03, 0x04, 0x07, 0x05, //
    0x04, 0x04, 0x00, 0x01, 0x02, 0x77, 0x00, 0x01, 0x02, 0x03, 0x11, 0x04, //
    0x05, 0x21, 0x31, 0x06, 0x12, 0x41, 0x51, 0x07, 0x61, 0x71, 0x13, 0x22, //
    0x32, 0x81, 0x08, 0x14, 0x42, 0x91, 0xA1, 0xB1, 0xC1, 0x09, 0x23, 0x33, //
    0x52, 0xF0, 0x15, 0x62, 0x72, 0xD1, 0x0A, 0x16, 0x24, 0x34, 0xE1, 0x25, //
    0xF1, 0x17, 0x18, 0x19, 0x1A, 0x26, 0x27, 0x28, 0x29, 0x2A, 0x35, 0x36, //
    0x37, 0x38, 0x39, 0x3A, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49, 0x4A, //
    0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59, 0x5A, 0x63, 0x64, 0x65, 0x66, //
    0x67, 0x68, 0x69, 0x6A, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79, 0x7A, //
    0x82, 0x83, 0x84, 0x85, 0x86, 0x87, 0x88, 0x89, 0x8A, 0x92, 0x93, 0x94, //
    0x95, 0x96, 0x97, 0x98, 0x99, 0x9A, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7, //
    0xA8, 0xA9, 0xAA, 0xB2, 0xB3, 0xB4, 0xB5, 0xB6, 0xB7, 0xB8, 0xB9, 0xBA, //
    0xC2, 0xC3, 0xC4, 0xC5, 0xC6, 0xC7, 0xC8, 0xC9, 0xCA, 0xD2, 0xD3, 0xD4, //
    0xD5, 0xD6, 0xD7, 0xD8, 0xD9, 0xDA, 0xE2, 0xE3, 0xE4, 0xE5, 0xE6, 0xE7, //
    0xE8, 0xE9, 0xEA, 0xF2, 0xF3, 0xF4, 0xF5, 0xF6, 0xF7, 0xF8, 0xF9, 0xFA, //
];

/// Second byte of the start-of-scan marker.
pub const SOS: u8 = 0xDA;

/// Second byte of the define-Huffman-table marker.
pub const DHT: u8 = 0xC4;

const MARKER_PREFIX: u8 = 0xFF;
const SOI: u8 = 0xD8;
const EOI: u8 = 0xD9;

/// Strategy for locating the start-of-scan marker.
pub trait MarkerScan {
    /// Position of the `0xFF` byte that opens the start-of-scan marker within
    /// `data`, if found.
    fn find_marker(&self, data: &[u8]) -> Option<usize>;

    /// Split point to use when [`MarkerScan::find_marker`] finds nothing.
    fn fallback_split(&self, len: usize) -> usize {
        len
    }
}

/// Sampling scan that tests every fourth byte, starting at offset 2, for the
/// second marker byte and steps back one to the `0xFF` lead-in.
///
/// This reproduces the byte layout the sensors have always been repaired with.
/// It is not a segment parser: a marker whose `0xDA` byte is not on the
/// sampled stride is missed, and a `0xDA` data byte inside an earlier segment
/// that happens to sit on the stride is mistaken for the marker. Use
/// [`SegmentScan`] when the input is not known to follow that layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrideScan;

impl StrideScan {
    /// First sampled offset.
    pub const START: usize = 2;
    /// Distance between samples.
    pub const STRIDE: usize = 4;

    /// Offsets sampled for `len` valid bytes.
    pub fn offsets(len: usize) -> impl Iterator<Item = usize> {
        (Self::START..len).step_by(Self::STRIDE)
    }

    /// Offset of the `0xDA` byte, always of the form `2 + 4k` and below
    /// `data.len()`.
    pub fn find_marker_byte(data: &[u8]) -> Option<usize> {
        Self::offsets(data.len()).find(|&pos| data.get(pos) == Some(&SOS))
    }
}

impl MarkerScan for StrideScan {
    fn find_marker(&self, data: &[u8]) -> Option<usize> {
        Self::find_marker_byte(data).map(|pos| pos - 1)
    }

    /// The first offset the scan would have tested past the data, minus one,
    /// clamped to the data length.
    fn fallback_split(&self, len: usize) -> usize {
        let past_end = if len <= Self::START {
            Self::START
        } else {
            Self::START + (len - Self::START).div_ceil(Self::STRIDE) * Self::STRIDE
        };
        (past_end - 1).min(len)
    }
}

/// Length-delimited JPEG segment walker.
///
/// Starts at the SOI marker and follows segment lengths until it reaches SOS.
/// Returns `None` for streams that do not start with SOI, are truncated
/// mid-header or hit EOI first.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentScan;

impl MarkerScan for SegmentScan {
    fn find_marker(&self, data: &[u8]) -> Option<usize> {
        segments(data)
            .find(|&(_, marker)| marker == SOS)
            .map(|(pos, _)| pos)
    }
}

/// Header segments of a JPEG stream as `(offset, marker)` pairs.
///
/// Iteration starts after SOI and stops after yielding SOS or EOI, or early on
/// a malformed or truncated header. Yields nothing when the data does not
/// start with SOI.
#[derive(Debug, Clone)]
pub struct Segments<'a> {
    data: &'a [u8],
    pos: usize,
    done: bool,
}

/// Walk the header segments of `data`.
pub fn segments(data: &[u8]) -> Segments<'_> {
    Segments {
        data,
        pos: 2,
        done: data.get(..2) != Some(&[MARKER_PREFIX, SOI][..]),
    }
}

impl Segments<'_> {
    fn step(&mut self) -> Option<(usize, u8)> {
        loop {
            let pos = self.pos;
            if *self.data.get(pos)? != MARKER_PREFIX {
                return None;
            }
            let marker = *self.data.get(pos + 1)?;
            match marker {
                // Fill bytes before a marker
                MARKER_PREFIX => {
                    self.pos += 1;
                    continue;
                }
                SOS | EOI => {}
                // Standalone markers carry no length
                0x01 | 0xD0..=0xD7 => self.pos += 2,
                _ => {
                    let hi = *self.data.get(pos + 2)?;
                    let lo = *self.data.get(pos + 3)?;
                    let len = usize::from(u16::from_be_bytes([hi, lo]));
                    if len < 2 {
                        return None;
                    }
                    self.pos += 2 + len;
                }
            }
            return Some((pos, marker));
        }
    }
}

impl Iterator for Segments<'_> {
    type Item = (usize, u8);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.step();
        if matches!(item, None | Some((_, SOS | EOI))) {
            self.done = true;
        }
        item
    }
}

/// A frame with the Huffman table spliced in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairedImage {
    bytes: Vec<u8>,
    split: usize,
    marker_found: bool,
}

impl RepairedImage {
    /// The repaired stream.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume into the repaired stream.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Repaired length, always input length plus [`HUFFMAN_TABLE_LEN`].
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Never true: the table alone is 420 bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Offset at which the table was inserted.
    pub const fn split(&self) -> usize {
        self.split
    }

    /// Whether the split came from a located marker rather than the fallback.
    pub const fn marker_found(&self) -> bool {
        self.marker_found
    }
}

/// Splice [`HUFFMAN_TABLE`] into `data` at `split`.
///
/// `split` is clamped to `data.len()`.
pub fn splice(data: &[u8], split: usize) -> Vec<u8> {
    let (head, tail) = data.split_at(split.min(data.len()));
    let mut out = Vec::with_capacity(data.len() + HUFFMAN_TABLE_LEN);
    out.extend_from_slice(head);
    out.extend_from_slice(&HUFFMAN_TABLE);
    out.extend_from_slice(tail);
    out
}

/// Repair the first `bytes_used` bytes of `buffer` with the given scan.
///
/// `bytes_used` beyond the buffer is clamped to the buffer length. The output
/// is always exactly `bytes_used + 420` bytes long, even when no marker is
/// found.
pub fn repair_with<S: MarkerScan + ?Sized>(
    scan: &S,
    buffer: &[u8],
    bytes_used: usize,
) -> RepairedImage {
    let data = buffer.get(..bytes_used).unwrap_or(buffer);

    let (split, marker_found) = match scan.find_marker(data) {
        Some(split) => (split, true),
        None => {
            let split = scan.fallback_split(data.len());
            warn!(
                bytes_used = data.len(),
                split, "Start-of-scan marker not found, frame will not decode"
            );
            (split, false)
        }
    };

    RepairedImage {
        bytes: splice(data, split),
        split: split.min(data.len()),
        marker_found,
    }
}

/// Repair with the default [`StrideScan`].
pub fn repair(buffer: &[u8], bytes_used: usize) -> RepairedImage {
    repair_with(&StrideScan, buffer, bytes_used)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::truncated_jpeg;

    #[test]
    fn test_table_is_a_dht_segment() {
        assert_eq!(HUFFMAN_TABLE.len(), 420);
        assert_eq!(HUFFMAN_TABLE[..2], [0xFF, 0xC4]);
        // Segment length field covers everything after the marker
        let len = u16::from_be_bytes([HUFFMAN_TABLE[2], HUFFMAN_TABLE[3]]);
        assert_eq!(usize::from(len), HUFFMAN_TABLE_LEN - 2);
    }

    #[test]
    fn test_stride_scan_finds_marker_on_stride() {
        let frame = truncated_jpeg(19, 256, 7);
        assert_eq!(StrideScan::find_marker_byte(&frame), Some(110));
        assert_eq!(StrideScan.find_marker(&frame), Some(109));
        assert_eq!(frame[109..111], [0xFF, 0xDA]);
    }

    #[test]
    fn test_stride_scan_positions_are_on_stride_and_in_range() {
        for app0 in [4, 7, 11, 19, 23, 27] {
            let frame = truncated_jpeg(app0, 300, 1);
            if let Some(pos) = StrideScan::find_marker_byte(&frame) {
                assert_eq!((pos - 2) % 4, 0);
                assert!(pos < frame.len());
                assert_eq!(frame[pos], SOS);
            }
        }
        assert!(StrideScan::offsets(50).all(|p| (p - 2) % 4 == 0 && p < 50));
    }

    #[test]
    fn test_stride_scan_misses_off_stride_marker() {
        // APP0 of 20 bytes puts 0xDA at 111, between samples
        let frame = truncated_jpeg(20, 256, 0);
        assert_eq!(frame[111], SOS);
        assert_eq!(StrideScan.find_marker(&frame), None);
        assert_eq!(SegmentScan.find_marker(&frame), Some(110));
    }

    #[test]
    fn test_stride_scan_ignores_marker_beyond_bytes_used() {
        let frame = truncated_jpeg(19, 256, 0);
        assert_eq!(StrideScan::find_marker_byte(frame.get(..110).expect("slice")), None);
    }

    #[test]
    fn test_stride_fallback_split_follows_sampled_offsets() {
        // Samples 2, 6, 10 end at 10, step back to 9
        assert_eq!(StrideScan.fallback_split(10), 9);
        // Samples end at 14; 13 is clamped to 11
        assert_eq!(StrideScan.fallback_split(11), 11);
        // First sample past 8 is 10; 9 is clamped to 8
        assert_eq!(StrideScan.fallback_split(8), 8);
        assert_eq!(StrideScan.fallback_split(0), 0);
        assert_eq!(StrideScan.fallback_split(1), 1);
    }

    #[test]
    fn test_repair_length_and_layout() {
        let frame = truncated_jpeg(19, 4000, 3);
        let repaired = repair(&frame, frame.len());

        assert!(repaired.marker_found());
        assert_eq!(repaired.len(), frame.len() + HUFFMAN_TABLE_LEN);
        let m = repaired.split();
        assert_eq!(m, 109);
        let out = repaired.as_bytes();
        assert_eq!(out[..m], frame[..m]);
        assert_eq!(out[m..m + HUFFMAN_TABLE_LEN], HUFFMAN_TABLE);
        assert_eq!(out[m + HUFFMAN_TABLE_LEN..], frame[m..]);
    }

    #[test]
    fn test_repair_respects_bytes_used() {
        let mut buffer = truncated_jpeg(19, 1000, 9);
        let used = buffer.len();
        buffer.resize(used + 5000, 0xAA);

        let repaired = repair(&buffer, used);
        assert_eq!(repaired.len(), used + HUFFMAN_TABLE_LEN);
        assert_eq!(repaired.as_bytes().last(), Some(&0xD9));
    }

    #[test]
    fn test_repair_clamps_bytes_used_to_buffer() {
        let frame = truncated_jpeg(19, 100, 0);
        let repaired = repair(&frame, frame.len() + 1000);
        assert_eq!(repaired.len(), frame.len() + HUFFMAN_TABLE_LEN);
    }

    #[test]
    fn test_injected_table_identical_across_calls() {
        let a = repair(&truncated_jpeg(19, 500, 1), 600);
        let b = repair(&truncated_jpeg(23, 900, 2), 1000);
        let table_a = &a.as_bytes()[a.split()..a.split() + HUFFMAN_TABLE_LEN];
        let table_b = &b.as_bytes()[b.split()..b.split() + HUFFMAN_TABLE_LEN];
        assert_eq!(table_a, table_b);
        assert_eq!(table_a, HUFFMAN_TABLE);
    }

    #[test]
    fn test_marker_at_146_with_50000_bytes() {
        // StrideScan only ever splits at 4k + 1, so a lead-in at 146 needs the
        // segment walker. APP0 of 56 bytes puts the SOS lead-in at 146.
        let mut buffer = truncated_jpeg(56, 50_000, 5);
        buffer.truncate(50_000);
        assert_eq!(buffer[146..148], [0xFF, 0xDA]);

        let repaired = repair_with(&SegmentScan, &buffer, 50_000);
        let out = repaired.as_bytes();

        assert_eq!(out.len(), 50_420);
        assert_eq!(repaired.split(), 146);
        assert_eq!(out[..146], buffer[..146]);
        assert_eq!(out[146..566], HUFFMAN_TABLE);
        assert_eq!(out[566..50_420], buffer[146..50_000]);
    }

    #[test]
    fn test_stride_marker_at_145_with_50000_bytes() {
        // APP0 of 55 bytes puts the lead-in at 145 and 0xDA on sampled offset 146
        let mut buffer = truncated_jpeg(55, 50_000, 5);
        buffer.truncate(50_000);
        assert_eq!(buffer[145..147], [0xFF, 0xDA]);

        let repaired = repair(&buffer, 50_000);
        let out = repaired.as_bytes();

        assert!(repaired.marker_found());
        assert_eq!(out.len(), 50_420);
        assert_eq!(repaired.split(), 145);
        assert_eq!(out[..145], buffer[..145]);
        assert_eq!(out[145..565], HUFFMAN_TABLE);
        assert_eq!(out[565..50_420], buffer[145..50_000]);
    }

    #[test]
    fn test_missing_marker_keeps_length() {
        let data = vec![0x11u8; 1000];
        let repaired = repair(&data, data.len());
        assert!(!repaired.marker_found());
        assert_eq!(repaired.len(), 1000 + HUFFMAN_TABLE_LEN);
        assert_eq!(repaired.split(), 1000);

        let empty = repair(&[], 0);
        assert_eq!(empty.len(), HUFFMAN_TABLE_LEN);
    }

    #[test]
    fn test_segment_scan_rejects_non_jpeg() {
        assert_eq!(SegmentScan.find_marker(&[0x00, 0x01, 0x02]), None);
        assert_eq!(SegmentScan.find_marker(&[0xFF, 0xD8, 0xFF, 0xD9]), None);
        // Truncated inside a segment header
        assert_eq!(SegmentScan.find_marker(&[0xFF, 0xD8, 0xFF, 0xDB, 0x00]), None);
    }

    #[test]
    fn test_segments_walk_repaired_header() {
        let frame = truncated_jpeg(19, 64, 0);
        let repaired = repair(&frame, frame.len());
        let markers: Vec<u8> = segments(repaired.as_bytes()).map(|(_, m)| m).collect();
        assert_eq!(markers, [0xE0, 0xDB, 0xC0, DHT, SOS]);
    }

    #[test]
    fn test_segment_scan_agrees_with_stride_scan_on_sensor_layout() {
        let frame = truncated_jpeg(19, 2048, 4);
        assert_eq!(SegmentScan.find_marker(&frame), StrideScan.find_marker(&frame));
    }

    #[test]
    fn test_splice_clamps_split() {
        let out = splice(&[1, 2, 3], 10);
        assert_eq!(out.len(), 3 + HUFFMAN_TABLE_LEN);
        assert_eq!(out[..3], [1, 2, 3]);
    }
}

use std::ops::Range;
use std::time::Duration;

use crate::error::PrintError;

/// Largest payload accepted by one characteristic write on most label printers.
pub const WRITE_MAX_CHUNK: usize = 20;

/// Spacing between consecutive segment writes.
pub const BASE_DELAY: Duration = Duration::from_millis(250);

/// How characters above U+00FF are handled when encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodingPolicy {
    /// Keep the low 8 bits of every code point.
    #[default]
    Truncate,
    /// Refuse any character that does not fit in one byte.
    Strict,
}

/// A contiguous run of payload characters, `len` is never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub offset: usize,
    pub len: usize,
}

impl Segment {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }
}

/// Encodes text one byte per character.
///
/// - `text`: payload text, expected to be Latin-1
///
/// Returns a buffer with `text.chars().count()` bytes, each the low 8 bits
/// of the corresponding code point. Empty input gives an empty buffer.
///
/// Lengths and segment offsets count Unicode scalar values, not UTF-16 code
/// units: a character above U+FFFF such as an emoji is one byte on the wire
/// and one position when chunking.
pub fn encode_text(text: &str) -> Vec<u8> {
    text.chars().map(|c| c as u32 as u8).collect()
}

/// Encodes characters, the slice form used per segment by the scheduler.
pub fn encode_chars(chars: &[char]) -> Vec<u8> {
    chars.iter().map(|&c| c as u32 as u8).collect()
}

/// Checks that every character fits in a byte.
///
/// Returns the first offending character and its offset as a `PrintError::Encoding`.
pub fn check_latin1(chars: &[char]) -> Result<(), PrintError> {
    match chars.iter().position(|&c| c as u32 > 0xFF) {
        Some(offset) => Err(PrintError::Encoding {
            offset,
            ch: chars[offset],
        }),
        None => Ok(()),
    }
}

/// Splits `total` characters into segments of at most `max_chunk`.
///
/// - `total`: payload length in characters
/// - `max_chunk`: segment size limit, must be > 0
///
/// Returns segments in ascending offset order covering `0..total` exactly.
/// The last one is full-sized when `total` is a multiple of `max_chunk`.
pub fn plan_segments(total: usize, max_chunk: usize) -> Result<Vec<Segment>, PrintError> {
    if max_chunk == 0 {
        return Err(PrintError::InvalidChunkSize);
    }
    let count = total.div_ceil(max_chunk);
    Ok((0..count)
        .map(|index| {
            let offset = index * max_chunk;
            Segment {
                index,
                offset,
                len: usize::min(max_chunk, total - offset),
            }
        })
        .collect())
}

/// Time after the start of a partitioned write at which segment `index` may be sent.
pub fn segment_deadline(index: usize, base: Duration) -> Duration {
    base.saturating_mul(u32::try_from(index).unwrap_or(u32::MAX))
}

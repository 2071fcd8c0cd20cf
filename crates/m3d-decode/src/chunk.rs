//! Tagged, length-prefixed chunk walking.
//!
//! Chunks are `{4-byte ASCII magic}{4-byte little-endian length}{payload}`
//! where the length includes the 8-byte header itself. The walk is bounds
//! checked: a chunk whose declared end lies past the buffer never reads
//! past the end.

use crate::buf;
use crate::error::{DecodeError, DecodeResult};

/// Size of a chunk header: magic plus length.
pub const CHUNK_HEADER_LEN: usize = 8;

/// One chunk borrowed from the containing buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawChunk<'a> {
    /// The 4-byte chunk magic.
    pub magic: [u8; 4],
    /// Payload bytes, header excluded.
    pub payload: &'a [u8],
}

/// Read the chunk at `offset` and advance past it.
///
/// # Errors
///
/// Returns [`DecodeError::UnexpectedEof`] if no full header fits, and
/// [`DecodeError::InvalidChunkSize`] if the declared length is below the
/// header size or overruns the buffer.
pub fn read_chunk<'a>(data: &'a [u8], offset: &mut usize) -> DecodeResult<RawChunk<'a>> {
    let start = *offset;
    let mut cursor = start;

    let magic_bytes = buf::take(data, &mut cursor, 4, "chunk magic")?;
    let magic = [magic_bytes[0], magic_bytes[1], magic_bytes[2], magic_bytes[3]];
    let length = buf::read_u32(data, &mut cursor, "chunk length")?;

    let length_usize = length as usize;
    if length_usize < CHUNK_HEADER_LEN || start + length_usize > data.len() {
        return Err(DecodeError::InvalidChunkSize { magic, length });
    }

    let payload = &data[cursor..start + length_usize];
    *offset = start + length_usize;
    Ok(RawChunk { magic, payload })
}

/// Append one chunk, computing the header-inclusive length.
pub fn write_chunk(out: &mut Vec<u8>, magic: [u8; 4], payload: &[u8]) {
    out.extend_from_slice(&magic);
    out.extend_from_slice(&((CHUNK_HEADER_LEN + payload.len()) as u32).to_le_bytes());
    out.extend_from_slice(payload);
}

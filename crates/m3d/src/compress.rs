//! DEFLATE bridge for the serialized chunk stream.
//!
//! The container optionally compresses everything between the file header
//! (and preview chunk, if any) and the end of file as one raw DEFLATE
//! stream. The codec itself is a black box; this module only adapts it to
//! the crate's error type.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;

use crate::error::{Error, Result};

/// Expand a raw DEFLATE stream.
pub fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    DeflateDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| Error::Compression {
            detail: e.to_string(),
        })?;
    Ok(out)
}

/// Compress a chunk stream as raw DEFLATE.
pub fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(|e| Error::Compression {
        detail: e.to_string(),
    })?;
    encoder.finish().map_err(|e| Error::Compression {
        detail: e.to_string(),
    })
}

//! Little-endian scalar readers with cursor advance.

use crate::error::{DecodeError, DecodeResult};

/// Read a single byte.
pub fn read_u8(data: &[u8], offset: &mut usize, context: &'static str) -> DecodeResult<u8> {
    let b = *data
        .get(*offset)
        .ok_or(DecodeError::UnexpectedEof { context })?;
    *offset += 1;
    Ok(b)
}

/// Read a little-endian `u16`.
pub fn read_u16(data: &[u8], offset: &mut usize, context: &'static str) -> DecodeResult<u16> {
    let bytes = take(data, offset, 2, context)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Read a little-endian `u32`.
pub fn read_u32(data: &[u8], offset: &mut usize, context: &'static str) -> DecodeResult<u32> {
    let bytes = take(data, offset, 4, context)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read a little-endian `f32`.
pub fn read_f32(data: &[u8], offset: &mut usize, context: &'static str) -> DecodeResult<f32> {
    Ok(f32::from_bits(read_u32(data, offset, context)?))
}

/// Read a little-endian `f64`.
pub fn read_f64(data: &[u8], offset: &mut usize, context: &'static str) -> DecodeResult<f64> {
    let bytes = take(data, offset, 8, context)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(f64::from_le_bytes(raw))
}

/// Borrow `len` bytes from the buffer and advance past them.
pub fn take<'a>(
    data: &'a [u8],
    offset: &mut usize,
    len: usize,
    context: &'static str,
) -> DecodeResult<&'a [u8]> {
    let end = offset
        .checked_add(len)
        .ok_or(DecodeError::UnexpectedEof { context })?;
    let slice = data
        .get(*offset..end)
        .ok_or(DecodeError::UnexpectedEof { context })?;
    *offset = end;
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_reads_advance() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05];
        let mut offset = 0;
        assert_eq!(read_u8(&data, &mut offset, "t").unwrap(), 1);
        assert_eq!(read_u16(&data, &mut offset, "t").unwrap(), 0x0302);
        assert_eq!(offset, 3);
    }

    #[test]
    fn test_f32_bit_exact() {
        let data = 1.5f32.to_le_bytes();
        let mut offset = 0;
        assert_eq!(read_f32(&data, &mut offset, "t").unwrap(), 1.5);
        assert_eq!(offset, 4);
    }

    #[test]
    fn test_eof() {
        let data = [0x01];
        let mut offset = 0;
        assert!(matches!(
            read_u32(&data, &mut offset, "t"),
            Err(DecodeError::UnexpectedEof { .. })
        ));
        // A failed read does not advance the cursor.
        assert_eq!(offset, 0);
    }
}

//! Little-endian wire encoding helpers.
//!
//! Every multi-byte field of the external control protocol is little-endian
//! with no padding and no alignment requirement. Strings are length-prefixed
//! with a `u32`.

use std::io::{Read, Write};

use crate::error::*;

/// Append a 16-bit little-endian value.
pub fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Append a 32-bit little-endian value.
pub fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Append a signed 32-bit little-endian value.
pub fn put_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Append a 64-bit little-endian value.
pub fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Append a string as `u32 length` followed by the raw bytes.
pub fn put_str(buf: &mut Vec<u8>, value: &str) {
    put_u32(buf, value.len() as u32);
    buf.extend_from_slice(value.as_bytes());
}

fn take<'a>(data: &'a [u8], offset: usize, len: usize) -> Result<&'a [u8]> {
    let end = offset.checked_add(len).ok_or_else(|| {
        Error::from(context!(ErrorKind::TruncatedPayload {
            needed: usize::MAX,
            got: data.len(),
        }))
    })?;
    if data.len() < end {
        return Err(context!(ErrorKind::TruncatedPayload {
            needed: end,
            got: data.len(),
        })
        .into());
    }
    Ok(&data[offset..end])
}

/// Read a 16-bit little-endian value at `offset`.
pub fn get_u16(data: &[u8], offset: usize) -> Result<u16> {
    let b = take(data, offset, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

/// Read a 32-bit little-endian value at `offset`.
pub fn get_u32(data: &[u8], offset: usize) -> Result<u32> {
    let b = take(data, offset, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Read a signed 32-bit little-endian value at `offset`.
pub fn get_i32(data: &[u8], offset: usize) -> Result<i32> {
    let b = take(data, offset, 4)?;
    Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Read a 64-bit little-endian value at `offset`.
pub fn get_u64(data: &[u8], offset: usize) -> Result<u64> {
    let b = take(data, offset, 8)?;
    Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
}

/// Read a length-prefixed string at `offset`.
///
/// Returns the string and the total number of bytes consumed.
pub fn get_str(data: &[u8], offset: usize) -> Result<(String, usize)> {
    let len = get_u32(data, offset)? as usize;
    let b = take(data, offset + 4, len)?;
    let s = String::from_utf8(b.to_vec())
        .map_err(|e| Error::from(context!(ErrorKind::InvalidResponse(e.to_string()))))?;
    Ok((s, 4 + len))
}

/// Read exactly `buf.len()` bytes from `stream`.
///
/// EOF, resets and aborted connections all surface as `ConnectionClosed`;
/// interrupted reads are retried by the standard library.
pub fn read_exact<R: Read + ?Sized>(stream: &mut R, buf: &mut [u8]) -> Result<()> {
    stream.read_exact(buf).map_err(map_context!())?;
    Ok(())
}

/// Write all of `data` to `stream`, looping over partial writes.
pub fn write_all<W: Write + ?Sized>(stream: &mut W, data: &[u8]) -> Result<()> {
    stream.write_all(data).map_err(map_context!())?;
    stream.flush().map_err(map_context!())?;
    Ok(())
}

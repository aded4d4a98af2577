//! Primitive Encodings
//!
//! Booleans are one byte. Integers and longs are little-endian base-128
//! varints over their two's-complement bits, so negative numbers take the
//! full 5 or 10 bytes. Floats are 4 little-endian bytes. Byte arrays and
//! strings carry a varint length prefix.

use crate::wire::protocol::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

const MAX_I32_BYTES: usize = 5;
const MAX_I64_BYTES: usize = 10;

pub fn write_bool(out: &mut BytesMut, v: bool) {
    out.put_u8(u8::from(v));
}

pub fn read_bool(input: &mut Bytes) -> Result<bool, CodecError> {
    Ok(read_u8(input)? != 0)
}

pub fn read_u8(input: &mut Bytes) -> Result<u8, CodecError> {
    if !input.has_remaining() {
        return Err(CodecError::UnexpectedEof);
    }
    Ok(input.get_u8())
}

pub fn write_i32(out: &mut BytesMut, v: i32) {
    write_unsigned(out, u64::from(v as u32));
}

pub fn read_i32(input: &mut Bytes) -> Result<i32, CodecError> {
    let v = read_unsigned(input, MAX_I32_BYTES)?;
    u32::try_from(v)
        .map(|v| v as i32)
        .map_err(|_| CodecError::VarintOverflow)
}

pub fn write_i64(out: &mut BytesMut, v: i64) {
    write_unsigned(out, v as u64);
}

pub fn read_i64(input: &mut Bytes) -> Result<i64, CodecError> {
    Ok(read_unsigned(input, MAX_I64_BYTES)? as i64)
}

pub fn write_f32(out: &mut BytesMut, v: f32) {
    out.put_f32_le(v);
}

pub fn read_f32(input: &mut Bytes) -> Result<f32, CodecError> {
    if input.remaining() < 4 {
        return Err(CodecError::UnexpectedEof);
    }
    Ok(input.get_f32_le())
}

/// Length as a varint, then the raw bytes.
pub fn write_bytes(out: &mut BytesMut, bytes: &[u8]) {
    write_unsigned(out, bytes.len() as u64);
    out.put_slice(bytes);
}

pub fn read_bytes(input: &mut Bytes) -> Result<Bytes, CodecError> {
    let len = read_unsigned(input, MAX_I64_BYTES)?;
    let len = usize::try_from(len).map_err(|_| CodecError::VarintOverflow)?;
    if input.remaining() < len {
        return Err(CodecError::UnexpectedEof);
    }
    Ok(input.split_to(len))
}

pub fn write_str(out: &mut BytesMut, s: &str) {
    write_bytes(out, s.as_bytes());
}

pub fn read_string(input: &mut Bytes) -> Result<String, CodecError> {
    let bytes = read_bytes(input)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

fn write_unsigned(out: &mut BytesMut, mut v: u64) {
    loop {
        let group = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.put_u8(group);
            return;
        }
        out.put_u8(group | 0x80);
    }
}

fn read_unsigned(input: &mut Bytes, max_bytes: usize) -> Result<u64, CodecError> {
    let mut result = 0u64;
    for i in 0..max_bytes {
        let byte = read_u8(input)?;
        result |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(result);
        }
    }
    Err(CodecError::VarintOverflow)
}

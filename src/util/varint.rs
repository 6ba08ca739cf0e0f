//! Variable-length integer encoding utilities.
//!
//! Every count, offset and delta in the index files is written with this
//! codec: 7 bits of payload per byte, the high bit set on every byte except
//! the last, least-significant group first.

use std::io::{Read, Write};

use byteorder::ReadBytesExt;

use crate::error::{LucernaError, Result};

/// Number of bytes `value` occupies once encoded.
pub fn encoded_len(value: u64) -> usize {
    let significant_bits = 64 - value.leading_zeros() as usize;
    significant_bits.div_ceil(7).max(1)
}

/// Add the 7-bit group `byte` at `shift` to `result`.
///
/// The tenth group of a u64 may only carry the top bit; anything more would
/// be silently truncated and is reported as corruption instead.
pub(crate) fn push_group(result: u64, byte: u8, shift: u32) -> Result<u64> {
    if shift > 63 || (shift == 63 && byte > 1) {
        return Err(LucernaError::corrupt("VInt overflow"));
    }
    Ok(result | ((byte & 0x7F) as u64) << shift)
}

/// Encode a u32 value using variable-length encoding.
pub fn encode_u32(value: u32) -> Vec<u8> {
    encode_u64(value as u64)
}

/// Encode a u64 value using variable-length encoding.
pub fn encode_u64(value: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(encoded_len(value));
    let mut val = value;

    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;

        if val != 0 {
            byte |= 0x80;
        }

        bytes.push(byte);

        if val == 0 {
            break;
        }
    }

    bytes
}

/// Decode a u32 value, returning it with the number of bytes consumed.
pub fn decode_u32(bytes: &[u8]) -> Result<(u32, usize)> {
    let (value, read) = decode_u64(bytes)?;
    let value = u32::try_from(value)
        .map_err(|_| LucernaError::corrupt(format!("VInt {value} overflows u32")))?;
    Ok((value, read))
}

/// Decode a u64 value, returning it with the number of bytes consumed.
pub fn decode_u64(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut result = 0u64;
    let mut shift = 0u32;

    for (i, &byte) in bytes.iter().enumerate() {
        result = push_group(result, byte, shift)?;

        if (byte & 0x80) == 0 {
            return Ok((result, i + 1));
        }

        shift += 7;
    }

    Err(LucernaError::eof("incomplete VInt"))
}

/// Write a variable-length encoded u32 to a writer.
pub fn write_u32<W: Write>(writer: &mut W, value: u32) -> Result<usize> {
    write_u64(writer, value as u64)
}

/// Write a variable-length encoded u64 to a writer.
pub fn write_u64<W: Write>(writer: &mut W, value: u64) -> Result<usize> {
    let bytes = encode_u64(value);
    writer.write_all(&bytes)?;
    Ok(bytes.len())
}

/// Read a variable-length encoded u32 from a reader.
pub fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let value = read_u64(reader)?;
    u32::try_from(value).map_err(|_| LucernaError::corrupt(format!("VInt {value} overflows u32")))
}

/// Read a variable-length encoded u64 from a reader.
pub fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0u32;

    loop {
        let byte = reader.read_u8()?;
        result = push_group(result, byte, shift)?;

        if (byte & 0x80) == 0 {
            return Ok(result);
        }

        shift += 7;
    }
}

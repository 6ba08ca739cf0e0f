//! Length norms.
//!
//! Every indexed field without `omit_norms` keeps one byte per document. The
//! byte is a tiny float: three mantissa bits and a five bit exponent, which
//! covers roughly `7e-10..7e9` with the resolution scoring needs.

use crate::error::{LucernaError, Result};
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter};

const MANTISSA_BITS: u32 = 3;
const ZERO_EXPONENT: i32 = 15;
const ZERO_POINT: i32 = (63 - ZERO_EXPONENT) << MANTISSA_BITS;

/// Encode a norm into one byte, rounding down.
pub fn encode_norm(value: f32) -> u8 {
    let bits = value.to_bits() as i32;
    let small = bits >> (24 - MANTISSA_BITS);
    if small <= ZERO_POINT {
        if bits <= 0 { 0 } else { 1 }
    } else if small >= ZERO_POINT + 0x100 {
        0xFF
    } else {
        (small - ZERO_POINT) as u8
    }
}

/// Decode a norm byte.
pub fn decode_norm(byte: u8) -> f32 {
    if byte == 0 {
        return 0.0;
    }
    let bits = ((byte as u32) << (24 - MANTISSA_BITS)) + (((63 - ZERO_EXPONENT) as u32) << 24);
    f32::from_bits(bits)
}

/// The norm byte of a document without a value for a normed field.
pub fn default_norm() -> u8 {
    encode_norm(1.0)
}

/// Length normalisation used when building norms.
pub trait Similarity: Send + Sync + std::fmt::Debug {
    /// Normalisation factor of a field value holding `num_terms` tokens.
    fn length_norm(&self, field: &str, num_terms: u32) -> f32;
}

/// `1 / sqrt(num_terms)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultSimilarity;

impl Similarity for DefaultSimilarity {
    fn length_norm(&self, _field: &str, num_terms: u32) -> f32 {
        if num_terms == 0 {
            return 1.0;
        }
        1.0 / (num_terms as f32).sqrt()
    }
}

/// Write one norm byte per document to `name`.
pub fn write_norms(storage: &dyn Storage, name: &str, norms: &[u8]) -> Result<()> {
    let mut writer = StructWriter::create(storage, name)?;
    writer.write_raw(norms)?;
    writer.close()
}

/// Read the norms of `max_doc` documents from `name`.
pub fn read_norms(storage: &dyn Storage, name: &str, max_doc: u32) -> Result<Vec<u8>> {
    let mut reader = StructReader::open(storage, name)?;
    if reader.size() != max_doc as u64 {
        return Err(LucernaError::corrupt(format!(
            "{name} holds {} norms, expected {max_doc}",
            reader.size()
        )));
    }
    reader.read_raw(max_doc as usize)
}

//! Low-level utilities shared by the index codecs.

pub mod bitset;
pub mod varint;

//! Growable bitset with set-count tracking.
//!
//! Used for deleted-document tombstones and for boolean set algebra. A
//! bitset may *extend as ones*: every bit at or beyond [`BitSet::len`] then
//! reads as set, which lets NOT be expressed without materialising an
//! unbounded number of bits.

use bit_vec::BitVec;

use crate::error::{LucernaError, Result};
use crate::storage::structured::{StructReader, StructWriter};
use crate::storage::{StorageInput, StorageOutput};

const BLOCK_BITS: usize = 32;

/// A dynamic bitset backed by [`BitVec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitSet {
    bits: BitVec,
    set_count: usize,
    extends_as_ones: bool,
}

impl Default for BitSet {
    fn default() -> Self {
        Self::new(0)
    }
}

impl BitSet {
    /// Create a bitset of `bit_count` cleared bits.
    pub fn new(bit_count: usize) -> Self {
        BitSet {
            bits: BitVec::from_elem(bit_count, false),
            set_count: 0,
            extends_as_ones: false,
        }
    }

    /// Create a bitset of `bit_count` set bits that also extends as ones.
    pub fn all_ones(bit_count: usize) -> Self {
        BitSet {
            bits: BitVec::from_elem(bit_count, true),
            set_count: bit_count,
            extends_as_ones: true,
        }
    }

    /// Number of materialised bits.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Whether no bits are materialised.
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Number of set bits among the materialised ones.
    pub fn count(&self) -> usize {
        self.set_count
    }

    /// Value of every bit beyond [`BitSet::len`].
    pub fn extends_as_ones(&self) -> bool {
        self.extends_as_ones
    }

    /// Read bit `index`.
    pub fn get(&self, index: usize) -> bool {
        self.bits.get(index).unwrap_or(self.extends_as_ones)
    }

    /// Grow the materialised length to at least `bit_count`, filling new bits
    /// with the tail value.
    pub fn grow(&mut self, bit_count: usize) {
        let len = self.bits.len();
        if bit_count > len {
            let extra = bit_count - len;
            self.bits.grow(extra, self.extends_as_ones);
            if self.extends_as_ones {
                self.set_count += extra;
            }
        }
    }

    /// Set bit `index`, growing as needed. Returns whether the bit changed.
    pub fn set(&mut self, index: usize) -> bool {
        self.grow(index + 1);
        if self.bits[index] {
            return false;
        }
        self.bits.set(index, true);
        self.set_count += 1;
        true
    }

    /// Clear bit `index`, growing as needed. Returns whether the bit changed.
    pub fn unset(&mut self, index: usize) -> bool {
        self.grow(index + 1);
        if !self.bits[index] {
            return false;
        }
        self.bits.set(index, false);
        self.set_count -= 1;
        true
    }

    /// Clear every materialised bit.
    pub fn clear_all(&mut self) {
        self.bits.clear();
        self.set_count = 0;
    }

    /// First set bit at or after `from` within the materialised bits.
    pub fn next_set_bit(&self, from: usize) -> Option<usize> {
        let len = self.bits.len();
        if from >= len {
            return None;
        }

        let blocks = self.bits.storage();
        let mut block_index = from / BLOCK_BITS;
        let mut block = blocks[block_index] & (u32::MAX << (from % BLOCK_BITS));

        loop {
            if block != 0 {
                let index = block_index * BLOCK_BITS + block.trailing_zeros() as usize;
                return (index < len).then_some(index);
            }
            block_index += 1;
            if block_index >= blocks.len() {
                return None;
            }
            block = blocks[block_index];
        }
    }

    /// A cursor enumerating the set bits in increasing order.
    pub fn scanner(&self) -> BitSetScanner<'_> {
        BitSetScanner {
            bitset: self,
            next: 0,
        }
    }

    /// Intersection. Bits beyond the shorter operand use its tail value.
    pub fn and(&self, other: &BitSet) -> BitSet {
        self.combine(other, |a, b| a.and(b), self.extends_as_ones && other.extends_as_ones)
    }

    /// Union.
    pub fn or(&self, other: &BitSet) -> BitSet {
        self.combine(other, |a, b| a.or(b), self.extends_as_ones || other.extends_as_ones)
    }

    /// Symmetric difference.
    pub fn xor(&self, other: &BitSet) -> BitSet {
        self.combine(other, |a, b| a.xor(b), self.extends_as_ones != other.extends_as_ones)
    }

    /// Complement, including the implicit tail.
    pub fn not(&self) -> BitSet {
        let mut bits = self.bits.clone();
        bits.negate();
        BitSet {
            set_count: self.bits.len() - self.set_count,
            bits,
            extends_as_ones: !self.extends_as_ones,
        }
    }

    fn combine<F>(&self, other: &BitSet, op: F, extends_as_ones: bool) -> BitSet
    where
        F: Fn(&mut BitVec, &BitVec) -> bool,
    {
        let len = self.len().max(other.len());
        let mut left = self.clone();
        left.grow(len);
        let mut right = other.clone();
        right.grow(len);

        op(&mut left.bits, &right.bits);
        let set_count = count_ones(&left.bits);
        BitSet {
            bits: left.bits,
            set_count,
            extends_as_ones,
        }
    }

    /// Serialize as `u32 bit_count`, `u32 set_count`, then the bits packed
    /// least-significant-bit first.
    pub fn write_to<W: StorageOutput>(&self, writer: &mut StructWriter<W>) -> Result<()> {
        writer.write_u32(self.bits.len() as u32)?;
        writer.write_u32(self.set_count as u32)?;

        let mut bytes = vec![0u8; self.bits.len().div_ceil(8)];
        let mut from = 0;
        while let Some(index) = self.next_set_bit(from) {
            bytes[index / 8] |= 1 << (index % 8);
            from = index + 1;
        }
        writer.write_raw(&bytes)
    }

    /// Read a bitset written by [`BitSet::write_to`].
    pub fn read_from<R: StorageInput>(reader: &mut StructReader<R>) -> Result<BitSet> {
        let bit_count = reader.read_u32()? as usize;
        let expected_count = reader.read_u32()? as usize;
        let bytes = reader.read_raw(bit_count.div_ceil(8))?;

        let mut bitset = BitSet::new(bit_count);
        for (byte_index, byte) in bytes.iter().enumerate() {
            if *byte == 0 {
                continue;
            }
            for bit in 0..8 {
                let index = byte_index * 8 + bit;
                if byte & (1 << bit) != 0 && index < bit_count {
                    bitset.set(index);
                }
            }
        }

        if bitset.count() != expected_count {
            return Err(LucernaError::corrupt(format!(
                "bitset count mismatch: header says {expected_count}, found {}",
                bitset.count()
            )));
        }
        Ok(bitset)
    }
}

fn count_ones(bits: &BitVec) -> usize {
    let len = bits.len();
    let blocks = bits.storage();
    let mut count = 0;
    for (i, block) in blocks.iter().enumerate() {
        let start = i * BLOCK_BITS;
        if start + BLOCK_BITS <= len {
            count += block.count_ones() as usize;
        } else if start < len {
            let mask = (1u32 << (len - start)) - 1;
            count += (block & mask).count_ones() as usize;
        }
    }
    count
}

/// Forward scanner over the set bits of a [`BitSet`].
#[derive(Debug, Clone)]
pub struct BitSetScanner<'a> {
    bitset: &'a BitSet,
    next: usize,
}

impl BitSetScanner<'_> {
    /// Rewind to the first bit.
    pub fn reset(&mut self) {
        self.next = 0;
    }

    /// Next set bit, or `None` once the materialised bits are exhausted.
    pub fn scan_next(&mut self) -> Option<usize> {
        let found = self.bitset.next_set_bit(self.next)?;
        self.next = found + 1;
        Some(found)
    }
}

impl Iterator for BitSetScanner<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        self.scan_next()
    }
}

//! Structured binary I/O on top of storage streams.
//!
//! Fixed-width integers are big-endian; counts, lengths and deltas use the
//! VInt codec from [`crate::util::varint`]. Both sides keep a running CRC32
//! of the bytes that went through them so that descriptor files can carry a
//! checksum trailer.

use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{LucernaError, Result};
use crate::storage::{Storage, StorageInput, StorageOutput};
use crate::util::varint;

/// A structured file writer for binary data.
pub struct StructWriter<W: StorageOutput> {
    writer: W,
    hasher: crc32fast::Hasher,
    position: u64,
}

impl StructWriter<Box<dyn StorageOutput>> {
    /// Create `name` in `storage` and wrap it.
    pub fn create(storage: &dyn Storage, name: &str) -> Result<Self> {
        Ok(StructWriter::new(storage.create_output(name)?))
    }
}

impl<W: StorageOutput> StructWriter<W> {
    /// Create a new structured file writer.
    pub fn new(writer: W) -> Self {
        StructWriter {
            writer,
            hasher: crc32fast::Hasher::new(),
            position: 0,
        }
    }

    /// Write a u8 value.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.writer.write_u8(value)?;
        self.hasher.update(&[value]);
        self.position += 1;
        Ok(())
    }

    /// Write a u32 value (big-endian).
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.writer.write_u32::<BigEndian>(value)?;
        self.hasher.update(&value.to_be_bytes());
        self.position += 4;
        Ok(())
    }

    /// Write a u64 value (big-endian).
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.writer.write_u64::<BigEndian>(value)?;
        self.hasher.update(&value.to_be_bytes());
        self.position += 8;
        Ok(())
    }

    /// Write a variable-length integer.
    pub fn write_varint(&mut self, value: u64) -> Result<()> {
        let encoded = varint::encode_u64(value);
        self.write_raw(&encoded)
    }

    /// Write a variable-length u32.
    pub fn write_vint(&mut self, value: u32) -> Result<()> {
        self.write_varint(value as u64)
    }

    /// Write a string with length prefix.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Write raw bytes with length prefix.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.write_varint(value.len() as u64)?;
        self.write_raw(value)
    }

    /// Write raw bytes without length prefix.
    pub fn write_raw(&mut self, value: &[u8]) -> Result<()> {
        self.writer.write_all(value)?;
        self.hasher.update(value);
        self.position += value.len() as u64;
        Ok(())
    }

    /// Get current file position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Move the write position. Used to fix up headers written as
    /// placeholders; the running checksum is not adjusted.
    pub fn seek(&mut self, position: u64) -> Result<()> {
        self.writer.seek(SeekFrom::Start(position))?;
        self.position = position;
        Ok(())
    }

    /// CRC32 of every byte written so far.
    pub fn checksum(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    /// Flush and close the writer.
    pub fn close(mut self) -> Result<()> {
        self.writer.flush_and_sync()?;
        self.writer.close()?;
        Ok(())
    }
}

impl<W: StorageOutput> std::fmt::Debug for StructWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StructWriter")
            .field("position", &self.position)
            .finish()
    }
}

/// A structured file reader for binary data.
pub struct StructReader<R: StorageInput> {
    reader: R,
    hasher: crc32fast::Hasher,
    position: u64,
    file_size: u64,
    name: String,
}

impl StructReader<Box<dyn StorageInput>> {
    /// Open `name` in `storage` and wrap it.
    pub fn open(storage: &dyn Storage, name: &str) -> Result<Self> {
        let mut reader = StructReader::new(storage.open_input(name)?)?;
        reader.name = name.to_string();
        Ok(reader)
    }

    /// Open an independent reader over the same bytes at the same position.
    pub fn clone_reader(&self) -> Result<Self> {
        let mut reader = StructReader::new(self.reader.clone_input()?)?;
        reader.name = self.name.clone();
        reader.seek(self.position)?;
        Ok(reader)
    }
}

impl<R: StorageInput> StructReader<R> {
    /// Create a new structured file reader.
    pub fn new(reader: R) -> Result<Self> {
        let file_size = reader.size()?;
        Ok(StructReader {
            reader,
            hasher: crc32fast::Hasher::new(),
            position: 0,
            file_size,
            name: String::new(),
        })
    }

    /// Name of the underlying file, empty when unknown.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn eof_error(&self, wanted: u64) -> LucernaError {
        LucernaError::eof(format!(
            "read of {wanted} bytes at {} past end of {} ({} bytes)",
            self.position,
            if self.name.is_empty() { "stream" } else { &self.name },
            self.file_size
        ))
    }

    fn check_remaining(&self, wanted: u64) -> Result<()> {
        if self.position + wanted > self.file_size {
            return Err(self.eof_error(wanted));
        }
        Ok(())
    }

    /// Read a u8 value.
    pub fn read_u8(&mut self) -> Result<u8> {
        self.check_remaining(1)?;
        let value = self.reader.read_u8()?;
        self.hasher.update(&[value]);
        self.position += 1;
        Ok(value)
    }

    /// Read a u32 value (big-endian).
    pub fn read_u32(&mut self) -> Result<u32> {
        self.check_remaining(4)?;
        let value = self.reader.read_u32::<BigEndian>()?;
        self.hasher.update(&value.to_be_bytes());
        self.position += 4;
        Ok(value)
    }

    /// Read a u64 value (big-endian).
    pub fn read_u64(&mut self) -> Result<u64> {
        self.check_remaining(8)?;
        let value = self.reader.read_u64::<BigEndian>()?;
        self.hasher.update(&value.to_be_bytes());
        self.position += 8;
        Ok(value)
    }

    /// Read a variable-length integer.
    pub fn read_varint(&mut self) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            result = varint::push_group(result, byte, shift).map_err(|_| {
                LucernaError::corrupt(format!(
                    "VInt overflow at {} in {}",
                    self.position, self.name
                ))
            })?;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    /// Read a variable-length u32.
    pub fn read_vint(&mut self) -> Result<u32> {
        let value = self.read_varint()?;
        u32::try_from(value).map_err(|_| {
            LucernaError::corrupt(format!("VInt {value} overflows u32 in {}", self.name))
        })
    }

    /// Read a string with length prefix.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes)
            .map_err(|e| LucernaError::corrupt(format!("invalid UTF-8 in {}: {e}", self.name)))
    }

    /// Read bytes with length prefix.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let length = self.read_varint()? as usize;
        self.read_raw(length)
    }

    /// Read exact number of raw bytes.
    pub fn read_raw(&mut self, length: usize) -> Result<Vec<u8>> {
        self.check_remaining(length as u64)?;
        let mut bytes = vec![0u8; length];
        self.reader.read_exact(&mut bytes)?;
        self.hasher.update(&bytes);
        self.position += length as u64;
        Ok(bytes)
    }

    /// Get current file position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Move the read position.
    pub fn seek(&mut self, position: u64) -> Result<()> {
        if position > self.file_size {
            return Err(self.eof_error(position - self.position.min(position)));
        }
        self.reader.seek(SeekFrom::Start(position))?;
        self.position = position;
        Ok(())
    }

    /// Get file size.
    pub fn size(&self) -> u64 {
        self.file_size
    }

    /// Bytes left between the current position and the end.
    pub fn remaining(&self) -> u64 {
        self.file_size.saturating_sub(self.position)
    }

    /// Capacity to reserve for `count` entries read from this file. Every
    /// entry takes at least one byte, so a count beyond what is left is
    /// corrupt and must not drive an allocation.
    pub fn capacity_for(&self, count: u64) -> usize {
        count.min(self.remaining()) as usize
    }

    /// Check if we're at end of file.
    pub fn is_eof(&self) -> bool {
        self.position >= self.file_size
    }

    /// CRC32 of every byte read so far.
    pub fn checksum(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    /// Close the reader.
    pub fn close(mut self) -> Result<()> {
        self.reader.close()
    }
}

impl<R: StorageInput> std::fmt::Debug for StructReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StructReader")
            .field("name", &self.name)
            .field("position", &self.position)
            .field("size", &self.file_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};

    #[test]
    fn test_write_read_big_endian() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let mut writer = StructWriter::create(&storage, "_0.tis").unwrap();
        writer.write_u8(7).unwrap();
        writer.write_u32(0x0102_0304).unwrap();
        writer.write_u64(42).unwrap();
        writer.write_vint(300).unwrap();
        writer.write_string("lucerna").unwrap();
        writer.close().unwrap();

        let mut input = storage.open_input("_0.tis").unwrap();
        let mut raw = Vec::new();
        input.read_to_end(&mut raw).unwrap();
        assert_eq!(&raw[1..5], &[1, 2, 3, 4]);

        let mut reader = StructReader::open(&storage, "_0.tis").unwrap();
        assert_eq!(reader.read_u8().unwrap(), 7);
        assert_eq!(reader.read_u32().unwrap(), 0x0102_0304);
        assert_eq!(reader.read_u64().unwrap(), 42);
        assert_eq!(reader.read_vint().unwrap(), 300);
        assert_eq!(reader.read_string().unwrap(), "lucerna");
        assert!(reader.is_eof());
    }

    #[test]
    fn test_seek_back_fixup() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let mut writer = StructWriter::create(&storage, "_0.cfs").unwrap();
        writer.write_u64(0).unwrap();
        writer.write_raw(b"payload").unwrap();
        let end = writer.position();
        writer.seek(0).unwrap();
        writer.write_u64(8).unwrap();
        writer.seek(end).unwrap();
        writer.write_u8(1).unwrap();
        writer.close().unwrap();

        let mut reader = StructReader::open(&storage, "_0.cfs").unwrap();
        assert_eq!(reader.size(), 16);
        assert_eq!(reader.read_u64().unwrap(), 8);
        assert_eq!(reader.read_raw(7).unwrap(), b"payload");
        assert_eq!(reader.read_u8().unwrap(), 1);
    }

    #[test]
    fn test_read_past_end_is_eof() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let mut writer = StructWriter::create(&storage, "_0.fdx").unwrap();
        writer.write_u32(1).unwrap();
        writer.close().unwrap();

        let mut reader = StructReader::open(&storage, "_0.fdx").unwrap();
        reader.read_u32().unwrap();
        let err = reader.read_u64().unwrap_err();
        assert!(matches!(err, LucernaError::Eof(_)));
        assert!(err.to_string().contains("_0.fdx"));
    }

    #[test]
    fn test_checksums_agree() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let mut writer = StructWriter::create(&storage, "segments_1").unwrap();
        writer.write_u32(1).unwrap();
        writer.write_string("_0").unwrap();
        let checksum = writer.checksum();
        writer.write_u32(checksum).unwrap();
        writer.close().unwrap();

        let mut reader = StructReader::open(&storage, "segments_1").unwrap();
        reader.read_u32().unwrap();
        reader.read_string().unwrap();
        assert_eq!(reader.checksum(), checksum);
        assert_eq!(reader.read_u32().unwrap(), checksum);
    }

    #[test]
    fn test_clone_reader_keeps_position() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let mut writer = StructWriter::create(&storage, "_0.frq").unwrap();
        for i in 0..10 {
            writer.write_vint(i).unwrap();
        }
        writer.close().unwrap();

        let mut reader = StructReader::open(&storage, "_0.frq").unwrap();
        reader.read_vint().unwrap();
        reader.read_vint().unwrap();
        let mut clone = reader.clone_reader().unwrap();
        assert_eq!(clone.read_vint().unwrap(), 2);
        assert_eq!(reader.read_vint().unwrap(), 2);
    }

    #[test]
    fn test_overlong_varint_is_corrupt() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let mut writer = StructWriter::create(&storage, "_0.prx").unwrap();
        writer.write_raw(&[0x80; 9]).unwrap();
        writer.write_u8(0x02).unwrap();
        writer.close().unwrap();

        let mut reader = StructReader::open(&storage, "_0.prx").unwrap();
        let err = reader.read_varint().unwrap_err();
        assert!(matches!(err, LucernaError::Corrupt(_)));
        assert!(err.to_string().contains("_0.prx"));
    }

    #[test]
    fn test_capacity_is_bounded_by_remaining_bytes() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let mut writer = StructWriter::create(&storage, "_0.tii").unwrap();
        writer.write_u64(u64::MAX).unwrap();
        writer.write_raw(&[0; 4]).unwrap();
        writer.close().unwrap();

        let mut reader = StructReader::open(&storage, "_0.tii").unwrap();
        let count = reader.read_u64().unwrap();
        assert_eq!(reader.remaining(), 4);
        assert_eq!(reader.capacity_for(count), 4);
        assert_eq!(reader.capacity_for(2), 2);
    }
}

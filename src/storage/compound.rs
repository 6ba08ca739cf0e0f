//! Compound file container.
//!
//! A segment's component files can be packed into one `S.cfs` blob:
//!
//! ```text
//! vint entry_count
//! entry_count x (u64 data_offset, string name)
//! concatenated file data
//! ```
//!
//! Offsets are written as zero first and fixed up once every file has been
//! copied. [`CompoundStorage`] serves the entries back as windows over the
//! container and refuses every write.

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};

use parking_lot::Mutex;

use crate::error::{LucernaError, Result};
use crate::storage::structured::{StructReader, StructWriter};
use crate::storage::{FileRefs, Storage, StorageError, StorageInput, StorageLock, StorageOutput};

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Packs existing files of a storage into one compound file.
#[derive(Debug)]
pub struct CompoundFileWriter<'a> {
    storage: &'a dyn Storage,
    name: String,
    entries: Vec<String>,
}

impl<'a> CompoundFileWriter<'a> {
    pub fn new(storage: &'a dyn Storage, name: &str) -> Self {
        CompoundFileWriter {
            storage,
            name: name.to_string(),
            entries: Vec::new(),
        }
    }

    /// Queue `file` for packaging. Names must be unique.
    pub fn add_file(&mut self, file: &str) -> Result<()> {
        if self.entries.iter().any(|existing| existing == file) {
            return Err(LucernaError::invalid_argument(format!(
                "{file} already added to {}",
                self.name
            )));
        }
        self.entries.push(file.to_string());
        Ok(())
    }

    /// Write the container and return the names it holds.
    pub fn close(self) -> Result<Vec<String>> {
        if self.entries.is_empty() {
            return Err(LucernaError::state(format!(
                "no entries to package into {}",
                self.name
            )));
        }

        let mut writer = StructWriter::create(self.storage, &self.name)?;
        writer.write_varint(self.entries.len() as u64)?;

        let mut offset_slots = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            offset_slots.push(writer.position());
            writer.write_u64(0)?;
            writer.write_string(entry)?;
        }

        let mut data_offsets = Vec::with_capacity(self.entries.len());
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        for entry in &self.entries {
            data_offsets.push(writer.position());
            let expected = self.storage.file_size(entry)?;
            let mut input = self.storage.open_input(entry)?;
            let mut copied = 0u64;
            loop {
                let read = input.read(&mut buffer)?;
                if read == 0 {
                    break;
                }
                writer.write_raw(&buffer[..read])?;
                copied += read as u64;
            }
            if copied != expected {
                return Err(LucernaError::corrupt(format!(
                    "copied {copied} bytes of {entry}, expected {expected}"
                )));
            }
        }

        let end = writer.position();
        for (slot, offset) in offset_slots.iter().zip(&data_offsets) {
            writer.seek(*slot)?;
            writer.write_u64(*offset)?;
        }
        writer.seek(end)?;
        writer.close()?;

        log::debug!(
            "packaged {} files into {} ({end} bytes)",
            self.entries.len(),
            self.name
        );
        Ok(self.entries)
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    offset: u64,
    length: u64,
}

/// Read-only storage over the entries of a compound file.
#[derive(Debug)]
pub struct CompoundStorage {
    name: String,
    base: Mutex<Box<dyn StorageInput>>,
    entries: BTreeMap<String, Entry>,
    refs: FileRefs,
}

impl CompoundStorage {
    /// Open the compound file `name` inside `storage`.
    pub fn open(storage: &dyn Storage, name: &str) -> Result<Self> {
        let mut reader = StructReader::open(storage, name)?;
        let size = reader.size();
        let count = reader.read_varint()?;
        // each entry needs at least an offset and a name length
        if count > reader.remaining() / 9 {
            return Err(LucernaError::corrupt(format!(
                "{name} lists {count} entries but has only {} header bytes left",
                reader.remaining()
            )));
        }

        let mut listing = Vec::with_capacity(reader.capacity_for(count));
        for _ in 0..count {
            let offset = reader.read_u64()?;
            let entry_name = reader.read_string()?;
            listing.push((entry_name, offset));
        }
        let data_start = reader.position();

        let mut entries = BTreeMap::new();
        for (i, (entry_name, offset)) in listing.iter().enumerate() {
            let end = listing.get(i + 1).map(|(_, next)| *next).unwrap_or(size);
            if *offset < data_start || *offset > end || end > size {
                return Err(LucernaError::corrupt(format!(
                    "entry {entry_name} in {name} has bad bounds {offset}..{end}"
                )));
            }
            entries.insert(
                entry_name.clone(),
                Entry {
                    offset: *offset,
                    length: end - offset,
                },
            );
        }

        Ok(CompoundStorage {
            name: name.to_string(),
            base: Mutex::new(storage.open_input(name)?),
            entries,
            refs: FileRefs::new(),
        })
    }

    /// Name of the underlying compound file.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn read_only(&self, op: &str, file: &str) -> LucernaError {
        StorageError::ReadOnly(format!("cannot {op} {file} inside {}", self.name)).into()
    }
}

impl Storage for CompoundStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(format!("{name} in {}", self.name)))?;
        let base = self.base.lock().clone_input()?;
        Ok(Box::new(CompoundInput::new(base, entry.offset, entry.length)?))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        Err(self.read_only("create", name))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        Err(self.read_only("delete", name))
    }

    fn list_files(&self) -> Result<Vec<String>> {
        Ok(self.entries.keys().cloned().collect())
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.entries
            .get(name)
            .map(|entry| entry.length)
            .ok_or_else(|| StorageError::FileNotFound(format!("{name} in {}", self.name)).into())
    }

    fn rename_file(&self, old_name: &str, _new_name: &str) -> Result<()> {
        Err(self.read_only("rename", old_name))
    }

    fn make_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        Err(self.read_only("lock", name))
    }

    fn file_refs(&self) -> &FileRefs {
        &self.refs
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// A window `[offset, offset + length)` over the compound file.
#[derive(Debug)]
pub struct CompoundInput {
    base: Box<dyn StorageInput>,
    offset: u64,
    length: u64,
    position: u64,
}

impl CompoundInput {
    fn new(mut base: Box<dyn StorageInput>, offset: u64, length: u64) -> Result<Self> {
        base.seek(SeekFrom::Start(offset))?;
        Ok(CompoundInput {
            base,
            offset,
            length,
            position: 0,
        })
    }
}

impl Read for CompoundInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = self.length.saturating_sub(self.position);
        if remaining == 0 {
            return Ok(0);
        }
        let wanted = buf.len().min(remaining as usize);
        let read = self.base.read(&mut buf[..wanted])?;
        self.position += read as u64;
        Ok(read)
    }
}

impl Seek for CompoundInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => p as i128,
            SeekFrom::Current(d) => self.position as i128 + d as i128,
            SeekFrom::End(d) => self.length as i128 + d as i128,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of compound entry",
            ));
        }
        let target = target as u64;
        self.base.seek(SeekFrom::Start(self.offset + target))?;
        self.position = target;
        Ok(target)
    }
}

impl StorageInput for CompoundInput {
    fn size(&self) -> Result<u64> {
        Ok(self.length)
    }

    fn clone_input(&self) -> Result<Box<dyn StorageInput>> {
        Ok(Box::new(CompoundInput::new(
            self.base.clone_input()?,
            self.offset,
            self.length,
        )?))
    }

    fn close(&mut self) -> Result<()> {
        self.base.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use std::io::Write;

    fn write_file(storage: &dyn Storage, name: &str, data: &[u8]) {
        let mut output = storage.create_output(name).unwrap();
        output.write_all(data).unwrap();
        output.close().unwrap();
    }

    fn read_all(storage: &dyn Storage, name: &str) -> Vec<u8> {
        let mut input = storage.open_input(name).unwrap();
        let mut data = Vec::new();
        input.read_to_end(&mut data).unwrap();
        data
    }

    #[test]
    fn test_package_round_trip() {
        let storage = MemoryStorage::default();
        let big: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        write_file(&storage, "_0.tis", b"terms");
        write_file(&storage, "_0.frq", &big);
        write_file(&storage, "_0.f0", b"");

        let mut writer = CompoundFileWriter::new(&storage, "_0.cfs");
        for name in ["_0.tis", "_0.frq", "_0.f0"] {
            writer.add_file(name).unwrap();
        }
        let packed = writer.close().unwrap();
        assert_eq!(packed.len(), 3);

        let compound = CompoundStorage::open(&storage, "_0.cfs").unwrap();
        assert_eq!(compound.list_files().unwrap(), vec!["_0.f0", "_0.frq", "_0.tis"]);
        for name in ["_0.tis", "_0.frq", "_0.f0"] {
            assert_eq!(read_all(&compound, name), read_all(&storage, name));
            assert_eq!(
                compound.file_size(name).unwrap(),
                storage.file_size(name).unwrap()
            );
        }
    }

    #[test]
    fn test_window_seek_and_clone() {
        let storage = MemoryStorage::default();
        write_file(&storage, "_1.fdx", &[1, 2, 3]);
        write_file(&storage, "_1.fdt", &[4, 5, 6, 7]);
        let mut writer = CompoundFileWriter::new(&storage, "_1.cfs");
        writer.add_file("_1.fdx").unwrap();
        writer.add_file("_1.fdt").unwrap();
        writer.close().unwrap();

        let compound = CompoundStorage::open(&storage, "_1.cfs").unwrap();
        let mut input = compound.open_input("_1.fdt").unwrap();
        input.seek(SeekFrom::Start(2)).unwrap();
        let mut clone = input.clone_input().unwrap();

        let mut rest = Vec::new();
        input.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, vec![6, 7]);

        let mut all = Vec::new();
        clone.read_to_end(&mut all).unwrap();
        assert_eq!(all, vec![4, 5, 6, 7]);
    }

    #[test]
    fn test_compound_storage_is_read_only() {
        let storage = MemoryStorage::default();
        write_file(&storage, "_2.tii", b"x");
        let mut writer = CompoundFileWriter::new(&storage, "_2.cfs");
        writer.add_file("_2.tii").unwrap();
        assert!(writer.add_file("_2.tii").is_err());
        writer.close().unwrap();

        let compound = CompoundStorage::open(&storage, "_2.cfs").unwrap();
        assert!(matches!(
            compound.create_output("_2.del"),
            Err(LucernaError::Unsupported(_))
        ));
        assert!(matches!(
            compound.delete_file("_2.tii"),
            Err(LucernaError::Unsupported(_))
        ));
        assert!(matches!(
            compound.rename_file("_2.tii", "_3.tii"),
            Err(LucernaError::Unsupported(_))
        ));
        assert!(matches!(
            compound.open_input("_2.tis"),
            Err(LucernaError::Storage(_))
        ));
    }

    #[test]
    fn test_corrupt_entry_count_is_rejected() {
        let storage = MemoryStorage::default();
        write_file(&storage, "_3.cfs", &crate::util::varint::encode_u64(1 << 56));
        assert!(matches!(
            CompoundStorage::open(&storage, "_3.cfs"),
            Err(LucernaError::Corrupt(_))
        ));
    }

    #[test]
    fn test_offset_inside_header_is_rejected() {
        let storage = MemoryStorage::default();
        let mut writer = StructWriter::create(&storage, "_4.cfs").unwrap();
        writer.write_varint(1).unwrap();
        writer.write_u64(0).unwrap();
        writer.write_string("_4.tis").unwrap();
        writer.write_raw(b"terms").unwrap();
        writer.close().unwrap();

        match CompoundStorage::open(&storage, "_4.cfs") {
            Err(LucernaError::Corrupt(message)) => assert!(message.contains("_4.tis")),
            other => panic!("expected corruption, got {other:?}"),
        }
    }
}

//! In-memory storage implementation for tests and temporary indexes.

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::{FileRefs, Storage, StorageError, StorageInput, StorageLock, StorageOutput};

/// Configuration for [`MemoryStorage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStorageConfig {
    /// Initial capacity, in bytes, of every output buffer.
    pub initial_capacity: usize,
}

impl Default for MemoryStorageConfig {
    fn default() -> Self {
        MemoryStorageConfig {
            initial_capacity: 4096,
        }
    }
}

type FileTable = Arc<Mutex<HashMap<String, Arc<[u8]>>>>;

/// An in-memory storage implementation.
///
/// Finalised files are immutable `Arc<[u8]>` buffers, so inputs opened before
/// a file is replaced keep reading the old bytes.
#[derive(Debug)]
pub struct MemoryStorage {
    files: FileTable,
    locks: Arc<Mutex<HashSet<String>>>,
    refs: FileRefs,
    config: MemoryStorageConfig,
}

impl MemoryStorage {
    /// Create a new memory storage.
    pub fn new(config: MemoryStorageConfig) -> Self {
        MemoryStorage {
            files: Arc::new(Mutex::new(HashMap::new())),
            locks: Arc::new(Mutex::new(HashSet::new())),
            refs: FileRefs::new(),
            config,
        }
    }

    /// Get the number of files stored.
    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Get the total size of all files.
    pub fn total_size(&self) -> u64 {
        self.files.lock().values().map(|data| data.len() as u64).sum()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(MemoryStorageConfig::default())
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;
        Ok(Box::new(MemoryInput::new(Arc::clone(data))))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        Ok(Box::new(MemoryOutput {
            name: name.to_string(),
            buffer: Cursor::new(Vec::with_capacity(self.config.initial_capacity)),
            files: Arc::clone(&self.files),
            closed: false,
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.files.lock().remove(name);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.files.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;
        Ok(data.len() as u64)
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        let mut files = self.files.lock();
        let data = files
            .remove(old_name)
            .ok_or_else(|| StorageError::FileNotFound(old_name.to_string()))?;
        files.insert(new_name.to_string(), data);
        Ok(())
    }

    fn make_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        Ok(Box::new(MemoryLock {
            name: name.to_string(),
            held: Arc::clone(&self.locks),
            owned: false,
        }))
    }

    fn file_refs(&self) -> &FileRefs {
        &self.refs
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// A memory-based input implementation.
#[derive(Debug)]
pub struct MemoryInput {
    cursor: Cursor<Arc<[u8]>>,
}

impl MemoryInput {
    fn new(data: Arc<[u8]>) -> Self {
        MemoryInput {
            cursor: Cursor::new(data),
        }
    }
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.cursor.get_ref().len() as u64)
    }

    fn clone_input(&self) -> Result<Box<dyn StorageInput>> {
        Ok(Box::new(MemoryInput::new(Arc::clone(self.cursor.get_ref()))))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A memory-based output. The file becomes visible on close or drop.
#[derive(Debug)]
pub struct MemoryOutput {
    name: String,
    buffer: Cursor<Vec<u8>>,
    files: FileTable,
    closed: bool,
}

impl MemoryOutput {
    fn publish(&mut self) {
        if !self.closed {
            let data: Arc<[u8]> = Arc::from(std::mem::take(self.buffer.get_mut()));
            self.files.lock().insert(self.name.clone(), data);
            self.closed = true;
        }
    }
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryOutput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.buffer.seek(pos)
    }
}

impl StorageOutput for MemoryOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.buffer.position())
    }

    fn close(&mut self) -> Result<()> {
        self.publish();
        Ok(())
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        self.publish();
    }
}

/// A lock held in the storage's shared lock set.
#[derive(Debug)]
pub struct MemoryLock {
    name: String,
    held: Arc<Mutex<HashSet<String>>>,
    owned: bool,
}

impl StorageLock for MemoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_obtain(&mut self) -> Result<bool> {
        if self.owned {
            return Ok(true);
        }
        self.owned = self.held.lock().insert(self.name.clone());
        Ok(self.owned)
    }

    fn release(&mut self) -> Result<()> {
        if self.owned {
            self.held.lock().remove(&self.name);
            self.owned = false;
        }
        Ok(())
    }

    fn is_locked(&self) -> bool {
        self.held.lock().contains(&self.name)
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        if self.owned {
            self.held.lock().remove(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LucernaError;

    #[test]
    fn test_write_read_roundtrip() {
        let storage = MemoryStorage::default();

        let mut output = storage.create_output("_0.fdt").unwrap();
        output.write_all(b"Hello, World!").unwrap();
        assert!(!storage.file_exists("_0.fdt"));
        output.close().unwrap();

        assert!(storage.file_exists("_0.fdt"));
        assert_eq!(storage.file_size("_0.fdt").unwrap(), 13);

        let mut input = storage.open_input("_0.fdt").unwrap();
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer).unwrap();
        assert_eq!(buffer, b"Hello, World!");
    }

    #[test]
    fn test_seek_overwrites_in_place() {
        let storage = MemoryStorage::default();
        let mut output = storage.create_output("_0.tis").unwrap();
        output.write_all(&[0, 0, 0, 0, 9, 9]).unwrap();
        output.seek(SeekFrom::Start(0)).unwrap();
        output.write_all(&[1, 2]).unwrap();
        output.seek(SeekFrom::End(0)).unwrap();
        output.write_all(&[7]).unwrap();
        output.close().unwrap();

        let mut input = storage.open_input("_0.tis").unwrap();
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer).unwrap();
        assert_eq!(buffer, vec![1, 2, 0, 0, 9, 9, 7]);
    }

    #[test]
    fn test_open_input_survives_replacement() {
        let storage = MemoryStorage::default();
        let mut output = storage.create_output("segments_1").unwrap();
        output.write_all(b"old").unwrap();
        output.close().unwrap();

        let mut old_input = storage.open_input("segments_1").unwrap();

        let mut output = storage.create_output("segments_1").unwrap();
        output.write_all(b"new!").unwrap();
        output.close().unwrap();

        let mut buffer = Vec::new();
        old_input.read_to_end(&mut buffer).unwrap();
        assert_eq!(buffer, b"old");
        assert_eq!(storage.file_size("segments_1").unwrap(), 4);
    }

    #[test]
    fn test_clone_input_is_independent() {
        let storage = MemoryStorage::default();
        let mut output = storage.create_output("_0.frq").unwrap();
        output.write_all(&[1, 2, 3, 4]).unwrap();
        output.close().unwrap();

        let mut input = storage.open_input("_0.frq").unwrap();
        input.seek(SeekFrom::Start(2)).unwrap();
        let mut clone = input.clone_input().unwrap();

        let mut byte = [0u8; 1];
        clone.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], 1);
        input.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], 3);
    }

    #[test]
    fn test_rename_delete_list() {
        let storage = MemoryStorage::default();
        for name in ["b", "a", "c"] {
            let mut output = storage.create_output(name).unwrap();
            output.close().unwrap();
        }
        assert_eq!(storage.list_files().unwrap(), vec!["a", "b", "c"]);

        storage.rename_file("a", "d").unwrap();
        storage.delete_file("b").unwrap();
        storage.delete_file("missing").unwrap();
        assert_eq!(storage.list_files().unwrap(), vec!["c", "d"]);

        assert!(matches!(
            storage.open_input("a"),
            Err(LucernaError::Storage(_))
        ));
    }

    #[test]
    fn test_locks_are_exclusive() {
        let storage = MemoryStorage::default();
        let mut first = storage.make_lock("write").unwrap();
        let mut second = storage.make_lock("write").unwrap();

        assert!(first.try_obtain().unwrap());
        assert!(!second.try_obtain().unwrap());
        assert!(second.is_locked());

        first.release().unwrap();
        assert!(second.try_obtain().unwrap());
        drop(second);
        assert!(!first.is_locked());
    }
}

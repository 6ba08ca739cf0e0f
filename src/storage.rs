//! Storage abstraction layer for Lucerna.
//!
//! Every index file is read and written through the [`Storage`] trait, so the
//! engine runs unchanged on top of the file system, on top of memory, or
//! inside a compound container.
//!
//! # Storage Types
//!
//! ## FileStorage
//! - Disk-based persistent storage
//! - Optional memory-mapped inputs
//! - Lock files created with create-new semantics
//!
//! ## MemoryStorage
//! - In-memory storage for tests and temporary indexes
//!
//! ## CompoundStorage
//! - Read-only view over the entries of a segment's `.cfs` container
//!
//! # Example
//!
//! ```
//! use lucerna::storage::{StorageConfig, StorageFactory};
//! use lucerna::storage::memory::MemoryStorageConfig;
//! use std::io::{Read, Write};
//!
//! # fn main() -> lucerna::error::Result<()> {
//! let storage = StorageFactory::create(StorageConfig::Memory(MemoryStorageConfig::default()))?;
//!
//! let mut output = storage.create_output("_0.fdt")?;
//! output.write_all(b"stored")?;
//! output.close()?;
//!
//! let mut input = storage.open_input("_0.fdt")?;
//! let mut buffer = Vec::new();
//! input.read_to_end(&mut buffer)?;
//! assert_eq!(buffer, b"stored");
//! # Ok(())
//! # }
//! ```

use std::io::{Read, Seek, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{LucernaError, Result};

pub mod compound;
pub mod file;
pub mod lock;
pub mod memory;
pub mod refs;
pub mod structured;

pub use refs::FileRefs;

/// A trait for storage backends that can store and retrieve index files.
///
/// Implementations must serialise structural operations (create, rename,
/// delete) on one instance; reads never take that lock.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Open an existing file for reading.
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create a file for writing, truncating any existing file.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Check if a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file. Deleting a missing file is not an error.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all files in the storage, sorted by name.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Get the size of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Rename a file, replacing any file already called `new_name`.
    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()>;

    /// Create a lock object for `name`. The lock is not obtained yet.
    fn make_lock(&self, name: &str) -> Result<Box<dyn StorageLock>>;

    /// Reference table of files held open by readers of this storage.
    fn file_refs(&self) -> &FileRefs;

    /// Sync all pending writes to storage.
    fn sync(&self) -> Result<()>;
}

/// A trait for reading data from storage.
pub trait StorageInput: Read + Seek + Send + std::fmt::Debug {
    /// Get the size of the input stream.
    fn size(&self) -> Result<u64>;

    /// Open an independent cursor over the same bytes, positioned at 0.
    fn clone_input(&self) -> Result<Box<dyn StorageInput>>;

    /// Close the input stream.
    fn close(&mut self) -> Result<()>;
}

/// A trait for writing data to storage.
pub trait StorageOutput: Write + Seek + Send + std::fmt::Debug {
    /// Flush and sync the output to storage.
    fn flush_and_sync(&mut self) -> Result<()>;

    /// Get the current position in the output stream.
    fn position(&self) -> Result<u64>;

    /// Close the output stream, making the file visible to readers.
    fn close(&mut self) -> Result<()>;
}

impl StorageOutput for Box<dyn StorageOutput> {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.as_mut().flush_and_sync()
    }

    fn position(&self) -> Result<u64> {
        self.as_ref().position()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

impl StorageInput for Box<dyn StorageInput> {
    fn size(&self) -> Result<u64> {
        self.as_ref().size()
    }

    fn clone_input(&self) -> Result<Box<dyn StorageInput>> {
        self.as_ref().clone_input()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

/// A named lock living in a storage.
pub trait StorageLock: Send + std::fmt::Debug {
    /// Get the name of the lock.
    fn name(&self) -> &str;

    /// Try to obtain the lock once, without waiting.
    fn try_obtain(&mut self) -> Result<bool>;

    /// Release the lock if this object holds it.
    fn release(&mut self) -> Result<()>;

    /// Whether anybody currently holds the lock.
    fn is_locked(&self) -> bool;
}

/// Configuration for storage backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StorageConfig {
    File(file::FileStorageConfig),

    Memory(memory::MemoryStorageConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory(memory::MemoryStorageConfig::default())
    }
}

/// A factory for creating storage instances.
pub struct StorageFactory;

impl StorageFactory {
    pub fn create(config: StorageConfig) -> Result<Arc<dyn Storage>> {
        match config {
            StorageConfig::Memory(mem_config) => {
                let storage = memory::MemoryStorage::new(mem_config);
                Ok(Arc::new(storage))
            }
            StorageConfig::File(file_config) => {
                let storage = file::FileStorage::new(file_config)?;
                Ok(Arc::new(storage))
            }
        }
    }
}

/// Error types specific to storage operations.
#[derive(Debug, Clone)]
pub enum StorageError {
    FileNotFound(String),

    IoError(String),

    LockFailed(String),

    ReadOnly(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::FileNotFound(name) => write!(f, "File not found: {name}"),
            StorageError::IoError(msg) => write!(f, "I/O error: {msg}"),
            StorageError::LockFailed(name) => write!(f, "Failed to acquire lock: {name}"),
            StorageError::ReadOnly(msg) => write!(f, "Read-only storage: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<StorageError> for LucernaError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::LockFailed(_) => LucernaError::lock(err.to_string()),
            StorageError::ReadOnly(_) => LucernaError::unsupported(err.to_string()),
            _ => LucernaError::storage(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::file::FileStorageConfig;
    use crate::storage::memory::MemoryStorageConfig;

    #[test]
    fn test_storage_config_default() {
        match StorageConfig::default() {
            StorageConfig::Memory(_) => {}
            _ => panic!("Expected Memory config"),
        }
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::FileNotFound("_0.tis".to_string());
        assert_eq!(err.to_string(), "File not found: _0.tis");

        let err = StorageError::LockFailed("write".to_string());
        assert_eq!(err.to_string(), "Failed to acquire lock: write");
        assert!(LucernaError::from(err).is_lock_error());

        let err = StorageError::ReadOnly("_0.cfs".to_string());
        assert!(matches!(
            LucernaError::from(err),
            LucernaError::Unsupported(_)
        ));
    }

    #[test]
    fn test_storage_factory_memory() {
        let storage =
            StorageFactory::create(StorageConfig::Memory(MemoryStorageConfig::default())).unwrap();
        assert!(!storage.file_exists("segments_1"));
    }

    #[test]
    fn test_storage_factory_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = StorageConfig::File(FileStorageConfig::new(temp_dir.path()));
        let storage = StorageFactory::create(config).unwrap();
        assert!(!storage.file_exists("segments_1"));
    }

    #[test]
    fn test_storage_factory_with_mmap() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let mut file_config = FileStorageConfig::new(temp_dir.path());
        file_config.use_mmap = true;
        let storage = StorageFactory::create(StorageConfig::File(file_config)).unwrap();

        let mut output = storage.create_output("_0.prx").unwrap();
        output.write_all(b"Hello, Factory!").unwrap();
        output.close().unwrap();

        let mut input = storage.open_input("_0.prx").unwrap();
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer).unwrap();
        assert_eq!(buffer, b"Hello, Factory!");
    }
}

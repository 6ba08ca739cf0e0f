//! File-based storage implementation.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::{Mmap, MmapOptions};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{LucernaError, Result};
use crate::storage::{FileRefs, Storage, StorageError, StorageInput, StorageLock, StorageOutput};

/// Configuration for [`FileStorage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStorageConfig {
    /// Index directory. Created when missing.
    pub path: PathBuf,

    /// Serve inputs from read-only memory maps instead of buffered reads.
    pub use_mmap: bool,

    /// Buffer size for buffered inputs and outputs.
    pub buffer_size: usize,

    /// Flush the output buffer after every write call.
    pub sync_writes: bool,
}

impl FileStorageConfig {
    /// Default configuration rooted at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileStorageConfig {
            path: path.as_ref().to_path_buf(),
            use_mmap: false,
            buffer_size: 65536,
            sync_writes: false,
        }
    }
}

impl Default for FileStorageConfig {
    fn default() -> Self {
        Self::new("./index")
    }
}

/// A file-based storage implementation.
#[derive(Debug)]
pub struct FileStorage {
    directory: PathBuf,
    config: FileStorageConfig,
    /// Serialises create, rename and delete.
    dir_ops: Mutex<()>,
    refs: FileRefs,
}

impl FileStorage {
    /// Open (creating if needed) the directory named by `config.path`.
    pub fn new(config: FileStorageConfig) -> Result<Self> {
        let directory = config.path.clone();

        if !directory.exists() {
            std::fs::create_dir_all(&directory).map_err(|e| {
                LucernaError::storage(format!(
                    "Failed to create directory {}: {e}",
                    directory.display()
                ))
            })?;
        }

        if !directory.is_dir() {
            return Err(LucernaError::storage(format!(
                "Path is not a directory: {}",
                directory.display()
            )));
        }

        Ok(FileStorage {
            directory,
            config,
            dir_ops: Mutex::new(()),
            refs: FileRefs::new(),
        })
    }

    /// Root directory of this storage.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    fn not_found_or_io(name: &str, e: std::io::Error) -> LucernaError {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::FileNotFound(name.to_string()).into()
        } else {
            LucernaError::Io(e)
        }
    }
}

impl Storage for FileStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let path = self.file_path(name);
        let file = File::open(&path).map_err(|e| Self::not_found_or_io(name, e))?;

        if self.config.use_mmap {
            let size = file.metadata()?.len();
            // zero-length files cannot be mapped on every platform
            if size > 0 {
                let mmap = unsafe { MmapOptions::new().map(&file) }
                    .map_err(|e| LucernaError::storage(format!("Failed to map {name}: {e}")))?;
                return Ok(Box::new(MmapInput::new(Arc::new(mmap))));
            }
        }

        Ok(Box::new(FileInput::new(path, file, self.config.buffer_size)?))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let _guard = self.dir_ops.lock();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.file_path(name))
            .map_err(|e| StorageError::IoError(format!("{name}: {e}")))?;

        Ok(Box::new(FileOutput::new(
            file,
            self.config.buffer_size,
            self.config.sync_writes,
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.file_path(name).exists()
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        let _guard = self.dir_ops.lock();
        match std::fs::remove_file(self.file_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::IoError(format!("Failed to delete {name}: {e}")).into()),
        }
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();

        for entry in std::fs::read_dir(&self.directory)? {
            let entry = entry?;
            let path = entry.path();

            if path.is_file() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    files.push(name.to_string());
                }
            }
        }

        files.sort();
        Ok(files)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let metadata = self
            .file_path(name)
            .metadata()
            .map_err(|e| Self::not_found_or_io(name, e))?;
        Ok(metadata.len())
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        let _guard = self.dir_ops.lock();
        std::fs::rename(self.file_path(old_name), self.file_path(new_name))
            .map_err(|e| Self::not_found_or_io(old_name, e))
    }

    fn make_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        Ok(Box::new(FileLock {
            name: name.to_string(),
            path: self.directory.join(format!("{name}.lock")),
            file: None,
        }))
    }

    fn file_refs(&self) -> &FileRefs {
        &self.refs
    }

    fn sync(&self) -> Result<()> {
        // directory fsync is not portable; outputs sync themselves on close
        Ok(())
    }
}

/// A buffered file input.
#[derive(Debug)]
pub struct FileInput {
    path: PathBuf,
    reader: BufReader<File>,
    size: u64,
    buffer_size: usize,
}

impl FileInput {
    fn new(path: PathBuf, file: File, buffer_size: usize) -> Result<Self> {
        let size = file.metadata()?.len();
        Ok(FileInput {
            path,
            reader: BufReader::with_capacity(buffer_size, file),
            size,
            buffer_size,
        })
    }
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for FileInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl StorageInput for FileInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn clone_input(&self) -> Result<Box<dyn StorageInput>> {
        // a duplicated descriptor would share the cursor, so reopen instead
        let file = File::open(&self.path)?;
        Ok(Box::new(FileInput::new(
            self.path.clone(),
            file,
            self.buffer_size,
        )?))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A read-only memory-mapped input.
#[derive(Debug)]
pub struct MmapInput {
    cursor: Cursor<MmapBytes>,
}

#[derive(Debug, Clone)]
struct MmapBytes(Arc<Mmap>);

impl AsRef<[u8]> for MmapBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}

impl MmapInput {
    fn new(mmap: Arc<Mmap>) -> Self {
        MmapInput {
            cursor: Cursor::new(MmapBytes(mmap)),
        }
    }
}

impl Read for MmapInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MmapInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageInput for MmapInput {
    fn size(&self) -> Result<u64> {
        Ok(self.cursor.get_ref().as_ref().len() as u64)
    }

    fn clone_input(&self) -> Result<Box<dyn StorageInput>> {
        Ok(Box::new(MmapInput::new(Arc::clone(&self.cursor.get_ref().0))))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A buffered file output.
#[derive(Debug)]
pub struct FileOutput {
    writer: BufWriter<File>,
    sync_writes: bool,
    position: u64,
    closed: bool,
}

impl FileOutput {
    fn new(file: File, buffer_size: usize, sync_writes: bool) -> Self {
        FileOutput {
            writer: BufWriter::with_capacity(buffer_size, file),
            sync_writes,
            position: 0,
            closed: false,
        }
    }
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let bytes_written = self.writer.write(buf)?;
        self.position += bytes_written as u64;

        if self.sync_writes {
            self.writer.flush()?;
        }

        Ok(bytes_written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl Seek for FileOutput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = self.writer.seek(pos)?;
        self.position = new_pos;
        Ok(new_pos)
    }
}

impl StorageOutput for FileOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.position)
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.flush_and_sync()?;
            self.closed = true;
        }
        Ok(())
    }
}

/// A lock file created with create-new semantics.
#[derive(Debug)]
pub struct FileLock {
    name: String,
    path: PathBuf,
    file: Option<File>,
}

impl StorageLock for FileLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_obtain(&mut self) -> Result<bool> {
        if self.file.is_some() {
            return Ok(true);
        }
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => {
                self.file = Some(file);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StorageError::IoError(format!("{}: {e}", self.path.display())).into()),
        }
    }

    fn release(&mut self) -> Result<()> {
        if self.file.take().is_some() {
            std::fs::remove_file(&self.path).map_err(|e| {
                StorageError::IoError(format!("Failed to release lock {}: {e}", self.name))
            })?;
        }
        Ok(())
    }

    fn is_locked(&self) -> bool {
        self.path.exists()
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (TempDir, FileStorage) {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(FileStorageConfig::new(temp_dir.path())).unwrap();
        (temp_dir, storage)
    }

    #[test]
    fn test_create_and_read_file() {
        let (_temp_dir, storage) = create_test_storage();

        let mut output = storage.create_output("_0.fdt").unwrap();
        output.write_all(b"Hello, World!").unwrap();
        output.close().unwrap();

        assert!(storage.file_exists("_0.fdt"));
        assert_eq!(storage.file_size("_0.fdt").unwrap(), 13);

        let mut input = storage.open_input("_0.fdt").unwrap();
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer).unwrap();
        assert_eq!(buffer, b"Hello, World!");
    }

    #[test]
    fn test_file_operations() {
        let (_temp_dir, storage) = create_test_storage();

        for name in ["_0.tis", "_0.tii"] {
            let mut output = storage.create_output(name).unwrap();
            output.write_all(name.as_bytes()).unwrap();
            output.close().unwrap();
        }
        assert_eq!(storage.list_files().unwrap(), vec!["_0.tii", "_0.tis"]);

        storage.rename_file("_0.tii", "_1.tii").unwrap();
        assert!(!storage.file_exists("_0.tii"));
        assert!(storage.file_exists("_1.tii"));

        storage.delete_file("_1.tii").unwrap();
        storage.delete_file("_1.tii").unwrap();
        assert_eq!(storage.list_files().unwrap(), vec!["_0.tis"]);
    }

    #[test]
    fn test_file_not_found() {
        let (_temp_dir, storage) = create_test_storage();
        assert!(matches!(
            storage.open_input("missing"),
            Err(LucernaError::Storage(_))
        ));
        assert!(storage.file_size("missing").is_err());
    }

    #[test]
    fn test_clone_input_has_own_cursor() {
        let (_temp_dir, storage) = create_test_storage();
        let mut output = storage.create_output("_0.prx").unwrap();
        output.write_all(&[10, 20, 30]).unwrap();
        output.close().unwrap();

        let mut input = storage.open_input("_0.prx").unwrap();
        input.seek(SeekFrom::Start(2)).unwrap();
        let mut clone = input.clone_input().unwrap();

        let mut byte = [0u8; 1];
        clone.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], 10);
        input.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], 30);
    }

    #[test]
    fn test_mmap_input() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = FileStorageConfig::new(temp_dir.path());
        config.use_mmap = true;
        let storage = FileStorage::new(config).unwrap();

        let mut output = storage.create_output("_0.frq").unwrap();
        output.write_all(&[1, 2, 3, 4, 5]).unwrap();
        output.close().unwrap();
        let empty = storage.create_output("_0.tvf").unwrap();
        drop(empty);

        let mut input = storage.open_input("_0.frq").unwrap();
        assert_eq!(input.size().unwrap(), 5);
        input.seek(SeekFrom::Start(3)).unwrap();
        let mut rest = Vec::new();
        input.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, vec![4, 5]);

        let input = storage.open_input("_0.tvf").unwrap();
        assert_eq!(input.size().unwrap(), 0);
    }

    #[test]
    fn test_lock_file_lifecycle() {
        let (temp_dir, storage) = create_test_storage();
        let mut lock = storage.make_lock("write").unwrap();
        assert!(lock.try_obtain().unwrap());
        assert!(temp_dir.path().join("write.lock").exists());

        let mut other = storage.make_lock("write").unwrap();
        assert!(!other.try_obtain().unwrap());

        lock.release().unwrap();
        assert!(!temp_dir.path().join("write.lock").exists());
        assert!(other.try_obtain().unwrap());
        drop(other);
        assert!(!temp_dir.path().join("write.lock").exists());
    }
}

//! Removal of index files that no committed segment set references.
//!
//! After every commit the files of the previous set that the new set dropped
//! are deleted. A file still held by an open reader is parked in the
//! storage's [`FileRefs`](crate::storage::FileRefs) table instead and removed
//! when that reader closes or on a later commit.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::Result;
use crate::index::segment_info::{SEGMENTS_PREFIX, SegmentInfos};
use crate::storage::Storage;

/// Whether `name` is a file the engine owns.
pub fn is_index_file(name: &str) -> bool {
    name.starts_with('_')
        || name.starts_with(SEGMENTS_PREFIX)
        || name.starts_with("pending_segments_")
}

/// Delete `names` now, or park those a reader still uses.
pub fn delete_files(storage: &dyn Storage, names: &[String]) -> Result<()> {
    let refs = storage.file_refs();
    for name in names {
        if refs.is_referenced(name) {
            log::debug!("deferring delete of {name}, still open in a reader");
            refs.add_pending(name);
            continue;
        }
        if let Err(e) = storage.delete_file(name) {
            log::warn!("could not delete {name}: {e}, will retry");
            refs.add_pending(name);
        } else {
            log::debug!("deleted {name}");
        }
    }
    Ok(())
}

/// Delete every pending file that no reader holds any more.
pub fn delete_pending(storage: &dyn Storage) -> Result<()> {
    let ready = storage.file_refs().take_unreferenced_pending();
    if ready.is_empty() {
        return Ok(());
    }
    delete_files(storage, &ready)
}

/// Tracks the file set of the last commit of one writer.
#[derive(Debug)]
pub struct Deleter {
    storage: Arc<dyn Storage>,
    committed: BTreeSet<String>,
}

impl Deleter {
    /// Start from the files referenced by `infos`.
    pub fn new(storage: Arc<dyn Storage>, infos: &SegmentInfos) -> Self {
        let committed = infos.files(storage.as_ref()).into_iter().collect();
        Deleter { storage, committed }
    }

    /// Remove every index file `infos` does not reference, such as the
    /// leftovers of an interrupted flush or merge and older generations.
    pub fn sweep(&mut self, infos: &SegmentInfos) -> Result<()> {
        let keep: BTreeSet<String> = infos.files(self.storage.as_ref()).into_iter().collect();
        let doomed: Vec<String> = self
            .storage
            .list_files()?
            .into_iter()
            .filter(|name| is_index_file(name) && !keep.contains(name))
            .collect();
        if !doomed.is_empty() {
            log::info!("removing {} unreferenced index files", doomed.len());
        }
        delete_files(self.storage.as_ref(), &doomed)?;
        self.committed = keep;
        delete_pending(self.storage.as_ref())
    }

    /// Record that `infos` was committed and drop what it superseded.
    pub fn checkpoint(&mut self, infos: &SegmentInfos) -> Result<()> {
        let current: BTreeSet<String> = infos.files(self.storage.as_ref()).into_iter().collect();
        let superseded: Vec<String> = self.committed.difference(&current).cloned().collect();
        delete_files(self.storage.as_ref(), &superseded)?;
        self.committed = current;
        delete_pending(self.storage.as_ref())
    }

    /// Delete files that were written but never committed.
    pub fn abandon(&self, names: &[String]) -> Result<()> {
        let orphans: Vec<String> = names
            .iter()
            .filter(|name| !self.committed.contains(*name))
            .cloned()
            .collect();
        delete_files(self.storage.as_ref(), &orphans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::segment_info::SegmentInfo;
    use crate::storage::memory::MemoryStorage;

    fn touch(storage: &dyn Storage, name: &str) {
        storage.create_output(name).unwrap().close().unwrap();
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn compound_infos(segments: &[&str]) -> SegmentInfos {
        let mut infos = SegmentInfos::new();
        for name in segments {
            infos.segments.push(SegmentInfo::new(*name, 1, true));
        }
        infos
    }

    #[test]
    fn test_referenced_files_are_deferred() {
        let storage = MemoryStorage::default();
        touch(&storage, "_0.cfs");
        touch(&storage, "_1.cfs");
        storage.file_refs().incref(&names(&["_0.cfs"]));

        delete_files(&storage, &names(&["_0.cfs", "_1.cfs"])).unwrap();
        assert!(storage.file_exists("_0.cfs"));
        assert!(!storage.file_exists("_1.cfs"));
        assert_eq!(storage.file_refs().pending(), names(&["_0.cfs"]));

        delete_pending(&storage).unwrap();
        assert!(storage.file_exists("_0.cfs"));

        let released = storage.file_refs().decref(&names(&["_0.cfs"]));
        delete_files(&storage, &released).unwrap();
        assert!(!storage.file_exists("_0.cfs"));
    }

    #[test]
    fn test_checkpoint_removes_superseded_files() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::default());
        let mut infos = compound_infos(&["_0", "_1"]);
        touch(storage.as_ref(), "_0.cfs");
        touch(storage.as_ref(), "_1.cfs");
        infos.write(storage.as_ref()).unwrap();
        let mut deleter = Deleter::new(Arc::clone(&storage), &infos);

        touch(storage.as_ref(), "_2.cfs");
        infos.segments = vec![SegmentInfo::new("_2", 2, true)];
        infos.write(storage.as_ref()).unwrap();
        deleter.checkpoint(&infos).unwrap();

        assert_eq!(
            storage.list_files().unwrap(),
            names(&["_2.cfs", "segments_2"])
        );
    }

    #[test]
    fn test_sweep_keeps_foreign_files() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::default());
        let mut infos = compound_infos(&["_0"]);
        touch(storage.as_ref(), "_0.cfs");
        touch(storage.as_ref(), "_5.frq");
        touch(storage.as_ref(), "pending_segments_9");
        touch(storage.as_ref(), "notes.txt");
        infos.write(storage.as_ref()).unwrap();

        let mut deleter = Deleter::new(Arc::clone(&storage), &infos);
        deleter.sweep(&infos).unwrap();
        assert_eq!(
            storage.list_files().unwrap(),
            names(&["_0.cfs", "notes.txt", "segments_1"])
        );

        touch(storage.as_ref(), "_6.tis");
        deleter.abandon(&names(&["_6.tis", "_0.cfs"])).unwrap();
        assert!(!storage.file_exists("_6.tis"));
        assert!(storage.file_exists("_0.cfs"));
    }
}

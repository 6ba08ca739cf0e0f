//! Shared reference table for files held open by readers.
//!
//! Readers register every file they use when they open and release them when
//! they close. The deleter consults the table before physically removing a
//! superseded file; files it could not remove yet are parked as pending and
//! handed back for deletion once their last reader lets go.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct RefsInner {
    counts: HashMap<String, usize>,
    pending: BTreeSet<String>,
}

/// Per-storage table of reader references and pending deletions.
#[derive(Debug, Default)]
pub struct FileRefs {
    inner: Mutex<RefsInner>,
}

impl FileRefs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one reference to each of `names`.
    pub fn incref(&self, names: &[String]) {
        let mut inner = self.inner.lock();
        for name in names {
            *inner.counts.entry(name.clone()).or_insert(0) += 1;
        }
    }

    /// Drop one reference to each of `names`.
    ///
    /// Returns the pending files that just became unreferenced; the caller is
    /// expected to delete them.
    pub fn decref(&self, names: &[String]) -> Vec<String> {
        let mut inner = self.inner.lock();
        let mut released = Vec::new();
        for name in names {
            let remove = match inner.counts.get_mut(name) {
                Some(count) => {
                    *count -= 1;
                    *count == 0
                }
                None => false,
            };
            if remove {
                inner.counts.remove(name);
                if inner.pending.remove(name) {
                    released.push(name.clone());
                }
            }
        }
        released
    }

    /// Whether any reader still holds `name`.
    pub fn is_referenced(&self, name: &str) -> bool {
        self.inner.lock().counts.contains_key(name)
    }

    /// Park `name` until its last reader releases it.
    pub fn add_pending(&self, name: &str) {
        self.inner.lock().pending.insert(name.to_string());
    }

    /// Remove and return every pending file that is no longer referenced.
    pub fn take_unreferenced_pending(&self) -> Vec<String> {
        let mut inner = self.inner.lock();
        let RefsInner { counts, pending } = &mut *inner;
        let ready: Vec<String> = pending
            .iter()
            .filter(|name| !counts.contains_key(*name))
            .cloned()
            .collect();
        for name in &ready {
            pending.remove(name);
        }
        ready
    }

    /// Snapshot of the pending set.
    pub fn pending(&self) -> Vec<String> {
        self.inner.lock().pending.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_pending_released_on_last_decref() {
        let refs = FileRefs::new();
        refs.incref(&names(&["_0.tis", "_0.frq"]));
        refs.incref(&names(&["_0.tis"]));

        refs.add_pending("_0.tis");
        assert!(refs.take_unreferenced_pending().is_empty());

        assert!(refs.decref(&names(&["_0.tis", "_0.frq"])).is_empty());
        assert!(refs.is_referenced("_0.tis"));
        assert!(!refs.is_referenced("_0.frq"));

        assert_eq!(refs.decref(&names(&["_0.tis"])), names(&["_0.tis"]));
        assert!(refs.pending().is_empty());
    }

    #[test]
    fn test_take_unreferenced_pending() {
        let refs = FileRefs::new();
        refs.incref(&names(&["_1.cfs"]));
        refs.add_pending("_1.cfs");
        refs.add_pending("_0.cfs");

        assert_eq!(refs.take_unreferenced_pending(), names(&["_0.cfs"]));
        assert_eq!(refs.pending(), names(&["_1.cfs"]));
    }
}

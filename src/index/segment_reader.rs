//! Read access to one segment.
//!
//! The immutable parts of a segment (dictionary, postings streams, stored
//! fields, term vectors) live in a shared core. Deletions and norms are
//! per-reader `Arc` values changed with `Arc::make_mut`, so a clone never
//! sees the uncommitted changes of another reader.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::document::Document;
use crate::error::{LucernaError, Result};
use crate::index::deleter;
use crate::index::field_infos::FieldInfos;
use crate::index::norms::{default_norm, read_norms, write_norms};
use crate::index::postings::{SegmentTermDocs, SegmentTermPositions, frq_file, prx_file};
use crate::index::segment_info::SegmentInfo;
use crate::index::stored_fields::StoredFieldsReader;
use crate::index::term_dictionary::{SegmentTermEnum, TermDictionaryReader, TermInfo};
use crate::index::term_vectors::{TermFreqVector, TermVectorsReader, tvx_file};
use crate::storage::compound::CompoundStorage;
use crate::storage::structured::{StructReader, StructWriter};
use crate::storage::{Storage, StorageInput};
use crate::util::bitset::BitSet;

#[derive(Debug)]
struct SegmentCore {
    storage: Arc<dyn Storage>,
    segment_storage: Arc<dyn Storage>,
    field_infos: Arc<FieldInfos>,
    terms: TermDictionaryReader,
    frq: Mutex<StructReader<Box<dyn StorageInput>>>,
    prx: Mutex<StructReader<Box<dyn StorageInput>>>,
    stored: StoredFieldsReader,
    vectors: Option<TermVectorsReader>,
}

/// Reader over one committed segment.
#[derive(Debug)]
pub struct SegmentReader {
    core: Arc<SegmentCore>,
    info: SegmentInfo,
    deleted: Option<Arc<BitSet>>,
    norms: BTreeMap<u32, Arc<Vec<u8>>>,
    deletions_dirty: bool,
    dirty_norms: BTreeSet<u32>,
    held_files: Vec<String>,
}

impl SegmentReader {
    /// Open `info` inside `storage`. Every file the segment uses is
    /// registered in the storage's reference table until the reader drops.
    pub fn open(
        storage: Arc<dyn Storage>,
        info: &SegmentInfo,
        field_infos: Arc<FieldInfos>,
    ) -> Result<Self> {
        let segment_storage: Arc<dyn Storage> = if info.uses_compound_file {
            Arc::new(CompoundStorage::open(
                storage.as_ref(),
                &info.compound_file_name(),
            )?)
        } else {
            Arc::clone(&storage)
        };
        let dir = segment_storage.as_ref();

        let terms = TermDictionaryReader::open(dir, &info.name)?;
        let frq = StructReader::open(dir, &frq_file(&info.name))?;
        let prx = StructReader::open(dir, &prx_file(&info.name))?;
        let stored = StoredFieldsReader::open(dir, &info.name)?;
        if stored.size() != info.doc_count {
            return Err(LucernaError::corrupt(format!(
                "segment {} claims {} docs but stores {}",
                info.name,
                info.doc_count,
                stored.size()
            )));
        }
        let vectors = if dir.file_exists(&tvx_file(&info.name)) {
            Some(TermVectorsReader::open(dir, &info.name)?)
        } else {
            None
        };

        let deleted = read_deletions(storage.as_ref(), info)?;
        let norms = read_all_norms(storage.as_ref(), dir, info, &field_infos)?;

        let held_files = info.files(storage.as_ref(), &field_infos);
        storage.file_refs().incref(&held_files);

        Ok(SegmentReader {
            core: Arc::new(SegmentCore {
                storage,
                segment_storage,
                field_infos,
                terms,
                frq: Mutex::new(frq),
                prx: Mutex::new(prx),
                stored,
                vectors,
            }),
            info: info.clone(),
            deleted,
            norms,
            deletions_dirty: false,
            dirty_norms: BTreeSet::new(),
            held_files,
        })
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Descriptor including any committed changes of this reader.
    pub fn info(&self) -> &SegmentInfo {
        &self.info
    }

    pub fn field_infos(&self) -> &Arc<FieldInfos> {
        &self.core.field_infos
    }

    /// Storage the segment's own files are read from.
    pub fn segment_storage(&self) -> &Arc<dyn Storage> {
        &self.core.segment_storage
    }

    pub fn max_doc(&self) -> u32 {
        self.info.doc_count
    }

    pub fn num_docs(&self) -> u32 {
        self.info.doc_count - self.deleted_count()
    }

    fn deleted_count(&self) -> u32 {
        self.deleted.as_ref().map(|bits| bits.count() as u32).unwrap_or(0)
    }

    pub fn has_deletions(&self) -> bool {
        self.deleted_count() > 0
    }

    /// Snapshot of the deletions, shared with cursors.
    pub fn deleted_docs(&self) -> Option<Arc<BitSet>> {
        self.deleted.clone()
    }

    pub fn is_deleted(&self, doc: u32) -> bool {
        self.deleted
            .as_ref()
            .is_some_and(|bits| bits.get(doc as usize))
    }

    fn check_doc(&self, doc: u32) -> Result<()> {
        if doc >= self.info.doc_count {
            return Err(LucernaError::invalid_argument(format!(
                "doc {doc} out of range for segment {} with {} docs",
                self.info.name, self.info.doc_count
            )));
        }
        Ok(())
    }

    /// Stored fields of `doc`. Deleted documents are an error.
    pub fn document(&self, doc: u32) -> Result<Document> {
        self.check_doc(doc)?;
        if self.is_deleted(doc) {
            return Err(LucernaError::invalid_argument(format!(
                "doc {doc} of segment {} is deleted",
                self.info.name
            )));
        }
        self.core.stored.document(&self.core.field_infos, doc)
    }

    pub(crate) fn stored_fields(&self) -> &StoredFieldsReader {
        &self.core.stored
    }

    pub(crate) fn term_vectors_reader(&self) -> Option<&TermVectorsReader> {
        self.core.vectors.as_ref()
    }

    pub fn terms(&self) -> Result<SegmentTermEnum> {
        self.core.terms.terms()
    }

    pub fn terms_from(&self, field_num: u32, text: &str) -> Result<SegmentTermEnum> {
        self.core.terms.terms_from(field_num, text)
    }

    pub fn term_info(&self, field_num: u32, text: &str) -> Result<Option<TermInfo>> {
        self.core.terms.get(field_num, text)
    }

    /// Documents containing the term, deleted ones included.
    pub fn doc_freq(&self, field_num: u32, text: &str) -> Result<u32> {
        Ok(self
            .term_info(field_num, text)?
            .map(|info| info.doc_freq)
            .unwrap_or(0))
    }

    /// Unpositioned postings cursor.
    pub fn term_docs(&self) -> Result<SegmentTermDocs> {
        let frq = self.core.frq.lock().clone_reader()?;
        Ok(SegmentTermDocs::new(
            frq,
            self.deleted.clone(),
            self.core.terms.skip_interval(),
        ))
    }

    /// Unpositioned postings cursor with positions.
    pub fn term_positions(&self) -> Result<SegmentTermPositions> {
        let frq = self.core.frq.lock().clone_reader()?;
        let prx = self.core.prx.lock().clone_reader()?;
        Ok(SegmentTermPositions::new(
            frq,
            prx,
            self.deleted.clone(),
            self.core.terms.skip_interval(),
        ))
    }

    pub fn term_docs_for(&self, field_num: u32, text: &str) -> Result<SegmentTermDocs> {
        let mut docs = self.term_docs()?;
        docs.seek(self.term_info(field_num, text)?.as_ref())?;
        Ok(docs)
    }

    pub fn term_positions_for(&self, field_num: u32, text: &str) -> Result<SegmentTermPositions> {
        let mut positions = self.term_positions()?;
        positions.seek(self.term_info(field_num, text)?.as_ref())?;
        Ok(positions)
    }

    /// Norm bytes of `field_num`, `None` when the field keeps no norms.
    pub fn norms(&self, field_num: u32) -> Option<&[u8]> {
        self.norms.get(&field_num).map(|norms| norms.as_slice())
    }

    pub fn term_freq_vector(&self, doc: u32, field: &str) -> Result<Option<TermFreqVector>> {
        self.check_doc(doc)?;
        match &self.core.vectors {
            Some(vectors) => vectors.get_field(&self.core.field_infos, doc, field),
            None => Ok(None),
        }
    }

    pub fn term_freq_vectors(&self, doc: u32) -> Result<Vec<TermFreqVector>> {
        self.check_doc(doc)?;
        match &self.core.vectors {
            Some(vectors) => vectors.get(&self.core.field_infos, doc),
            None => Ok(Vec::new()),
        }
    }

    /// Mark `doc` deleted in this reader. Visible to others after commit.
    pub fn delete_document(&mut self, doc: u32) -> Result<()> {
        self.check_doc(doc)?;
        let max_doc = self.info.doc_count as usize;
        let bits = self
            .deleted
            .get_or_insert_with(|| Arc::new(BitSet::new(max_doc)));
        if Arc::make_mut(bits).set(doc as usize) {
            self.deletions_dirty = true;
        }
        Ok(())
    }

    pub fn undelete_all(&mut self) {
        if self.deleted.take().is_some() || self.info.has_deletions() {
            self.deletions_dirty = true;
        }
    }

    /// Replace the norm byte of `doc` in `field_num`.
    pub fn set_norm(&mut self, doc: u32, field_num: u32, value: u8) -> Result<()> {
        self.check_doc(doc)?;
        let norms = self.norms.get_mut(&field_num).ok_or_else(|| {
            LucernaError::invalid_argument(format!(
                "field number {field_num} keeps no norms in segment {}",
                self.info.name
            ))
        })?;
        Arc::make_mut(norms)[doc as usize] = value;
        self.dirty_norms.insert(field_num);
        Ok(())
    }

    pub fn has_changes(&self) -> bool {
        self.deletions_dirty || !self.dirty_norms.is_empty()
    }

    /// Write pending deletions and norms as new generation files and adopt
    /// them.
    ///
    /// The caller commits the updated [`SegmentReader::info`] in a new
    /// segments file.
    pub fn commit_changes(&mut self) -> Result<()> {
        if let Some(info) = self.prepare_commit()? {
            self.finish_commit(info)?;
        }
        Ok(())
    }

    /// Write pending deletions and norms under the next generations and
    /// return the descriptor naming them, `None` when nothing changed.
    ///
    /// The reader itself is left untouched, so a commit whose segments file
    /// cannot be written keeps its changes pending and can be retried.
    pub(crate) fn prepare_commit(&self) -> Result<Option<SegmentInfo>> {
        if !self.has_changes() {
            return Ok(None);
        }
        let storage = self.core.storage.as_ref();
        let mut info = self.info.clone();

        if self.deletions_dirty {
            let name = info.advance_del_gen();
            let empty;
            let bits = match self.deleted.as_deref() {
                Some(bits) => bits,
                None => {
                    empty = BitSet::new(info.doc_count as usize);
                    &empty
                }
            };
            let mut writer = StructWriter::create(storage, &name)?;
            bits.write_to(&mut writer)?;
            writer.close()?;
            log::debug!("wrote {name} with {} deleted docs", bits.count());
        }

        for field_num in &self.dirty_norms {
            let name = info.advance_norm_gen(*field_num);
            if let Some(norms) = self.norms.get(field_num) {
                write_norms(storage, &name, norms)?;
                log::debug!("wrote {name}");
            }
        }
        Ok(Some(info))
    }

    /// Adopt `info` from [`SegmentReader::prepare_commit`] once it has been
    /// committed, moving this reader's file references to its files.
    pub(crate) fn finish_commit(&mut self, info: SegmentInfo) -> Result<()> {
        self.info = info;
        self.deletions_dirty = false;
        self.dirty_norms.clear();

        let storage = Arc::clone(&self.core.storage);
        let files = self.info.files(storage.as_ref(), &self.core.field_infos);
        let refs = storage.file_refs();
        refs.incref(&files);
        let released = refs.decref(&self.held_files);
        self.held_files = files;
        deleter::delete_files(storage.as_ref(), &released)
    }
}

impl Clone for SegmentReader {
    fn clone(&self) -> Self {
        self.core.storage.file_refs().incref(&self.held_files);
        SegmentReader {
            core: Arc::clone(&self.core),
            info: self.info.clone(),
            deleted: self.deleted.clone(),
            norms: self.norms.clone(),
            deletions_dirty: self.deletions_dirty,
            dirty_norms: self.dirty_norms.clone(),
            held_files: self.held_files.clone(),
        }
    }
}

impl Drop for SegmentReader {
    fn drop(&mut self) {
        let storage = self.core.storage.as_ref();
        let released = storage.file_refs().decref(&self.held_files);
        if let Err(e) = deleter::delete_files(storage, &released) {
            log::warn!("failed to delete files released by {}: {e}", self.info.name);
        }
    }
}

/// Committed deletions of `info`, `None` when nothing is deleted.
pub(crate) fn read_deletions(storage: &dyn Storage, info: &SegmentInfo) -> Result<Option<Arc<BitSet>>> {
    let name = match info.del_file_name() {
        Some(name) => name,
        None => return Ok(None),
    };
    let mut reader = StructReader::open(storage, &name)?;
    let mut bits = BitSet::read_from(&mut reader)?;
    let max_doc = info.doc_count as usize;
    if bits.len() > max_doc {
        return Err(LucernaError::corrupt(format!(
            "{name} covers {} docs, segment has {max_doc}",
            bits.len()
        )));
    }
    bits.grow(max_doc);
    Ok((bits.count() > 0).then(|| Arc::new(bits)))
}

fn read_all_norms(
    storage: &dyn Storage,
    segment_storage: &dyn Storage,
    info: &SegmentInfo,
    field_infos: &FieldInfos,
) -> Result<BTreeMap<u32, Arc<Vec<u8>>>> {
    let mut norms = BTreeMap::new();
    for field in field_infos.iter().filter(|field| field.has_norms()) {
        let values = if info.has_separate_norms(field.number) {
            read_norms(storage, &info.norm_file_name(field.number), info.doc_count)?
        } else {
            let name = info.original_norm_file_name(field.number);
            if segment_storage.file_exists(&name) {
                read_norms(segment_storage, &name, info.doc_count)?
            } else {
                // field gained norms after this segment was written
                vec![default_norm(); info.doc_count as usize]
            }
        };
        norms.insert(field.number, Arc::new(values));
    }
    Ok(norms)
}

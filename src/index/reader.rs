//! Point-in-time reader over every segment of an index.
//!
//! Documents are numbered globally: segment `i` starts at the sum of
//! `max_doc` of segments `0..i`. A reader never sees commits made after it
//! was opened; [`IndexReader::is_latest`] tells whether one happened and
//! [`IndexReader::reopen`] catches up, reusing unchanged segments.
//!
//! Deletions and norm changes made through a reader stay private to it
//! until [`IndexReader::commit`], which requires the write lock. The lock
//! is taken on the first change and fails with a state error when the
//! index moved on since the reader was opened.

use std::sync::Arc;
use std::time::Duration;

use crate::document::Document;
use crate::error::{LucernaError, Result};
use crate::index::deleter::Deleter;
use crate::index::field_infos::FieldInfos;
use crate::index::norms::default_norm;
use crate::index::postings::{SegmentTermDocs, SegmentTermPositions, TermDocs, TermPositions};
use crate::index::segment_info::SegmentInfos;
use crate::index::segment_reader::SegmentReader;
use crate::index::term_dictionary::{SegmentTermEnum, compare_keys};
use crate::index::term_vectors::TermFreqVector;
use crate::storage::Storage;
use crate::storage::lock::{
    COMMIT_LOCK_NAME, DEFAULT_COMMIT_LOCK_TIMEOUT, DEFAULT_LOCK_POLL_INTERVAL,
    DEFAULT_WRITE_LOCK_TIMEOUT, LockGuard, WRITE_LOCK_NAME,
};

/// Reader over one committed generation of an index.
#[derive(Debug)]
pub struct IndexReader {
    storage: Arc<dyn Storage>,
    infos: SegmentInfos,
    field_infos: Arc<FieldInfos>,
    segments: Vec<SegmentReader>,
    /// First global doc number of each segment, plus `max_doc` at the end.
    starts: Vec<u32>,
    write_lock: Option<LockGuard>,
    write_lock_timeout: Duration,
    lock_poll_interval: Duration,
}

impl IndexReader {
    /// Open the latest committed generation of the index in `storage`.
    pub fn open(storage: Arc<dyn Storage>) -> Result<Self> {
        let _commit = LockGuard::obtain(
            storage.as_ref(),
            COMMIT_LOCK_NAME,
            DEFAULT_COMMIT_LOCK_TIMEOUT,
            DEFAULT_LOCK_POLL_INTERVAL,
        )?;
        let infos = SegmentInfos::read_latest(storage.as_ref())?;
        Self::assemble(storage, infos, &[])
    }

    fn assemble(
        storage: Arc<dyn Storage>,
        infos: SegmentInfos,
        previous: &[SegmentReader],
    ) -> Result<Self> {
        let field_infos = Arc::new(infos.field_infos.clone());
        let mut segments = Vec::with_capacity(infos.len());
        let mut starts = Vec::with_capacity(infos.len() + 1);
        let mut max_doc = 0u32;
        for info in infos.iter() {
            let reusable = previous
                .iter()
                .find(|reader| reader.info() == info && !reader.has_changes());
            let reader = match reusable {
                Some(reader) => reader.clone(),
                None => SegmentReader::open(Arc::clone(&storage), info, Arc::clone(&field_infos))?,
            };
            starts.push(max_doc);
            max_doc = max_doc.checked_add(reader.max_doc()).ok_or_else(|| {
                LucernaError::corrupt("index holds more than u32::MAX documents")
            })?;
            segments.push(reader);
        }
        starts.push(max_doc);

        log::debug!(
            "opened reader on {} ({} segments, {max_doc} docs)",
            infos.segments_file_name(),
            segments.len()
        );
        Ok(IndexReader {
            storage,
            infos,
            field_infos,
            segments,
            starts,
            write_lock: None,
            write_lock_timeout: DEFAULT_WRITE_LOCK_TIMEOUT,
            lock_poll_interval: DEFAULT_LOCK_POLL_INTERVAL,
        })
    }

    /// How long a change waits for the write lock.
    pub fn set_write_lock_timeout(&mut self, timeout: Duration) {
        self.write_lock_timeout = timeout;
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn field_infos(&self) -> &FieldInfos {
        &self.field_infos
    }

    /// Version of the generation this reader was opened on.
    pub fn version(&self) -> u64 {
        self.infos.version
    }

    pub fn generation(&self) -> u64 {
        self.infos.generation
    }

    /// Whether no commit happened since this reader was opened.
    pub fn is_latest(&self) -> Result<bool> {
        Ok(SegmentInfos::latest_generation(self.storage.as_ref())? == Some(self.infos.generation))
    }

    /// A reader on the latest generation. Segments that did not change are
    /// shared with this reader; uncommitted changes of this reader are not
    /// carried over.
    pub fn reopen(&self) -> Result<IndexReader> {
        let _commit = LockGuard::obtain(
            self.storage.as_ref(),
            COMMIT_LOCK_NAME,
            DEFAULT_COMMIT_LOCK_TIMEOUT,
            self.lock_poll_interval,
        )?;
        let infos = SegmentInfos::read_latest(self.storage.as_ref())?;
        let mut reader = Self::assemble(Arc::clone(&self.storage), infos, &self.segments)?;
        reader.write_lock_timeout = self.write_lock_timeout;
        Ok(reader)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn max_doc(&self) -> u32 {
        self.starts.last().copied().unwrap_or(0)
    }

    /// Live documents.
    pub fn num_docs(&self) -> u32 {
        self.segments.iter().map(SegmentReader::num_docs).sum()
    }

    pub fn has_deletions(&self) -> bool {
        self.segments.iter().any(SegmentReader::has_deletions)
    }

    /// Segment holding global `doc`, and its number inside that segment.
    fn locate(&self, doc: u32) -> Result<(usize, u32)> {
        if doc >= self.max_doc() {
            return Err(LucernaError::invalid_argument(format!(
                "doc {doc} out of range, index has {} docs",
                self.max_doc()
            )));
        }
        // starts is sorted; empty segments share a start with their successor
        let index = self.starts.partition_point(|start| *start <= doc) - 1;
        Ok((index, doc - self.starts[index]))
    }

    pub fn is_deleted(&self, doc: u32) -> bool {
        match self.locate(doc) {
            Ok((index, local)) => self.segments[index].is_deleted(local),
            Err(_) => false,
        }
    }

    /// Stored fields of `doc`.
    pub fn document(&self, doc: u32) -> Result<Document> {
        let (index, local) = self.locate(doc)?;
        self.segments[index].document(local)
    }

    fn field_number(&self, field: &str) -> Option<u32> {
        self.field_infos.field_number(field)
    }

    /// Every term of every field, positioned before the first one.
    pub fn all_terms(&self) -> Result<MultiTermEnum> {
        let mut enums = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            let mut terms = segment.terms()?;
            terms.next()?;
            enums.push(terms);
        }
        Ok(MultiTermEnum::new(Arc::clone(&self.field_infos), enums, None))
    }

    /// Terms of `field`, positioned before the first one.
    pub fn terms(&self, field: &str) -> Result<MultiTermEnum> {
        let Some(field_num) = self.field_number(field) else {
            return Ok(MultiTermEnum::new(Arc::clone(&self.field_infos), Vec::new(), None));
        };
        let enums = self
            .segments
            .iter()
            .map(|segment| segment.terms_from(field_num, ""))
            .collect::<Result<Vec<_>>>()?;
        Ok(MultiTermEnum::new(
            Arc::clone(&self.field_infos),
            enums,
            Some(field_num),
        ))
    }

    /// Terms from the first one at or after `field:text` on, across fields.
    /// The enumeration is positioned on that term.
    pub fn terms_from(&self, field: &str, text: &str) -> Result<MultiTermEnum> {
        let field_num = self
            .field_number(field)
            .ok_or_else(|| LucernaError::invalid_argument(format!("unknown field {field}")))?;
        let enums = self
            .segments
            .iter()
            .map(|segment| segment.terms_from(field_num, text))
            .collect::<Result<Vec<_>>>()?;
        let mut terms = MultiTermEnum::new(Arc::clone(&self.field_infos), enums, None);
        terms.pick()?;
        Ok(terms)
    }

    /// Documents containing `field:text`, deleted ones included.
    pub fn doc_freq(&self, field: &str, text: &str) -> Result<u32> {
        let Some(field_num) = self.field_number(field) else {
            return Ok(0);
        };
        let mut total = 0;
        for segment in &self.segments {
            total += segment.doc_freq(field_num, text)?;
        }
        Ok(total)
    }

    /// Live documents containing `field:text`, in increasing order.
    pub fn term_docs_for(&self, field: &str, text: &str) -> Result<MultiTermDocs> {
        let field_num = self.field_number(field);
        let mut cursors = Vec::with_capacity(self.segments.len());
        for (segment, base) in self.segments.iter().zip(&self.starts) {
            let mut cursor = segment.term_docs()?;
            let info = match field_num {
                Some(field_num) => segment.term_info(field_num, text)?,
                None => None,
            };
            cursor.seek(info.as_ref())?;
            cursors.push((*base, cursor));
        }
        Ok(MultiCursor::new(cursors))
    }

    /// Like [`IndexReader::term_docs_for`], with positions.
    pub fn term_positions_for(&self, field: &str, text: &str) -> Result<MultiTermPositions> {
        let field_num = self.field_number(field);
        let mut cursors = Vec::with_capacity(self.segments.len());
        for (segment, base) in self.segments.iter().zip(&self.starts) {
            let mut cursor = segment.term_positions()?;
            let info = match field_num {
                Some(field_num) => segment.term_info(field_num, text)?,
                None => None,
            };
            cursor.seek(info.as_ref())?;
            cursors.push((*base, cursor));
        }
        Ok(MultiCursor::new(cursors))
    }

    /// Norm bytes of `field` for every document, `None` when the field
    /// keeps no norms.
    pub fn norms(&self, field: &str) -> Option<Vec<u8>> {
        let info = self.field_infos.by_name(field)?;
        if !info.has_norms() {
            return None;
        }
        let mut norms = Vec::with_capacity(self.max_doc() as usize);
        for segment in &self.segments {
            match segment.norms(info.number) {
                Some(bytes) => norms.extend_from_slice(bytes),
                None => norms.resize(norms.len() + segment.max_doc() as usize, default_norm()),
            }
        }
        Some(norms)
    }

    pub fn term_freq_vector(&self, doc: u32, field: &str) -> Result<Option<TermFreqVector>> {
        let (index, local) = self.locate(doc)?;
        self.segments[index].term_freq_vector(local, field)
    }

    pub fn term_freq_vectors(&self, doc: u32) -> Result<Vec<TermFreqVector>> {
        let (index, local) = self.locate(doc)?;
        self.segments[index].term_freq_vectors(local)
    }

    pub fn field_names(&self) -> Vec<String> {
        self.field_infos.iter().map(|info| info.name.clone()).collect()
    }

    /// Take the write lock before the first change.
    fn acquire_write_lock(&mut self) -> Result<()> {
        if self.write_lock.is_some() {
            return Ok(());
        }
        let lock = LockGuard::obtain(
            self.storage.as_ref(),
            WRITE_LOCK_NAME,
            self.write_lock_timeout,
            self.lock_poll_interval,
        )?;
        if !self.is_latest()? {
            return Err(LucernaError::state(format!(
                "reader on {} is stale, reopen it before making changes",
                self.infos.segments_file_name()
            )));
        }
        self.write_lock = Some(lock);
        Ok(())
    }

    pub fn delete_document(&mut self, doc: u32) -> Result<()> {
        let (index, local) = self.locate(doc)?;
        self.acquire_write_lock()?;
        self.segments[index].delete_document(local)
    }

    /// Delete every document containing `field:text`. Returns how many
    /// live documents were deleted.
    pub fn delete_documents(&mut self, field: &str, text: &str) -> Result<u32> {
        let mut docs = self.term_docs_for(field, text)?;
        let mut matched = Vec::new();
        while docs.next()? {
            matched.push(docs.doc());
        }
        if matched.is_empty() {
            return Ok(0);
        }
        self.acquire_write_lock()?;
        for doc in &matched {
            let (index, local) = self.locate(*doc)?;
            self.segments[index].delete_document(local)?;
        }
        Ok(matched.len() as u32)
    }

    pub fn undelete_all(&mut self) -> Result<()> {
        self.acquire_write_lock()?;
        for segment in &mut self.segments {
            segment.undelete_all();
        }
        Ok(())
    }

    /// Replace the norm byte of `doc` in `field`.
    pub fn set_norm(&mut self, doc: u32, field: &str, value: u8) -> Result<()> {
        let (index, local) = self.locate(doc)?;
        let field_num = self
            .field_number(field)
            .ok_or_else(|| LucernaError::invalid_argument(format!("unknown field {field}")))?;
        self.acquire_write_lock()?;
        self.segments[index].set_norm(local, field_num, value)
    }

    pub fn has_changes(&self) -> bool {
        self.segments.iter().any(SegmentReader::has_changes)
    }

    /// Write pending changes as a new generation and release the write lock.
    pub fn commit(&mut self) -> Result<()> {
        if !self.has_changes() {
            if let Some(lock) = self.write_lock.take() {
                lock.release()?;
            }
            return Ok(());
        }
        if self.write_lock.is_none() {
            return Err(LucernaError::state("changes pending without the write lock"));
        }

        {
            let _commit = LockGuard::obtain(
                self.storage.as_ref(),
                COMMIT_LOCK_NAME,
                DEFAULT_COMMIT_LOCK_TIMEOUT,
                self.lock_poll_interval,
            )?;
            // nothing is adopted until the segments file is written, so a
            // failure leaves every change pending for a retry
            let mut staged = Vec::with_capacity(self.segments.len());
            for segment in &self.segments {
                staged.push(segment.prepare_commit()?);
            }
            let mut next = self.infos.clone();
            next.segments = self
                .segments
                .iter()
                .zip(&staged)
                .map(|(segment, info)| info.as_ref().unwrap_or(segment.info()).clone())
                .collect();
            next.write(self.storage.as_ref())?;

            for (segment, info) in self.segments.iter_mut().zip(staged) {
                if let Some(info) = info {
                    segment.finish_commit(info)?;
                }
            }
            let mut deleter = Deleter::new(Arc::clone(&self.storage), &self.infos);
            self.infos = next;
            deleter.checkpoint(&self.infos)?;
        }

        log::info!(
            "reader committed {} ({} live docs)",
            self.infos.segments_file_name(),
            self.num_docs()
        );
        if let Some(lock) = self.write_lock.take() {
            lock.release()?;
        }
        Ok(())
    }

    /// Commit pending changes and release every file of the reader.
    pub fn close(mut self) -> Result<()> {
        self.commit()
    }
}

impl Drop for IndexReader {
    fn drop(&mut self) {
        if self.has_changes() {
            log::warn!(
                "reader on {} dropped with uncommitted changes, discarding them",
                self.infos.segments_file_name()
            );
        }
    }
}

/// Merged view of the term enumerations of several segments.
///
/// Terms come in `(field number, text)` order; a term present in several
/// segments is reported once with the summed document frequency.
#[derive(Debug)]
pub struct MultiTermEnum {
    field_infos: Arc<FieldInfos>,
    /// Each positioned on its next unreported term, or exhausted.
    enums: Vec<SegmentTermEnum>,
    field: Option<u32>,
    current: Option<(u32, String)>,
    doc_freq: u32,
}

impl MultiTermEnum {
    fn new(field_infos: Arc<FieldInfos>, enums: Vec<SegmentTermEnum>, field: Option<u32>) -> Self {
        MultiTermEnum {
            field_infos,
            enums,
            field,
            current: None,
            doc_freq: 0,
        }
    }

    /// Advance to the next term. Returns false when there is none.
    pub fn next(&mut self) -> Result<bool> {
        if let Some((field_num, text)) = self.current.take() {
            for terms in &mut self.enums {
                if terms.field_num() == field_num && terms.term() == Some(text.as_str()) {
                    terms.next()?;
                }
            }
        }
        self.pick()
    }

    /// Make the smallest pending term current.
    fn pick(&mut self) -> Result<bool> {
        let mut smallest: Option<&SegmentTermEnum> = None;
        for terms in &self.enums {
            let Some(text) = terms.term() else {
                continue;
            };
            let is_smaller = match smallest.and_then(|s| s.term().map(|t| (s.field_num(), t))) {
                Some((field_num, current)) => {
                    compare_keys(terms.field_num(), text, field_num, current).is_lt()
                }
                None => true,
            };
            if is_smaller {
                smallest = Some(terms);
            }
        }

        let Some((field_num, text)) =
            smallest.and_then(|s| s.term().map(|t| (s.field_num(), t.to_string())))
        else {
            self.doc_freq = 0;
            return Ok(false);
        };
        if self.field.is_some_and(|field| field != field_num) {
            self.doc_freq = 0;
            return Ok(false);
        }

        self.doc_freq = self
            .enums
            .iter()
            .filter(|terms| terms.field_num() == field_num && terms.term() == Some(text.as_str()))
            .map(SegmentTermEnum::doc_freq)
            .sum();
        self.current = Some((field_num, text));
        Ok(true)
    }

    /// Current term text.
    pub fn term(&self) -> Option<&str> {
        self.current.as_ref().map(|(_, text)| text.as_str())
    }

    /// Field name of the current term.
    pub fn field(&self) -> Option<&str> {
        let (field_num, _) = self.current.as_ref()?;
        self.field_infos.field_name(*field_num).ok()
    }

    pub fn field_num(&self) -> Option<u32> {
        self.current.as_ref().map(|(field_num, _)| *field_num)
    }

    /// Documents containing the current term, deleted ones included.
    pub fn doc_freq(&self) -> u32 {
        self.doc_freq
    }
}

/// Postings cursor chaining the cursors of consecutive segments.
#[derive(Debug)]
pub struct MultiCursor<C> {
    /// Segment base and the segment's cursor.
    cursors: Vec<(u32, C)>,
    current: usize,
}

pub type MultiTermDocs = MultiCursor<SegmentTermDocs>;
pub type MultiTermPositions = MultiCursor<SegmentTermPositions>;

impl<C> MultiCursor<C> {
    fn new(cursors: Vec<(u32, C)>) -> Self {
        MultiCursor { cursors, current: 0 }
    }
}

impl<C: TermDocs> TermDocs for MultiCursor<C> {
    fn doc(&self) -> u32 {
        self.cursors
            .get(self.current)
            .map(|(base, cursor)| base + cursor.doc())
            .unwrap_or(0)
    }

    fn freq(&self) -> u32 {
        self.cursors
            .get(self.current)
            .map(|(_, cursor)| cursor.freq())
            .unwrap_or(0)
    }

    fn next(&mut self) -> Result<bool> {
        while let Some((_, cursor)) = self.cursors.get_mut(self.current) {
            if cursor.next()? {
                return Ok(true);
            }
            self.current += 1;
        }
        Ok(false)
    }

    fn skip_to(&mut self, target: u32) -> Result<bool> {
        while let Some((base, cursor)) = self.cursors.get_mut(self.current) {
            if cursor.skip_to(target.saturating_sub(*base))? {
                return Ok(true);
            }
            self.current += 1;
        }
        Ok(false)
    }
}

impl<C: TermPositions> TermPositions for MultiCursor<C> {
    fn next_position(&mut self) -> Result<u32> {
        match self.cursors.get_mut(self.current) {
            Some((_, cursor)) => cursor.next_position(),
            None => Err(LucernaError::state("cursor is exhausted")),
        }
    }
}

//! The index writer.
//!
//! Added documents are buffered in a [`DocumentInverter`] and written as a
//! new segment once `max_buffered_docs` of them are pending. Every flush is
//! committed right away as a new segments generation, after which the merge
//! policy is consulted until it finds nothing more to merge.
//!
//! Only one writer may be open on an index; it holds `write.lock` until
//! [`IndexWriter::close`] or [`IndexWriter::abort`].

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::analysis::analyzer::{Analyzer, WhitespaceAnalyzer};
use crate::document::Document;
use crate::error::{LucernaError, Result};
use crate::index::deleter::Deleter;
use crate::index::field_infos::FieldInfos;
use crate::index::inverter::DocumentInverter;
use crate::index::merge_policy::{LogDocMergePolicy, MergePolicy};
use crate::index::merger::SegmentMerger;
use crate::index::norms::{DefaultSimilarity, Similarity};
use crate::index::postings::TermDocs;
use crate::index::segment_info::{SegmentInfo, SegmentInfos};
use crate::index::segment_reader::{SegmentReader, read_deletions};
use crate::index::term_dictionary::Term;
use crate::storage::Storage;
use crate::storage::compound::CompoundFileWriter;
use crate::storage::lock::{COMMIT_LOCK_NAME, LockGuard, WRITE_LOCK_NAME};

/// Configuration of an [`IndexWriter`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexWriterConfig {
    /// Start a new empty index even if one exists.
    pub create: bool,
    /// Documents buffered before a flush.
    pub max_buffered_docs: u32,
    /// Segments of one size level merged together.
    pub merge_factor: u32,
    /// Segments with more documents than this are never merged.
    pub max_merge_docs: u32,
    /// Tokens indexed per field and document; the rest are dropped.
    pub max_field_length: u32,
    /// Every n-th term goes to the `.tii` sample index.
    pub term_index_interval: u32,
    /// Postings between two skip entries.
    pub skip_interval: u32,
    /// Pack the files of new segments into one `.cfs` container.
    pub use_compound_file: bool,
    pub write_lock_timeout_ms: u64,
    pub commit_lock_timeout_ms: u64,
    pub lock_poll_interval_ms: u64,
}

impl Default for IndexWriterConfig {
    fn default() -> Self {
        IndexWriterConfig {
            create: false,
            max_buffered_docs: 10,
            merge_factor: 10,
            max_merge_docs: u32::MAX,
            max_field_length: 10_000,
            term_index_interval: 128,
            skip_interval: 16,
            use_compound_file: true,
            write_lock_timeout_ms: 1_000,
            commit_lock_timeout_ms: 10_000,
            lock_poll_interval_ms: 10,
        }
    }
}

impl IndexWriterConfig {
    /// Parse a configuration from JSON; missing keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: IndexWriterConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_buffered_docs == 0 {
            return Err(LucernaError::invalid_config("max_buffered_docs must be at least 1"));
        }
        if self.merge_factor < 2 {
            return Err(LucernaError::invalid_config("merge_factor must be at least 2"));
        }
        if self.max_field_length == 0 {
            return Err(LucernaError::invalid_config("max_field_length must be at least 1"));
        }
        if self.term_index_interval == 0 || self.skip_interval == 0 {
            return Err(LucernaError::invalid_config(
                "term_index_interval and skip_interval must be at least 1",
            ));
        }
        Ok(())
    }

    fn write_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.write_lock_timeout_ms)
    }

    fn commit_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_lock_timeout_ms)
    }

    fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }
}

/// Adds, deletes and merges documents of one index.
#[derive(Debug)]
pub struct IndexWriter {
    storage: Arc<dyn Storage>,
    config: IndexWriterConfig,
    analyzer: Arc<dyn Analyzer>,
    merge_policy: Box<dyn MergePolicy>,
    /// Last committed set; the counter may run ahead of it.
    infos: SegmentInfos,
    inverter: DocumentInverter,
    /// Delete-by-term requests with the number of documents buffered when
    /// each was made.
    buffered_deletes: Vec<(Term, u32)>,
    deleter: Deleter,
    write_lock: Option<LockGuard>,
}

impl IndexWriter {
    /// Open a writer on `storage`, creating the index when asked to or when
    /// there is none yet.
    pub fn open(storage: Arc<dyn Storage>, config: IndexWriterConfig) -> Result<Self> {
        config.validate()?;
        let write_lock = LockGuard::obtain(
            storage.as_ref(),
            WRITE_LOCK_NAME,
            config.write_lock_timeout(),
            config.lock_poll_interval(),
        )?;

        let (infos, deleter) = {
            let _commit = LockGuard::obtain(
                storage.as_ref(),
                COMMIT_LOCK_NAME,
                config.commit_lock_timeout(),
                config.lock_poll_interval(),
            )?;
            let infos = Self::load_or_create(storage.as_ref(), config.create)?;
            let mut deleter = Deleter::new(Arc::clone(&storage), &infos);
            deleter.sweep(&infos)?;
            (infos, deleter)
        };

        log::info!(
            "opened writer on {} ({} segments, {} docs)",
            infos.segments_file_name(),
            infos.len(),
            infos.max_doc()
        );
        let merge_policy = Box::new(LogDocMergePolicy::new(
            config.max_buffered_docs,
            config.merge_factor,
            config.max_merge_docs,
        ));
        Ok(IndexWriter {
            inverter: DocumentInverter::new(config.max_field_length, Arc::new(DefaultSimilarity)),
            storage,
            config,
            analyzer: Arc::new(WhitespaceAnalyzer),
            merge_policy,
            infos,
            buffered_deletes: Vec::new(),
            deleter,
            write_lock: Some(write_lock),
        })
    }

    fn load_or_create(storage: &dyn Storage, create: bool) -> Result<SegmentInfos> {
        let latest = SegmentInfos::latest_generation(storage)?;
        match latest {
            Some(generation) if !create => SegmentInfos::read(storage, generation),
            Some(generation) => {
                // keep counters running so new names never collide with
                // files that open readers still hold
                let mut infos = match SegmentInfos::read(storage, generation) {
                    Ok(previous) => SegmentInfos {
                        counter: previous.counter,
                        version: previous.version,
                        generation: previous.generation,
                        ..SegmentInfos::new()
                    },
                    Err(e) => {
                        log::warn!("replacing unreadable index: {e}");
                        SegmentInfos {
                            generation,
                            ..SegmentInfos::new()
                        }
                    }
                };
                infos.write(storage)?;
                Ok(infos)
            }
            None => {
                let mut infos = SegmentInfos::new();
                infos.write(storage)?;
                log::info!("created new index");
                Ok(infos)
            }
        }
    }

    pub fn config(&self) -> &IndexWriterConfig {
        &self.config
    }

    /// Analyzer used by [`IndexWriter::add_document`].
    pub fn set_analyzer(&mut self, analyzer: Arc<dyn Analyzer>) {
        self.analyzer = analyzer;
    }

    /// Similarity computing the norms of documents added from now on.
    pub fn set_similarity(&mut self, similarity: Arc<dyn Similarity>) {
        self.inverter.set_similarity(similarity);
    }

    pub fn set_merge_policy(&mut self, merge_policy: Box<dyn MergePolicy>) {
        self.merge_policy = merge_policy;
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Committed segments.
    pub fn segments(&self) -> &[SegmentInfo] {
        &self.infos.segments
    }

    pub fn field_infos(&self) -> &FieldInfos {
        &self.infos.field_infos
    }

    pub fn buffered_docs(&self) -> u32 {
        self.inverter.num_docs()
    }

    /// Committed plus buffered documents, deleted ones included.
    pub fn max_doc(&self) -> u64 {
        self.infos.max_doc() + self.inverter.num_docs() as u64
    }

    /// Committed live documents plus buffered ones. Buffered deletes are
    /// not counted until they are flushed.
    pub fn doc_count(&self) -> Result<u64> {
        let mut count = self.inverter.num_docs() as u64;
        for info in self.infos.iter() {
            let deleted = read_deletions(self.storage.as_ref(), info)?
                .map(|bits| bits.count() as u64)
                .unwrap_or(0);
            count += info.doc_count as u64 - deleted;
        }
        Ok(count)
    }

    pub fn add_document(&mut self, document: &Document) -> Result<()> {
        let analyzer = Arc::clone(&self.analyzer);
        self.add_document_with_analyzer(document, analyzer.as_ref())
    }

    /// Buffer `document`, flushing when the buffer is full.
    ///
    /// When the analyzer fails the document still occupies a number in the
    /// buffered segment; it is deleted when that segment is flushed.
    pub fn add_document_with_analyzer(
        &mut self,
        document: &Document,
        analyzer: &dyn Analyzer,
    ) -> Result<()> {
        let added = self
            .inverter
            .add_document(&mut self.infos.field_infos, document, analyzer);
        if self.inverter.num_docs() >= self.config.max_buffered_docs {
            self.flush()?;
        }
        added.map(|_| ())
    }

    /// Delete every document containing `term` at the next flush, including
    /// buffered documents added before this call.
    pub fn delete_documents(&mut self, term: Term) {
        let limit = self.inverter.num_docs();
        match self.buffered_deletes.iter_mut().find(|(t, _)| *t == term) {
            Some(entry) => entry.1 = limit,
            None => self.buffered_deletes.push((term, limit)),
        }
    }

    /// Replace the documents containing `term` with `document`.
    pub fn update_document(&mut self, term: Term, document: &Document) -> Result<()> {
        self.delete_documents(term);
        self.add_document(document)
    }

    /// Write buffered documents and deletes, commit, then merge.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_buffer()?;
        self.maybe_merge()
    }

    /// Make everything added and deleted so far durable.
    pub fn commit(&mut self) -> Result<()> {
        self.flush()
    }

    /// Merge the whole index into a single segment.
    pub fn optimize(&mut self) -> Result<()> {
        self.flush_buffer()?;
        let needs_merge = match self.infos.segments.as_slice() {
            [] => false,
            // a del file left by undelete_all holds no deleted docs
            [only] => {
                read_deletions(self.storage.as_ref(), only)?.is_some()
                    || only.has_any_separate_norms()
                    || only.uses_compound_file != self.config.use_compound_file
            }
            _ => true,
        };
        if needs_merge {
            let all = 0..self.infos.len();
            self.guarded(|writer| writer.merge_segments(all))?;
        }
        Ok(())
    }

    /// Flush, commit and release the write lock.
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        self.release_lock()
    }

    /// Drop buffered documents and deletes and release the write lock
    /// without committing anything.
    pub fn abort(mut self) -> Result<()> {
        let discarded = self.inverter.num_docs();
        self.inverter =
            DocumentInverter::new(self.config.max_field_length, Arc::new(DefaultSimilarity));
        self.buffered_deletes.clear();
        log::info!("writer aborted, discarded {discarded} buffered docs");
        self.release_lock()
    }

    fn release_lock(&mut self) -> Result<()> {
        match self.write_lock.take() {
            Some(lock) => lock.release(),
            None => Ok(()),
        }
    }

    /// Run `step`, removing whatever it left behind when it fails.
    fn guarded<T>(&mut self, step: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = step(self);
        if let Err(e) = &result {
            log::warn!("writer operation failed, removing its partial files: {e}");
            if let Err(sweep_error) = self.remove_unreferenced() {
                log::warn!("cleanup after failure also failed: {sweep_error}");
            }
        }
        result
    }

    /// Sweep files the committed set does not reference, under the commit
    /// lock so no segments file changes underneath.
    fn remove_unreferenced(&mut self) -> Result<()> {
        let _commit = LockGuard::obtain(
            self.storage.as_ref(),
            COMMIT_LOCK_NAME,
            self.config.commit_lock_timeout(),
            self.config.lock_poll_interval(),
        )?;
        self.deleter.sweep(&self.infos)
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if self.inverter.num_docs() == 0 && self.buffered_deletes.is_empty() {
            return Ok(());
        }
        self.guarded(Self::write_flush)
    }

    fn write_flush(&mut self) -> Result<()> {
        let deletes = std::mem::take(&mut self.buffered_deletes);
        let mut segments = self.infos.segments.clone();
        let mut packed = Vec::new();

        let mut aborted = Vec::new();
        let flushed = if self.inverter.num_docs() > 0 {
            aborted = self.inverter.aborted_docs().to_vec();
            let name = self.infos.next_segment_name();
            let mut info = self.inverter.flush(
                self.storage.as_ref(),
                &name,
                &self.infos.field_infos,
                self.config.term_index_interval,
                self.config.skip_interval,
            )?;
            if self.config.use_compound_file {
                packed = self.package_compound(&mut info)?;
            }
            log::info!("flushed segment {name} with {} docs", info.doc_count);
            segments.push(info);
            true
        } else {
            false
        };

        if !deletes.is_empty() || !aborted.is_empty() {
            let deleted = self.apply_deletes(&mut segments, flushed, &deletes, &aborted)?;
            log::debug!(
                "applied {} buffered deletes and {} aborted docs ({deleted} docs deleted)",
                deletes.len(),
                aborted.len()
            );
        }

        let mut next = self.infos.clone();
        next.segments = segments;
        self.commit_infos(next)?;
        self.deleter.abandon(&packed)
    }

    /// Pack the component files of a freshly written segment.
    fn package_compound(&self, info: &mut SegmentInfo) -> Result<Vec<String>> {
        let files = info.component_files(self.storage.as_ref(), &self.infos.field_infos);
        let mut writer = CompoundFileWriter::new(self.storage.as_ref(), &info.compound_file_name());
        for file in &files {
            writer.add_file(file)?;
        }
        let packed = writer.close()?;
        info.uses_compound_file = true;
        Ok(packed)
    }

    /// Apply delete-by-term requests to `segments`. When `flushed` is set
    /// the last segment is the one just flushed: a request only reaches its
    /// documents added before the request, and `aborted` docs are deleted.
    /// Returns the number of documents newly deleted.
    fn apply_deletes(
        &self,
        segments: &mut [SegmentInfo],
        flushed: bool,
        deletes: &[(Term, u32)],
        aborted: &[u32],
    ) -> Result<usize> {
        let field_infos = Arc::new(self.infos.field_infos.clone());
        let last = segments.len().saturating_sub(1);
        let mut deleted = 0usize;
        for (index, info) in segments.iter_mut().enumerate() {
            let is_flushed = flushed && index == last;
            let mut reader =
                SegmentReader::open(Arc::clone(&self.storage), info, Arc::clone(&field_infos))?;
            let mut hits = Vec::new();
            for (term, limit) in deletes {
                let Some(field_num) = field_infos.field_number(&term.field) else {
                    continue;
                };
                let mut docs = reader.term_docs_for(field_num, &term.text)?;
                while docs.next()? {
                    if is_flushed && docs.doc() >= *limit {
                        break;
                    }
                    hits.push(docs.doc());
                }
            }
            if is_flushed {
                hits.extend_from_slice(aborted);
            }
            // a document matching several terms is deleted once
            hits.sort_unstable();
            hits.dedup();
            for doc in &hits {
                reader.delete_document(*doc)?;
            }
            if reader.has_changes() {
                deleted += hits.len();
                reader.commit_changes()?;
                *info = reader.info().clone();
            }
        }
        Ok(deleted)
    }

    /// Write `next` as the new generation and drop what it superseded.
    fn commit_infos(&mut self, mut next: SegmentInfos) -> Result<()> {
        let _commit = LockGuard::obtain(
            self.storage.as_ref(),
            COMMIT_LOCK_NAME,
            self.config.commit_lock_timeout(),
            self.config.lock_poll_interval(),
        )?;
        next.write(self.storage.as_ref())?;
        self.infos = next;
        self.deleter.checkpoint(&self.infos)?;
        log::info!(
            "committed {} ({} segments, {} docs)",
            self.infos.segments_file_name(),
            self.infos.len(),
            self.infos.max_doc()
        );
        Ok(())
    }

    fn maybe_merge(&mut self) -> Result<()> {
        while let Some(range) = self.merge_policy.find_merge(&self.infos.segments) {
            if range.len() < 2 || range.end > self.infos.len() {
                log::warn!("merge policy proposed unusable range {range:?}, ignoring it");
                break;
            }
            self.guarded(|writer| writer.merge_segments(range))?;
        }
        Ok(())
    }

    /// Merge `range` of the committed segments into one and commit.
    fn merge_segments(&mut self, range: Range<usize>) -> Result<()> {
        let name = self.infos.next_segment_name();
        let field_infos = Arc::new(self.infos.field_infos.clone());
        let readers = self.infos.segments[range.clone()]
            .iter()
            .map(|info| {
                SegmentReader::open(Arc::clone(&self.storage), info, Arc::clone(&field_infos))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut merger = SegmentMerger::new(
            self.storage.as_ref(),
            &name,
            &field_infos,
            self.config.term_index_interval,
            self.config.skip_interval,
        );
        for reader in &readers {
            merger.add(reader);
        }
        let mut info = merger.merge()?;
        drop(merger);
        drop(readers);

        let mut next = self.infos.clone();
        let mut written = Vec::new();
        if info.doc_count == 0 {
            log::info!("merged segments {range:?} held no live docs, dropping them");
            written = info.component_files(self.storage.as_ref(), &field_infos);
            next.segments.drain(range);
        } else {
            if self.config.use_compound_file {
                written = self.package_compound(&mut info)?;
            }
            next.segments.splice(range, [info]);
        }
        self.commit_infos(next)?;
        self.deleter.abandon(&written)
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        let pending = self.inverter.num_docs();
        if self.write_lock.is_some() && (pending > 0 || !self.buffered_deletes.is_empty()) {
            log::warn!(
                "writer dropped without close, discarding {pending} buffered docs and {} deletes",
                self.buffered_deletes.len()
            );
        }
    }
}

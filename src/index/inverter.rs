//! In-memory inversion of buffered documents.
//!
//! Every token appends an occurrence to the posting of its term for the
//! current document; postings and occurrences are arena nodes chained by
//! handle, and each field keeps a hash map from term text to the head and
//! tail of its posting chain. Stored fields, norms and term vectors are
//! buffered per document. [`DocumentInverter::flush`] writes all of it as
//! one segment and resets the arena.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;

use crate::analysis::analyzer::{Analyzer, KeywordAnalyzer};
use crate::analysis::token::TokenStream;
use crate::document::{Document, Field, Index, TermVector};
use crate::error::{LucernaError, Result};
use crate::index::arena::{PostingArena, PostingId};
use crate::index::field_infos::FieldInfos;
use crate::index::norms::{Similarity, default_norm, encode_norm, write_norms};
use crate::index::postings::PostingsWriter;
use crate::index::segment_info::SegmentInfo;
use crate::index::stored_fields::StoredFieldsWriter;
use crate::index::term_dictionary::TermDictionaryWriter;
use crate::index::term_vectors::{TermFreqVector, TermVectorOffset, TermVectorsWriter};
use crate::storage::Storage;

#[derive(Clone, Copy, Debug)]
struct PostingList {
    first: PostingId,
    last: PostingId,
    doc_freq: u32,
}

/// Inversion state of one field within the current document.
#[derive(Debug)]
struct FieldState {
    position: i64,
    offset: u32,
    length: u32,
    boost: f32,
    vector: TermVector,
    truncated: bool,
    /// Terms that got a posting for this document, in first-seen order.
    touched: Vec<String>,
}

impl FieldState {
    fn new() -> Self {
        FieldState {
            position: -1,
            offset: 0,
            length: 0,
            boost: 1.0,
            vector: TermVector::No,
            truncated: false,
            touched: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct DocState {
    doc_num: u32,
    fields: BTreeMap<u32, FieldState>,
    stored: Document,
}

/// Buffers documents of one flush unit.
#[derive(Debug)]
pub struct DocumentInverter {
    arena: PostingArena,
    postings: AHashMap<u32, AHashMap<String, PostingList>>,
    stored: Vec<Document>,
    vectors: Vec<Vec<TermFreqVector>>,
    has_vectors: bool,
    norms: AHashMap<u32, Vec<u8>>,
    aborted: Vec<u32>,
    doc_count: u32,
    current: Option<DocState>,
    max_field_length: u32,
    similarity: Arc<dyn Similarity>,
}

impl DocumentInverter {
    pub fn new(max_field_length: u32, similarity: Arc<dyn Similarity>) -> Self {
        DocumentInverter {
            arena: PostingArena::new(),
            postings: AHashMap::new(),
            stored: Vec::new(),
            vectors: Vec::new(),
            has_vectors: false,
            norms: AHashMap::new(),
            aborted: Vec::new(),
            doc_count: 0,
            current: None,
            max_field_length,
            similarity,
        }
    }

    /// Similarity used for the norms of documents finished from now on.
    pub fn set_similarity(&mut self, similarity: Arc<dyn Similarity>) {
        self.similarity = similarity;
    }

    /// Buffered documents, finished ones only.
    pub fn num_docs(&self) -> u32 {
        self.doc_count
    }

    /// Documents whose inversion failed half way. They are buffered like any
    /// other document and must be deleted once the segment is committed.
    pub fn aborted_docs(&self) -> &[u32] {
        &self.aborted
    }

    /// Rough size of the buffered state in bytes.
    pub fn memory_usage(&self) -> usize {
        let terms: usize = self
            .postings
            .values()
            .flat_map(|table| table.keys())
            .map(|term| term.len() + std::mem::size_of::<PostingList>())
            .sum();
        let norms: usize = self.norms.values().map(Vec::len).sum();
        self.arena.memory_usage() + terms + norms
    }

    /// Validate, register and invert a whole document.
    ///
    /// Untokenized fields are indexed as one term whatever `analyzer` is.
    /// When an analyzer fails half way the document keeps its number, is
    /// listed in [`DocumentInverter::aborted_docs`], and the error is
    /// returned.
    pub fn add_document(
        &mut self,
        field_infos: &mut FieldInfos,
        document: &Document,
        analyzer: &dyn Analyzer,
    ) -> Result<u32> {
        for field in document.fields() {
            field.validate()?;
        }
        for field in document.fields() {
            field_infos.add_field(field);
        }

        let doc_num = self.start_document()?;
        let result = self.process_fields(field_infos, document, analyzer);
        self.finish_document(field_infos)?;
        if let Err(e) = result {
            log::warn!("inversion of doc {doc_num} failed, it will be deleted: {e}");
            self.aborted.push(doc_num);
            return Err(e);
        }
        Ok(doc_num)
    }

    fn process_fields(
        &mut self,
        field_infos: &FieldInfos,
        document: &Document,
        analyzer: &dyn Analyzer,
    ) -> Result<()> {
        for field in document.fields() {
            if field.store {
                self.store_field(field)?;
            }
            if !field.index.is_indexed() {
                continue;
            }
            let field_num = field_infos.field_number(&field.name).ok_or_else(|| {
                LucernaError::invalid_argument(format!("field {} is not registered", field.name))
            })?;
            let text = field.value.as_text().ok_or_else(|| {
                LucernaError::invalid_argument(format!("field {} has no text to index", field.name))
            })?;
            let tokens = match field.index {
                Index::Untokenized => KeywordAnalyzer.token_stream(&field.name, text)?,
                _ => analyzer.token_stream(&field.name, text)?,
            };
            self.invert_field(field_num, field, tokens)?;
        }
        Ok(())
    }

    /// Begin the next document and return its number within the unit.
    pub fn start_document(&mut self) -> Result<u32> {
        if self.current.is_some() {
            return Err(LucernaError::state("previous document was not finished"));
        }
        self.current = Some(DocState {
            doc_num: self.doc_count,
            fields: BTreeMap::new(),
            stored: Document::new(),
        });
        Ok(self.doc_count)
    }

    /// Buffer a stored value of the current document.
    pub fn store_field(&mut self, field: &Field) -> Result<()> {
        let doc = self
            .current
            .as_mut()
            .ok_or_else(|| LucernaError::state("store_field called outside a document"))?;
        doc.stored.add(field.clone());
        Ok(())
    }

    /// Invert one instance of an indexed field of the current document.
    ///
    /// Repeated instances continue the positions and offsets of the previous
    /// one. Tokens past `max_field_length` are dropped.
    pub fn invert_field(&mut self, field_num: u32, field: &Field, tokens: TokenStream) -> Result<()> {
        let doc = self
            .current
            .as_mut()
            .ok_or_else(|| LucernaError::state("invert_field called outside a document"))?;
        if !field.index.is_indexed() {
            return Err(LucernaError::invalid_argument(format!(
                "field {} is not indexed",
                field.name
            )));
        }

        let doc_num = doc.doc_num;
        let state = doc.fields.entry(field_num).or_insert_with(FieldState::new);
        state.boost *= field.boost;
        state.vector = widen(state.vector, field.term_vector);
        let with_offsets = state.vector.with_offsets();
        let table = self.postings.entry(field_num).or_default();
        let arena = &mut self.arena;

        let mut last_end = 0u32;
        for token in tokens {
            if state.length >= self.max_field_length {
                if !state.truncated {
                    log::debug!(
                        "field {} of doc {doc_num} truncated at {} tokens",
                        field.name,
                        self.max_field_length
                    );
                    state.truncated = true;
                }
                break;
            }

            state.position = (state.position + token.position_increment as i64).max(0);
            let position = u32::try_from(state.position).map_err(|_| {
                LucernaError::invalid_argument(format!("position overflow in field {}", field.name))
            })?;
            let end = offset_u32(token.end_offset, &field.name)?;
            let (start_offset, end_offset) = if with_offsets {
                (
                    state.offset + offset_u32(token.start_offset, &field.name)?,
                    state.offset + end,
                )
            } else {
                (0, 0)
            };

            match table.get_mut(token.text.as_str()) {
                Some(list) if arena.posting(list.last).doc_num == doc_num => {
                    arena.add_occurrence(list.last, position, start_offset, end_offset);
                }
                Some(list) => {
                    let id = arena.new_posting(doc_num, position, start_offset, end_offset);
                    arena.link(list.last, id);
                    list.last = id;
                    list.doc_freq += 1;
                    state.touched.push(token.text);
                }
                None => {
                    let id = arena.new_posting(doc_num, position, start_offset, end_offset);
                    table.insert(
                        token.text.clone(),
                        PostingList {
                            first: id,
                            last: id,
                            doc_freq: 1,
                        },
                    );
                    state.touched.push(token.text);
                }
            }
            state.length += 1;
            last_end = end;
        }
        state.offset += last_end;
        Ok(())
    }

    /// Close the current document: compute its norms and term vectors.
    pub fn finish_document(&mut self, field_infos: &FieldInfos) -> Result<()> {
        let doc = self
            .current
            .take()
            .ok_or_else(|| LucernaError::state("finish_document called outside a document"))?;

        let mut vectors = Vec::new();
        for (field_num, state) in &doc.fields {
            let info = field_infos.field_info(*field_num).ok_or_else(|| {
                LucernaError::invalid_argument(format!("field number {field_num} is not registered"))
            })?;
            if info.has_norms() {
                let norm = self.similarity.length_norm(&info.name, state.length) * state.boost;
                let norms = self.norms.entry(*field_num).or_default();
                norms.resize(doc.doc_num as usize, default_norm());
                norms.push(encode_norm(norm));
            }
            if state.vector.is_stored() && !state.touched.is_empty() {
                vectors.push(self.build_vector(&info.name, *field_num, state));
            }
        }

        self.has_vectors |= !vectors.is_empty();
        self.vectors.push(vectors);
        self.stored.push(doc.stored);
        self.doc_count += 1;
        Ok(())
    }

    fn build_vector(&self, field: &str, field_num: u32, state: &FieldState) -> TermFreqVector {
        let mut terms: Vec<&String> = state.touched.iter().collect();
        terms.sort_unstable();
        let with_positions = state.vector.with_positions();
        let with_offsets = state.vector.with_offsets();

        let mut vector = TermFreqVector {
            field: field.to_string(),
            terms: Vec::with_capacity(terms.len()),
            freqs: Vec::with_capacity(terms.len()),
            positions: with_positions.then(Vec::new),
            offsets: with_offsets.then(Vec::new),
        };
        let table = self.postings.get(&field_num);
        for term in terms {
            let Some(list) = table.and_then(|table| table.get(term.as_str())) else {
                continue;
            };
            let posting = self.arena.posting(list.last);
            vector.terms.push(term.clone());
            vector.freqs.push(posting.freq);
            let occurrences = self.arena.occurrences_of(posting);
            if let Some(positions) = vector.positions.as_mut() {
                positions.push(occurrences.clone().map(|o| o.position).collect());
            }
            if let Some(offsets) = vector.offsets.as_mut() {
                offsets.push(
                    occurrences
                        .map(|o| TermVectorOffset {
                            start: o.start_offset,
                            end: o.end_offset,
                        })
                        .collect(),
                );
            }
        }
        vector
    }

    /// Write the buffered documents as segment `segment` and reset.
    ///
    /// The buffer is cleared whether or not writing succeeds.
    pub fn flush(
        &mut self,
        storage: &dyn Storage,
        segment: &str,
        field_infos: &FieldInfos,
        index_interval: u32,
        skip_interval: u32,
    ) -> Result<SegmentInfo> {
        let result = self.write_segment(storage, segment, field_infos, index_interval, skip_interval);
        self.reset();
        result
    }

    fn write_segment(
        &mut self,
        storage: &dyn Storage,
        segment: &str,
        field_infos: &FieldInfos,
        index_interval: u32,
        skip_interval: u32,
    ) -> Result<SegmentInfo> {
        if self.current.is_some() {
            return Err(LucernaError::state("cannot flush with an unfinished document"));
        }
        if self.doc_count == 0 {
            return Err(LucernaError::state("nothing to flush"));
        }

        let mut dictionary =
            TermDictionaryWriter::new(storage, segment, index_interval, skip_interval)?;
        let mut postings = PostingsWriter::new(storage, segment, skip_interval)?;
        let mut field_nums: Vec<u32> = self.postings.keys().copied().collect();
        field_nums.sort_unstable();

        let mut positions = Vec::new();
        for field_num in field_nums {
            let Some(table) = self.postings.get(&field_num) else {
                continue;
            };
            let mut terms: Vec<(&String, &PostingList)> = table.iter().collect();
            terms.sort_unstable_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            for (term, list) in terms {
                postings.start_term();
                for posting in self.arena.postings_from(list.first) {
                    positions.clear();
                    positions.extend(self.arena.occurrences_of(posting).map(|o| o.position));
                    postings.add_posting(posting.doc_num, &positions)?;
                }
                let info = postings.finish_term()?;
                debug_assert_eq!(info.doc_freq, list.doc_freq);
                dictionary.add(field_num, term, &info)?;
            }
        }
        let term_count = dictionary.size();
        dictionary.close()?;
        postings.close()?;

        let mut stored = StoredFieldsWriter::new(storage, segment)?;
        for document in &self.stored {
            stored.add_document(field_infos, document)?;
        }
        stored.close()?;

        if self.has_vectors {
            let mut vectors = TermVectorsWriter::new(storage, segment)?;
            for doc_vectors in &self.vectors {
                vectors.add_document(field_infos, doc_vectors)?;
            }
            vectors.close()?;
        }

        let info = SegmentInfo::new(segment, self.doc_count, false);
        for field in field_infos.iter().filter(|field| field.has_norms()) {
            let mut norms = self.norms.remove(&field.number).unwrap_or_default();
            norms.resize(self.doc_count as usize, default_norm());
            write_norms(storage, &info.original_norm_file_name(field.number), &norms)?;
        }

        log::debug!(
            "flushed segment {segment}: {} docs, {term_count} terms, {} postings",
            self.doc_count,
            self.arena.posting_count()
        );
        Ok(info)
    }

    fn reset(&mut self) {
        self.arena.reset();
        self.postings.clear();
        self.stored.clear();
        self.vectors.clear();
        self.has_vectors = false;
        self.norms.clear();
        self.aborted.clear();
        self.doc_count = 0;
        self.current = None;
    }
}

fn widen(current: TermVector, requested: TermVector) -> TermVector {
    let positions = current.with_positions() || requested.with_positions();
    let offsets = current.with_offsets() || requested.with_offsets();
    match (current.is_stored() || requested.is_stored(), positions, offsets) {
        (false, _, _) => TermVector::No,
        (true, false, false) => TermVector::Yes,
        (true, true, false) => TermVector::WithPositions,
        (true, false, true) => TermVector::WithOffsets,
        (true, true, true) => TermVector::WithPositionsOffsets,
    }
}

fn offset_u32(offset: usize, field: &str) -> Result<u32> {
    u32::try_from(offset)
        .map_err(|_| LucernaError::invalid_argument(format!("offset overflow in field {field}")))
}

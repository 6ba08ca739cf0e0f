//! Merging several segments into one.
//!
//! Live documents are renumbered in input order: the documents of input `i`
//! start right after the live documents of inputs `0..i`. Stored fields,
//! term vectors and norms are copied in that order, and the dictionaries
//! are merged term by term with each input's postings translated into the
//! new numbering. Deleted documents are dropped.

use crate::error::{LucernaError, Result};
use crate::index::field_infos::FieldInfos;
use crate::index::norms::{default_norm, write_norms};
use crate::index::postings::{PostingsWriter, TermDocs, TermPositions};
use crate::index::segment_info::SegmentInfo;
use crate::index::segment_reader::SegmentReader;
use crate::index::stored_fields::StoredFieldsWriter;
use crate::index::term_dictionary::{SegmentTermEnum, TermDictionaryWriter, compare_keys};
use crate::index::term_vectors::TermVectorsWriter;
use crate::storage::Storage;

const DELETED: u32 = u32::MAX;

/// Merges segment readers into a new segment.
#[derive(Debug)]
pub struct SegmentMerger<'a> {
    storage: &'a dyn Storage,
    segment: String,
    field_infos: &'a FieldInfos,
    index_interval: u32,
    skip_interval: u32,
    readers: Vec<&'a SegmentReader>,
}

impl<'a> SegmentMerger<'a> {
    pub fn new(
        storage: &'a dyn Storage,
        segment: &str,
        field_infos: &'a FieldInfos,
        index_interval: u32,
        skip_interval: u32,
    ) -> Self {
        SegmentMerger {
            storage,
            segment: segment.to_string(),
            field_infos,
            index_interval,
            skip_interval,
            readers: Vec::new(),
        }
    }

    pub fn add(&mut self, reader: &'a SegmentReader) {
        self.readers.push(reader);
    }

    /// Write the merged segment. Its files are not referenced by anything
    /// until the caller commits the returned descriptor.
    pub fn merge(&self) -> Result<SegmentInfo> {
        if self.readers.is_empty() {
            return Err(LucernaError::state("no segments to merge"));
        }

        let doc_maps = self.doc_maps();
        let doc_count = self.merge_stored_fields(&doc_maps)?;
        self.merge_vectors(&doc_maps)?;
        let term_count = self.merge_terms(&doc_maps)?;

        let info = SegmentInfo::new(self.segment.clone(), doc_count, false);
        self.merge_norms(&info)?;

        log::info!(
            "merged {} segments into {} ({doc_count} docs, {term_count} terms)",
            self.readers.len(),
            self.segment
        );
        Ok(info)
    }

    /// Per input, old doc number to new doc number or `DELETED`.
    fn doc_maps(&self) -> Vec<Vec<u32>> {
        let mut next = 0u32;
        self.readers
            .iter()
            .map(|reader| {
                (0..reader.max_doc())
                    .map(|doc| {
                        if reader.is_deleted(doc) {
                            DELETED
                        } else {
                            next += 1;
                            next - 1
                        }
                    })
                    .collect()
            })
            .collect()
    }

    fn live_docs<'m>(map: &'m [u32]) -> impl Iterator<Item = u32> + 'm {
        map.iter()
            .enumerate()
            .filter(|(_, new)| **new != DELETED)
            .map(|(old, _)| old as u32)
    }

    fn merge_stored_fields(&self, doc_maps: &[Vec<u32>]) -> Result<u32> {
        let mut writer = StoredFieldsWriter::new(self.storage, &self.segment)?;
        for (reader, map) in self.readers.iter().zip(doc_maps) {
            for doc in Self::live_docs(map) {
                writer.add_raw_document(&reader.stored_fields().raw_document(doc)?)?;
            }
        }
        let count = writer.doc_count();
        writer.close()?;
        Ok(count)
    }

    fn merge_vectors(&self, doc_maps: &[Vec<u32>]) -> Result<()> {
        if self
            .readers
            .iter()
            .all(|reader| reader.term_vectors_reader().is_none())
        {
            return Ok(());
        }
        let mut writer = TermVectorsWriter::new(self.storage, &self.segment)?;
        for (reader, map) in self.readers.iter().zip(doc_maps) {
            for doc in Self::live_docs(map) {
                let vectors = reader.term_freq_vectors(doc)?;
                writer.add_document(self.field_infos, &vectors)?;
            }
        }
        writer.close()
    }

    fn merge_norms(&self, info: &SegmentInfo) -> Result<()> {
        for field in self.field_infos.iter().filter(|field| field.has_norms()) {
            let mut norms = Vec::with_capacity(info.doc_count as usize);
            for reader in &self.readers {
                let source = reader.norms(field.number);
                for doc in 0..reader.max_doc() {
                    if !reader.is_deleted(doc) {
                        norms.push(
                            source
                                .map(|bytes| bytes[doc as usize])
                                .unwrap_or_else(default_norm),
                        );
                    }
                }
            }
            write_norms(
                self.storage,
                &info.original_norm_file_name(field.number),
                &norms,
            )?;
        }
        Ok(())
    }

    fn merge_terms(&self, doc_maps: &[Vec<u32>]) -> Result<u64> {
        let mut dictionary = TermDictionaryWriter::new(
            self.storage,
            &self.segment,
            self.index_interval,
            self.skip_interval,
        )?;
        let mut postings = PostingsWriter::new(self.storage, &self.segment, self.skip_interval)?;

        let mut enums: Vec<SegmentTermEnum> = Vec::with_capacity(self.readers.len());
        for reader in &self.readers {
            let mut terms = reader.terms()?;
            terms.next()?;
            enums.push(terms);
        }
        let mut cursors = self
            .readers
            .iter()
            .map(|reader| reader.term_positions())
            .collect::<Result<Vec<_>>>()?;

        let mut positions = Vec::new();
        let mut matching = Vec::with_capacity(enums.len());
        loop {
            // smallest current key across the inputs
            let mut smallest: Option<(u32, String)> = None;
            for terms in &enums {
                if let Some(text) = terms.term() {
                    let is_smaller = match &smallest {
                        Some((field, current)) => {
                            compare_keys(terms.field_num(), text, *field, current).is_lt()
                        }
                        None => true,
                    };
                    if is_smaller {
                        smallest = Some((terms.field_num(), text.to_string()));
                    }
                }
            }
            let Some((field_num, text)) = smallest else {
                break;
            };

            matching.clear();
            for (i, terms) in enums.iter().enumerate() {
                if terms.term() == Some(text.as_str()) && terms.field_num() == field_num {
                    matching.push(i);
                }
            }

            postings.start_term();
            let mut doc_freq = 0;
            for &i in &matching {
                let cursor = &mut cursors[i];
                cursor.seek(enums[i].term_info())?;
                while cursor.next()? {
                    let new_doc = doc_maps[i][cursor.doc() as usize];
                    if new_doc == DELETED {
                        return Err(LucernaError::corrupt(format!(
                            "deleted doc {} of segment {} surfaced during merge",
                            cursor.doc(),
                            self.readers[i].name()
                        )));
                    }
                    positions.clear();
                    for _ in 0..cursor.freq() {
                        positions.push(cursor.next_position()?);
                    }
                    postings.add_posting(new_doc, &positions)?;
                    doc_freq += 1;
                }
            }
            if doc_freq > 0 {
                let info = postings.finish_term()?;
                dictionary.add(field_num, &text, &info)?;
            }

            for &i in &matching {
                enums[i].next()?;
            }
        }

        let term_count = dictionary.size();
        dictionary.close()?;
        postings.close()?;
        Ok(term_count)
    }
}

//! Frequency and proximity streams.
//!
//! For every term, `S.frq` holds one entry per document:
//!
//! ```text
//! vint doc_code        (doc_delta << 1) | (freq == 1)
//! [vint freq]          only when freq != 1
//! ```
//!
//! followed by the term's skip data, and `S.prx` holds `freq` position
//! deltas per document. Before posting number `k` (counting from 1) is
//! written, whenever `k % skip_interval == 0`, a skip entry recording the
//! last written document and the current `.frq`/`.prx` pointers is buffered.
//! Skip entries are delta-coded against the previous entry (pointers against
//! the term's start pointers) and appended to `.frq` right after the
//! postings; [`TermInfo::skip_offset`] is their offset from
//! [`TermInfo::freq_pointer`].

use std::sync::Arc;

use crate::error::{LucernaError, Result};
use crate::index::term_dictionary::TermInfo;
use crate::storage::structured::{StructReader, StructWriter};
use crate::storage::{Storage, StorageInput, StorageOutput};
use crate::util::bitset::BitSet;
use crate::util::varint;

pub fn frq_file(segment: &str) -> String {
    format!("{segment}.frq")
}

pub fn prx_file(segment: &str) -> String {
    format!("{segment}.prx")
}

/// Cursor over the documents containing one term.
pub trait TermDocs: Send + std::fmt::Debug {
    /// Current document number.
    fn doc(&self) -> u32;

    /// Frequency of the term in the current document.
    fn freq(&self) -> u32;

    /// Move to the next live document. Returns false when exhausted.
    fn next(&mut self) -> Result<bool>;

    /// Move to the first live document >= `target`. Returns false when there
    /// is none.
    fn skip_to(&mut self, target: u32) -> Result<bool>;

    /// Fill `docs` and `freqs` with upcoming documents. Returns how many
    /// were read; 0 means exhausted.
    fn read(&mut self, docs: &mut [u32], freqs: &mut [u32]) -> Result<usize> {
        let wanted = docs.len().min(freqs.len());
        let mut read = 0;
        while read < wanted && self.next()? {
            docs[read] = self.doc();
            freqs[read] = self.freq();
            read += 1;
        }
        Ok(read)
    }
}

/// [`TermDocs`] that can also walk positions of the current document.
pub trait TermPositions: TermDocs {
    /// Next position inside the current document. Must be called at most
    /// [`TermDocs::freq`] times per document.
    fn next_position(&mut self) -> Result<u32>;
}

/// Writes postings of consecutive terms.
pub struct PostingsWriter {
    frq: StructWriter<Box<dyn StorageOutput>>,
    prx: StructWriter<Box<dyn StorageOutput>>,
    skip_interval: u32,
    skip_buffer: Vec<u8>,
    doc_freq: u32,
    last_doc: u32,
    freq_start: u64,
    prox_start: u64,
    last_skip_doc: u32,
    last_skip_freq_pointer: u64,
    last_skip_prox_pointer: u64,
    in_term: bool,
}

impl PostingsWriter {
    pub fn new(storage: &dyn Storage, segment: &str, skip_interval: u32) -> Result<Self> {
        if skip_interval == 0 {
            return Err(LucernaError::invalid_argument("skip_interval must be positive"));
        }
        Ok(PostingsWriter {
            frq: StructWriter::create(storage, &frq_file(segment))?,
            prx: StructWriter::create(storage, &prx_file(segment))?,
            skip_interval,
            skip_buffer: Vec::new(),
            doc_freq: 0,
            last_doc: 0,
            freq_start: 0,
            prox_start: 0,
            last_skip_doc: 0,
            last_skip_freq_pointer: 0,
            last_skip_prox_pointer: 0,
            in_term: false,
        })
    }

    /// Begin the postings of a new term.
    pub fn start_term(&mut self) {
        self.freq_start = self.frq.position();
        self.prox_start = self.prx.position();
        self.doc_freq = 0;
        self.last_doc = 0;
        self.skip_buffer.clear();
        self.last_skip_doc = 0;
        self.last_skip_freq_pointer = self.freq_start;
        self.last_skip_prox_pointer = self.prox_start;
        self.in_term = true;
    }

    /// Append one document with its ascending positions.
    pub fn add_posting(&mut self, doc: u32, positions: &[u32]) -> Result<()> {
        if !self.in_term {
            return Err(LucernaError::state("add_posting called outside a term"));
        }
        if positions.is_empty() {
            return Err(LucernaError::invalid_argument(format!(
                "posting for doc {doc} has no positions"
            )));
        }
        if self.doc_freq > 0 && doc <= self.last_doc {
            return Err(LucernaError::corrupt(format!(
                "doc {doc} not after previous doc {} in postings",
                self.last_doc
            )));
        }

        self.doc_freq += 1;
        if self.doc_freq % self.skip_interval == 0 {
            self.buffer_skip()?;
        }

        let freq = positions.len() as u32;
        let delta = (doc - self.last_doc) as u64;
        if freq == 1 {
            self.frq.write_varint(delta << 1 | 1)?;
        } else {
            self.frq.write_varint(delta << 1)?;
            self.frq.write_vint(freq)?;
        }
        self.last_doc = doc;

        let mut last_position = 0;
        for &position in positions {
            if position < last_position {
                return Err(LucernaError::corrupt(format!(
                    "positions of doc {doc} are not ascending"
                )));
            }
            self.prx.write_vint(position - last_position)?;
            last_position = position;
        }
        Ok(())
    }

    fn buffer_skip(&mut self) -> Result<()> {
        let freq_pointer = self.frq.position();
        let prox_pointer = self.prx.position();
        varint::write_u32(&mut self.skip_buffer, self.last_doc - self.last_skip_doc)?;
        varint::write_u64(
            &mut self.skip_buffer,
            freq_pointer - self.last_skip_freq_pointer,
        )?;
        varint::write_u64(
            &mut self.skip_buffer,
            prox_pointer - self.last_skip_prox_pointer,
        )?;
        self.last_skip_doc = self.last_doc;
        self.last_skip_freq_pointer = freq_pointer;
        self.last_skip_prox_pointer = prox_pointer;
        Ok(())
    }

    /// Finish the current term, appending its skip data.
    pub fn finish_term(&mut self) -> Result<TermInfo> {
        if !self.in_term || self.doc_freq == 0 {
            return Err(LucernaError::state("finish_term called without postings"));
        }
        let skip_offset = if self.skip_buffer.is_empty() {
            0
        } else {
            let offset = self.frq.position() - self.freq_start;
            self.frq.write_raw(&self.skip_buffer)?;
            offset
        };
        self.in_term = false;
        Ok(TermInfo {
            doc_freq: self.doc_freq,
            freq_pointer: self.freq_start,
            prox_pointer: self.prox_start,
            skip_offset,
        })
    }

    pub fn close(self) -> Result<()> {
        self.frq.close()?;
        self.prx.close()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SkipEntry {
    doc: u32,
    freq_pointer: u64,
    prox_pointer: u64,
}

/// Position stream state of a [`SegmentTermPositions`].
#[derive(Debug)]
struct ProxState {
    input: StructReader<Box<dyn StorageInput>>,
    /// Positions of documents already passed that were never read.
    pending_skip: u64,
    /// Positions of the current document not read yet.
    remaining: u32,
    position: u32,
}

/// Postings cursor over one segment.
#[derive(Debug)]
pub struct SegmentTermDocs {
    frq: StructReader<Box<dyn StorageInput>>,
    prox: Option<ProxState>,
    deleted: Option<Arc<BitSet>>,
    skip_interval: u32,
    info: TermInfo,
    count: u32,
    doc: u32,
    freq: u32,
    skips: Option<Vec<SkipEntry>>,
}

impl SegmentTermDocs {
    /// Cursor over `.frq` of `segment`; `deleted` documents are skipped.
    pub fn new(
        frq: StructReader<Box<dyn StorageInput>>,
        deleted: Option<Arc<BitSet>>,
        skip_interval: u32,
    ) -> Self {
        SegmentTermDocs {
            frq,
            prox: None,
            deleted,
            skip_interval,
            info: TermInfo::default(),
            count: 0,
            doc: 0,
            freq: 0,
            skips: None,
        }
    }

    /// Position the cursor on the postings of `info`, or on nothing.
    pub fn seek(&mut self, info: Option<&TermInfo>) -> Result<()> {
        self.info = info.copied().unwrap_or_default();
        self.count = 0;
        self.doc = 0;
        self.freq = 0;
        self.skips = None;
        if self.info.doc_freq > 0 {
            self.frq.seek(self.info.freq_pointer)?;
        }
        if let Some(prox) = self.prox.as_mut() {
            if self.info.doc_freq > 0 {
                prox.input.seek(self.info.prox_pointer)?;
            }
            prox.pending_skip = 0;
            prox.remaining = 0;
            prox.position = 0;
        }
        Ok(())
    }

    /// Number of documents of the current term, deleted ones included.
    pub fn doc_freq(&self) -> u32 {
        self.info.doc_freq
    }

    fn is_deleted(&self, doc: u32) -> bool {
        self.deleted
            .as_ref()
            .is_some_and(|bits| bits.get(doc as usize))
    }

    /// Decode the next posting, deleted or not.
    fn read_posting(&mut self) -> Result<bool> {
        if self.count >= self.info.doc_freq {
            return Ok(false);
        }
        if let Some(prox) = self.prox.as_mut() {
            prox.pending_skip += prox.remaining as u64;
            prox.remaining = 0;
        }

        let code = self.frq.read_varint()?;
        let delta = u32::try_from(code >> 1).map_err(|_| {
            LucernaError::corrupt(format!("doc delta overflow in {}", self.frq.name()))
        })?;
        self.doc = self.doc.checked_add(delta).ok_or_else(|| {
            LucernaError::corrupt(format!("doc number overflow in {}", self.frq.name()))
        })?;
        self.freq = if code & 1 == 1 {
            1
        } else {
            self.frq.read_vint()?
        };
        self.count += 1;

        if let Some(prox) = self.prox.as_mut() {
            prox.remaining = self.freq;
            prox.position = 0;
        }
        Ok(true)
    }

    fn load_skips(&mut self) -> Result<()> {
        if self.skips.is_some() {
            return Ok(());
        }
        let num_skips = self.info.doc_freq / self.skip_interval;
        let mut entries = Vec::with_capacity((num_skips as u64).min(self.frq.size()) as usize);
        if num_skips > 0 {
            let skip_start = self.info.freq_pointer + self.info.skip_offset;
            let mut input = self.frq.clone_reader()?;
            input.seek(skip_start)?;

            let mut doc = 0u32;
            let mut freq_pointer = self.info.freq_pointer;
            let mut prox_pointer = self.info.prox_pointer;
            for _ in 0..num_skips {
                doc = doc.checked_add(input.read_vint()?).ok_or_else(|| {
                    LucernaError::corrupt(format!("skip doc overflow in {}", input.name()))
                })?;
                freq_pointer += input.read_varint()?;
                prox_pointer += input.read_varint()?;
                if freq_pointer > skip_start {
                    return Err(LucernaError::corrupt(format!(
                        "skip pointer {freq_pointer} past skip data at {skip_start} in {}",
                        input.name()
                    )));
                }
                entries.push(SkipEntry {
                    doc,
                    freq_pointer,
                    prox_pointer,
                });
            }
        }
        self.skips = Some(entries);
        Ok(())
    }

    /// Jump over whole skip intervals whose documents are all below `target`.
    fn skip_forward(&mut self, target: u32) -> Result<()> {
        if self.info.doc_freq < self.skip_interval {
            return Ok(());
        }
        self.load_skips()?;
        let skips = match self.skips.as_ref() {
            Some(skips) => skips,
            None => return Ok(()),
        };

        // entry j is valid once (j + 1) * skip_interval - 1 postings are read
        let usable = skips.partition_point(|entry| entry.doc < target);
        if usable == 0 {
            return Ok(());
        }
        let j = usable - 1;
        let consumed = (j as u32 + 1) * self.skip_interval - 1;
        if consumed <= self.count {
            return Ok(());
        }

        let entry = skips[j];
        self.frq.seek(entry.freq_pointer)?;
        if let Some(prox) = self.prox.as_mut() {
            prox.input.seek(entry.prox_pointer)?;
            prox.pending_skip = 0;
            prox.remaining = 0;
            prox.position = 0;
        }
        self.doc = entry.doc;
        self.count = consumed;
        Ok(())
    }
}

impl TermDocs for SegmentTermDocs {
    fn doc(&self) -> u32 {
        self.doc
    }

    fn freq(&self) -> u32 {
        self.freq
    }

    fn next(&mut self) -> Result<bool> {
        while self.read_posting()? {
            if !self.is_deleted(self.doc) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn skip_to(&mut self, target: u32) -> Result<bool> {
        self.skip_forward(target)?;
        loop {
            if !self.next()? {
                return Ok(false);
            }
            if self.doc >= target {
                return Ok(true);
            }
        }
    }
}

/// Postings cursor that also reads positions.
#[derive(Debug)]
pub struct SegmentTermPositions {
    docs: SegmentTermDocs,
}

impl SegmentTermPositions {
    pub fn new(
        frq: StructReader<Box<dyn StorageInput>>,
        prx: StructReader<Box<dyn StorageInput>>,
        deleted: Option<Arc<BitSet>>,
        skip_interval: u32,
    ) -> Self {
        let mut docs = SegmentTermDocs::new(frq, deleted, skip_interval);
        docs.prox = Some(ProxState {
            input: prx,
            pending_skip: 0,
            remaining: 0,
            position: 0,
        });
        SegmentTermPositions { docs }
    }

    pub fn seek(&mut self, info: Option<&TermInfo>) -> Result<()> {
        self.docs.seek(info)
    }

    pub fn doc_freq(&self) -> u32 {
        self.docs.doc_freq()
    }
}

impl TermDocs for SegmentTermPositions {
    fn doc(&self) -> u32 {
        self.docs.doc()
    }

    fn freq(&self) -> u32 {
        self.docs.freq()
    }

    fn next(&mut self) -> Result<bool> {
        self.docs.next()
    }

    fn skip_to(&mut self, target: u32) -> Result<bool> {
        self.docs.skip_to(target)
    }
}

impl TermPositions for SegmentTermPositions {
    fn next_position(&mut self) -> Result<u32> {
        let prox = self
            .docs
            .prox
            .as_mut()
            .ok_or_else(|| LucernaError::state("cursor has no position stream"))?;
        if prox.remaining == 0 {
            return Err(LucernaError::state(format!(
                "no more positions for doc {}",
                self.docs.doc
            )));
        }
        while prox.pending_skip > 0 {
            prox.input.read_varint()?;
            prox.pending_skip -= 1;
        }
        prox.position += prox.input.read_vint()?;
        prox.remaining -= 1;
        Ok(prox.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    struct Fixture {
        storage: MemoryStorage,
        infos: Vec<TermInfo>,
    }

    /// Writes terms whose postings are given as (doc, positions).
    fn write(terms: &[Vec<(u32, Vec<u32>)>], skip_interval: u32) -> Fixture {
        let storage = MemoryStorage::default();
        let mut writer = PostingsWriter::new(&storage, "_0", skip_interval).unwrap();
        let mut infos = Vec::new();
        for postings in terms {
            writer.start_term();
            for (doc, positions) in postings {
                writer.add_posting(*doc, positions).unwrap();
            }
            infos.push(writer.finish_term().unwrap());
        }
        writer.close().unwrap();
        Fixture { storage, infos }
    }

    fn docs(fixture: &Fixture, deleted: Option<Arc<BitSet>>, skip_interval: u32) -> SegmentTermDocs {
        let frq = StructReader::open(&fixture.storage, "_0.frq").unwrap();
        SegmentTermDocs::new(frq, deleted, skip_interval)
    }

    fn positions(fixture: &Fixture, skip_interval: u32) -> SegmentTermPositions {
        let frq = StructReader::open(&fixture.storage, "_0.frq").unwrap();
        let prx = StructReader::open(&fixture.storage, "_0.prx").unwrap();
        SegmentTermPositions::new(frq, prx, None, skip_interval)
    }

    fn long_postings(count: u32) -> Vec<(u32, Vec<u32>)> {
        (0..count)
            .map(|i| {
                let doc = i * 3 + (i % 2);
                let positions = (0..(i % 3 + 1)).map(|p| p * 2 + i % 5).collect();
                (doc, positions)
            })
            .collect()
    }

    #[test]
    fn test_doc_codes_and_freqs() {
        let fixture = write(&[vec![(0, vec![0]), (5, vec![1, 4, 9]), (6, vec![2])]], 16);
        assert_eq!(fixture.infos[0].doc_freq, 3);
        assert_eq!(fixture.infos[0].skip_offset, 0);

        let mut cursor = docs(&fixture, None, 16);
        cursor.seek(Some(&fixture.infos[0])).unwrap();
        let mut seen = Vec::new();
        while cursor.next().unwrap() {
            seen.push((cursor.doc(), cursor.freq()));
        }
        assert_eq!(seen, vec![(0, 1), (5, 3), (6, 1)]);
        assert!(!cursor.next().unwrap());
    }

    #[test]
    fn test_skip_entry_count_and_offset() {
        let fixture = write(&[long_postings(8), long_postings(3)], 4);
        let info = fixture.infos[0];
        assert!(info.skip_offset > 0);
        assert_eq!(fixture.infos[1].skip_offset, 0);
        assert!(fixture.infos[1].freq_pointer > info.freq_pointer + info.skip_offset);

        let mut cursor = docs(&fixture, None, 4);
        cursor.seek(Some(&info)).unwrap();
        cursor.load_skips().unwrap();
        let skips = cursor.skips.clone().unwrap();
        assert_eq!(skips.len(), 2);
        // entry j holds the doc of posting (j + 1) * 4 - 1
        let postings = long_postings(8);
        assert_eq!(skips[0].doc, postings[2].0);
        assert_eq!(skips[1].doc, postings[6].0);
    }

    #[test]
    fn test_skip_to_matches_next() {
        let postings = long_postings(500);
        let fixture = write(&[postings.clone()], 8);

        for target_step in [1u32, 7, 50, 333] {
            let mut skipping = docs(&fixture, None, 8);
            skipping.seek(Some(&fixture.infos[0])).unwrap();
            let mut target = 0;
            while skipping.skip_to(target).unwrap() {
                let expected = postings.iter().find(|(doc, _)| *doc >= target).unwrap();
                assert_eq!(skipping.doc(), expected.0);
                assert_eq!(skipping.freq(), expected.1.len() as u32);
                target = skipping.doc() + target_step;
            }
            assert!(postings.iter().all(|(doc, _)| *doc < target));
        }
    }

    #[test]
    fn test_deleted_docs_are_skipped() {
        let postings = long_postings(40);
        let fixture = write(&[postings.clone()], 4);
        let mut deleted = BitSet::new(200);
        for (doc, _) in postings.iter().step_by(3) {
            deleted.set(*doc as usize);
        }
        let deleted = Arc::new(deleted);

        let mut cursor = docs(&fixture, Some(Arc::clone(&deleted)), 4);
        cursor.seek(Some(&fixture.infos[0])).unwrap();
        let mut seen = Vec::new();
        while cursor.next().unwrap() {
            seen.push(cursor.doc());
        }
        let expected: Vec<u32> = postings
            .iter()
            .map(|(doc, _)| *doc)
            .filter(|doc| !deleted.get(*doc as usize))
            .collect();
        assert_eq!(seen, expected);

        let mut cursor = docs(&fixture, Some(Arc::clone(&deleted)), 4);
        cursor.seek(Some(&fixture.infos[0])).unwrap();
        assert!(cursor.skip_to(postings[9].0).unwrap());
        assert_eq!(cursor.doc(), postings[10].0);
    }

    #[test]
    fn test_positions_after_skipping() {
        let postings = long_postings(100);
        let fixture = write(&[long_postings(5), postings.clone()], 4);

        let mut cursor = positions(&fixture, 4);
        cursor.seek(Some(&fixture.infos[1])).unwrap();

        // read some positions, leave some unread, then skip ahead
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.next_position().unwrap(), postings[0].1[0]);
        assert!(cursor.next().unwrap());
        assert!(cursor.skip_to(postings[37].0).unwrap());
        let mut read = Vec::new();
        for _ in 0..cursor.freq() {
            read.push(cursor.next_position().unwrap());
        }
        assert_eq!(read, postings[37].1);
        assert!(cursor.next_position().is_err());

        assert!(cursor.next().unwrap());
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.doc(), postings[39].0);
        assert_eq!(cursor.next_position().unwrap(), postings[39].1[0]);
    }

    #[test]
    fn test_read_batch_and_missing_term() {
        let postings = long_postings(10);
        let fixture = write(&[postings.clone()], 4);
        let mut cursor = docs(&fixture, None, 4);
        cursor.seek(Some(&fixture.infos[0])).unwrap();

        let mut doc_buf = [0u32; 4];
        let mut freq_buf = [0u32; 4];
        assert_eq!(cursor.read(&mut doc_buf, &mut freq_buf).unwrap(), 4);
        assert_eq!(doc_buf[3], postings[3].0);
        assert_eq!(cursor.read(&mut doc_buf, &mut freq_buf).unwrap(), 4);
        assert_eq!(cursor.read(&mut doc_buf, &mut freq_buf).unwrap(), 2);
        assert_eq!(cursor.read(&mut doc_buf, &mut freq_buf).unwrap(), 0);

        cursor.seek(None).unwrap();
        assert!(!cursor.next().unwrap());
        assert!(!cursor.skip_to(0).unwrap());
    }

    #[test]
    fn test_writer_rejects_unordered_docs() {
        let storage = MemoryStorage::default();
        let mut writer = PostingsWriter::new(&storage, "_0", 4).unwrap();
        writer.start_term();
        writer.add_posting(3, &[0]).unwrap();
        assert!(writer.add_posting(3, &[0]).is_err());
        assert!(writer.add_posting(1, &[0]).is_err());
        assert!(writer.add_posting(4, &[5, 2]).is_err());
    }
}

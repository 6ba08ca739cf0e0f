//! Two-level term dictionary.
//!
//! `S.tis` holds every term of the segment sorted by `(field_num, text)`,
//! prefix-coded against the previous term, together with its [`TermInfo`].
//! `S.tii` holds every `index_interval`-th entry of `S.tis` plus the `.tis`
//! pointer just past that entry. The reader keeps `.tii` in memory and
//! answers a lookup with a binary search over the samples followed by a
//! linear scan of at most `index_interval - 1` entries of `.tis`.
//!
//! Both files share one layout:
//!
//! ```text
//! u32 format | u64 term_count | u32 index_interval | u32 skip_interval
//! per term:
//!   vint prefix_len | vint suffix_len | suffix bytes | vint field_num
//!   vint doc_freq | vint freq_pointer_delta | vint prox_pointer_delta
//!   [vint skip_offset]           when doc_freq >= skip_interval
//!   [vint tis_pointer_delta]     .tii only
//! ```

use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{LucernaError, Result};
use crate::storage::structured::{StructReader, StructWriter};
use crate::storage::{Storage, StorageInput, StorageOutput};

pub const TERM_DICTIONARY_FORMAT: u32 = 1;
const HEADER_LENGTH: u64 = 4 + 8 + 4 + 4;
const TERM_COUNT_OFFSET: u64 = 4;

/// A term at the API boundary: field name plus text.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term {
    pub field: String,
    pub text: String,
}

impl Term {
    pub fn new<F: Into<String>, T: Into<String>>(field: F, text: T) -> Self {
        Term {
            field: field.into(),
            text: text.into(),
        }
    }
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.field, self.text)
    }
}

/// Dictionary payload of one term.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TermInfo {
    pub doc_freq: u32,
    pub freq_pointer: u64,
    pub prox_pointer: u64,
    /// Offset of the skip data from `freq_pointer`; 0 when there is none.
    pub skip_offset: u64,
}

/// Compare dictionary keys the way the files are sorted.
pub fn compare_keys(a_field: u32, a_text: &str, b_field: u32, b_text: &str) -> Ordering {
    a_field
        .cmp(&b_field)
        .then_with(|| a_text.as_bytes().cmp(b_text.as_bytes()))
}

fn shared_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Name of a segment's dictionary files.
pub fn tis_file(segment: &str) -> String {
    format!("{segment}.tis")
}

pub fn tii_file(segment: &str) -> String {
    format!("{segment}.tii")
}

/// Prefix-coding writer for one of the two files.
struct EntryWriter {
    out: StructWriter<Box<dyn StorageOutput>>,
    skip_interval: u32,
    count: u64,
    last_field: u32,
    last_term: Vec<u8>,
    last_info: TermInfo,
    last_tis_pointer: u64,
}

impl EntryWriter {
    fn create(
        storage: &dyn Storage,
        name: &str,
        index_interval: u32,
        skip_interval: u32,
    ) -> Result<Self> {
        let mut out = StructWriter::create(storage, name)?;
        out.write_u32(TERM_DICTIONARY_FORMAT)?;
        out.write_u64(0)?;
        out.write_u32(index_interval)?;
        out.write_u32(skip_interval)?;
        Ok(EntryWriter {
            out,
            skip_interval,
            count: 0,
            last_field: 0,
            last_term: Vec::new(),
            last_info: TermInfo::default(),
            last_tis_pointer: 0,
        })
    }

    fn write_entry(
        &mut self,
        field_num: u32,
        term: &[u8],
        info: &TermInfo,
        tis_pointer: Option<u64>,
    ) -> Result<()> {
        let prefix = shared_prefix(&self.last_term, term);
        self.out.write_vint(prefix as u32)?;
        self.out.write_vint((term.len() - prefix) as u32)?;
        self.out.write_raw(&term[prefix..])?;
        self.out.write_vint(field_num)?;
        self.out.write_vint(info.doc_freq)?;
        self.out
            .write_varint(info.freq_pointer - self.last_info.freq_pointer)?;
        self.out
            .write_varint(info.prox_pointer - self.last_info.prox_pointer)?;
        if info.doc_freq >= self.skip_interval {
            self.out.write_varint(info.skip_offset)?;
        }
        if let Some(pointer) = tis_pointer {
            self.out.write_varint(pointer - self.last_tis_pointer)?;
            self.last_tis_pointer = pointer;
        }

        self.last_field = field_num;
        self.last_term.clear();
        self.last_term.extend_from_slice(term);
        self.last_info = *info;
        self.count += 1;
        Ok(())
    }

    fn close(mut self) -> Result<()> {
        let end = self.out.position();
        self.out.seek(TERM_COUNT_OFFSET)?;
        self.out.write_u64(self.count)?;
        self.out.seek(end)?;
        self.out.close()
    }
}

/// Writes `S.tis` and `S.tii` from terms added in dictionary order.
pub struct TermDictionaryWriter {
    segment: String,
    tis: EntryWriter,
    tii: EntryWriter,
    index_interval: u32,
    has_last: bool,
}

impl TermDictionaryWriter {
    pub fn new(
        storage: &dyn Storage,
        segment: &str,
        index_interval: u32,
        skip_interval: u32,
    ) -> Result<Self> {
        if index_interval == 0 || skip_interval == 0 {
            return Err(LucernaError::invalid_argument(
                "index_interval and skip_interval must be positive",
            ));
        }
        Ok(TermDictionaryWriter {
            segment: segment.to_string(),
            tis: EntryWriter::create(storage, &tis_file(segment), index_interval, skip_interval)?,
            tii: EntryWriter::create(storage, &tii_file(segment), index_interval, skip_interval)?,
            index_interval,
            has_last: false,
        })
    }

    /// Append a term. Terms must arrive strictly increasing by
    /// `(field_num, term)` and postings pointers must not move backwards.
    pub fn add(&mut self, field_num: u32, term: &str, info: &TermInfo) -> Result<()> {
        if self.has_last
            && (self.tis.last_field, self.tis.last_term.as_slice()) >= (field_num, term.as_bytes())
        {
            return Err(LucernaError::corrupt(format!(
                "term out of order in {}: field {field_num} {term:?} after field {} {:?}",
                tis_file(&self.segment),
                self.tis.last_field,
                String::from_utf8_lossy(&self.tis.last_term)
            )));
        }
        if info.freq_pointer < self.tis.last_info.freq_pointer
            || info.prox_pointer < self.tis.last_info.prox_pointer
        {
            return Err(LucernaError::corrupt(format!(
                "postings pointer moved backwards at term {term:?} in {}",
                tis_file(&self.segment)
            )));
        }

        let sample = self.tis.count % self.index_interval as u64 == 0;
        self.tis.write_entry(field_num, term.as_bytes(), info, None)?;
        if sample {
            let tis_pointer = self.tis.out.position();
            self.tii
                .write_entry(field_num, term.as_bytes(), info, Some(tis_pointer))?;
        }
        self.has_last = true;
        Ok(())
    }

    /// Number of terms written so far.
    pub fn size(&self) -> u64 {
        self.tis.count
    }

    pub fn close(self) -> Result<()> {
        self.tis.close()?;
        self.tii.close()
    }
}

/// One in-memory sample of `.tii`.
#[derive(Clone, Debug)]
struct IndexSample {
    field_num: u32,
    term: String,
    info: TermInfo,
    tis_pointer: u64,
}

struct Header {
    term_count: u64,
    index_interval: u32,
    skip_interval: u32,
}

fn read_header<R: StorageInput>(reader: &mut StructReader<R>) -> Result<Header> {
    let format = reader.read_u32()?;
    if format != TERM_DICTIONARY_FORMAT {
        return Err(LucernaError::corrupt(format!(
            "unknown term dictionary format {format} in {}",
            reader.name()
        )));
    }
    let term_count = reader.read_u64()?;
    let index_interval = reader.read_u32()?;
    let skip_interval = reader.read_u32()?;
    if index_interval == 0 || skip_interval == 0 {
        return Err(LucernaError::corrupt(format!(
            "zero interval in header of {}",
            reader.name()
        )));
    }
    Ok(Header {
        term_count,
        index_interval,
        skip_interval,
    })
}

/// Reader over a segment's term dictionary.
///
/// The sample array is immutable and shared; every lookup or enumeration
/// runs on its own [`SegmentTermEnum`] cursor.
#[derive(Debug)]
pub struct TermDictionaryReader {
    tis: Mutex<StructReader<Box<dyn StorageInput>>>,
    samples: Arc<Vec<IndexSample>>,
    term_count: u64,
    index_interval: u32,
    skip_interval: u32,
}

impl TermDictionaryReader {
    pub fn open(storage: &dyn Storage, segment: &str) -> Result<Self> {
        let mut tis = StructReader::open(storage, &tis_file(segment))?;
        let header = read_header(&mut tis)?;

        let mut tii = StructReader::open(storage, &tii_file(segment))?;
        let index_header = read_header(&mut tii)?;
        if index_header.index_interval != header.index_interval
            || index_header.skip_interval != header.skip_interval
        {
            return Err(LucernaError::corrupt(format!(
                "{} and {} disagree on intervals",
                tis_file(segment),
                tii_file(segment)
            )));
        }

        let mut samples: Vec<IndexSample> =
            Vec::with_capacity(tii.capacity_for(index_header.term_count));
        let mut cursor = EntryCursor::new(header.skip_interval, true);
        for _ in 0..index_header.term_count {
            cursor.read_entry(&mut tii)?;
            if let Some(previous) = samples.last() {
                if compare_keys(previous.field_num, &previous.term, cursor.field_num, &cursor.term)
                    != Ordering::Less
                {
                    return Err(LucernaError::corrupt(format!(
                        "samples out of order in {}",
                        tii_file(segment)
                    )));
                }
            }
            samples.push(IndexSample {
                field_num: cursor.field_num,
                term: cursor.term.clone(),
                info: cursor.info,
                tis_pointer: cursor.tis_pointer,
            });
        }
        tii.close()?;

        Ok(TermDictionaryReader {
            tis: Mutex::new(tis),
            samples: Arc::new(samples),
            term_count: header.term_count,
            index_interval: header.index_interval,
            skip_interval: header.skip_interval,
        })
    }

    /// Number of terms in the segment.
    pub fn size(&self) -> u64 {
        self.term_count
    }

    pub fn index_interval(&self) -> u32 {
        self.index_interval
    }

    pub fn skip_interval(&self) -> u32 {
        self.skip_interval
    }

    /// Enumerator positioned before the first term.
    pub fn terms(&self) -> Result<SegmentTermEnum> {
        let mut input = self.tis.lock().clone_reader()?;
        input.seek(HEADER_LENGTH)?;
        Ok(SegmentTermEnum {
            input,
            cursor: EntryCursor::new(self.skip_interval, false),
            ordinal: -1,
            size: self.term_count,
        })
    }

    /// Enumerator positioned on the first term >= `(field_num, term)`.
    /// [`SegmentTermEnum::term`] is `None` when there is no such term.
    pub fn terms_from(&self, field_num: u32, term: &str) -> Result<SegmentTermEnum> {
        let mut terms = self.enum_near(field_num, term)?;
        terms.scan_to(field_num, term)?;
        Ok(terms)
    }

    /// Look up one term.
    pub fn get(&self, field_num: u32, term: &str) -> Result<Option<TermInfo>> {
        let index = match self.sample_index(field_num, term) {
            Some(index) => index,
            None => return Ok(None),
        };
        let sample = &self.samples[index];
        if sample.field_num == field_num && sample.term == term {
            return Ok(Some(sample.info));
        }

        let mut terms = self.enum_at_sample(index)?;
        terms.scan_to(field_num, term)?;
        match terms.term() {
            Some(found) if terms.field_num() == field_num && found == term => {
                Ok(terms.term_info().copied())
            }
            _ => Ok(None),
        }
    }

    /// Greatest sample <= target.
    fn sample_index(&self, field_num: u32, term: &str) -> Option<usize> {
        let upper = self.samples.partition_point(|sample| {
            compare_keys(sample.field_num, &sample.term, field_num, term) != Ordering::Greater
        });
        upper.checked_sub(1)
    }

    fn enum_near(&self, field_num: u32, term: &str) -> Result<SegmentTermEnum> {
        match self.sample_index(field_num, term) {
            Some(index) => self.enum_at_sample(index),
            None => {
                let mut terms = self.terms()?;
                terms.next()?;
                Ok(terms)
            }
        }
    }

    fn enum_at_sample(&self, index: usize) -> Result<SegmentTermEnum> {
        let sample = &self.samples[index];
        let mut input = self.tis.lock().clone_reader()?;
        input.seek(sample.tis_pointer)?;
        let mut cursor = EntryCursor::new(self.skip_interval, false);
        cursor.field_num = sample.field_num;
        cursor.term = sample.term.clone();
        cursor.info = sample.info;
        Ok(SegmentTermEnum {
            input,
            cursor,
            ordinal: index as i64 * self.index_interval as i64,
            size: self.term_count,
        })
    }
}

/// Decoding state shared by `.tis` enumeration and `.tii` loading.
#[derive(Debug)]
struct EntryCursor {
    skip_interval: u32,
    with_tis_pointer: bool,
    field_num: u32,
    term: String,
    info: TermInfo,
    tis_pointer: u64,
}

impl EntryCursor {
    fn new(skip_interval: u32, with_tis_pointer: bool) -> Self {
        EntryCursor {
            skip_interval,
            with_tis_pointer,
            field_num: 0,
            term: String::new(),
            info: TermInfo::default(),
            tis_pointer: 0,
        }
    }

    fn read_entry<R: StorageInput>(&mut self, input: &mut StructReader<R>) -> Result<()> {
        let prefix = input.read_vint()? as usize;
        let suffix = input.read_vint()? as usize;
        if prefix > self.term.len() {
            return Err(LucernaError::corrupt(format!(
                "prefix length {prefix} exceeds previous term in {} at {}",
                input.name(),
                input.position()
            )));
        }
        let mut bytes = std::mem::take(&mut self.term).into_bytes();
        bytes.truncate(prefix);
        bytes.extend_from_slice(&input.read_raw(suffix)?);
        self.term = String::from_utf8(bytes)
            .map_err(|e| LucernaError::corrupt(format!("invalid term in {}: {e}", input.name())))?;

        self.field_num = input.read_vint()?;
        self.info.doc_freq = input.read_vint()?;
        self.info.freq_pointer += input.read_varint()?;
        self.info.prox_pointer += input.read_varint()?;
        self.info.skip_offset = if self.info.doc_freq >= self.skip_interval {
            input.read_varint()?
        } else {
            0
        };
        if self.with_tis_pointer {
            self.tis_pointer += input.read_varint()?;
        }
        Ok(())
    }
}

/// Forward cursor over `.tis`, owned by the caller.
#[derive(Debug)]
pub struct SegmentTermEnum {
    input: StructReader<Box<dyn StorageInput>>,
    cursor: EntryCursor,
    ordinal: i64,
    size: u64,
}

impl SegmentTermEnum {
    /// Advance to the next term. Returns false once past the last term.
    pub fn next(&mut self) -> Result<bool> {
        if self.ordinal + 1 >= self.size as i64 {
            self.ordinal = self.size as i64;
            return Ok(false);
        }
        self.cursor.read_entry(&mut self.input)?;
        self.ordinal += 1;
        Ok(true)
    }

    fn is_positioned(&self) -> bool {
        self.ordinal >= 0 && self.ordinal < self.size as i64
    }

    /// Current term text, `None` before the first or after the last term.
    pub fn term(&self) -> Option<&str> {
        self.is_positioned().then_some(self.cursor.term.as_str())
    }

    /// Field number of the current term.
    pub fn field_num(&self) -> u32 {
        self.cursor.field_num
    }

    pub fn term_info(&self) -> Option<&TermInfo> {
        self.is_positioned().then_some(&self.cursor.info)
    }

    pub fn doc_freq(&self) -> u32 {
        if self.is_positioned() {
            self.cursor.info.doc_freq
        } else {
            0
        }
    }

    /// Ordinal of the current term within the segment.
    pub fn ordinal(&self) -> i64 {
        self.ordinal
    }

    /// Advance while the current term is below the target.
    fn scan_to(&mut self, field_num: u32, term: &str) -> Result<()> {
        loop {
            match self.term() {
                Some(current) => {
                    if compare_keys(self.cursor.field_num, current, field_num, term)
                        != Ordering::Less
                    {
                        return Ok(());
                    }
                }
                None if self.ordinal >= 0 => return Ok(()),
                None => {}
            }
            if !self.next()? {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn info(doc_freq: u32, pointer: u64) -> TermInfo {
        TermInfo {
            doc_freq,
            freq_pointer: pointer * 10,
            prox_pointer: pointer * 20,
            skip_offset: if doc_freq >= 4 { 7 } else { 0 },
        }
    }

    fn build(storage: &MemoryStorage, terms: &[(u32, String)], index_interval: u32) {
        let mut writer = TermDictionaryWriter::new(storage, "_0", index_interval, 4).unwrap();
        for (i, (field, term)) in terms.iter().enumerate() {
            writer
                .add(*field, term, &info(i as u32 % 6 + 1, i as u64))
                .unwrap();
        }
        assert_eq!(writer.size(), terms.len() as u64);
        writer.close().unwrap();
    }

    fn sample_terms() -> Vec<(u32, String)> {
        let mut terms = Vec::new();
        for field in 0..3u32 {
            for i in 0..40 {
                terms.push((field, format!("term{i:03}")));
            }
        }
        terms.push((3, "zebra".to_string()));
        terms.push((3, "zébu".to_string()));
        terms
    }

    #[test]
    fn test_get_every_term() {
        let storage = MemoryStorage::default();
        let terms = sample_terms();
        build(&storage, &terms, 16);

        let reader = TermDictionaryReader::open(&storage, "_0").unwrap();
        assert_eq!(reader.size(), terms.len() as u64);
        for (i, (field, term)) in terms.iter().enumerate() {
            let found = reader.get(*field, term).unwrap();
            assert_eq!(found, Some(info(i as u32 % 6 + 1, i as u64)), "{field} {term}");
        }
    }

    #[test]
    fn test_get_missing_terms() {
        let storage = MemoryStorage::default();
        build(&storage, &sample_terms(), 16);
        let reader = TermDictionaryReader::open(&storage, "_0").unwrap();

        assert_eq!(reader.get(0, "aaa").unwrap(), None);
        assert_eq!(reader.get(0, "term0005").unwrap(), None);
        assert_eq!(reader.get(1, "zzz").unwrap(), None);
        assert_eq!(reader.get(9, "term000").unwrap(), None);
    }

    #[test]
    fn test_enumeration_and_terms_from() {
        let storage = MemoryStorage::default();
        let terms = sample_terms();
        build(&storage, &terms, 7);
        let reader = TermDictionaryReader::open(&storage, "_0").unwrap();

        let mut all = reader.terms().unwrap();
        assert!(all.term().is_none());
        let mut seen = Vec::new();
        while all.next().unwrap() {
            seen.push((all.field_num(), all.term().unwrap().to_string()));
        }
        assert_eq!(seen, terms);
        assert!(all.term().is_none());

        let from = reader.terms_from(1, "term0105").unwrap();
        assert_eq!(from.field_num(), 1);
        assert_eq!(from.term(), Some("term011"));

        let from = reader.terms_from(0, "").unwrap();
        assert_eq!(from.term(), Some("term000"));
        assert_eq!(from.ordinal(), 0);

        let past = reader.terms_from(4, "a").unwrap();
        assert!(past.term().is_none());
    }

    #[test]
    fn test_rejects_out_of_order_terms() {
        let storage = MemoryStorage::default();
        let mut writer = TermDictionaryWriter::new(&storage, "_1", 128, 16).unwrap();
        writer.add(0, "b", &TermInfo::default()).unwrap();
        assert!(matches!(
            writer.add(0, "a", &TermInfo::default()),
            Err(LucernaError::Corrupt(_))
        ));
        assert!(matches!(
            writer.add(0, "b", &TermInfo::default()),
            Err(LucernaError::Corrupt(_))
        ));
        writer.add(1, "a", &TermInfo::default()).unwrap();
    }

    #[test]
    fn test_empty_dictionary() {
        let storage = MemoryStorage::default();
        build(&storage, &[], 4);
        let reader = TermDictionaryReader::open(&storage, "_0").unwrap();
        assert_eq!(reader.size(), 0);
        assert_eq!(reader.get(0, "x").unwrap(), None);
        assert!(!reader.terms().unwrap().next().unwrap());
        assert!(reader.terms_from(0, "x").unwrap().term().is_none());
    }
}

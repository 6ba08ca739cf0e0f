//! Per-document term vectors.
//!
//! ```text
//! S.tvx  per doc: u64 pointer into .tvd
//! S.tvd  per doc: vint field_count, per field: vint field_num, u64 pointer into .tvf
//! S.tvf  per field vector:
//!          vint term_count | u8 flags (1 = positions, 2 = offsets)
//!          per term: vint prefix_len | vint suffix_len | suffix | vint freq
//!                    [freq x vint position_delta]
//!                    [freq x (vint start_delta, vint length)]
//! ```
//!
//! Terms of a vector are sorted. Start offsets are delta-coded against the
//! previous end offset of the same term.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{LucernaError, Result};
use crate::index::field_infos::FieldInfos;
use crate::storage::structured::{StructReader, StructWriter};
use crate::storage::{Storage, StorageInput, StorageOutput};

const STORE_POSITIONS: u8 = 0x01;
const STORE_OFFSETS: u8 = 0x02;

pub fn tvx_file(segment: &str) -> String {
    format!("{segment}.tvx")
}

pub fn tvd_file(segment: &str) -> String {
    format!("{segment}.tvd")
}

pub fn tvf_file(segment: &str) -> String {
    format!("{segment}.tvf")
}

/// Character offsets of one occurrence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermVectorOffset {
    pub start: u32,
    pub end: u32,
}

/// The terms of one field of one document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermFreqVector {
    pub field: String,
    /// Sorted, unique.
    pub terms: Vec<String>,
    pub freqs: Vec<u32>,
    /// Per term, its positions; `None` when positions are not stored.
    pub positions: Option<Vec<Vec<u32>>>,
    /// Per term, its offsets; `None` when offsets are not stored.
    pub offsets: Option<Vec<Vec<TermVectorOffset>>>,
}

impl TermFreqVector {
    pub fn size(&self) -> usize {
        self.terms.len()
    }

    pub fn index_of(&self, term: &str) -> Option<usize> {
        self.terms.binary_search_by(|t| t.as_str().cmp(term)).ok()
    }

    /// Frequency of `term`, 0 when absent.
    pub fn freq_of(&self, term: &str) -> u32 {
        self.index_of(term).map(|i| self.freqs[i]).unwrap_or(0)
    }

    fn check(&self) -> Result<()> {
        let len = self.terms.len();
        let consistent = self.freqs.len() == len
            && self.positions.as_ref().is_none_or(|p| p.len() == len)
            && self.offsets.as_ref().is_none_or(|o| o.len() == len);
        if !consistent {
            return Err(LucernaError::invalid_argument(format!(
                "term vector of field {} has mismatched lengths",
                self.field
            )));
        }
        if self.terms.windows(2).any(|w| w[0] >= w[1]) {
            return Err(LucernaError::invalid_argument(format!(
                "term vector of field {} is not sorted",
                self.field
            )));
        }
        Ok(())
    }
}

/// Appends term vectors, one call per document.
#[derive(Debug)]
pub struct TermVectorsWriter {
    tvx: StructWriter<Box<dyn StorageOutput>>,
    tvd: StructWriter<Box<dyn StorageOutput>>,
    tvf: StructWriter<Box<dyn StorageOutput>>,
}

impl TermVectorsWriter {
    pub fn new(storage: &dyn Storage, segment: &str) -> Result<Self> {
        Ok(TermVectorsWriter {
            tvx: StructWriter::create(storage, &tvx_file(segment))?,
            tvd: StructWriter::create(storage, &tvd_file(segment))?,
            tvf: StructWriter::create(storage, &tvf_file(segment))?,
        })
    }

    /// Write the vectors of the next document, possibly none.
    pub fn add_document(&mut self, field_infos: &FieldInfos, vectors: &[TermFreqVector]) -> Result<()> {
        self.tvx.write_u64(self.tvd.position())?;
        self.tvd.write_vint(vectors.len() as u32)?;
        for vector in vectors {
            vector.check()?;
            let number = field_infos.field_number(&vector.field).ok_or_else(|| {
                LucernaError::invalid_argument(format!("field {} is not registered", vector.field))
            })?;
            self.tvd.write_vint(number)?;
            self.tvd.write_u64(self.tvf.position())?;
            self.write_field(vector)?;
        }
        Ok(())
    }

    fn write_field(&mut self, vector: &TermFreqVector) -> Result<()> {
        let mut flags = 0;
        if vector.positions.is_some() {
            flags |= STORE_POSITIONS;
        }
        if vector.offsets.is_some() {
            flags |= STORE_OFFSETS;
        }
        self.tvf.write_vint(vector.terms.len() as u32)?;
        self.tvf.write_u8(flags)?;

        let mut last: &[u8] = &[];
        for (i, term) in vector.terms.iter().enumerate() {
            let bytes = term.as_bytes();
            let prefix = last.iter().zip(bytes).take_while(|(a, b)| a == b).count();
            self.tvf.write_vint(prefix as u32)?;
            self.tvf.write_vint((bytes.len() - prefix) as u32)?;
            self.tvf.write_raw(&bytes[prefix..])?;
            self.tvf.write_vint(vector.freqs[i])?;
            last = bytes;

            if let Some(positions) = &vector.positions {
                let mut previous = 0;
                for &position in &positions[i] {
                    self.tvf.write_vint(position.checked_sub(previous).ok_or_else(|| {
                        LucernaError::invalid_argument(format!(
                            "positions of {term} in field {} are not ascending",
                            vector.field
                        ))
                    })?)?;
                    previous = position;
                }
            }
            if let Some(offsets) = &vector.offsets {
                let mut previous_end = 0;
                for offset in &offsets[i] {
                    if offset.start < previous_end || offset.end < offset.start {
                        return Err(LucernaError::invalid_argument(format!(
                            "offsets of {term} in field {} are not ascending",
                            vector.field
                        )));
                    }
                    self.tvf.write_vint(offset.start - previous_end)?;
                    self.tvf.write_vint(offset.end - offset.start)?;
                    previous_end = offset.end;
                }
            }
        }
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        self.tvx.close()?;
        self.tvd.close()?;
        self.tvf.close()
    }
}

#[derive(Debug)]
struct Streams {
    tvx: StructReader<Box<dyn StorageInput>>,
    tvd: StructReader<Box<dyn StorageInput>>,
    tvf: StructReader<Box<dyn StorageInput>>,
}

/// Random access to the term vectors of a segment.
#[derive(Debug)]
pub struct TermVectorsReader {
    streams: Mutex<Streams>,
    size: u32,
}

impl TermVectorsReader {
    pub fn open(storage: &dyn Storage, segment: &str) -> Result<Self> {
        let tvx = StructReader::open(storage, &tvx_file(segment))?;
        if tvx.size() % 8 != 0 {
            return Err(LucernaError::corrupt(format!(
                "{} has a partial entry",
                tvx_file(segment)
            )));
        }
        let size = (tvx.size() / 8) as u32;
        Ok(TermVectorsReader {
            streams: Mutex::new(Streams {
                tvx,
                tvd: StructReader::open(storage, &tvd_file(segment))?,
                tvf: StructReader::open(storage, &tvf_file(segment))?,
            }),
            size,
        })
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// All vectors of `doc`, in field-number order of writing.
    pub fn get(&self, field_infos: &FieldInfos, doc: u32) -> Result<Vec<TermFreqVector>> {
        self.read(field_infos, doc, None)
    }

    /// The vector of one field of `doc`.
    pub fn get_field(
        &self,
        field_infos: &FieldInfos,
        doc: u32,
        field: &str,
    ) -> Result<Option<TermFreqVector>> {
        let number = match field_infos.field_number(field) {
            Some(number) => number,
            None => return Ok(None),
        };
        Ok(self.read(field_infos, doc, Some(number))?.pop())
    }

    fn read(
        &self,
        field_infos: &FieldInfos,
        doc: u32,
        only: Option<u32>,
    ) -> Result<Vec<TermFreqVector>> {
        if doc >= self.size {
            return Err(LucernaError::invalid_argument(format!(
                "doc {doc} out of range, term vectors hold {}",
                self.size
            )));
        }
        let mut streams = self.streams.lock();
        streams.tvx.seek(doc as u64 * 8)?;
        let tvd_pointer = streams.tvx.read_u64()?;
        streams.tvd.seek(tvd_pointer)?;

        let count = streams.tvd.read_vint()?;
        let mut fields = Vec::with_capacity(streams.tvd.capacity_for(count as u64));
        for _ in 0..count {
            let number = streams.tvd.read_vint()?;
            let pointer = streams.tvd.read_u64()?;
            if only.is_none_or(|wanted| wanted == number) {
                fields.push((number, pointer));
            }
        }

        let mut vectors = Vec::with_capacity(fields.len());
        for (number, pointer) in fields {
            let name = field_infos.field_name(number)?.to_string();
            streams.tvf.seek(pointer)?;
            vectors.push(read_field(&mut streams.tvf, name)?);
        }
        Ok(vectors)
    }
}

fn overflow(file: &str) -> LucernaError {
    LucernaError::corrupt(format!("term vector position overflows in {file}"))
}

fn read_field(tvf: &mut StructReader<Box<dyn StorageInput>>, field: String) -> Result<TermFreqVector> {
    let count = tvf.read_vint()?;
    let flags = tvf.read_u8()?;
    let capacity = tvf.capacity_for(count as u64);
    let mut vector = TermFreqVector {
        field,
        terms: Vec::with_capacity(capacity),
        freqs: Vec::with_capacity(capacity),
        positions: (flags & STORE_POSITIONS != 0).then(|| Vec::with_capacity(capacity)),
        offsets: (flags & STORE_OFFSETS != 0).then(|| Vec::with_capacity(capacity)),
    };

    let mut last: Vec<u8> = Vec::new();
    for _ in 0..count {
        let prefix = tvf.read_vint()? as usize;
        let suffix_len = tvf.read_vint()? as usize;
        if prefix > last.len() {
            return Err(LucernaError::corrupt(format!(
                "term vector prefix {prefix} longer than previous term in {}",
                tvf.name()
            )));
        }
        last.truncate(prefix);
        last.extend_from_slice(&tvf.read_raw(suffix_len)?);
        let term = String::from_utf8(last.clone()).map_err(|_| {
            LucernaError::corrupt(format!("invalid utf-8 term in {}", tvf.name()))
        })?;
        let freq = tvf.read_vint()?;

        if let Some(positions) = vector.positions.as_mut() {
            let mut list = Vec::with_capacity(tvf.capacity_for(freq as u64));
            let mut position = 0u32;
            for _ in 0..freq {
                position = position
                    .checked_add(tvf.read_vint()?)
                    .ok_or_else(|| overflow(tvf.name()))?;
                list.push(position);
            }
            positions.push(list);
        }
        if let Some(offsets) = vector.offsets.as_mut() {
            let mut list = Vec::with_capacity(tvf.capacity_for(freq as u64));
            let mut previous_end = 0u32;
            for _ in 0..freq {
                let start = previous_end
                    .checked_add(tvf.read_vint()?)
                    .ok_or_else(|| overflow(tvf.name()))?;
                let end = start
                    .checked_add(tvf.read_vint()?)
                    .ok_or_else(|| overflow(tvf.name()))?;
                list.push(TermVectorOffset { start, end });
                previous_end = end;
            }
            offsets.push(list);
        }
        vector.terms.push(term);
        vector.freqs.push(freq);
    }
    Ok(vector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn infos() -> FieldInfos {
        let mut infos = FieldInfos::new();
        infos.add("title", true, true, false, false, false);
        infos.add("body", true, true, true, true, false);
        infos
    }

    fn body_vector() -> TermFreqVector {
        TermFreqVector {
            field: "body".to_string(),
            terms: vec!["cat".into(), "cats".into(), "dog".into()],
            freqs: vec![2, 1, 1],
            positions: Some(vec![vec![0, 4], vec![2], vec![3]]),
            offsets: Some(vec![
                vec![
                    TermVectorOffset { start: 0, end: 3 },
                    TermVectorOffset { start: 20, end: 23 },
                ],
                vec![TermVectorOffset { start: 9, end: 13 }],
                vec![TermVectorOffset { start: 14, end: 17 }],
            ]),
        }
    }

    fn title_vector() -> TermFreqVector {
        TermFreqVector {
            field: "title".to_string(),
            terms: vec!["hello".into(), "world".into()],
            freqs: vec![1, 1],
            positions: None,
            offsets: None,
        }
    }

    #[test]
    fn test_vectors_round_trip() {
        let storage = MemoryStorage::default();
        let infos = infos();
        let mut writer = TermVectorsWriter::new(&storage, "_0").unwrap();
        writer
            .add_document(&infos, &[title_vector(), body_vector()])
            .unwrap();
        writer.add_document(&infos, &[]).unwrap();
        writer.add_document(&infos, &[body_vector()]).unwrap();
        writer.close().unwrap();

        let reader = TermVectorsReader::open(&storage, "_0").unwrap();
        assert_eq!(reader.size(), 3);
        assert_eq!(
            reader.get(&infos, 0).unwrap(),
            vec![title_vector(), body_vector()]
        );
        assert!(reader.get(&infos, 1).unwrap().is_empty());
        assert_eq!(
            reader.get_field(&infos, 2, "body").unwrap(),
            Some(body_vector())
        );
        assert_eq!(reader.get_field(&infos, 2, "title").unwrap(), None);
        assert_eq!(reader.get_field(&infos, 2, "missing").unwrap(), None);
        assert!(reader.get(&infos, 3).is_err());
    }

    #[test]
    fn test_vector_lookup() {
        let vector = body_vector();
        assert_eq!(vector.size(), 3);
        assert_eq!(vector.index_of("cats"), Some(1));
        assert_eq!(vector.freq_of("cat"), 2);
        assert_eq!(vector.freq_of("bird"), 0);
    }

    #[test]
    fn test_unsorted_vector_is_rejected() {
        let storage = MemoryStorage::default();
        let infos = infos();
        let mut vector = title_vector();
        vector.terms.reverse();
        let mut writer = TermVectorsWriter::new(&storage, "_0").unwrap();
        assert!(matches!(
            writer.add_document(&infos, &[vector]),
            Err(LucernaError::InvalidArgument(_))
        ));
    }
}

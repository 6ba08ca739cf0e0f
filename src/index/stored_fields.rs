//! Stored field values.
//!
//! `S.fdx` holds one `u64` pointer into `S.fdt` per document. Each `.fdt`
//! record is `vint field_count` followed, per stored field, by
//! `vint field_num | u8 bits | value`, where the value is a string or a
//! length-prefixed byte blob depending on the binary bit.

use parking_lot::Mutex;

use crate::document::{Document, Field, FieldValue, Index, TermVector};
use crate::error::{LucernaError, Result};
use crate::index::field_infos::{FieldInfo, FieldInfos};
use crate::storage::structured::{StructReader, StructWriter};
use crate::storage::{Storage, StorageInput, StorageOutput};

const FIELD_IS_TOKENIZED: u8 = 0x01;
const FIELD_IS_BINARY: u8 = 0x02;

pub fn fdx_file(segment: &str) -> String {
    format!("{segment}.fdx")
}

pub fn fdt_file(segment: &str) -> String {
    format!("{segment}.fdt")
}

/// Appends stored documents to a segment.
#[derive(Debug)]
pub struct StoredFieldsWriter {
    index: StructWriter<Box<dyn StorageOutput>>,
    data: StructWriter<Box<dyn StorageOutput>>,
    doc_count: u32,
}

impl StoredFieldsWriter {
    pub fn new(storage: &dyn Storage, segment: &str) -> Result<Self> {
        Ok(StoredFieldsWriter {
            index: StructWriter::create(storage, &fdx_file(segment))?,
            data: StructWriter::create(storage, &fdt_file(segment))?,
            doc_count: 0,
        })
    }

    /// Write the stored fields of the next document.
    pub fn add_document(&mut self, field_infos: &FieldInfos, document: &Document) -> Result<()> {
        self.index.write_u64(self.data.position())?;
        let stored: Vec<&Field> = document.fields().iter().filter(|f| f.store).collect();
        self.data.write_vint(stored.len() as u32)?;
        for field in stored {
            let number = field_infos.field_number(&field.name).ok_or_else(|| {
                LucernaError::invalid_argument(format!("field {} is not registered", field.name))
            })?;
            self.data.write_vint(number)?;
            let mut bits = 0;
            if field.index == Index::Tokenized {
                bits |= FIELD_IS_TOKENIZED;
            }
            match &field.value {
                FieldValue::Text(text) => {
                    self.data.write_u8(bits)?;
                    self.data.write_string(text)?;
                }
                FieldValue::Binary(bytes) => {
                    self.data.write_u8(bits | FIELD_IS_BINARY)?;
                    self.data.write_bytes(bytes)?;
                }
            }
        }
        self.doc_count += 1;
        Ok(())
    }

    /// Append a record previously read with [`StoredFieldsReader::raw_document`].
    pub fn add_raw_document(&mut self, record: &[u8]) -> Result<()> {
        self.index.write_u64(self.data.position())?;
        self.data.write_raw(record)?;
        self.doc_count += 1;
        Ok(())
    }

    pub fn doc_count(&self) -> u32 {
        self.doc_count
    }

    pub fn close(self) -> Result<()> {
        self.index.close()?;
        self.data.close()
    }
}

/// Random access to stored documents of a segment.
#[derive(Debug)]
pub struct StoredFieldsReader {
    index: Mutex<StructReader<Box<dyn StorageInput>>>,
    data: Mutex<StructReader<Box<dyn StorageInput>>>,
    size: u32,
}

impl StoredFieldsReader {
    pub fn open(storage: &dyn Storage, segment: &str) -> Result<Self> {
        let index = StructReader::open(storage, &fdx_file(segment))?;
        if index.size() % 8 != 0 {
            return Err(LucernaError::corrupt(format!(
                "{} has a partial entry",
                fdx_file(segment)
            )));
        }
        let size = (index.size() / 8) as u32;
        Ok(StoredFieldsReader {
            index: Mutex::new(index),
            data: Mutex::new(StructReader::open(storage, &fdt_file(segment))?),
            size,
        })
    }

    /// Number of documents with a record.
    pub fn size(&self) -> u32 {
        self.size
    }

    fn bounds(&self, doc: u32) -> Result<(u64, u64)> {
        if doc >= self.size {
            return Err(LucernaError::invalid_argument(format!(
                "doc {doc} out of range, stored fields hold {}",
                self.size
            )));
        }
        let mut index = self.index.lock();
        index.seek(doc as u64 * 8)?;
        let start = index.read_u64()?;
        let end = if doc + 1 < self.size {
            index.read_u64()?
        } else {
            self.data.lock().size()
        };
        if end < start {
            return Err(LucernaError::corrupt(format!(
                "stored fields pointers of doc {doc} go backwards"
            )));
        }
        Ok((start, end))
    }

    /// Decode document `doc`.
    pub fn document(&self, field_infos: &FieldInfos, doc: u32) -> Result<Document> {
        let (start, _) = self.bounds(doc)?;
        let mut data = self.data.lock();
        data.seek(start)?;
        let count = data.read_vint()?;
        let mut document = Document::new();
        for _ in 0..count {
            let number = data.read_vint()?;
            let info = field_infos.field_info(number).ok_or_else(|| {
                LucernaError::corrupt(format!(
                    "doc {doc} references unknown field number {number} in {}",
                    data.name()
                ))
            })?;
            let bits = data.read_u8()?;
            let field = if bits & FIELD_IS_BINARY != 0 {
                Field::binary(info.name.clone(), data.read_bytes()?)
            } else {
                stored_text_field(info, bits, data.read_string()?)
            };
            document.add(field);
        }
        Ok(document)
    }

    /// The encoded record of `doc`, for copying into another segment.
    pub fn raw_document(&self, doc: u32) -> Result<Vec<u8>> {
        let (start, end) = self.bounds(doc)?;
        let mut data = self.data.lock();
        data.seek(start)?;
        data.read_raw((end - start) as usize)
    }
}

fn stored_text_field(info: &FieldInfo, bits: u8, text: String) -> Field {
    let index = if !info.is_indexed {
        Index::No
    } else if bits & FIELD_IS_TOKENIZED != 0 {
        Index::Tokenized
    } else {
        Index::Untokenized
    };
    let term_vector = match (
        info.store_term_vector,
        info.store_position_with_term_vector,
        info.store_offset_with_term_vector,
    ) {
        (false, _, _) => TermVector::No,
        (true, false, false) => TermVector::Yes,
        (true, true, false) => TermVector::WithPositions,
        (true, false, true) => TermVector::WithOffsets,
        (true, true, true) => TermVector::WithPositionsOffsets,
    };
    let mut field = Field::stored(info.name.clone(), text)
        .with_term_vector(term_vector)
        .with_omit_norms(info.omit_norms);
    field.index = index;
    field
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn documents() -> Vec<Document> {
        vec![
            Document::builder()
                .add_text("title", "first doc")
                .add_field(Field::unstored("body", "not kept"))
                .add_field(Field::binary("blob", vec![0, 1, 255]))
                .build(),
            Document::new(),
            Document::builder()
                .add_keyword("id", "c-3")
                .add_text("title", "third")
                .add_text("title", "again")
                .build(),
        ]
    }

    fn field_infos(docs: &[Document]) -> FieldInfos {
        let mut infos = FieldInfos::new();
        for doc in docs {
            for field in doc.fields() {
                infos.add_field(field);
            }
        }
        infos
    }

    #[test]
    fn test_documents_round_trip() {
        let storage = MemoryStorage::default();
        let docs = documents();
        let infos = field_infos(&docs);

        let mut writer = StoredFieldsWriter::new(&storage, "_0").unwrap();
        for doc in &docs {
            writer.add_document(&infos, doc).unwrap();
        }
        assert_eq!(writer.doc_count(), 3);
        writer.close().unwrap();

        let reader = StoredFieldsReader::open(&storage, "_0").unwrap();
        assert_eq!(reader.size(), 3);

        let first = reader.document(&infos, 0).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first.get_text("title"), Some("first doc"));
        assert_eq!(first.get("title").unwrap().index, Index::Tokenized);
        assert!(first.get("body").is_none());
        assert_eq!(
            first.get("blob").unwrap().value.as_binary(),
            Some(&[0u8, 1, 255][..])
        );

        assert!(reader.document(&infos, 1).unwrap().is_empty());

        let third = reader.document(&infos, 2).unwrap();
        assert_eq!(third.get("id").unwrap().index, Index::Untokenized);
        let titles: Vec<_> = third
            .get_all("title")
            .filter_map(|f| f.value.as_text())
            .collect();
        assert_eq!(titles, vec!["third", "again"]);

        assert!(matches!(
            reader.document(&infos, 3),
            Err(LucernaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_raw_copy_preserves_documents() {
        let storage = MemoryStorage::default();
        let docs = documents();
        let infos = field_infos(&docs);

        let mut writer = StoredFieldsWriter::new(&storage, "_0").unwrap();
        for doc in &docs {
            writer.add_document(&infos, doc).unwrap();
        }
        writer.close().unwrap();
        let source = StoredFieldsReader::open(&storage, "_0").unwrap();

        let mut copy = StoredFieldsWriter::new(&storage, "_1").unwrap();
        for doc in [2, 0] {
            copy.add_raw_document(&source.raw_document(doc).unwrap()).unwrap();
        }
        copy.close().unwrap();

        let copied = StoredFieldsReader::open(&storage, "_1").unwrap();
        assert_eq!(
            copied.document(&infos, 0).unwrap(),
            source.document(&infos, 2).unwrap()
        );
        assert_eq!(
            copied.document(&infos, 1).unwrap(),
            source.document(&infos, 0).unwrap()
        );
    }

    #[test]
    fn test_unregistered_field_is_rejected() {
        let storage = MemoryStorage::default();
        let mut writer = StoredFieldsWriter::new(&storage, "_0").unwrap();
        let doc = Document::builder().add_text("title", "x").build();
        assert!(writer.add_document(&FieldInfos::new(), &doc).is_err());
    }
}

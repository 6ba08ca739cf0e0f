//! Index-wide field name to field number table.
//!
//! Field numbers are assigned on first sight and never change, so every
//! segment of an index shares one table, stored in the segments file.
//! Flags only ever widen: once a field has been indexed or has stored term
//! vectors it keeps the flag, and norms are omitted only while every instance
//! asked for it.

use ahash::AHashMap;

use crate::document::Field;
use crate::error::{LucernaError, Result};
use crate::storage::structured::{StructReader, StructWriter};
use crate::storage::{StorageInput, StorageOutput};

const IS_INDEXED: u8 = 0x01;
const STORE_TERM_VECTOR: u8 = 0x02;
const STORE_POSITIONS_WITH_TERM_VECTOR: u8 = 0x04;
const STORE_OFFSETS_WITH_TERM_VECTOR: u8 = 0x08;
const OMIT_NORMS: u8 = 0x10;

/// Per-field flags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: String,
    pub number: u32,
    pub is_indexed: bool,
    pub store_term_vector: bool,
    pub store_position_with_term_vector: bool,
    pub store_offset_with_term_vector: bool,
    pub omit_norms: bool,
}

impl FieldInfo {
    /// Whether segments keep a norm byte per document for this field.
    pub fn has_norms(&self) -> bool {
        self.is_indexed && !self.omit_norms
    }

    fn flags(&self) -> u8 {
        let mut bits = 0;
        if self.is_indexed {
            bits |= IS_INDEXED;
        }
        if self.store_term_vector {
            bits |= STORE_TERM_VECTOR;
        }
        if self.store_position_with_term_vector {
            bits |= STORE_POSITIONS_WITH_TERM_VECTOR;
        }
        if self.store_offset_with_term_vector {
            bits |= STORE_OFFSETS_WITH_TERM_VECTOR;
        }
        if self.omit_norms {
            bits |= OMIT_NORMS;
        }
        bits
    }
}

/// The field table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldInfos {
    fields: Vec<FieldInfo>,
    by_name: AHashMap<String, u32>,
}

impl FieldInfos {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `field`, widening flags of an existing entry.
    pub fn add_field(&mut self, field: &Field) -> u32 {
        let indexed = field.index.is_indexed();
        self.add(
            &field.name,
            indexed,
            field.term_vector.is_stored(),
            field.term_vector.with_positions(),
            field.term_vector.with_offsets(),
            !indexed || field.omit_norms,
        )
    }

    /// Register a field by its flags and return its number.
    pub fn add(
        &mut self,
        name: &str,
        is_indexed: bool,
        store_term_vector: bool,
        store_position_with_term_vector: bool,
        store_offset_with_term_vector: bool,
        omit_norms: bool,
    ) -> u32 {
        if let Some(&number) = self.by_name.get(name) {
            let info = &mut self.fields[number as usize];
            if is_indexed && !info.is_indexed {
                // a field first seen unindexed never had norms to omit
                info.omit_norms = omit_norms;
            } else if is_indexed {
                info.omit_norms &= omit_norms;
            }
            info.is_indexed |= is_indexed;
            info.store_term_vector |= store_term_vector;
            info.store_position_with_term_vector |= store_position_with_term_vector;
            info.store_offset_with_term_vector |= store_offset_with_term_vector;
            return number;
        }

        let number = self.fields.len() as u32;
        self.fields.push(FieldInfo {
            name: name.to_string(),
            number,
            is_indexed,
            store_term_vector,
            store_position_with_term_vector,
            store_offset_with_term_vector,
            omit_norms,
        });
        self.by_name.insert(name.to_string(), number);
        number
    }

    pub fn field_number(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    pub fn field_info(&self, number: u32) -> Option<&FieldInfo> {
        self.fields.get(number as usize)
    }

    pub fn by_name(&self, name: &str) -> Option<&FieldInfo> {
        self.field_number(name).and_then(|n| self.field_info(n))
    }

    /// Name of field `number`, or an error naming the bad number.
    pub fn field_name(&self, number: u32) -> Result<&str> {
        self.field_info(number)
            .map(|info| info.name.as_str())
            .ok_or_else(|| LucernaError::corrupt(format!("unknown field number {number}")))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldInfo> {
        self.fields.iter()
    }

    /// Whether any field stores term vectors.
    pub fn has_vectors(&self) -> bool {
        self.fields.iter().any(|f| f.store_term_vector)
    }

    pub fn write_to<W: StorageOutput>(&self, writer: &mut StructWriter<W>) -> Result<()> {
        writer.write_vint(self.fields.len() as u32)?;
        for info in &self.fields {
            writer.write_string(&info.name)?;
            writer.write_u8(info.flags())?;
        }
        Ok(())
    }

    pub fn read_from<R: StorageInput>(reader: &mut StructReader<R>) -> Result<FieldInfos> {
        let count = reader.read_vint()?;
        let mut infos = FieldInfos::new();
        for _ in 0..count {
            let name = reader.read_string()?;
            let bits = reader.read_u8()?;
            if infos.by_name.contains_key(&name) {
                return Err(LucernaError::corrupt(format!(
                    "duplicate field {name} in {}",
                    reader.name()
                )));
            }
            infos.add(
                &name,
                bits & IS_INDEXED != 0,
                bits & STORE_TERM_VECTOR != 0,
                bits & STORE_POSITIONS_WITH_TERM_VECTOR != 0,
                bits & STORE_OFFSETS_WITH_TERM_VECTOR != 0,
                bits & OMIT_NORMS != 0,
            );
        }
        Ok(infos)
    }
}

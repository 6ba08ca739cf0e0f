//! Field definition and per-field indexing flags.

use serde::{Deserialize, Serialize};

use crate::error::{LucernaError, Result};

/// How a field value is indexed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Index {
    /// Not searchable.
    No,
    /// Run through the analyzer.
    Tokenized,
    /// Indexed as a single term.
    Untokenized,
}

impl Index {
    pub fn is_indexed(self) -> bool {
        self != Index::No
    }
}

/// Which per-document term vector data is kept for a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TermVector {
    No,
    Yes,
    WithPositions,
    WithOffsets,
    WithPositionsOffsets,
}

impl TermVector {
    pub fn is_stored(self) -> bool {
        self != TermVector::No
    }

    pub fn with_positions(self) -> bool {
        matches!(
            self,
            TermVector::WithPositions | TermVector::WithPositionsOffsets
        )
    }

    pub fn with_offsets(self) -> bool {
        matches!(
            self,
            TermVector::WithOffsets | TermVector::WithPositionsOffsets
        )
    }
}

/// Value held by a field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Binary(Vec<u8>),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(text) => Some(text),
            FieldValue::Binary(_) => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Binary(bytes) => Some(bytes),
            FieldValue::Text(_) => None,
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, FieldValue::Binary(_))
    }
}

/// A named value plus the flags controlling how it is stored and indexed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub value: FieldValue,
    /// Keep the original value in the stored fields files.
    pub store: bool,
    pub index: Index,
    pub term_vector: TermVector,
    /// Skip the one-byte length norm for this field.
    pub omit_norms: bool,
    /// Multiplied into the norm.
    pub boost: f32,
}

impl Field {
    fn new<S: Into<String>>(name: S, value: FieldValue, store: bool, index: Index) -> Self {
        Field {
            name: name.into(),
            value,
            store,
            index,
            term_vector: TermVector::No,
            omit_norms: false,
            boost: 1.0,
        }
    }

    /// Stored and tokenized.
    pub fn text<S: Into<String>, T: Into<String>>(name: S, value: T) -> Self {
        Self::new(name, FieldValue::Text(value.into()), true, Index::Tokenized)
    }

    /// Stored and indexed as one term.
    pub fn keyword<S: Into<String>, T: Into<String>>(name: S, value: T) -> Self {
        Self::new(name, FieldValue::Text(value.into()), true, Index::Untokenized)
    }

    /// Tokenized but not stored.
    pub fn unstored<S: Into<String>, T: Into<String>>(name: S, value: T) -> Self {
        Self::new(name, FieldValue::Text(value.into()), false, Index::Tokenized)
    }

    /// Stored only.
    pub fn stored<S: Into<String>, T: Into<String>>(name: S, value: T) -> Self {
        Self::new(name, FieldValue::Text(value.into()), true, Index::No)
    }

    /// Stored binary value. Binary values are never indexed.
    pub fn binary<S: Into<String>>(name: S, value: Vec<u8>) -> Self {
        Self::new(name, FieldValue::Binary(value), true, Index::No)
    }

    pub fn with_term_vector(mut self, term_vector: TermVector) -> Self {
        self.term_vector = term_vector;
        self
    }

    pub fn with_omit_norms(mut self, omit_norms: bool) -> Self {
        self.omit_norms = omit_norms;
        self
    }

    pub fn with_boost(mut self, boost: f32) -> Self {
        self.boost = boost;
        self
    }

    pub fn with_store(mut self, store: bool) -> Self {
        self.store = store;
        self
    }

    /// Reject flag combinations that cannot be indexed.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(LucernaError::invalid_argument("field name must not be empty"));
        }
        if !self.store && !self.index.is_indexed() {
            return Err(LucernaError::invalid_argument(format!(
                "field {} is neither stored nor indexed",
                self.name
            )));
        }
        if self.value.is_binary() && self.index.is_indexed() {
            return Err(LucernaError::invalid_argument(format!(
                "binary field {} cannot be indexed",
                self.name
            )));
        }
        if self.term_vector.is_stored() && !self.index.is_indexed() {
            return Err(LucernaError::invalid_argument(format!(
                "field {} stores term vectors but is not indexed",
                self.name
            )));
        }
        if !self.boost.is_finite() || self.boost < 0.0 {
            return Err(LucernaError::invalid_argument(format!(
                "field {} has invalid boost {}",
                self.name, self.boost
            )));
        }
        Ok(())
    }
}

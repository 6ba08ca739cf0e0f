//! Document model.
//!
//! A [`Document`] is an ordered list of named fields. Field names may repeat;
//! repeated instances of an indexed field are inverted as one continuous
//! value.

pub mod field;

use serde::{Deserialize, Serialize};

pub use field::{Field, FieldValue, Index, TermVector};

/// A document represents a single item to be indexed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    fields: Vec<Field>,
}

impl Document {
    /// Create a new empty document.
    pub fn new() -> Self {
        Document { fields: Vec::new() }
    }

    /// Append a field.
    pub fn add(&mut self, field: Field) {
        self.fields.push(field);
    }

    /// First field called `name`.
    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Every field called `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Field> + 'a {
        self.fields.iter().filter(move |f| f.name == name)
    }

    /// Text of the first field called `name`, if it holds text.
    pub fn get_text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|f| f.value.as_text())
    }

    /// Remove every field called `name`.
    pub fn remove_all(&mut self, name: &str) {
        self.fields.retain(|f| f.name != name);
    }

    /// All fields in insertion order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Get the number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if the document is empty.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Create a builder for constructing documents.
    pub fn builder() -> DocumentBuilder {
        DocumentBuilder::new()
    }
}

/// A builder for constructing documents in a fluent manner.
#[derive(Debug, Default)]
pub struct DocumentBuilder {
    document: Document,
}

impl DocumentBuilder {
    /// Create a new document builder.
    pub fn new() -> Self {
        DocumentBuilder {
            document: Document::new(),
        }
    }

    /// Add a stored, tokenized text field.
    pub fn add_text<S: Into<String>, T: Into<String>>(mut self, name: S, value: T) -> Self {
        self.document.add(Field::text(name, value));
        self
    }

    /// Add a stored, untokenized field.
    pub fn add_keyword<S: Into<String>, T: Into<String>>(mut self, name: S, value: T) -> Self {
        self.document.add(Field::keyword(name, value));
        self
    }

    /// Add an arbitrary field.
    pub fn add_field(mut self, field: Field) -> Self {
        self.document.add(field);
        self
    }

    /// Build the document.
    pub fn build(self) -> Document {
        self.document
    }
}

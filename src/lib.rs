//! # Lucerna
//!
//! A segment-based inverted index storage engine for Rust.
//!
//! ## Features
//!
//! - Immutable segments with prefix-coded term dictionaries
//! - Postings with embedded skip lists
//! - Stored fields, term vectors and per-field norms
//! - Logarithmic segment merging and compound segment files
//! - Generation-based commits with copy-on-write deletions
//! - File system and in-memory storage backends
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use lucerna::prelude::*;
//!
//! # fn main() -> lucerna::error::Result<()> {
//! let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::default());
//!
//! let mut writer = IndexWriter::open(Arc::clone(&storage), IndexWriterConfig::default())?;
//! for text in ["the cat sat", "the dog ran", "cats and dogs"] {
//!     writer.add_document(&Document::builder().add_text("body", text).build())?;
//! }
//! writer.close()?;
//!
//! let reader = IndexReader::open(storage)?;
//! let mut docs = reader.term_docs_for("body", "the")?;
//! let mut matches = Vec::new();
//! while docs.next()? {
//!     matches.push(docs.doc());
//! }
//! assert_eq!(matches, vec![0, 1]);
//! # Ok(())
//! # }
//! ```

pub mod analysis;
pub mod document;
pub mod error;
pub mod index;
pub mod storage;
pub mod util;

pub mod prelude {
    pub use crate::analysis::analyzer::{Analyzer, KeywordAnalyzer, WhitespaceAnalyzer};
    pub use crate::document::{Document, Field, TermVector};
    pub use crate::error::{LucernaError, Result};
    pub use crate::index::{
        IndexReader, IndexWriter, IndexWriterConfig, Term, TermDocs, TermPositions,
    };
    pub use crate::storage::Storage;
    pub use crate::storage::file::{FileStorage, FileStorageConfig};
    pub use crate::storage::memory::MemoryStorage;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

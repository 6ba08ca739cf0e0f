//! The inverted index: segments, their codecs, and the reader and writer
//! that manage them.
//!
//! A segment is written once by a flush or a merge and never modified.
//! Deletions and norm updates go to generation-suffixed side files, and
//! the set of live segments is recorded in a `segments_<gen>` file that
//! every commit writes anew.

pub mod arena;
pub mod deleter;
pub mod field_infos;
pub mod inverter;
pub mod merge_policy;
pub mod merger;
pub mod norms;
pub mod postings;
pub mod reader;
pub mod segment_info;
pub mod segment_reader;
pub mod stored_fields;
pub mod term_dictionary;
pub mod term_vectors;
pub mod writer;

pub use field_infos::{FieldInfo, FieldInfos};
pub use merge_policy::{LogDocMergePolicy, MergePolicy};
pub use norms::{DefaultSimilarity, Similarity};
pub use postings::{TermDocs, TermPositions};
pub use reader::{IndexReader, MultiTermDocs, MultiTermEnum, MultiTermPositions};
pub use segment_info::{SegmentInfo, SegmentInfos};
pub use term_dictionary::{Term, TermInfo};
pub use term_vectors::{TermFreqVector, TermVectorOffset};
pub use writer::{IndexWriter, IndexWriterConfig};

//! Text analysis contract consumed by the inverter.
//!
//! Real tokenization pipelines live outside this crate. What is here is the
//! token contract plus two small analyzers that are enough to build and test
//! indexes: one splitting on whitespace and one emitting the whole value.

pub mod analyzer;
pub mod token;

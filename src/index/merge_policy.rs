//! When to merge segments.

use std::ops::Range;

use crate::index::segment_info::SegmentInfo;

/// Chooses segments to merge after a flush.
pub trait MergePolicy: Send + Sync + std::fmt::Debug {
    /// A run of consecutive segments to merge into one, if any. The writer
    /// keeps asking until this returns `None`.
    fn find_merge(&self, segments: &[SegmentInfo]) -> Option<Range<usize>>;
}

/// Logarithmic levels by document count.
///
/// Level 0 holds segments of at most `min_merge_docs` documents, and each
/// next level bound is `merge_factor` times the previous one. The trailing
/// run of segments at or below a level's bound is merged into one once it
/// contains `merge_factor` segments of that level. Segments above
/// `max_merge_docs` never take part in a merge.
#[derive(Clone, Debug)]
pub struct LogDocMergePolicy {
    pub min_merge_docs: u32,
    pub merge_factor: u32,
    pub max_merge_docs: u32,
}

impl LogDocMergePolicy {
    pub fn new(min_merge_docs: u32, merge_factor: u32, max_merge_docs: u32) -> Self {
        LogDocMergePolicy {
            min_merge_docs: min_merge_docs.max(1),
            merge_factor: merge_factor.max(2),
            max_merge_docs,
        }
    }
}

impl MergePolicy for LogDocMergePolicy {
    fn find_merge(&self, segments: &[SegmentInfo]) -> Option<Range<usize>> {
        let max_merge_docs = self.max_merge_docs as u64;
        let mut lower = 0u64;
        let mut bound = self.min_merge_docs as u64;
        loop {
            let limit = bound.min(max_merge_docs);
            let start = segments
                .iter()
                .rposition(|segment| segment.doc_count as u64 > limit)
                .map(|i| i + 1)
                .unwrap_or(0);
            let at_level = segments[start..]
                .iter()
                .filter(|segment| segment.doc_count as u64 > lower)
                .count();
            if at_level >= self.merge_factor as usize {
                return Some(start..segments.len());
            }
            if start == 0 || bound >= max_merge_docs {
                return None;
            }
            lower = bound;
            bound = bound.saturating_mul(self.merge_factor as u64);
        }
    }
}

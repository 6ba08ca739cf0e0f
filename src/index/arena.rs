//! Bump arena for the posting and occurrence nodes of one flush unit.
//!
//! Nodes are addressed by typed handles instead of references, so chains can
//! be extended while the table that owns their heads is borrowed mutably.
//! Nothing is freed individually: [`PostingArena::reset`] drops every node
//! at once and keeps the backing capacity for the next flush unit.

/// Handle to a [`Posting`] inside a [`PostingArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PostingId(u32);

/// Handle to an [`Occurrence`] inside a [`PostingArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OccurrenceId(u32);

/// One (term, document) pair of the current flush unit.
#[derive(Clone, Debug)]
pub struct Posting {
    pub doc_num: u32,
    pub freq: u32,
    pub first_occurrence: OccurrenceId,
    pub last_occurrence: OccurrenceId,
    pub next_posting: Option<PostingId>,
}

/// One position of a term inside a document.
#[derive(Clone, Debug)]
pub struct Occurrence {
    pub position: u32,
    pub start_offset: u32,
    pub end_offset: u32,
    pub next: Option<OccurrenceId>,
}

/// Arena owning every node of one flush unit.
#[derive(Debug, Default)]
pub struct PostingArena {
    postings: Vec<Posting>,
    occurrences: Vec<Occurrence>,
}

impl PostingArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new posting for `doc_num` with its first occurrence.
    pub fn new_posting(
        &mut self,
        doc_num: u32,
        position: u32,
        start_offset: u32,
        end_offset: u32,
    ) -> PostingId {
        let occurrence = self.push_occurrence(position, start_offset, end_offset);
        let id = PostingId(self.postings.len() as u32);
        self.postings.push(Posting {
            doc_num,
            freq: 1,
            first_occurrence: occurrence,
            last_occurrence: occurrence,
            next_posting: None,
        });
        id
    }

    /// Append an occurrence at the tail of `posting` and bump its freq.
    pub fn add_occurrence(
        &mut self,
        posting: PostingId,
        position: u32,
        start_offset: u32,
        end_offset: u32,
    ) {
        let occurrence = self.push_occurrence(position, start_offset, end_offset);
        let last = self.postings[posting.0 as usize].last_occurrence;
        self.occurrences[last.0 as usize].next = Some(occurrence);

        let node = &mut self.postings[posting.0 as usize];
        node.last_occurrence = occurrence;
        node.freq += 1;
    }

    /// Link `next` after `posting`.
    pub fn link(&mut self, posting: PostingId, next: PostingId) {
        self.postings[posting.0 as usize].next_posting = Some(next);
    }

    pub fn posting(&self, id: PostingId) -> &Posting {
        &self.postings[id.0 as usize]
    }

    pub fn occurrence(&self, id: OccurrenceId) -> &Occurrence {
        &self.occurrences[id.0 as usize]
    }

    /// Walk the posting chain starting at `first`.
    pub fn postings_from(&self, first: PostingId) -> PostingIter<'_> {
        PostingIter {
            arena: self,
            next: Some(first),
        }
    }

    /// Walk the occurrences of `posting`.
    pub fn occurrences_of(&self, posting: &Posting) -> OccurrenceIter<'_> {
        OccurrenceIter {
            arena: self,
            next: Some(posting.first_occurrence),
        }
    }

    pub fn posting_count(&self) -> usize {
        self.postings.len()
    }

    pub fn occurrence_count(&self) -> usize {
        self.occurrences.len()
    }

    /// Approximate bytes held by live nodes.
    pub fn memory_usage(&self) -> usize {
        self.postings.len() * std::mem::size_of::<Posting>()
            + self.occurrences.len() * std::mem::size_of::<Occurrence>()
    }

    /// Drop every node. Capacity is kept.
    pub fn reset(&mut self) {
        self.postings.clear();
        self.occurrences.clear();
    }

    fn push_occurrence(&mut self, position: u32, start_offset: u32, end_offset: u32) -> OccurrenceId {
        let id = OccurrenceId(self.occurrences.len() as u32);
        self.occurrences.push(Occurrence {
            position,
            start_offset,
            end_offset,
            next: None,
        });
        id
    }
}

/// Iterator over a posting chain.
#[derive(Debug)]
pub struct PostingIter<'a> {
    arena: &'a PostingArena,
    next: Option<PostingId>,
}

impl<'a> Iterator for PostingIter<'a> {
    type Item = &'a Posting;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        let posting = self.arena.posting(id);
        self.next = posting.next_posting;
        Some(posting)
    }
}

/// Iterator over the occurrences of one posting.
#[derive(Clone, Debug)]
pub struct OccurrenceIter<'a> {
    arena: &'a PostingArena,
    next: Option<OccurrenceId>,
}

impl<'a> Iterator for OccurrenceIter<'a> {
    type Item = &'a Occurrence;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        let occurrence = self.arena.occurrence(id);
        self.next = occurrence.next;
        Some(occurrence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chains() {
        let mut arena = PostingArena::new();
        let first = arena.new_posting(0, 0, 0, 3);
        arena.add_occurrence(first, 4, 10, 13);
        let second = arena.new_posting(2, 1, 4, 7);
        arena.link(first, second);

        let docs: Vec<(u32, u32)> = arena
            .postings_from(first)
            .map(|p| (p.doc_num, p.freq))
            .collect();
        assert_eq!(docs, vec![(0, 2), (2, 1)]);

        let positions: Vec<u32> = arena
            .occurrences_of(arena.posting(first))
            .map(|o| o.position)
            .collect();
        assert_eq!(positions, vec![0, 4]);
    }

    #[test]
    fn test_reset_keeps_capacity() {
        let mut arena = PostingArena::new();
        for doc in 0..100 {
            let p = arena.new_posting(doc, 0, 0, 0);
            arena.add_occurrence(p, 1, 0, 0);
        }
        assert_eq!(arena.posting_count(), 100);
        assert_eq!(arena.occurrence_count(), 200);
        assert!(arena.memory_usage() > 0);

        arena.reset();
        assert_eq!(arena.posting_count(), 0);
        assert_eq!(arena.occurrence_count(), 0);
        assert!(arena.postings.capacity() >= 100);
    }
}

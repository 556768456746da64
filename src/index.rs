//! Inverted index: `predicate_id → bitmap of combination_ids`.
//!
//! Postings are compressed roaring bitmaps, so union/intersection/and-not
//! over large combination sets stay cheap regardless of density. The index
//! is built once by the compiler and read-only afterwards.

use roaring::RoaringBitmap;

/// Read-only after build. One postings bitmap per predicate id.
#[derive(Debug, Clone, Default)]
pub struct InvertedIndex {
    postings: Vec<RoaringBitmap>,
}

impl InvertedIndex {
    /// Create an index covering `num_predicates` predicate ids.
    pub fn with_predicates(num_predicates: usize) -> Self {
        InvertedIndex {
            postings: vec![RoaringBitmap::new(); num_predicates],
        }
    }

    /// Record that `combination` contains `predicate`.
    pub fn insert(&mut self, predicate: u32, combination: u32) {
        self.postings[predicate as usize].insert(combination);
    }

    /// Combinations containing `predicate`. Empty bitmap for unknown ids.
    pub fn postings(&self, predicate: u32) -> &RoaringBitmap {
        static EMPTY: std::sync::OnceLock<RoaringBitmap> = std::sync::OnceLock::new();
        self.postings
            .get(predicate as usize)
            .unwrap_or_else(|| EMPTY.get_or_init(RoaringBitmap::new))
    }

    pub fn num_predicates(&self) -> usize {
        self.postings.len()
    }

    /// True when no predicate has any posting.
    pub fn is_empty(&self) -> bool {
        self.postings.iter().all(RoaringBitmap::is_empty)
    }

    /// Total number of `(predicate, combination)` pairs.
    pub fn cardinality(&self) -> u64 {
        self.postings.iter().map(RoaringBitmap::len).sum()
    }
}

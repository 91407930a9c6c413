//! Blocks: fixed-size sorted runs of key-value slots.
//!
//! - 128 slots per block (2 KiB of pairs)
//! - Occupied slots are contiguous from offset 0, ascending by key
//! - Empty slots hold `INVALID`, which sorts after every real key
//! - Inserts and deletes shift the occupied tail in place

use crate::error::{Error, Result};

/// Number of slots per block
pub const BLOCK: usize = 128;

/// Key marking an empty slot
pub const INVALID: u64 = u64::MAX;

/// Offset where lookups start probing, 40% into the block
const SEARCH_SEED: usize = BLOCK * 2 / 5;

/// One key-value pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub key: u64,
    pub value: u64,
}

impl Slot {
    pub const EMPTY: Slot = Slot {
        key: INVALID,
        value: 0,
    };

    #[inline]
    pub const fn new(key: u64, value: u64) -> Self {
        Self { key, value }
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.key == INVALID
    }
}

/// Outcome of a successful block insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// New key written at this offset
    Inserted(usize),
    /// Existing key overwritten in place
    Updated { offset: usize, old: u64 },
}

/// Sorted-run operations over one block worth of slots
pub trait Block {
    /// Index of the first slot whose key is greater than `key`
    fn upper_bound(&self, key: u64) -> usize;

    /// Index of the first slot whose key is not less than `key`
    fn lower_bound(&self, key: u64) -> usize;

    /// Offset of `key`, if stored
    fn position(&self, key: u64) -> Option<usize>;

    /// Number of occupied slots
    fn occupied(&self) -> usize;

    /// Insert or overwrite `key`, shifting larger keys one slot right
    fn insert(&mut self, key: u64, value: u64) -> Result<InsertResult>;

    /// Remove `key`, shifting larger keys one slot left
    fn remove(&mut self, key: u64) -> Option<u64>;

    /// Append `slot` after the last occupied slot. The caller keeps keys ascending.
    fn push(&mut self, slot: Slot) -> bool;
}

impl Block for [Slot] {
    /// Exponential search outward from the seed offset, then binary search
    /// inside the bracketed window
    fn upper_bound(&self, key: u64) -> usize {
        debug_assert_eq!(self.len(), BLOCK);
        let m = SEARCH_SEED;
        let mut bound = 1;

        let (l, r) = if key < self[m].key {
            while bound < m && self[m - bound].key > key {
                bound *= 2;
            }
            (m - bound.min(m), m - bound / 2)
        } else {
            let size = BLOCK - m;
            while bound < size && self[m + bound].key <= key {
                bound *= 2;
            }
            (m + bound / 2, m + bound.min(size))
        };

        l + self[l..r].partition_point(|s| s.key <= key)
    }

    #[inline]
    fn lower_bound(&self, key: u64) -> usize {
        self.partition_point(|s| s.key < key)
    }

    #[inline]
    fn position(&self, key: u64) -> Option<usize> {
        let pos = self.upper_bound(key);
        (pos > 0 && self[pos - 1].key == key).then(|| pos - 1)
    }

    #[inline]
    fn occupied(&self) -> usize {
        self.partition_point(|s| !s.is_empty())
    }

    fn insert(&mut self, key: u64, value: u64) -> Result<InsertResult> {
        debug_assert_ne!(key, INVALID);
        let pos = self.lower_bound(key);

        if pos < self.len() && self[pos].key == key {
            let old = std::mem::replace(&mut self[pos].value, value);
            return Ok(InsertResult::Updated { offset: pos, old });
        }

        if pos == self.len() || !self[self.len() - 1].is_empty() {
            return Err(Error::SegmentFull);
        }

        // shift the occupied tail right by one
        let end = self.occupied();
        self.copy_within(pos..end, pos + 1);
        self[pos] = Slot::new(key, value);

        Ok(InsertResult::Inserted(pos))
    }

    fn remove(&mut self, key: u64) -> Option<u64> {
        let pos = self.position(key)?;
        let value = self[pos].value;

        let end = self.occupied();
        self.copy_within(pos + 1..end, pos);
        self[end - 1] = Slot::EMPTY;

        Some(value)
    }

    #[inline]
    fn push(&mut self, slot: Slot) -> bool {
        let end = self.occupied();
        if end == self.len() {
            return false;
        }
        debug_assert!(end == 0 || self[end - 1].key < slot.key);
        self[end] = slot;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // boxed so the `Block` methods are not shadowed by `Vec`'s own
    fn empty_block() -> Box<[Slot]> {
        vec![Slot::EMPTY; BLOCK].into_boxed_slice()
    }

    fn keys(block: &[Slot]) -> Vec<u64> {
        block[..block.occupied()].iter().map(|s| s.key).collect()
    }

    #[test]
    fn test_insert_keeps_order() {
        let mut block = empty_block();

        for key in [10, 20, 5, 15] {
            assert!(matches!(
                block.insert(key, key * 2),
                Ok(InsertResult::Inserted(_))
            ));
        }

        assert_eq!(keys(&block), vec![5, 10, 15, 20]);
        assert_eq!(block.occupied(), 4);
    }

    #[test]
    fn test_insert_offsets() {
        let mut block = empty_block();

        assert_eq!(block.insert(10, 1), Ok(InsertResult::Inserted(0)));
        assert_eq!(block.insert(30, 1), Ok(InsertResult::Inserted(1)));
        assert_eq!(block.insert(20, 1), Ok(InsertResult::Inserted(1)));
        assert_eq!(block.insert(5, 1), Ok(InsertResult::Inserted(0)));
    }

    #[test]
    fn test_insert_updates_in_place() {
        let mut block = empty_block();

        block.insert(7, 70).unwrap();
        let result = block.insert(7, 71).unwrap();

        assert_eq!(result, InsertResult::Updated { offset: 0, old: 70 });
        assert_eq!(block.occupied(), 1);
        assert_eq!(block[0].value, 71);
    }

    #[test]
    fn test_insert_full_block() {
        let mut block = empty_block();

        for i in 0..BLOCK as u64 {
            block.insert(i * 2 + 1, i).unwrap();
        }

        assert_eq!(block.occupied(), BLOCK);
        assert_eq!(block.insert(0, 0), Err(Error::SegmentFull));
        assert_eq!(block.insert(1_000_000, 0), Err(Error::SegmentFull));

        // updates still succeed on a full block
        assert!(matches!(
            block.insert(3, 99),
            Ok(InsertResult::Updated { old: 1, .. })
        ));
    }

    #[test]
    fn test_upper_bound_matches_linear() {
        let mut block = empty_block();
        for i in 0..100u64 {
            block.insert(i * 10, i).unwrap();
        }

        for key in [0, 1, 9, 10, 11, 500, 505, 990, 991, 5_000] {
            let expected = block.iter().position(|s| s.key > key).unwrap();
            assert_eq!(block.upper_bound(key), expected, "key {}", key);
        }
    }

    #[test]
    fn test_upper_bound_full_and_empty() {
        let block = empty_block();
        assert_eq!(block.upper_bound(42), 0);

        let mut full = empty_block();
        for i in 0..BLOCK as u64 {
            full.insert(i, i).unwrap();
        }
        assert_eq!(full.upper_bound(BLOCK as u64 + 10), BLOCK);
        assert_eq!(full.upper_bound(0), 1);
    }

    #[test]
    fn test_position() {
        let mut block = empty_block();
        block.insert(10, 20).unwrap();
        block.insert(15, 30).unwrap();

        assert_eq!(block.position(15), Some(1));
        assert_eq!(block.position(12), None);
        // nothing below the first slot
        assert_eq!(block.position(1), None);
    }

    #[test]
    fn test_remove_shifts_left() {
        let mut block = empty_block();
        for key in [1, 2, 3, 4] {
            block.insert(key, key * 100).unwrap();
        }

        assert_eq!(block.remove(2), Some(200));
        assert_eq!(keys(&block), vec![1, 3, 4]);
        assert!(block[3].is_empty());

        assert_eq!(block.remove(2), None);
        assert_eq!(block.remove(4), Some(400));
        assert_eq!(keys(&block), vec![1, 3]);
    }

    #[test]
    fn test_remove_from_empty_and_full() {
        let mut block = empty_block();
        assert_eq!(block.remove(5), None);

        for i in 0..BLOCK as u64 {
            block.insert(i, i).unwrap();
        }
        assert_eq!(block.remove(0), Some(0));
        assert_eq!(block.occupied(), BLOCK - 1);
        assert!(block[BLOCK - 1].is_empty());
    }

    #[test]
    fn test_push() {
        let mut block = empty_block();
        assert!(block.push(Slot::new(1, 1)));
        assert!(block.push(Slot::new(5, 5)));
        assert_eq!(keys(&block), vec![1, 5]);

        let mut full = vec![Slot::new(0, 0); BLOCK].into_boxed_slice();
        for (i, slot) in full.iter_mut().enumerate() {
            slot.key = i as u64;
        }
        assert!(!full.push(Slot::new(BLOCK as u64, 0)));
    }
}

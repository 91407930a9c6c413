//! Ordered iterators for `CdfHash`

use crate::directory::RoutingTable;
use crate::segment::SegmentId;
use crate::table::CdfHash;

/// An iterator over the entries of a `CdfHash` in ascending key order
///
/// Walks the slots of one segment, follows its sibling link to the next
/// segment of the shard and then moves on to the next shard.
pub struct Iter<'a> {
    shards: &'a [Option<RoutingTable>],
    shard: usize,

    /// Segment and flat slot index, `None` at the start of a shard
    cursor: Option<(SegmentId, usize)>,
}

impl<'a> Iter<'a> {
    pub(crate) fn new(
        shards: &'a [Option<RoutingTable>],
        shard: usize,
        cursor: Option<(SegmentId, usize)>,
    ) -> Self {
        Self {
            shards,
            shard,
            cursor,
        }
    }

    fn next_shard(&mut self) {
        self.shard += 1;
        self.cursor = None;
    }
}

impl Iterator for Iter<'_> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let table = match self.shards.get(self.shard)? {
                Some(table) => table,
                None => {
                    self.next_shard();
                    continue;
                }
            };

            let (id, index) = self.cursor.unwrap_or((table.first_segment(), 0));
            let segment = table.segment(id);
            match segment.slot(index) {
                Some(slot) => {
                    self.cursor = Some((id, index + 1));
                    if !slot.is_empty() {
                        return Some((slot.key, slot.value));
                    }
                }
                None => match segment.sibling() {
                    Some(next) => self.cursor = Some((next, 0)),
                    None => self.next_shard(),
                },
            }
        }
    }
}

impl std::iter::FusedIterator for Iter<'_> {}

/// An iterator over the keys of a `CdfHash` in ascending order
pub struct Keys<'a> {
    inner: Iter<'a>,
}

impl<'a> Keys<'a> {
    pub(crate) fn new(iter: Iter<'a>) -> Self {
        Self { inner: iter }
    }
}

impl Iterator for Keys<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(k, _)| k)
    }
}

/// An iterator over the values of a `CdfHash` in ascending key order
pub struct Values<'a> {
    inner: Iter<'a>,
}

impl<'a> Values<'a> {
    pub(crate) fn new(iter: Iter<'a>) -> Self {
        Self { inner: iter }
    }
}

impl Iterator for Values<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(_, v)| v)
    }
}

impl<'a> IntoIterator for &'a CdfHash {
    type Item = (u64, u64);
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

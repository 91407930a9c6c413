//! Routing table: an extendible-hash directory over a segment arena.
//!
//! The directory holds `2^global_depth` entries, each tagged with the local
//! depth of the segment it references. A segment at local depth `d` is
//! referenced by an aligned run of `2^(global_depth - d)` entries.

use tracing::{debug, trace};

use crate::bucket::{InsertResult, Slot};
use crate::config::Policy;
use crate::pool::Pools;
use crate::segment::{local_mask, Segment, SegmentId};

/// Depth-tagged segment reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub depth: u8,
    pub segment: SegmentId,
}

/// Counters of adaptation outcomes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdaptStats {
    pub splits: u64,
    pub doublings: u64,
    pub expansions: u64,
    pub remaps: u64,
    pub remap_failures: u64,
}

/// What the retry loop did about a full block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adaptation {
    Remapped,
    Expanded,
    Split { doubled: bool },
}

/// Shared state threaded through one adaptation cycle
pub(crate) struct AdaptCtx<'a> {
    pub pools: &'a mut Pools,
    pub policy: Policy,
    pub stats: &'a mut AdaptStats,
}

pub struct RoutingTable {
    /// Segment arena, `None` for freed handles
    segments: Vec<Option<Segment>>,

    /// Freed arena handles
    free: Vec<SegmentId>,

    /// Directory mapping key prefixes to segments
    directory: Vec<DirEntry>,

    /// `directory.len() == 2^global_depth`
    global_depth: u8,

    /// Key bits below the shard prefix
    key_bits: u32,

    /// Live keys across all segments
    len: usize,
}

impl RoutingTable {
    /// Create a table at global depth 1 with two one-block sibling segments
    pub fn new(key_bits: u32, pools: &mut Pools) -> Self {
        let mut low = Segment::new(1, pools);
        let high = Segment::new(1, pools);
        low.set_sibling(Some(SegmentId(1)));

        Self {
            segments: vec![Some(low), Some(high)],
            free: Vec::new(),
            directory: vec![
                DirEntry {
                    depth: 1,
                    segment: SegmentId(0),
                },
                DirEntry {
                    depth: 1,
                    segment: SegmentId(1),
                },
            ],
            global_depth: 1,
            key_bits,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn global_depth(&self) -> u8 {
        self.global_depth
    }

    /// Number of live segments
    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len() - self.free.len()
    }

    /// Live segments in arena order
    pub fn segments(&self) -> impl Iterator<Item = &Segment> + '_ {
        self.segments.iter().flatten()
    }

    #[inline]
    pub fn segment(&self, id: SegmentId) -> &Segment {
        self.segments[id.index()]
            .as_ref()
            .expect("directory references a freed segment")
    }

    #[inline]
    fn segment_mut(&mut self, id: SegmentId) -> &mut Segment {
        self.segments[id.index()]
            .as_mut()
            .expect("directory references a freed segment")
    }

    /// Segment holding the smallest keys of this table
    #[inline]
    pub fn first_segment(&self) -> SegmentId {
        self.directory[0].segment
    }

    /// Directory slot for a key (uses the high bits below the shard prefix)
    #[inline]
    fn slot_of(&self, key: u64) -> usize {
        let key_hash = key & local_mask(self.key_bits);
        (key_hash >> (self.key_bits - self.global_depth as u32)) as usize
    }

    /// Local key width of a segment at `depth`
    #[inline]
    fn local_bits(&self, depth: u8) -> u32 {
        self.key_bits - depth as u32
    }

    /// Resolve a key to its segment, local key width and block
    #[inline]
    fn route(&self, key: u64) -> (usize, SegmentId, u32, usize) {
        let y = self.slot_of(key);
        let DirEntry { depth, segment } = self.directory[y];
        let local_bits = self.local_bits(depth);
        let bucket = self.segment(segment).bucket_of(key, local_bits);
        (y, segment, local_bits, bucket)
    }

    pub fn get(&self, key: u64) -> Option<u64> {
        let (_, id, _, bucket) = self.route(key);
        self.segment(id).get(key, bucket)
    }

    pub fn find(&mut self, key: u64) -> Option<&mut u64> {
        let (_, id, _, bucket) = self.route(key);
        self.segment_mut(id).find(key, bucket)
    }

    pub fn delete(&mut self, key: u64) -> Option<u64> {
        let (_, id, _, bucket) = self.route(key);
        let value = self.segment_mut(id).delete(key, bucket)?;
        self.len -= 1;
        Some(value)
    }

    /// Segment and flat slot index of the first key `>= key` in its home segment
    pub fn seek(&self, key: u64) -> (SegmentId, usize) {
        let (_, id, _, bucket) = self.route(key);
        (id, self.segment(id).seek(key, bucket))
    }

    /// Insert or update a pair, adapting segments and directory until it fits.
    /// Returns the previous value.
    pub(crate) fn insert(&mut self, key: u64, value: u64, ctx: &mut AdaptCtx<'_>) -> Option<u64> {
        let mut pending = Vec::new();
        let old = self.insert_one(key, value, ctx, &mut pending);
        if old.is_none() {
            self.len += 1;
        }

        // keys a rehouse could not place go back through the retry loop
        while let Some(slot) = pending.pop() {
            let replaced = self.insert_one(slot.key, slot.value, ctx, &mut pending);
            debug_assert!(replaced.is_none());
        }

        old
    }

    /// Retry loop: every failed attempt is followed by one adaptation.
    ///
    /// Terminates because a successful remap leaves every block with a free
    /// slot, expansion is capped by the segment ceiling and each split
    /// consumes one key bit.
    fn insert_one(
        &mut self,
        key: u64,
        value: u64,
        ctx: &mut AdaptCtx<'_>,
        pending: &mut Vec<Slot>,
    ) -> Option<u64> {
        loop {
            let (y, id, _, bucket) = self.route(key);
            match self.segment_mut(id).insert(key, value, bucket) {
                Ok(InsertResult::Inserted(_)) => return None,
                Ok(InsertResult::Updated { old, .. }) => return Some(old),
                Err(_) => {
                    let outcome = self.adapt(y, key, ctx, pending);
                    trace!(key, ?outcome, "block full, adapted");
                }
            }
        }
    }

    /// Pick and apply one adaptation for the segment at directory slot `y`
    fn adapt(
        &mut self,
        y: usize,
        key: u64,
        ctx: &mut AdaptCtx<'_>,
        pending: &mut Vec<Slot>,
    ) -> Adaptation {
        let DirEntry { depth, segment: id } = self.directory[y];
        let global_depth = self.global_depth;
        let local_bits = self.local_bits(depth);
        let policy = ctx.policy;
        let max_buckets = policy.max_buckets(depth);
        let util = self.segment(id).utilization();
        let skewed = util < policy.bucket_util_threshold;

        if depth < global_depth
            && depth >= policy.remap_depth
            && skewed
            && policy.learned_cdf
            && self.try_remap(id, key, local_bits, max_buckets, true, ctx, pending)
        {
            return Adaptation::Remapped;
        }

        if depth >= global_depth && global_depth >= policy.remap_depth {
            if skewed
                && policy.learned_cdf
                && self.try_remap(id, key, local_bits, max_buckets, false, ctx, pending)
            {
                return Adaptation::Remapped;
            }

            // splitting a windowed segment keeps its keys together
            if !skewed || self.segment(id).is_windowed() {
                let segment = self.segment_mut(id);
                let from = segment.seg_num();
                if let Ok(leftovers) = segment.expand(local_bits, max_buckets, ctx.pools) {
                    debug!(depth, from, to = from * 2, "expanded segment");
                    ctx.stats.expansions += 1;
                    pending.extend(leftovers);
                    return Adaptation::Expanded;
                }
            }
        }

        let doubled = self.split(y, ctx, pending);
        Adaptation::Split { doubled }
    }

    /// Create the model if needed, refine the overflowing range and remap.
    /// With `check_ceiling` a segment already past `max_buckets` is refused.
    #[allow(clippy::too_many_arguments)]
    fn try_remap(
        &mut self,
        id: SegmentId,
        key: u64,
        local_bits: u32,
        max_buckets: usize,
        check_ceiling: bool,
        ctx: &mut AdaptCtx<'_>,
        pending: &mut Vec<Slot>,
    ) -> bool {
        let policy = ctx.policy;
        let segment = self.segment_mut(id);

        if segment.ensure_cdf(ctx.pools) {
            debug!(seg_num = segment.seg_num(), "created local cdf");
        }
        if segment.remap_available() <= 0 || (check_ceiling && segment.seg_num() > max_buckets) {
            return false;
        }

        let divided = segment.divide_ranges_if_needed(
            key,
            local_bits,
            policy.range_bits_limit,
            policy.reclaim_threshold,
            ctx.pools,
        );
        if divided > 0 {
            debug!(divided, "subdivided local cdf ranges");
        }

        let from = segment.seg_num();
        match segment.local_remap(
            key,
            local_bits,
            max_buckets,
            policy.range_bits_limit,
            policy.reclaim_threshold,
            ctx.pools,
        ) {
            Ok(leftovers) => {
                debug!(from, to = segment.seg_num(), "local remap");
                ctx.stats.remaps += 1;
                pending.extend(leftovers);
                true
            }
            Err(err) => {
                debug!(error = %err, "local remap failed");
                ctx.stats.remap_failures += 1;
                false
            }
        }
    }

    /// Store a segment in a free arena handle
    fn alloc_segment(&mut self, segment: Segment) -> SegmentId {
        match self.free.pop() {
            Some(id) => {
                self.segments[id.index()] = Some(segment);
                id
            }
            None => {
                self.segments.push(Some(segment));
                SegmentId((self.segments.len() - 1) as u32)
            }
        }
    }

    /// Replace the segment at slot `y` with its two halves and update the
    /// directory, doubling it when the segment was at global depth.
    /// Returns whether the directory doubled.
    fn split(&mut self, y: usize, ctx: &mut AdaptCtx<'_>, pending: &mut Vec<Slot>) -> bool {
        let DirEntry { depth, segment: old_id } = self.directory[y];
        let local_bits = self.local_bits(depth);

        let old = self.segments[old_id.index()]
            .take()
            .expect("directory references a freed segment");
        let old_sibling = old.sibling();
        let (mut low, mut high, leftovers) = old.split(local_bits, ctx.pools);
        let (low_keys, high_keys) = (low.num_key(), high.num_key());

        high.set_sibling(old_sibling);
        let high_id = self.alloc_segment(high);
        low.set_sibling(Some(high_id));
        let low_id = self.alloc_segment(low);
        self.free.push(old_id);

        let chunk = 1usize << (self.global_depth - depth);
        let y0 = y - y % chunk;
        if y0 > 0 {
            let prev = self.directory[y0 - 1].segment;
            self.segment_mut(prev).set_sibling(Some(low_id));
        }

        let new_depth = depth + 1;
        let low_entry = DirEntry {
            depth: new_depth,
            segment: low_id,
        };
        let high_entry = DirEntry {
            depth: new_depth,
            segment: high_id,
        };

        let doubled = if depth < self.global_depth {
            let half = chunk / 2;
            self.directory[y0..y0 + half].fill(low_entry);
            self.directory[y0 + half..y0 + chunk].fill(high_entry);
            false
        } else {
            // every entry is duplicated in place: [A, B] -> [A, A, B, B]
            let mut directory = Vec::with_capacity(self.directory.len() * 2);
            for (i, &entry) in self.directory.iter().enumerate() {
                if i == y {
                    directory.push(low_entry);
                    directory.push(high_entry);
                } else {
                    directory.push(entry);
                    directory.push(entry);
                }
            }
            self.directory = directory;
            self.global_depth += 1;
            true
        };

        ctx.stats.splits += 1;
        if doubled {
            ctx.stats.doublings += 1;
        }
        debug!(
            depth = new_depth,
            global_depth = self.global_depth,
            low_keys,
            high_keys,
            leftovers = leftovers.len(),
            doubled,
            "split segment"
        );
        pending.extend(leftovers);

        doubled
    }

    /// Bytes held by the directory, slot arrays and models
    pub fn memory_bytes(&self) -> usize {
        self.directory.len() * std::mem::size_of::<DirEntry>()
            + self.segments().map(Segment::memory_bytes).sum::<usize>()
    }

    /// Blocks across all segments
    pub fn blocks(&self) -> usize {
        self.segments().map(Segment::seg_num).sum()
    }

    /// Check directory fan-out, sibling order and segment bookkeeping
    #[cfg(test)]
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        let gd = self.global_depth;
        if self.directory.len() != 1usize << gd {
            return Err(format!("directory has {} entries at depth {}", self.directory.len(), gd));
        }

        // distinct segments in directory order
        let mut order: Vec<SegmentId> = Vec::new();
        let mut y = 0;
        while y < self.directory.len() {
            let entry = self.directory[y];
            if entry.depth > gd || entry.depth == 0 {
                return Err(format!("slot {} has depth {} at global depth {}", y, entry.depth, gd));
            }
            let chunk = 1usize << (gd - entry.depth);
            if y % chunk != 0 {
                return Err(format!("slot {} starts a misaligned run of {}", y, chunk));
            }
            if self.directory[y..y + chunk].iter().any(|e| *e != entry) {
                return Err(format!("run at slot {} references mixed segments", y));
            }

            let segment = self.segment(entry.segment);
            let local_bits = self.local_bits(entry.depth);
            if !segment.is_consistent(local_bits) {
                return Err(format!("segment at slot {} is inconsistent", y));
            }
            for slot in segment.entries() {
                let home = self.slot_of(slot.key);
                if home < y || home >= y + chunk {
                    return Err(format!("key {:#x} stored outside its slots", slot.key));
                }
            }

            order.push(entry.segment);
            y += chunk;
        }

        if order.len() != self.segment_count() {
            return Err(format!(
                "{} segments reachable, {} allocated",
                order.len(),
                self.segment_count()
            ));
        }
        for pair in order.windows(2) {
            if self.segment(pair[0]).sibling() != Some(pair[1]) {
                return Err(format!("sibling of {:?} is not {:?}", pair[0], pair[1]));
            }
        }
        if let Some(last) = order.last() {
            if self.segment(*last).sibling().is_some() {
                return Err("last segment has a sibling".to_string());
            }
        }

        let keys: usize = self.segments().map(Segment::num_key).sum();
        if keys != self.len {
            return Err(format!("segments hold {} keys, table counts {}", keys, self.len));
        }

        Ok(())
    }
}

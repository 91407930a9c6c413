//! Segment is the storage unit of a routing table.
//!
//! - `seg_num` blocks of `BLOCK` sorted slots in one pooled array
//! - Keys are routed to a block by the local CDF, or by uniform scaling
//!   while the segment has no model
//! - A model may be fitted to an aligned window of the local key domain;
//!   keys outside it clamp to the edge blocks
//! - Blocks are ordered: every key of block `b` is smaller than every key
//!   of block `b + 1`
//! - Adaptation primitives: expand, split, local remap, range subdivision

use tracing::trace;

use crate::bucket::{Block, InsertResult, Slot, BLOCK};
use crate::cdf::{normalize, uniform_bucket, LocalCdf};
use crate::error::{Error, Result};
use crate::pool::{Pooled, Pools};

/// Utilization above which a model with at least as many ranges as blocks
/// skips reclaiming and only grows
const NO_RECLAIM_UTIL: f64 = 0.1;

/// Upper bound on tuning rounds within one local remap
const MAX_REMAP_ROUNDS: usize = 64;

/// A remap never grows a segment past this many times the blocks its keys fill
const REMAP_SPARSITY: usize = 16;

/// Bits a model's window must shrink by before the model is refitted to it
const MIN_WINDOW_GAIN: u32 = 8;

/// Keys per block a fitted model aims for
const FIT_KEYS_PER_BLOCK: f64 = BLOCK as f64 / 2.0;

/// Handle of a segment in its routing table's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentId(pub(crate) u32);

impl SegmentId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Mask selecting the low `bits` bits of a key
#[inline]
pub fn local_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Aligned part of a local key domain that a model is fitted to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Zoom {
    base: u64,
    bits: u32,
}

impl Zoom {
    /// Smallest aligned window holding the local keys `lo..=hi`
    fn enclosing(lo: u64, hi: u64) -> Self {
        let bits = (u64::BITS - (lo ^ hi).leading_zeros()).max(1);
        Self {
            base: lo & !local_mask(bits),
            bits,
        }
    }
}

/// Maps keys to the coordinates a segment's model works in
#[derive(Debug, Clone, Copy)]
struct Window {
    mask: u64,
    base: u64,
    bits: u32,
}

impl Window {
    fn new(local_bits: u32, zoom: Option<Zoom>) -> Self {
        let (base, bits) = zoom.map_or((0, local_bits), |z| (z.base, z.bits));
        Self {
            mask: local_mask(local_bits),
            base,
            bits,
        }
    }

    /// Offset of `key` into the window, clamped to its edges
    #[inline]
    fn view(&self, key: u64) -> u64 {
        ((key & self.mask).saturating_sub(self.base)).min(local_mask(self.bits))
    }

    #[inline]
    fn contains(&self, key: u64) -> bool {
        let x = key & self.mask;
        x >= self.base && x - self.base <= local_mask(self.bits)
    }
}

/// Block of `key` in a segment with the given model, window and size
#[inline]
fn locate(cdf: Option<&LocalCdf>, window: Window, key: u64, seg_num: usize) -> usize {
    let x = window.view(key);
    match cdf {
        Some(cdf) => cdf.bucket(x, window.bits, seg_num),
        None => uniform_bucket(normalize(x, window.bits), seg_num),
    }
}

/// Lay ascending `entries` out over `seg_num` fresh blocks.
///
/// Returns the array, the number of entries placed and the entries whose
/// block was already full.
fn place<F>(
    entries: &[Slot],
    seg_num: usize,
    pools: &mut Pools,
    mut bucket_of: F,
) -> (Pooled<Slot>, usize, Vec<Slot>)
where
    F: FnMut(u64) -> usize,
{
    let mut slots = pools.alloc_slots(seg_num);
    let mut leftovers = Vec::new();
    let mut placed = 0;

    for entry in entries {
        let bucket = bucket_of(entry.key);
        if slots[bucket * BLOCK..(bucket + 1) * BLOCK].push(*entry) {
            placed += 1;
        } else {
            leftovers.push(*entry);
        }
    }

    (slots, placed, leftovers)
}

/// Range holding most of the given ascending keys
fn most_populous_range(entries: &[Slot], cdf: &LocalCdf, window: Window) -> usize {
    let mut best = (0, 0);
    let mut run = (usize::MAX, 0);

    for entry in entries {
        let range = cdf.range_of(window.view(entry.key), window.bits);
        if range == run.0 {
            run.1 += 1;
        } else {
            run = (range, 1);
        }
        if run.1 > best.1 {
            best = (run.0, run.1);
        }
    }

    best.0
}

/// Most populous range of the first block that `cdf` would fill completely
fn first_overflow(entries: &[Slot], cdf: &LocalCdf, window: Window, seg_num: usize) -> Option<usize> {
    let mut current = usize::MAX;
    let mut start = 0;

    for (i, entry) in entries.iter().enumerate() {
        let bucket = locate(Some(cdf), window, entry.key, seg_num);
        if bucket != current {
            current = bucket;
            start = i;
        }
        if i + 1 - start >= BLOCK {
            return Some(most_populous_range(&entries[start..=i], cdf, window));
        }
    }

    None
}

/// Shape a split child starts from
struct Half {
    seg_num: usize,
    cdf: Option<LocalCdf>,
    zoom: Option<Zoom>,
}

impl Half {
    fn empty() -> Self {
        Self::plain(1)
    }

    fn plain(seg_num: usize) -> Self {
        Self {
            seg_num,
            cdf: None,
            zoom: None,
        }
    }

    fn model(cdf: LocalCdf, seg_num: usize) -> Self {
        Self {
            seg_num,
            cdf: Some(cdf),
            zoom: None,
        }
    }

    /// Segment of this shape holding `entries`, and the entries that did not fit
    fn build(self, entries: &[Slot], local_bits: u32, pools: &mut Pools) -> (Segment, Vec<Slot>) {
        let window = Window::new(local_bits, self.zoom);
        let (slots, placed, leftovers) = place(entries, self.seg_num, pools, |k| {
            locate(self.cdf.as_ref(), window, k, self.seg_num)
        });
        (Segment::with_model(self, slots, placed), leftovers)
    }
}

#[derive(Debug)]
pub struct Segment {
    /// `seg_num * BLOCK` slots
    slots: Pooled<Slot>,

    /// Number of blocks
    seg_num: usize,

    /// Live keys
    num_key: usize,

    /// Local CDF, created on the first skewed overflow
    cdf: Option<LocalCdf>,

    /// Window the model is fitted to, the whole local domain when `None`
    zoom: Option<Zoom>,

    /// Block count implied by the model, `-1` once remapping is exhausted
    remap_available: i64,

    /// Lowest range allowed to donate blocks
    reclaim_flag: usize,

    /// Next segment in key order, not owned
    sibling: Option<SegmentId>,
}

impl Segment {
    /// Create an empty, model-free segment of `seg_num` blocks
    pub fn new(seg_num: usize, pools: &mut Pools) -> Self {
        Self {
            slots: pools.alloc_slots(seg_num),
            seg_num,
            num_key: 0,
            cdf: None,
            zoom: None,
            remap_available: seg_num as i64,
            reclaim_flag: 0,
            sibling: None,
        }
    }

    fn with_model(half: Half, slots: Pooled<Slot>, num_key: usize) -> Self {
        Self {
            slots,
            seg_num: half.seg_num,
            num_key,
            cdf: half.cdf,
            zoom: half.zoom,
            remap_available: half.seg_num as i64,
            reclaim_flag: 0,
            sibling: None,
        }
    }

    #[inline]
    pub fn seg_num(&self) -> usize {
        self.seg_num
    }

    #[inline]
    pub fn num_key(&self) -> usize {
        self.num_key
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.seg_num * BLOCK
    }

    /// Live keys over slots
    #[inline]
    pub fn utilization(&self) -> f64 {
        self.num_key as f64 / self.capacity() as f64
    }

    #[inline]
    pub fn cdf(&self) -> Option<&LocalCdf> {
        self.cdf.as_ref()
    }

    #[inline]
    pub fn remap_available(&self) -> i64 {
        self.remap_available
    }

    #[inline]
    pub fn sibling(&self) -> Option<SegmentId> {
        self.sibling
    }

    #[inline]
    pub fn set_sibling(&mut self, sibling: Option<SegmentId>) {
        self.sibling = sibling;
    }

    /// Slot at a flat index, `None` past the end
    #[inline]
    pub fn slot(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    #[inline]
    fn block(&self, bucket: usize) -> &[Slot] {
        &self.slots[bucket * BLOCK..(bucket + 1) * BLOCK]
    }

    #[inline]
    fn block_mut(&mut self, bucket: usize) -> &mut [Slot] {
        &mut self.slots[bucket * BLOCK..(bucket + 1) * BLOCK]
    }

    /// Live entries in ascending key order
    pub fn entries(&self) -> impl Iterator<Item = &Slot> + '_ {
        self.slots
            .chunks(BLOCK)
            .flat_map(|block| block[..block.occupied()].iter())
    }

    /// Routes over a window narrower than its local key domain
    #[inline]
    pub fn is_windowed(&self) -> bool {
        self.zoom.is_some()
    }

    /// Width in bits of the window the model routes over
    #[inline]
    pub fn window_bits(&self, local_bits: u32) -> u32 {
        self.window(local_bits).bits
    }

    #[inline]
    fn window(&self, local_bits: u32) -> Window {
        Window::new(local_bits, self.zoom)
    }

    /// Block `key` belongs to, given the segment's local key width
    #[inline]
    pub fn bucket_of(&self, key: u64, local_bits: u32) -> usize {
        locate(self.cdf.as_ref(), self.window(local_bits), key, self.seg_num)
    }

    pub fn get(&self, key: u64, bucket: usize) -> Option<u64> {
        let block = self.block(bucket);
        block.position(key).map(|pos| block[pos].value)
    }

    pub fn find(&mut self, key: u64, bucket: usize) -> Option<&mut u64> {
        let block = self.block_mut(bucket);
        let pos = block.position(key)?;
        Some(&mut block[pos].value)
    }

    /// Insert or update `key` in `bucket`
    pub fn insert(&mut self, key: u64, value: u64, bucket: usize) -> Result<InsertResult> {
        let result = self.block_mut(bucket).insert(key, value)?;
        if let InsertResult::Inserted(_) = result {
            self.num_key += 1;
        }
        Ok(result)
    }

    pub fn delete(&mut self, key: u64, bucket: usize) -> Option<u64> {
        let value = self.block_mut(bucket).remove(key)?;
        self.num_key -= 1;
        Some(value)
    }

    /// Flat index of the first slot in `bucket` holding a key `>= key`
    pub fn seek(&self, key: u64, bucket: usize) -> usize {
        bucket * BLOCK + self.block(bucket).lower_bound(key)
    }

    /// Create a model reproducing the current uniform mapping.
    /// Returns `false` when the segment already has one.
    pub fn ensure_cdf(&mut self, pools: &mut Pools) -> bool {
        if self.cdf.is_some() {
            return false;
        }
        self.cdf = Some(LocalCdf::new(self.seg_num, pools));
        self.remap_available = self.seg_num as i64;
        true
    }

    /// Refine the range holding `key` while its blocks are sparsely used.
    ///
    /// Each round doubles the model's range count, up to `limit` range bits.
    /// Returns the number of rounds.
    pub fn divide_ranges_if_needed(
        &mut self,
        key: u64,
        local_bits: u32,
        limit: u8,
        threshold: f64,
        pools: &mut Pools,
    ) -> usize {
        let window = self.window(local_bits);
        let limit = limit.min(window.bits.min(u8::MAX as u32) as u8);
        let x = window.view(key);
        let mut rounds = 0;

        while let Some(cdf) = self.cdf.as_ref() {
            if cdf.range_bits() >= limit {
                break;
            }
            let (first, last) = cdf.range_blocks(cdf.range_of(x, window.bits), window.bits, self.seg_num);
            if first == last {
                break;
            }
            let count: usize = (first..=last).map(|b| self.block(b).occupied()).sum();
            let util = count as f64 / ((last - first + 1) * BLOCK) as f64;
            if util >= threshold {
                break;
            }

            if let Some(cdf) = self.cdf.as_mut() {
                cdf.subdivide(pools);
            }
            self.reclaim_flag *= 2;
            rounds += 1;
        }

        rounds
    }

    /// Tune the model until no block would overflow, then rehouse every key.
    ///
    /// The model is first refitted to the window its keys occupy when they
    /// left the current one or crowd a small part of it. The range that
    /// overflowed first then gains blocks, reclaimed from sparse ranges
    /// while possible and otherwise by growing the image. When tuning fails
    /// a model fitted to the key counts is tried. The image never passes
    /// `max_buckets`, nor `REMAP_SPARSITY` times the blocks the keys fill.
    /// On failure model and window are rolled back and remapping stays
    /// disabled for this segment.
    pub fn local_remap(
        &mut self,
        key: u64,
        local_bits: u32,
        max_buckets: usize,
        range_limit: u8,
        threshold: f64,
        pools: &mut Pools,
    ) -> Result<Vec<Slot>> {
        if self.remap_available < 0 || self.cdf.is_none() {
            return Err(Error::RemapExhausted);
        }
        let seg_num = self.seg_num;
        let entries: Vec<Slot> = self.entries().copied().collect();
        let over_block: Vec<Slot> = {
            let block = self.block(self.bucket_of(key, local_bits));
            block[..block.occupied()].to_vec()
        };
        let filled = (entries.len() + 1).div_ceil(BLOCK);
        let ceiling = max_buckets.min((REMAP_SPARSITY * filled).max(seg_num));

        let previous = self.refit_window(&entries, key, local_bits, pools);
        let window = self.window(local_bits);

        let tuned = match self.tune(&entries, &over_block, window, ceiling, threshold, previous.is_some()) {
            Some(snum) => Some(snum),
            None => self.fit(&entries, window, ceiling, range_limit, pools),
        };

        let Some(snum) = tuned else {
            if let Some((zoom, cdf)) = previous {
                if let Some(fitted) = std::mem::replace(&mut self.cdf, cdf) {
                    fitted.release(pools);
                }
                self.zoom = zoom;
            }
            self.remap_available = -1;
            return Err(Error::RemapExhausted);
        };

        if let Some((_, Some(cdf))) = previous {
            cdf.release(pools);
        }
        let leftovers = self.rehouse(&entries, window, snum, pools);
        trace!(from = seg_num, to = snum, window = window.bits, "local remap committed");
        self.remap_available = snum as i64;
        Ok(leftovers)
    }

    /// Aligned window of `keys` when one of them lies outside the current
    /// window or they fill a window at least `MIN_WINDOW_GAIN` bits narrower.
    /// `Some(None)` stands for the whole local domain.
    fn refit_target<I>(&self, keys: I, local_bits: u32) -> Option<Option<Zoom>>
    where
        I: IntoIterator<Item = u64>,
    {
        let window = self.window(local_bits);
        let mask = local_mask(local_bits);
        let (lo, hi) = keys
            .into_iter()
            .map(|k| k & mask)
            .fold((u64::MAX, 0), |(lo, hi), x| (lo.min(x), hi.max(x)));
        if lo > hi {
            return None;
        }

        let fitted = Zoom::enclosing(lo, hi);
        if window.contains(lo) && window.contains(hi) && fitted.bits + MIN_WINDOW_GAIN > window.bits {
            return None;
        }
        Some((fitted.bits < local_bits).then_some(fitted))
    }

    /// Swap in a fresh model over the window `entries` and `key` occupy,
    /// when [`Segment::refit_target`] asks for one.
    ///
    /// Returns the replaced window and model.
    fn refit_window(
        &mut self,
        entries: &[Slot],
        key: u64,
        local_bits: u32,
        pools: &mut Pools,
    ) -> Option<(Option<Zoom>, Option<LocalCdf>)> {
        let keys = entries.iter().map(|e| e.key).chain(Some(key));
        let zoom = self.refit_target(keys, local_bits)?;

        trace!(?zoom, "refitting model window");
        let cdf = LocalCdf::new(self.seg_num, pools);
        Some((std::mem::replace(&mut self.zoom, zoom), self.cdf.replace(cdf)))
    }

    /// Reclaim-then-grow rounds on the current model until `entries` leave
    /// no block full. Returns the new block count, or `None` with the model
    /// rolled back.
    fn tune(
        &mut self,
        entries: &[Slot],
        over_block: &[Slot],
        window: Window,
        ceiling: usize,
        threshold: f64,
        refitted: bool,
    ) -> Option<usize> {
        let util = self.utilization();
        let seg_num = self.seg_num;
        let cdf = self.cdf.as_mut()?;
        let mut reclaim = true;
        if cdf.ranges() >= seg_num && util > NO_RECLAIM_UTIL {
            self.remap_available = 0;
            reclaim = false;
        }

        let mut counts = vec![0usize; cdf.ranges()];
        for entry in entries {
            counts[cdf.range_of(window.view(entry.key), window.bits)] += 1;
        }

        let snapshot = cdf.snapshot();
        let mut reclaim_flag = if refitted { 0 } else { self.reclaim_flag };
        let mut target = most_populous_range(over_block, cdf, window);

        for _ in 0..MAX_REMAP_ROUNDS {
            if !(self.remap_available > 0 || (self.remap_available == 0 && !reclaim)) {
                break;
            }

            let mut needed = cdf.bucket_increase(target);
            let mut available = self.remap_available;
            if reclaim {
                if !cdf.reclaim(target, &mut needed, &mut counts, &mut reclaim_flag, threshold) {
                    reclaim = false;
                    self.remap_available = cdf.implied_buckets() as i64;
                }
                available = cdf.implied_buckets() as i64;
            }
            if !reclaim {
                available = cdf
                    .grow_range(needed, target, ceiling)
                    .map_or(-1, |n| n as i64);
            }
            if available <= 0 {
                break;
            }

            let snum = available as usize;
            match first_overflow(entries, cdf, window, snum) {
                Some(range) => target = range,
                None => {
                    self.reclaim_flag = reclaim_flag;
                    return Some(snum);
                }
            }
        }

        cdf.restore(&snapshot);
        None
    }

    /// Replace the model by one fitted to the key counts, refining ranges up
    /// to `range_limit` bits until no block would be full.
    fn fit(
        &mut self,
        entries: &[Slot],
        window: Window,
        ceiling: usize,
        range_limit: u8,
        pools: &mut Pools,
    ) -> Option<usize> {
        let first = self.cdf.as_ref()?.range_bits();
        let last = range_limit.min(window.bits.min(u8::MAX as u32) as u8).max(first);

        for range_bits in first..=last {
            let keys = entries.iter().map(|e| window.view(e.key));
            let cdf = LocalCdf::fitted(keys, window.bits, range_bits, FIT_KEYS_PER_BLOCK, pools);
            let snum = cdf.implied_buckets();

            if snum <= ceiling && first_overflow(entries, &cdf, window, snum).is_none() {
                if let Some(old) = self.cdf.replace(cdf) {
                    old.release(pools);
                }
                self.reclaim_flag = 0;
                return Some(snum);
            }
            cdf.release(pools);
            if snum > ceiling {
                // finer ranges only add slivers
                break;
            }
        }

        None
    }

    /// Lay `entries` out over `seg_num` fresh blocks with the current model
    fn rehouse(&mut self, entries: &[Slot], window: Window, seg_num: usize, pools: &mut Pools) -> Vec<Slot> {
        let model = self.cdf.as_ref();
        let (slots, placed, leftovers) = place(entries, seg_num, pools, |k| locate(model, window, k, seg_num));

        let old = std::mem::replace(&mut self.slots, slots);
        pools.free_slots(old);
        self.seg_num = seg_num;
        self.num_key = placed;
        leftovers
    }

    /// Double the block count, scaling the model with it, and rehouse every key.
    ///
    /// Without a model the uniform mapping is refitted to the window the
    /// keys occupy, as a local remap does for a model.
    pub fn expand(&mut self, local_bits: u32, max_buckets: usize, pools: &mut Pools) -> Result<Vec<Slot>> {
        if self.seg_num * 2 > max_buckets {
            return Err(Error::CapacityExceeded { max: max_buckets });
        }

        let seg_num = self.seg_num * 2;
        let entries: Vec<Slot> = self.entries().copied().collect();
        match self.cdf.as_mut() {
            Some(cdf) => cdf.scale(2.0),
            None => {
                if let Some(zoom) = self.refit_target(entries.iter().map(|e| e.key), local_bits) {
                    trace!(?zoom, "refitting uniform window");
                    self.zoom = zoom;
                }
            }
        }
        let leftovers = self.rehouse(&entries, self.window(local_bits), seg_num, pools);
        self.remap_available = seg_num as i64;

        Ok(leftovers)
    }

    /// Split into the lower and upper half of the local key domain.
    ///
    /// Children inherit the model projected onto their half, or the parent's
    /// block count when there is no model. A segment routing over a window
    /// stays whole in the half holding the window, refitting the window to
    /// its keys when it has no model; the other half starts over with one
    /// block. Returns both children and any key that did not fit its
    /// child's block.
    pub fn split(mut self, local_bits: u32, pools: &mut Pools) -> (Segment, Segment, Vec<Slot>) {
        debug_assert!(local_bits > 0);
        let child_bits = local_bits - 1;
        let entries: Vec<Slot> = self.entries().copied().collect();
        let boundary = entries.partition_point(|e| (e.key >> child_bits) & 1 == 0);
        let (low_entries, high_entries) = entries.split_at(boundary);

        let (low, high) = match (self.cdf.take(), self.zoom) {
            (cdf, Some(zoom)) => {
                let upper = (zoom.base >> child_bits) & 1 == 1;
                let kept_entries = if upper { high_entries } else { low_entries };
                let mask = local_mask(child_bits);
                let zoom = match (&cdf, kept_entries.first(), kept_entries.last()) {
                    // a uniform mapping follows the keys it keeps
                    (None, Some(first), Some(last)) => Zoom::enclosing(first.key & mask, last.key & mask),
                    _ => Zoom {
                        base: zoom.base & mask,
                        bits: zoom.bits,
                    },
                };
                let kept = Half {
                    seg_num: self.seg_num,
                    cdf,
                    zoom: (zoom.bits < child_bits).then_some(zoom),
                };
                if upper {
                    (Half::empty(), kept)
                } else {
                    (kept, Half::empty())
                }
            }
            (Some(cdf), None) => {
                let [(low, low_num), (high, high_num)] = cdf.split_halves(pools);
                cdf.release(pools);
                (Half::model(low, low_num), Half::model(high, high_num))
            }
            (None, None) => (Half::plain(self.seg_num), Half::plain(self.seg_num)),
        };

        let (low, mut leftovers) = low.build(low_entries, child_bits, pools);
        let (high, high_leftovers) = high.build(high_entries, child_bits, pools);
        leftovers.extend(high_leftovers);

        self.release(pools);

        (low, high, leftovers)
    }

    /// Bytes held by slots and model
    pub fn memory_bytes(&self) -> usize {
        self.slots.len() * std::mem::size_of::<Slot>()
            + self.cdf.as_ref().map_or(0, LocalCdf::memory_bytes)
    }

    /// Return storage and model to the pools
    pub fn release(self, pools: &mut Pools) {
        pools.free_slots(self.slots);
        if let Some(cdf) = self.cdf {
            cdf.release(pools);
        }
    }

    /// Check placement, ordering and bookkeeping
    #[cfg(test)]
    pub fn is_consistent(&self, local_bits: u32) -> bool {
        let entries: Vec<&Slot> = self.entries().collect();
        let sorted = entries.windows(2).all(|w| w[0].key < w[1].key);
        let placed = self.slots.chunks(BLOCK).enumerate().all(|(b, block)| {
            block[..block.occupied()]
                .iter()
                .all(|s| self.bucket_of(s.key, local_bits) == b)
                && block[block.occupied()..].iter().all(Slot::is_empty)
        });
        let model = self.cdf.as_ref().map_or(true, LocalCdf::is_monotone);

        sorted
            && placed
            && model
            && entries.len() == self.num_key
            && self.num_key <= self.capacity()
    }
}

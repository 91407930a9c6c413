//! Piecewise-linear local CDF models.
//!
//! A model splits a segment's local key domain into `2^range_bits` equal
//! ranges. Range `i` maps the normalized key `u = x / 2^local_bits` to the
//! block position `gradient * u + intercept`. Positions are measured in
//! blocks, so `floor(position)` is the block a key belongs to and a range
//! spanning one block has gradient `2^range_bits`.
//!
//! Tuning steps move edges by whole blocks and fitted spans are multiples
//! of a 64th of a block, so gradients and intercepts stay dyadic and edges
//! are computed exactly.

use crate::bucket::BLOCK;
use crate::pool::{Pooled, Pools};

/// Range bits of a freshly created model
pub const INITIAL_RANGE_BITS: u8 = 1;

/// Granularity of a fitted range's span, in blocks
const FIT_QUANTUM: f64 = 1.0 / 64.0;

/// One affine piece of a model
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Line {
    pub gradient: f64,
    pub intercept: f64,
}

impl Line {
    #[inline]
    pub fn at(&self, u: f64) -> f64 {
        self.gradient * u + self.intercept
    }
}

/// Position of a local key within its `2^local_bits` domain, in `[0, 1)`
#[inline]
pub fn normalize(x: u64, local_bits: u32) -> f64 {
    x as f64 / (local_bits as f64).exp2()
}

/// Block for normalized key `u` in a model-free segment of `seg_num` blocks
#[inline]
pub fn uniform_bucket(u: f64, seg_num: usize) -> usize {
    ((seg_num as f64 * u).floor() as usize).min(seg_num - 1)
}

/// Local CDF of one segment
#[derive(Debug)]
pub struct LocalCdf {
    range_bits: u8,
    lines: Pooled<Line>,
}

impl LocalCdf {
    /// Model reproducing the uniform mapping of a `seg_num`-block segment
    pub fn new(seg_num: usize, pools: &mut Pools) -> Self {
        let mut lines = pools.alloc_lines(INITIAL_RANGE_BITS);
        lines.fill(Line {
            gradient: seg_num as f64,
            intercept: 0.0,
        });

        Self {
            range_bits: INITIAL_RANGE_BITS,
            lines,
        }
    }

    /// Model whose ranges span blocks in proportion to the keys they hold,
    /// `per_block` keys to a block.
    ///
    /// Spans are rounded up to whole quanta, so an empty range keeps a
    /// sliver of a block and edges stay dyadic.
    pub fn fitted<I>(keys: I, local_bits: u32, range_bits: u8, per_block: f64, pools: &mut Pools) -> Self
    where
        I: IntoIterator<Item = u64>,
    {
        let mut model = Self {
            range_bits,
            lines: pools.alloc_lines(range_bits),
        };
        let mut counts = vec![0usize; model.ranges()];
        for x in keys {
            counts[model.range_of(x, local_bits)] += 1;
        }

        let ranges = model.ranges() as f64;
        let mut edge = 0.0;
        for (i, (line, &count)) in model.lines.iter_mut().zip(&counts).enumerate() {
            let span = ((count as f64 / per_block / FIT_QUANTUM).ceil() * FIT_QUANTUM).max(FIT_QUANTUM);
            line.gradient = span * ranges;
            line.intercept = edge - span * i as f64;
            edge += span;
        }

        model
    }

    #[inline]
    pub fn range_bits(&self) -> u8 {
        self.range_bits
    }

    #[inline]
    pub fn ranges(&self) -> usize {
        self.lines.len()
    }

    /// Range holding local key `x`
    #[inline]
    pub fn range_of(&self, x: u64, local_bits: u32) -> usize {
        let shift = local_bits.saturating_sub(self.range_bits as u32);
        ((x >> shift) as usize).min(self.ranges() - 1)
    }

    /// Position of the left edge of range `i`; `i == ranges()` gives the top
    #[inline]
    pub fn left_edge(&self, i: usize) -> f64 {
        if i >= self.ranges() {
            return self.top();
        }
        self.lines[i].at(i as f64 / self.ranges() as f64)
    }

    /// Position of the right edge of the last range
    #[inline]
    pub fn top(&self) -> f64 {
        self.lines[self.ranges() - 1].at(1.0)
    }

    /// Number of blocks the model's image spans
    #[inline]
    pub fn implied_buckets(&self) -> usize {
        (self.top().ceil() as usize).max(1)
    }

    /// Gradient of a range whose image is exactly one block
    #[inline]
    fn one_bucket_gradient(&self) -> f64 {
        self.ranges() as f64
    }

    /// Blocks spanned by range `i`, possibly fractional
    #[inline]
    pub fn buckets_of(&self, i: usize) -> f64 {
        self.lines[i].gradient / self.one_bucket_gradient()
    }

    /// Block for local key `x`, clamped so that blocks never decrease with keys
    pub fn bucket(&self, x: u64, local_bits: u32, seg_num: usize) -> usize {
        let i = self.range_of(x, local_bits);
        let lo = self.left_edge(i).floor().max(0.0);
        let hi = self.left_edge(i + 1).floor().max(lo);
        let pos = self.lines[i].at(normalize(x, local_bits)).floor();

        (pos.clamp(lo, hi) as usize).min(seg_num - 1)
    }

    /// First and last block reached by keys of range `i`
    pub fn range_blocks(&self, i: usize, local_bits: u32, seg_num: usize) -> (usize, usize) {
        let shift = local_bits.saturating_sub(self.range_bits as u32);
        let first = (i as u64) << shift;
        let last = ((i as u64 + 1) << shift) - 1;
        (
            self.bucket(first, local_bits, seg_num),
            self.bucket(last, local_bits, seg_num),
        )
    }

    /// Blocks range `i` asks for when it overflows: its current span, at least one
    #[inline]
    pub fn bucket_increase(&self, i: usize) -> usize {
        (self.buckets_of(i).ceil() as usize).max(1)
    }

    /// Change the gradient of range `i` keeping its left edge fixed, and
    /// shift every higher range by the change of its right edge
    fn regrade(&mut self, i: usize, gradient: f64) {
        let ranges = self.ranges() as f64;
        let delta = gradient - self.lines[i].gradient;

        self.lines[i].intercept -= delta * (i as f64 / ranges);
        self.lines[i].gradient = gradient;

        let shift = delta / ranges;
        for line in self.lines[i + 1..].iter_mut() {
            line.intercept += shift;
        }
    }

    /// Double the range count, each range splitting into two halves with the
    /// same affine map
    pub fn subdivide(&mut self, pools: &mut Pools) {
        let mut lines = pools.alloc_lines(self.range_bits + 1);
        for (i, line) in self.lines.iter().enumerate() {
            lines[2 * i] = *line;
            lines[2 * i + 1] = *line;
        }

        let old = std::mem::replace(&mut self.lines, lines);
        pools.free_lines(old);
        self.range_bits += 1;
    }

    /// Multiply every position by `factor`
    pub fn scale(&mut self, factor: f64) {
        for line in self.lines.iter_mut() {
            line.gradient *= factor;
            line.intercept *= factor;
        }
    }

    /// Move blocks from sparsely occupied ranges to `target`.
    ///
    /// Ranges from `reclaim_flag` on whose occupancy is under `threshold`
    /// give up part of their span. Returns `true` once `needed` blocks were
    /// collected and handed to `target`. Otherwise `target` receives what
    /// was collected, `needed` holds the shortfall and `false` is returned.
    pub fn reclaim(
        &mut self,
        target: usize,
        needed: &mut usize,
        counts: &mut [usize],
        reclaim_flag: &mut usize,
        threshold: f64,
    ) -> bool {
        let one_bucket = self.one_bucket_gradient();
        let wanted = *needed;
        let mut first_donor = None;

        for i in *reclaim_flag..self.ranges() {
            if i == target {
                continue;
            }
            let buckets = self.buckets_of(i);
            if buckets <= 0.0 {
                continue;
            }
            let util = counts[i] as f64 / (buckets * BLOCK as f64);
            if util >= threshold {
                continue;
            }

            let mut taken = ((1.0 - util) * buckets).ceil() as usize;
            if taken as f64 >= buckets {
                taken -= 1;
            }
            let taken = taken.min(*needed);
            if taken == 0 {
                continue;
            }

            first_donor.get_or_insert(i);
            let gradient = self.lines[i].gradient - taken as f64 * one_bucket;
            self.regrade(i, gradient);
            *needed -= taken;

            if *needed == 0 {
                let gradient = self.lines[target].gradient + wanted as f64 * one_bucket;
                self.regrade(target, gradient);
                counts[target] *= 2;
                *reclaim_flag = first_donor.unwrap_or(i);
                return true;
            }
        }

        let collected = wanted - *needed;
        if collected > 0 {
            let gradient = self.lines[target].gradient + collected as f64 * one_bucket;
            self.regrade(target, gradient);
        }
        if let Some(donor) = first_donor {
            *reclaim_flag = donor;
        }
        false
    }

    /// Grow range `target` by `needed` blocks, shifting the ranges above it.
    ///
    /// Returns the new implied block count, or `None` when the image would
    /// pass `max_buckets`.
    pub fn grow_range(&mut self, needed: usize, target: usize, max_buckets: usize) -> Option<usize> {
        if self.top() + needed as f64 > max_buckets as f64 {
            return None;
        }
        let gradient = self.lines[target].gradient + needed as f64 * self.one_bucket_gradient();
        self.regrade(target, gradient);
        Some(self.implied_buckets())
    }

    /// Project the model onto the lower and upper half of its domain.
    ///
    /// Both children keep the parent's block positions, the upper one shifted
    /// down by the whole blocks below the midpoint. Returns each child with
    /// the block count its image spans.
    pub fn split_halves(&self, pools: &mut Pools) -> [(LocalCdf, usize); 2] {
        let half = self.ranges() / 2;
        let mid = self.left_edge(half);
        let base = mid.floor();
        let child_bits = self.range_bits.saturating_sub(1).max(INITIAL_RANGE_BITS);

        let mut lower = pools.alloc_lines(child_bits);
        let mut upper = pools.alloc_lines(child_bits);
        let per_parent_line = lower.len() / half;

        for j in 0..lower.len() {
            let low = self.lines[j / per_parent_line];
            lower[j] = Line {
                gradient: low.gradient / 2.0,
                intercept: low.intercept,
            };

            let high = self.lines[half + j / per_parent_line];
            upper[j] = Line {
                gradient: high.gradient / 2.0,
                intercept: high.intercept + high.gradient / 2.0 - base,
            };
        }

        let lower_buckets = (mid.ceil() as usize).max(1);
        let upper_buckets = ((self.top() - base).ceil() as usize).max(1);

        [
            (
                LocalCdf {
                    range_bits: child_bits,
                    lines: lower,
                },
                lower_buckets,
            ),
            (
                LocalCdf {
                    range_bits: child_bits,
                    lines: upper,
                },
                upper_buckets,
            ),
        ]
    }

    /// Copy of the current lines, for [`LocalCdf::restore`]
    pub fn snapshot(&self) -> Vec<Line> {
        self.lines.to_vec()
    }

    /// Roll back to a snapshot taken at the same range bits
    pub fn restore(&mut self, snapshot: &[Line]) {
        debug_assert_eq!(snapshot.len(), self.lines.len());
        self.lines.copy_from_slice(snapshot);
    }

    /// Gradients are positive and range images follow each other without overlap
    pub fn is_monotone(&self) -> bool {
        let ranges = self.ranges();
        (0..ranges).all(|i| {
            let line = self.lines[i];
            let right = line.at((i + 1) as f64 / ranges as f64);
            line.gradient > 0.0
                && self.left_edge(i) <= right
                && (i + 1 == ranges || (right - self.left_edge(i + 1)).abs() < 1e-6)
        })
    }

    #[inline]
    pub fn memory_bytes(&self) -> usize {
        self.lines.len() * std::mem::size_of::<Line>()
    }

    pub fn release(self, pools: &mut Pools) {
        pools.free_lines(self.lines);
    }
}

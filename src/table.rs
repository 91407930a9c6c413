use tracing::{debug, info};

use crate::bucket::INVALID;
use crate::config::{IndexConfig, Workload};
use crate::directory::{AdaptCtx, AdaptStats, RoutingTable};
use crate::error::{Error, Result};
use crate::iter::{Iter, Keys, Values};
use crate::pool::Pools;

/// Snapshot of index shape and adaptation history
#[derive(Debug, Clone, PartialEq)]
pub struct IndexStats {
    pub keys: usize,
    pub shards: usize,
    pub segments: usize,
    pub blocks: usize,
    pub max_global_depth: u8,
    pub workload: Workload,
    pub memory_bytes: usize,
    pub adapt: AdaptStats,
}

/// An ordered `u64 -> u64` index combining extendible hashing with learned
/// per-segment CDF models
///
/// Keys are routed to a shard by their top bits, then through the shard's
/// directory to a segment whose blocks keep keys sorted. Overflowing
/// segments are remapped, expanded or split depending on depth, utilization
/// and the workload classification.
pub struct CdfHash {
    /// Routing tables, created on first write to the shard
    shards: Vec<Option<RoutingTable>>,
    pools: Pools,
    config: IndexConfig,
    workload: Workload,
    stats: AdaptStats,
    len: usize,
}

impl CdfHash {
    /// Create an empty index with the default configuration
    #[inline]
    pub fn new() -> Self {
        Self::build(IndexConfig::default())
    }

    /// Create an empty index with the provided configuration
    pub fn with_config(config: IndexConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: IndexConfig) -> Self {
        let shards = std::iter::repeat_with(|| None)
            .take(1usize << config.shard_bits)
            .collect();

        Self {
            shards,
            pools: Pools::new(),
            config,
            workload: Workload::Unclassified,
            stats: AdaptStats::default(),
            len: 0,
        }
    }

    /// Returns the number of keys in the index
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the index contains no keys
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Workload classification, fixed once any shard reaches the
    /// classification depth
    #[inline]
    pub fn workload(&self) -> Workload {
        self.workload
    }

    /// Global depth of a shard's directory, `None` if the shard is untouched
    pub fn global_depth(&self, shard: usize) -> Option<u8> {
        self.shards.get(shard)?.as_ref().map(RoutingTable::global_depth)
    }

    /// Bits of a key below the shard prefix
    #[inline]
    fn key_bits(&self) -> u32 {
        64 - self.config.shard_bits as u32
    }

    #[inline]
    fn shard_of(&self, key: u64) -> usize {
        (key >> self.key_bits()) as usize
    }

    #[inline]
    fn table(&self, key: u64) -> Option<&RoutingTable> {
        self.shards[self.shard_of(key)].as_ref()
    }

    /// Inserts a key-value pair into the index
    ///
    /// If the index did not have this key present, `None` is returned.
    /// If the index did have this key present, the value is updated, and the old value is returned.
    pub fn insert(&mut self, key: u64, value: u64) -> Result<Option<u64>> {
        if key == INVALID {
            return Err(Error::ReservedKey(key));
        }

        let shard = self.shard_of(key);
        let key_bits = self.key_bits();
        let Self {
            shards,
            pools,
            config,
            workload,
            stats,
            ..
        } = &mut *self;

        let table = shards[shard].get_or_insert_with(|| {
            debug!(shard, "created shard");
            RoutingTable::new(key_bits, pools)
        });
        let mut ctx = AdaptCtx {
            pools,
            policy: config.policy(*workload),
            stats,
        };
        let old = table.insert(key, value, &mut ctx);
        let depth = table.global_depth();

        if old.is_none() {
            self.len += 1;
        }
        if self.workload == Workload::Unclassified && depth >= self.config.classify_depth {
            self.classify();
        }

        Ok(old)
    }

    /// Sample every segment once and fix the workload classification
    fn classify(&mut self) {
        let (mut uniform, mut total) = (0usize, 0usize);
        for segment in self.shards.iter().flatten().flat_map(RoutingTable::segments) {
            total += 1;
            if segment.cdf().is_none() && segment.seg_num() > 1 {
                uniform += 1;
            }
        }

        let fraction = uniform as f64 / total.max(1) as f64;
        self.workload = if fraction > self.config.uniform_fraction {
            Workload::Uniform
        } else {
            Workload::Skewed
        };
        info!(
            workload = ?self.workload,
            uniform,
            total,
            fraction,
            "classified workload"
        );
    }

    /// Returns the value associated with the given key
    #[inline]
    pub fn get(&self, key: u64) -> Option<u64> {
        if key == INVALID {
            return None;
        }
        self.table(key)?.get(key)
    }

    /// Returns a mutable reference to the value associated with the given key
    pub fn find(&mut self, key: u64) -> Option<&mut u64> {
        if key == INVALID {
            return None;
        }
        let shard = self.shard_of(key);
        self.shards[shard].as_mut()?.find(key)
    }

    /// Return `true` if the index contains the given key
    #[inline]
    pub fn contains_key(&self, key: u64) -> bool {
        self.get(key).is_some()
    }

    /// Overwrite the value of an existing key, returning `false` if it is absent
    pub fn update(&mut self, key: u64, value: u64) -> bool {
        match self.find(key) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Removes a key from the index, returning the value if the key was present
    pub fn remove(&mut self, key: u64) -> Option<u64> {
        if key == INVALID {
            return None;
        }
        let shard = self.shard_of(key);
        let value = self.shards[shard].as_mut()?.delete(key)?;
        self.len -= 1;
        Some(value)
    }

    /// Removes a key, returning `true` if it was present
    #[inline]
    pub fn delete(&mut self, key: u64) -> bool {
        self.remove(key).is_some()
    }

    /// Returns an iterator over all entries in ascending key order
    pub fn iter(&self) -> Iter<'_> {
        Iter::new(&self.shards, 0, None)
    }

    /// Returns an iterator over entries with keys `>= start` in ascending order
    pub fn range_from(&self, start: u64) -> Iter<'_> {
        let shard = self.shard_of(start);
        let cursor = self.shards[shard].as_ref().map(|table| table.seek(start));
        Iter::new(&self.shards, shard, cursor)
    }

    pub fn keys(&self) -> Keys<'_> {
        Keys::new(self.iter())
    }

    pub fn values(&self) -> Values<'_> {
        Values::new(self.iter())
    }

    /// Values of up to `n` smallest keys `>= start`, in key order
    pub fn scan(&self, start: u64, n: usize) -> Vec<u64> {
        self.range_from(start).take(n).map(|(_, v)| v).collect()
    }

    /// Entries of up to `n` smallest keys `>= start`, in key order
    pub fn scan_entries(&self, start: u64, n: usize) -> Vec<(u64, u64)> {
        self.range_from(start).take(n).collect()
    }

    /// Clears the index, returning all storage to the allocator
    pub fn clear(&mut self) {
        *self = Self::build(self.config.clone());
    }

    pub fn stats(&self) -> IndexStats {
        let tables = || self.shards.iter().flatten();

        IndexStats {
            keys: self.len,
            shards: tables().count(),
            segments: tables().map(RoutingTable::segment_count).sum(),
            blocks: tables().map(RoutingTable::blocks).sum(),
            max_global_depth: tables().map(RoutingTable::global_depth).max().unwrap_or(0),
            workload: self.workload,
            memory_bytes: tables().map(RoutingTable::memory_bytes).sum(),
            adapt: self.stats,
        }
    }

    /// Check every shard's directory, sibling chain and segments
    #[cfg(test)]
    pub fn validate(&self) -> std::result::Result<(), String> {
        let mut keys = 0;
        for (shard, table) in self.shards.iter().enumerate() {
            if let Some(table) = table {
                table
                    .check_invariants()
                    .map_err(|e| format!("shard {}: {}", shard, e))?;
                keys += table.len();
            }
        }
        if keys != self.len {
            return Err(format!("shards hold {} keys, index counts {}", keys, self.len));
        }
        Ok(())
    }
}

impl Default for CdfHash {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use rand::prelude::*;
    use rand_distr::Zipf;

    use super::*;
    use crate::bucket::BLOCK;

    /// Width of shard 0's key domain under the default configuration
    const SHARD_SPAN: u64 = 1 << 55;

    #[test]
    fn test_new() {
        let table = CdfHash::new();
        assert!(table.is_empty());
        assert_eq!(table.len(), 0);
        assert_eq!(table.workload(), Workload::Unclassified);
        assert_eq!(table.global_depth(0), None);
        assert_eq!(table.stats().shards, 0);
    }

    #[test]
    fn test_invalid_config() {
        let result = CdfHash::with_config(IndexConfig::new().shard_bits(0));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_reserved_key() {
        let mut table = CdfHash::new();
        assert_eq!(table.insert(INVALID, 1), Err(Error::ReservedKey(INVALID)));
        assert_eq!(table.get(INVALID), None);
        assert!(!table.delete(INVALID));
        assert!(table.is_empty());
    }

    #[test]
    fn test_small_keys() {
        let mut table = CdfHash::new();
        for key in [10, 20, 5, 15] {
            assert_eq!(table.insert(key, key * 2).unwrap(), None);
        }

        assert_eq!(table.len(), 4);
        assert_eq!(table.get(15), Some(30));
        assert_eq!(table.get(99), None);
        assert_eq!(table.global_depth(0), Some(1));
        assert_eq!(table.scan(6, 10), vec![20, 30, 40]);
        table.validate().unwrap();
    }

    #[test]
    fn test_insert_update() {
        let mut table = CdfHash::new();

        table.insert(1, 100).unwrap();
        let old = table.insert(1, 200).unwrap();

        assert_eq!(old, Some(100));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(1), Some(200));
    }

    #[test]
    fn test_find_and_update() {
        let mut table = CdfHash::new();
        table.insert(7, 70).unwrap();

        *table.find(7).unwrap() += 1;
        assert_eq!(table.get(7), Some(71));

        assert!(table.update(7, 700));
        assert_eq!(table.get(7), Some(700));
        assert!(!table.update(8, 800));
        assert_eq!(table.get(8), None);
        assert!(table.find(8).is_none());
    }

    #[test]
    fn test_delete() {
        let mut table = CdfHash::new();
        table.insert(1, 100).unwrap();

        assert!(!table.delete(2));
        assert!(table.delete(1));
        assert!(!table.delete(1));
        assert!(table.is_empty());
        assert!(!table.contains_key(1));
        assert_eq!(table.remove(1), None);
    }

    #[test]
    fn test_clear() {
        let mut table = CdfHash::new();

        for i in 0u64..100 {
            table.insert(i << 40, i * 10).unwrap();
        }

        assert_eq!(table.len(), 100);
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.iter().count(), 0);
    }

    #[test]
    fn test_uniform_keys_expand() {
        // ascending, evenly spaced keys in one shard
        let mut table = CdfHash::new();
        let step = SHARD_SPAN / 10_000;
        for i in 0..10_000u64 {
            table.insert(i * step, i).unwrap();
        }

        let stats = table.stats();
        assert_eq!(stats.keys, 10_000);
        assert_eq!(stats.shards, 1);

        // splits stop at the remap depth, after that segments grow in place
        assert_eq!(table.global_depth(0), Some(6));
        assert_eq!(stats.segments, 64);
        assert_eq!(stats.adapt.splits, 62);
        assert_eq!(stats.adapt.expansions, 64);
        assert_eq!(stats.blocks, 128);

        for i in 0..10_000u64 {
            assert_eq!(table.get(i * step), Some(i), "missing key {}", i * step);
        }
        table.validate().unwrap();
    }

    /// Zipf-chosen clusters, keys packed towards each cluster's start
    fn skewed_keys(n: usize) -> Vec<u64> {
        let mut rng = StdRng::seed_from_u64(42);
        let zipf = Zipf::new(100, 1.2).unwrap();
        let cluster = 1u64 << 48;

        (0..n)
            .map(|_| {
                let c = rng.sample(zipf) as u64;
                let r: f64 = rng.gen();
                c * cluster + (r * r * cluster as f64) as u64
            })
            .collect()
    }

    fn load(config: IndexConfig, keys: &[u64]) -> CdfHash {
        let mut table = CdfHash::with_config(config).unwrap();
        for (i, &key) in keys.iter().enumerate() {
            table.insert(key, i as u64).unwrap();
        }
        table
    }

    #[test]
    fn test_skewed_keys_learned_vs_plain() {
        let keys = skewed_keys(10_000);
        let mut expected = HashMap::new();
        for (i, &key) in keys.iter().enumerate() {
            expected.insert(key, i as u64);
        }

        let base = IndexConfig::new().classify_depth(u8::MAX);
        let learned = load(base.clone().learned_cdf(true), &keys);
        let plain = load(base.learned_cdf(false), &keys);

        for table in [&learned, &plain] {
            assert_eq!(table.len(), expected.len());
            for (&key, &value) in &expected {
                assert_eq!(table.get(key), Some(value), "missing key {:#x}", key);
            }
            table.validate().unwrap();
        }

        let (learned, plain) = (learned.stats().adapt, plain.stats().adapt);
        assert!(learned.remaps > 0);
        assert_eq!(plain.remaps, 0);
        assert!(
            learned.splits < plain.splits,
            "learned {} splits, plain {}",
            learned.splits,
            plain.splits
        );
    }

    #[test]
    fn test_consecutive_keys_stay_compact() {
        let n = 3_000;
        for learned in [true, false] {
            let mut table = CdfHash::with_config(IndexConfig::new().learned_cdf(learned)).unwrap();
            for key in 0..n as u64 {
                table.insert(key, key + 1).unwrap();
            }

            assert_eq!(table.len(), n);
            for key in 0..n as u64 {
                assert_eq!(table.get(key), Some(key + 1), "missing key {}", key);
            }
            assert_eq!(table.scan(0, n + 1).len(), n);
            table.validate().unwrap();

            let stats = table.stats();
            assert!(stats.blocks * BLOCK <= 16 * n, "{:?}", stats);
            assert!(stats.max_global_depth <= 16, "{:?}", stats);
            assert!(stats.memory_bytes < 4 << 20, "{:?}", stats);
        }
    }

    #[test]
    fn test_scan_across_split() {
        let mut table = CdfHash::new();
        let step = SHARD_SPAN / 512;
        let keys: Vec<u64> = (0..200).map(|i| i * step).collect();
        for &key in &keys {
            table.insert(key, key + 1).unwrap();
        }
        assert!(table.stats().adapt.splits > 0);

        // start just below the boundary between the first two segments
        let start = keys[127] - 1;
        let got = table.scan_entries(start, 150);
        let want: Vec<(u64, u64)> = keys
            .iter()
            .filter(|&&k| k >= start)
            .take(150)
            .map(|&k| (k, k + 1))
            .collect();

        assert_eq!(got.len(), 73);
        assert_eq!(got, want);
        assert_eq!(table.scan(start, 2), vec![keys[127] + 1, keys[128] + 1]);
    }

    #[test]
    fn test_delete_all_after_splits() {
        let mut table = CdfHash::new();
        let step = SHARD_SPAN / 3_000;
        let keys: Vec<u64> = (0..3_000).map(|i| i * step).collect();
        for &key in &keys {
            table.insert(key, key).unwrap();
        }
        let segments = table.stats().segments;
        assert!(segments > 2);

        for &key in &keys {
            assert!(table.delete(key));
        }

        assert!(table.is_empty());
        assert_eq!(table.stats().segments, segments);
        assert_eq!(table.iter().next(), None);
        table.validate().unwrap();

        // links still route reinserted keys in order
        for &key in keys.iter().rev().step_by(7) {
            table.insert(key, 1).unwrap();
        }
        let scanned: Vec<u64> = table.keys().collect();
        assert!(scanned.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(scanned.len(), table.len());
    }

    #[test]
    fn test_classification() {
        let config = IndexConfig::new().classify_depth(7);
        let mut table = CdfHash::with_config(config).unwrap();
        let step = SHARD_SPAN / 40_000;
        let mut keys: Vec<u64> = (0..40_000).map(|i| i * step).collect();
        keys.shuffle(&mut StdRng::seed_from_u64(3));
        for &key in &keys {
            table.insert(key, key).unwrap();
        }

        // shuffled, evenly spread keys fill blocks evenly, so segments grow
        // without models
        assert_eq!(table.workload(), Workload::Uniform);
        assert!(table.stats().max_global_depth >= 7);
        table.validate().unwrap();
    }

    #[test]
    fn test_matches_btreemap() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut table = CdfHash::new();
        let mut reference = BTreeMap::new();

        for _ in 0..20_000 {
            let key = rng.gen_range(0..u64::MAX);
            if rng.gen_bool(0.2) {
                let first = *reference.keys().next().unwrap_or(&key);
                assert_eq!(table.remove(first), reference.remove(&first));
            } else {
                assert_eq!(table.insert(key, key ^ 1).unwrap(), reference.insert(key, key ^ 1));
            }
        }

        assert_eq!(table.len(), reference.len());
        assert!(table.iter().eq(reference.iter().map(|(&k, &v)| (k, v))));
        let start = rng.gen();
        assert!(table
            .range_from(start)
            .take(100)
            .eq(reference.range(start..).take(100).map(|(&k, &v)| (k, v))));
        table.validate().unwrap();
    }
}

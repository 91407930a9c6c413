use crate::error::{Error, Result};

/// Configuration for a [`CdfHash`](crate::table::CdfHash) index
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Number of high key bits selecting a shard (default: 9)
    pub shard_bits: u8,

    /// Local depth from which segments may expand or remap instead of
    /// splitting (default: 6)
    pub remap_depth: u8,

    /// Segment utilization separating "uniform" (expand) from "skewed"
    /// (remap) overflow handling (default: 0.6)
    pub bucket_util_threshold: f64,

    /// Range occupancy under which a range donates blocks or gets
    /// subdivided (default: 0.6)
    pub reclaim_threshold: f64,

    /// Growth exponent of the bucket ceiling while the workload is
    /// unclassified or skewed (default: 1)
    pub skewed_max_bits: u8,

    /// Growth exponent of the bucket ceiling once the workload is
    /// classified uniform (default: 7)
    pub uniform_max_bits: u8,

    /// Upper bound on a local CDF's range bits (default: 17)
    pub range_bits_limit: u8,

    /// Global depth that triggers the one-shot workload classification
    /// (default: 8)
    pub classify_depth: u8,

    /// Fraction of expanded, model-free segments above which the workload
    /// counts as uniform (default: 0.1)
    pub uniform_fraction: f64,

    /// Build and tune local CDF models on skewed overflow (default: true)
    pub learned_cdf: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            shard_bits: 9,
            remap_depth: 6,
            bucket_util_threshold: 0.6,
            reclaim_threshold: 0.6,
            skewed_max_bits: 1,
            uniform_max_bits: 7,
            range_bits_limit: 17,
            classify_depth: 8,
            uniform_fraction: 0.1,
            learned_cdf: true,
        }
    }
}

impl IndexConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of shard bits
    pub fn shard_bits(mut self, bits: u8) -> Self {
        self.shard_bits = bits;
        self
    }

    /// Set the local depth at which remap and expand become available
    pub fn remap_depth(mut self, depth: u8) -> Self {
        self.remap_depth = depth;
        self
    }

    /// Set the utilization threshold between expand and remap
    pub fn bucket_util_threshold(mut self, threshold: f64) -> Self {
        self.bucket_util_threshold = threshold;
        self
    }

    /// Set the range occupancy threshold for donation and subdivision
    pub fn reclaim_threshold(mut self, threshold: f64) -> Self {
        self.reclaim_threshold = threshold;
        self
    }

    /// Set the ceiling exponent used before a uniform classification
    pub fn skewed_max_bits(mut self, bits: u8) -> Self {
        self.skewed_max_bits = bits;
        self
    }

    /// Set the ceiling exponent used after a uniform classification
    pub fn uniform_max_bits(mut self, bits: u8) -> Self {
        self.uniform_max_bits = bits;
        self
    }

    /// Set the maximum range bits of a local CDF
    pub fn range_bits_limit(mut self, bits: u8) -> Self {
        self.range_bits_limit = bits;
        self
    }

    /// Set the global depth that triggers classification. `u8::MAX` disables it.
    pub fn classify_depth(mut self, depth: u8) -> Self {
        self.classify_depth = depth;
        self
    }

    /// Set the uniform-segment fraction for classification
    pub fn uniform_fraction(mut self, fraction: f64) -> Self {
        self.uniform_fraction = fraction;
        self
    }

    /// Enable or disable local CDF models
    pub fn learned_cdf(mut self, enabled: bool) -> Self {
        self.learned_cdf = enabled;
        self
    }

    /// Check that every field is in range
    pub fn validate(&self) -> Result<()> {
        if !(1..=16).contains(&self.shard_bits) {
            return Err(Error::InvalidConfig(format!(
                "shard_bits must be within 1..=16, got {}",
                self.shard_bits
            )));
        }
        if self.remap_depth >= 64 - self.shard_bits {
            return Err(Error::InvalidConfig(format!(
                "remap_depth {} leaves no local key bits",
                self.remap_depth
            )));
        }
        for (name, value) in [
            ("bucket_util_threshold", self.bucket_util_threshold),
            ("reclaim_threshold", self.reclaim_threshold),
            ("uniform_fraction", self.uniform_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::InvalidConfig(format!(
                    "{name} must be within 0.0..=1.0, got {value}"
                )));
            }
        }
        if self.skewed_max_bits > MAX_CEILING_BITS || self.uniform_max_bits > MAX_CEILING_BITS {
            return Err(Error::InvalidConfig(format!(
                "ceiling bits must not exceed {MAX_CEILING_BITS}"
            )));
        }
        if !(1..=32).contains(&self.range_bits_limit) {
            return Err(Error::InvalidConfig(format!(
                "range_bits_limit must be within 1..=32, got {}",
                self.range_bits_limit
            )));
        }
        Ok(())
    }

    /// Policy snapshot for the given workload classification
    pub(crate) fn policy(&self, workload: Workload) -> Policy {
        let max_bits = match workload {
            Workload::Uniform => self.uniform_max_bits,
            Workload::Unclassified | Workload::Skewed => self.skewed_max_bits,
        };
        Policy {
            remap_depth: self.remap_depth,
            bucket_util_threshold: self.bucket_util_threshold,
            reclaim_threshold: self.reclaim_threshold,
            range_bits_limit: self.range_bits_limit,
            learned_cdf: self.learned_cdf,
            max_bits,
        }
    }
}

/// Largest exponent the bucket ceiling may reach
const MAX_CEILING_BITS: u8 = 24;

/// Outcome of the one-shot workload classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Workload {
    #[default]
    Unclassified,
    Uniform,
    Skewed,
}

/// Adaptation parameters handed down to routing tables and segments
#[derive(Debug, Clone, Copy)]
pub(crate) struct Policy {
    pub remap_depth: u8,
    pub bucket_util_threshold: f64,
    pub reclaim_threshold: f64,
    pub range_bits_limit: u8,
    pub learned_cdf: bool,
    pub max_bits: u8,
}

impl Policy {
    /// Maximum number of blocks a segment at `local_depth` may hold
    #[inline]
    pub fn max_buckets(&self, local_depth: u8) -> usize {
        if local_depth < self.remap_depth {
            return 1;
        }
        let bits = (self.max_bits as u32 + (local_depth - self.remap_depth) as u32)
            .min(MAX_CEILING_BITS as u32);
        1usize << bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(IndexConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_shard_bits() {
        let err = IndexConfig::new().shard_bits(0).validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(IndexConfig::new().shard_bits(17).validate().is_err());
    }

    #[test]
    fn test_invalid_threshold() {
        assert!(IndexConfig::new()
            .bucket_util_threshold(1.5)
            .validate()
            .is_err());
    }

    #[test]
    fn test_max_buckets() {
        let config = IndexConfig::default();
        let skewed = config.policy(Workload::Unclassified);
        assert_eq!(skewed.max_buckets(3), 1);
        assert_eq!(skewed.max_buckets(6), 2);
        assert_eq!(skewed.max_buckets(8), 8);

        let uniform = config.policy(Workload::Uniform);
        assert_eq!(uniform.max_buckets(5), 1);
        assert_eq!(uniform.max_buckets(6), 128);
        assert_eq!(uniform.max_buckets(7), 256);
    }

    #[test]
    fn test_max_buckets_saturates() {
        let policy = IndexConfig::default().policy(Workload::Uniform);
        assert_eq!(policy.max_buckets(50), 1 << MAX_CEILING_BITS);
    }
}

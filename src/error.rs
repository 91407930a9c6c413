use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the index.
///
/// Only `ReservedKey` and `InvalidConfig` ever reach a caller. The remaining
/// variants are signals between a segment and the routing table's retry loop,
/// which always resolves them by remapping, expanding or splitting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// `u64::MAX` marks empty slots and cannot be stored
    #[error("key {0:#x} is reserved as the empty-slot marker")]
    ReservedKey(u64),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The addressed block has no free slot
    #[error("segment block is full")]
    SegmentFull,

    /// The local CDF has no growth budget left for this adaptation cycle
    #[error("local cdf remap budget exhausted")]
    RemapExhausted,

    /// Growing the segment would pass its bucket ceiling
    #[error("segment would exceed its ceiling of {max} blocks")]
    CapacityExceeded { max: usize },
}

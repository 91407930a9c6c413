//! Ordered `u64 -> u64` index built on extendible hashing with learned,
//! per-segment CDF models.
//!
//! ```
//! use cdfhash::CdfHash;
//!
//! let mut index = CdfHash::new();
//! for key in [10, 20, 5, 15] {
//!     index.insert(key, key * 2).unwrap();
//! }
//!
//! assert_eq!(index.get(15), Some(30));
//! assert_eq!(index.get(99), None);
//! assert_eq!(index.scan(6, 2), vec![20, 30]);
//! ```

pub mod bucket;
pub mod cdf;
pub mod config;
pub mod directory;
pub mod error;
pub mod iter;
pub mod pool;
pub mod segment;
pub mod table;

#[cfg(test)]
mod proptests;

pub use config::{IndexConfig, Workload};
pub use directory::AdaptStats;
pub use error::{Error, Result};
pub use table::{CdfHash, IndexStats};

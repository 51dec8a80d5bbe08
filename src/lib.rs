//! triemap_rs: a lock-free sparse map from 32-bit indices to values, stored in a
//! 16-way trie of atomic slots.
//!
//! Reads never allocate, writes grow only the path they need, and removing
//! the last value under a branch prunes it again. Detached nodes are
//! reclaimed through an epoch collector and recycled through a bounded pool.
//!
//! ```
//! use triemap_rs::Mapper;
//!
//! let m = Mapper::new();
//! assert!(m.set(-3, "a"));
//! assert!(!m.insert(-3, "b"));
//! assert_eq!(m.exchange(-3, "c"), Some("a"));
//! assert_eq!(m.remove_at(-3), Some("c"));
//! assert!(m.is_empty());
//! ```

mod branch;
mod error;
mod leaf;
mod mapper;
mod pool;
mod set;
mod slot;

pub use error::{ConfigError, CopyError, SetError};
pub use mapper::{Entries, Iter, Mapper, MapperConfig, DEFAULT_BRANCH_POOL_CAPACITY};
pub use set::SafeSet;

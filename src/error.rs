//! Error types for caller-input violations.
//!
//! Lost races inside the trie are never errors; they are resolved internally
//! or reported through `bool` / `Option` results. Only arguments the caller
//! controls can fail.

use std::fmt;

/// Errors from [`Mapper::copy_to`](crate::Mapper::copy_to).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum CopyError {
    /// The start position lies past the end of the destination.
    StartOutOfBounds { start: usize, len: usize },
    /// The destination cannot hold every entry counted at the time of the call.
    InsufficientCapacity { needed: usize, available: usize },
}

impl fmt::Display for CopyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartOutOfBounds { start, len } => {
                write!(f, "start position {start} is past the end of a buffer of length {len}")
            }
            Self::InsufficientCapacity { needed, available } => write!(
                f,
                "destination too small: {needed} entries, room for {available}"
            ),
        }
    }
}

impl std::error::Error for CopyError {}

/// Errors from [`MapperConfig::check`](crate::MapperConfig::check).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// `branch_pool_capacity` is larger than the supported maximum.
    PoolCapacityTooLarge { requested: usize, max: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PoolCapacityTooLarge { requested, max } => write!(
                f,
                "branch_pool_capacity {requested} exceeds the maximum of {max}"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Errors from [`SafeSet`](crate::SafeSet) operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum SetError {
    /// An equal value is already stored.
    AlreadyPresent,
}

impl fmt::Display for SetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyPresent => write!(f, "the value is already present"),
        }
    }
}

impl std::error::Error for SetError {}

use std::fmt;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};
use crossbeam_utils::CachePadded;

use crate::branch::{Branch, BranchPool, WIDTH};
use crate::error::{ConfigError, CopyError};
use crate::pool::Pool;

// ================================================================================================
// CONFIGURATION
// ================================================================================================

/// Branch pool capacity used by [`Mapper::new`].
pub const DEFAULT_BRANCH_POOL_CAPACITY: usize = 16;

const MAX_BRANCH_POOL_CAPACITY: usize = 1 << 16;

/// First cursor value past the end of the address space.
const ADDRESS_END: u64 = 1 << u32::BITS;

/// Construction-time settings for a [`Mapper`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapperConfig {
    /// How many detached branches are kept for reuse. `0` disables pooling.
    pub branch_pool_capacity: usize,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            branch_pool_capacity: DEFAULT_BRANCH_POOL_CAPACITY,
        }
    }
}

impl MapperConfig {
    /// Checks the settings without panicking.
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.branch_pool_capacity > MAX_BRANCH_POOL_CAPACITY {
            return Err(ConfigError::PoolCapacityTooLarge {
                requested: self.branch_pool_capacity,
                max: MAX_BRANCH_POOL_CAPACITY,
            });
        }
        Ok(())
    }

    /// Validates the settings.
    ///
    /// # Panics
    ///
    /// Panics if `branch_pool_capacity` exceeds the supported maximum.
    #[track_caller]
    pub fn validate(&self) {
        if let Err(err) = self.check() {
            panic!("{err}");
        }
    }
}

// ================================================================================================
// MAIN MAPPER STRUCTURE
// ================================================================================================

/// One generation of the trie. Replaced wholesale by [`Mapper::clear`].
struct Trie<T> {
    root: Branch<T>,
    // Signed so a removal that overtakes the matching insert's increment can
    // dip below zero for a moment instead of wrapping.
    len: CachePadded<AtomicIsize>,
}

impl<T> Trie<T> {
    fn new() -> Self {
        Self {
            root: Branch::root(),
            len: CachePadded::new(AtomicIsize::new(0)),
        }
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Acquire).max(0) as usize
    }
}

/// Lock-free sparse map from 32-bit indices to values.
///
/// Indices are `i32`; the bit pattern is reinterpreted as an unsigned address,
/// so every distinct index has its own slot. Memory grows with the number of
/// occupied indices, not with the size of the address space.
///
/// Every operation is safe to call concurrently from any number of threads.
/// Each individual slot behaves like an atomic register; operations spanning
/// several slots (iteration, [`len`](Mapper::len), [`copy_to`](Mapper::copy_to))
/// are not snapshots.
pub struct Mapper<T> {
    trie: Atomic<Trie<T>>,
    pool: Arc<BranchPool<T>>,
}

#[inline]
fn address(index: i32) -> u32 {
    index as u32
}

impl<T> Mapper<T> {
    fn trie<'g>(&self, guard: &'g Guard) -> &'g Trie<T> {
        // SAFETY: the pointer is never null, and a replaced trie is only
        // reclaimed after every guard that could have loaded it is dropped.
        unsafe { self.trie.load(Ordering::Acquire, guard).deref() }
    }

    /// Returns the number of occupied indices.
    ///
    /// Exact whenever no write is in flight; otherwise an approximation.
    pub fn len(&self) -> usize {
        let guard = &epoch::pin();
        self.trie(guard).len()
    }

    /// Returns true if the map contains no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send + Sync + 'static> Mapper<T> {
    /// Create an empty mapper with default settings.
    pub fn new() -> Self {
        Self::with_config(MapperConfig::default())
    }

    /// Create an empty mapper with the given settings.
    ///
    /// # Panics
    ///
    /// Panics if the settings are invalid; see [`MapperConfig::validate`].
    /// [`try_with_config`](Mapper::try_with_config) reports the same problem
    /// as an error instead.
    #[track_caller]
    pub fn with_config(config: MapperConfig) -> Self {
        config.validate();
        Self::build(config)
    }

    /// Create an empty mapper with the given settings, rejecting invalid ones.
    pub fn try_with_config(config: MapperConfig) -> Result<Self, ConfigError> {
        config.check()?;
        Ok(Self::build(config))
    }

    fn build(config: MapperConfig) -> Self {
        Self {
            trie: Atomic::new(Trie::new()),
            pool: Arc::new(Pool::new(config.branch_pool_capacity, Branch::recycle)),
        }
    }

    // ============================================================================================
    // PUBLIC API METHODS
    // ============================================================================================

    /// Get a clone of the value stored at `index`.
    pub fn get(&self, index: i32) -> Option<T>
    where
        T: Clone,
    {
        self.get_with(index, T::clone)
    }

    /// Apply `f` to the value stored at `index` without cloning it.
    pub fn get_with<R>(&self, index: i32, f: impl FnOnce(&T) -> R) -> Option<R> {
        let guard = &epoch::pin();
        self.trie(guard).root.with_value(address(index), guard, f)
    }

    /// Check whether `index` is occupied.
    pub fn contains(&self, index: i32) -> bool {
        self.get_with(index, |_| ()).is_some()
    }

    /// Store `value` at `index`, replacing any previous value.
    ///
    /// Returns true if the index was empty immediately before the write.
    pub fn set(&self, index: i32, value: T) -> bool {
        let guard = &epoch::pin();
        let trie = self.trie(guard);
        let is_new = trie
            .root
            .replace(address(index), value, &self.pool, guard)
            .is_none();
        if is_new {
            trie.len.fetch_add(1, Ordering::AcqRel);
        }
        is_new
    }

    /// Store `value` at `index` and return the value it displaced.
    ///
    /// `None` means the index was empty.
    pub fn exchange(&self, index: i32, value: T) -> Option<T>
    where
        T: Clone,
    {
        let guard = &epoch::pin();
        let trie = self.trie(guard);
        let previous = trie
            .root
            .replace(address(index), value, &self.pool, guard)
            .map(|leaf| leaf.value().clone());
        if previous.is_none() {
            trie.len.fetch_add(1, Ordering::AcqRel);
        }
        previous
    }

    /// Store `value` at `index` only if the index is empty.
    ///
    /// Returns false, dropping `value`, if another value is already there.
    pub fn insert(&self, index: i32, value: T) -> bool {
        self.insert_with(index, value, |_, _| ()).is_ok()
    }

    /// Store `value` at `index` only if the index is empty.
    ///
    /// On failure returns a clone of the value found at the moment of the
    /// attempt. That value was really stored by some writer, though it may
    /// already have been replaced by the time the caller looks at it.
    pub fn try_insert(&self, index: i32, value: T) -> Result<(), T>
    where
        T: Clone,
    {
        self.insert_with(index, value, |existing, _| existing.clone())
            .map_err(|(existing, _)| existing)
    }

    /// Conditional insert that hands the rejected value back together with
    /// `occupied(existing, rejected)`.
    pub(crate) fn insert_with<R>(
        &self,
        index: i32,
        value: T,
        occupied: impl FnOnce(&T, &T) -> R,
    ) -> Result<(), (R, T)> {
        let guard = &epoch::pin();
        let trie = self.trie(guard);
        let result = trie
            .root
            .insert(address(index), value, occupied, &self.pool, guard);
        if result.is_ok() {
            trie.len.fetch_add(1, Ordering::AcqRel);
        }
        result
    }

    /// Remove the value at `index` and return it.
    pub fn remove_at(&self, index: i32) -> Option<T>
    where
        T: Clone,
    {
        self.remove_leaf(index, |_| true, T::clone)
    }

    /// Remove the value at `index`, returning whether anything was removed.
    ///
    /// Unlike [`remove_at`](Mapper::remove_at) this never clones.
    pub fn delete_at(&self, index: i32) -> bool {
        self.remove_leaf(index, |_| true, |_| ()).is_some()
    }

    /// Remove the value at `index` only if it equals `expected`.
    ///
    /// The comparison and the removal act on the same stored value: if a
    /// concurrent writer replaces it in between, the new value is compared
    /// again rather than removed blindly.
    pub fn remove_value_at(&self, index: i32, expected: &T) -> bool
    where
        T: PartialEq,
    {
        self.remove_leaf(index, |value| value == expected, |_| ())
            .is_some()
    }

    /// Remove the value at `index` only if `check` accepts it, returning it.
    pub fn remove_where_at(&self, index: i32, check: impl FnMut(&T) -> bool) -> Option<T>
    where
        T: Clone,
    {
        self.remove_leaf(index, check, T::clone)
    }

    fn remove_leaf<R>(
        &self,
        index: i32,
        check: impl FnMut(&T) -> bool,
        extract: impl FnOnce(&T) -> R,
    ) -> Option<R> {
        let guard = &epoch::pin();
        let trie = self.trie(guard);
        let leaf = trie
            .root
            .remove_where(address(index), check, &self.pool, guard)?;
        trie.len.fetch_sub(1, Ordering::AcqRel);
        Some(extract(leaf.value()))
    }

    /// Copy the values into `dest[start..]` in ascending address order.
    ///
    /// The capacity check uses [`len`](Mapper::len) at the time of the call;
    /// entries added concurrently afterwards are cut off at the end of `dest`.
    /// Returns the number of values written.
    pub fn copy_to(&self, dest: &mut [T], start: usize) -> Result<usize, CopyError>
    where
        T: Clone,
    {
        if start > dest.len() {
            return Err(CopyError::StartOutOfBounds {
                start,
                len: dest.len(),
            });
        }
        let available = dest.len() - start;
        let needed = self.len();
        if available < needed {
            return Err(CopyError::InsufficientCapacity { needed, available });
        }
        let mut written = 0;
        for (slot, value) in dest[start..].iter_mut().zip(self.iter()) {
            *slot = value;
            written += 1;
        }
        Ok(written)
    }

    /// Returns an iterator over cloned values in ascending address order.
    ///
    /// Values are gathered one terminal branch at a time; entries added or
    /// removed while iterating may or may not be seen.
    pub fn iter(&self) -> Iter<'_, T>
    where
        T: Clone,
    {
        Iter {
            inner: self.entries(),
        }
    }

    /// Returns an iterator over `(index, value)` pairs in ascending address
    /// order (non-negative indices first, then negative ones).
    pub fn entries(&self) -> Entries<'_, T>
    where
        T: Clone,
    {
        Entries {
            mapper: self,
            cursor: 0,
            chunk: Vec::new().into_iter(),
        }
    }

    /// Removes all entries by replacing the trie.
    ///
    /// Writes racing with the replacement may land in the discarded trie.
    pub fn clear(&self) {
        let guard = &epoch::pin();
        self.replace_trie(guard);
    }

    /// Removes all entries and returns the values that were stored, in
    /// ascending address order.
    pub fn drain(&self) -> std::vec::IntoIter<T>
    where
        T: Clone,
    {
        let guard = &epoch::pin();
        let old = self.replace_trie(guard);
        let mut values = Vec::with_capacity(old.len());
        let mut chunk = Vec::with_capacity(WIDTH);
        let mut cursor = 0;
        while let Some(next) = old.root.collect_chunk(0, cursor, &mut chunk, guard) {
            values.extend(chunk.drain(..).map(|(_, value)| value));
            cursor = next;
        }
        values.into_iter()
    }

    /// Swap in an empty trie and retire the old one, which stays readable
    /// under `guard`.
    fn replace_trie<'g>(&self, guard: &'g Guard) -> &'g Trie<T> {
        let old = self
            .trie
            .swap(Owned::new(Trie::new()), Ordering::AcqRel, guard);
        #[cfg(feature = "tracing")]
        tracing::debug!("clear: trie replaced");
        // SAFETY: unlinked by the swap above; operations that loaded it before
        // the swap are pinned, so destruction waits for them.
        unsafe {
            guard.defer_destroy(old);
            old.deref()
        }
    }
}

impl<T> Drop for Mapper<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` rules out concurrent operations, and the trie
        // pointer is never null.
        unsafe {
            let trie = self.trie.load(Ordering::Relaxed, epoch::unprotected());
            drop(trie.into_owned());
        }
    }
}

// ================================================================================================
// ITERATOR IMPLEMENTATIONS
// ================================================================================================

/// Iterator over `(index, value)` pairs of a [`Mapper`].
pub struct Entries<'a, T> {
    mapper: &'a Mapper<T>,
    cursor: u64,
    chunk: std::vec::IntoIter<(u32, T)>,
}

impl<T: Clone> Entries<'_, T> {
    // Pin only for the duration of one terminal branch.
    fn collect_next_chunk(&mut self) -> bool {
        if self.cursor >= ADDRESS_END {
            return false;
        }
        let guard = &epoch::pin();
        let mut chunk = Vec::with_capacity(WIDTH);
        match self
            .mapper
            .trie(guard)
            .root
            .collect_chunk(0, self.cursor, &mut chunk, guard)
        {
            Some(next) => {
                self.cursor = next;
                self.chunk = chunk.into_iter();
                true
            }
            None => {
                self.cursor = ADDRESS_END;
                false
            }
        }
    }
}

impl<T: Clone> Iterator for Entries<'_, T> {
    type Item = (i32, T);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((address, value)) = self.chunk.next() {
                return Some((address as i32, value));
            }
            if !self.collect_next_chunk() {
                return None;
            }
        }
    }
}

/// Iterator over the values of a [`Mapper`].
pub struct Iter<'a, T> {
    inner: Entries<'a, T>,
}

impl<T: Clone> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(_, value)| value)
    }
}

// ================================================================================================
// STANDARD TRAIT IMPLEMENTATIONS
// ================================================================================================

impl<T: Send + Sync + 'static> Default for Mapper<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Mapper<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapper")
            .field("len", &self.len())
            .field("pooled_branches", &self.pool.len())
            .field("pool_capacity", &self.pool.capacity())
            .finish()
    }
}

impl<'a, T: Clone + Send + Sync + 'static> IntoIterator for &'a Mapper<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T: Send + Sync + 'static> FromIterator<(i32, T)> for Mapper<T> {
    fn from_iter<I: IntoIterator<Item = (i32, T)>>(iter: I) -> Self {
        let mapper = Mapper::new();
        for (index, value) in iter {
            mapper.set(index, value);
        }
        mapper
    }
}

impl<T: Send + Sync + 'static> Extend<(i32, T)> for Mapper<T> {
    fn extend<I: IntoIterator<Item = (i32, T)>>(&mut self, iter: I) {
        for (index, value) in iter {
            self.set(index, value);
        }
    }
}

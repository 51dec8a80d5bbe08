//! Concurrent hash set built on [`Mapper`] with open addressing.
//!
//! A value lives at `hash32(value) + attempt` for the first attempt whose slot
//! was free when it was added. Lookups scan `probing()` consecutive addresses;
//! the probing depth only ever grows.

use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{CopyError, SetError};
use crate::mapper::{Iter, Mapper};

const DEFAULT_PROBING: usize = 1;

/// Lock-free set of values addressed by their 32-bit hash.
pub struct SafeSet<T, S = ahash::RandomState> {
    mapper: Mapper<T>,
    probing: AtomicUsize,
    hasher: S,
}

impl<T> SafeSet<T>
where
    T: Hash + Eq + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_probing(DEFAULT_PROBING)
    }

    /// Create a set that initially scans `probing` addresses per lookup.
    pub fn with_probing(probing: usize) -> Self {
        Self::with_probing_and_hasher(probing, ahash::RandomState::new())
    }
}

impl<T, S> SafeSet<T, S>
where
    T: Hash + Eq + Clone + Send + Sync + 'static,
    S: BuildHasher,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_probing_and_hasher(DEFAULT_PROBING, hasher)
    }

    pub fn with_probing_and_hasher(probing: usize, hasher: S) -> Self {
        Self {
            mapper: Mapper::new(),
            probing: AtomicUsize::new(probing),
            hasher,
        }
    }

    #[inline]
    fn address(&self, hash: u32, attempt: usize) -> i32 {
        hash.wrapping_add(attempt as u32) as i32
    }

    #[inline]
    fn hash(&self, value: &T) -> u32 {
        self.hasher.hash_one(value) as u32
    }

    /// The hasher that places values. `hasher().hash_one(x) as u32` is the
    /// hash the `*_by` lookups expect.
    pub fn hasher(&self) -> &S {
        &self.hasher
    }

    /// Current probing depth.
    pub fn probing(&self) -> usize {
        self.probing.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.mapper.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapper.is_empty()
    }

    /// Add `value` unless an equal value is already present.
    ///
    /// The duplicate check stops at the first free address in the collision
    /// chain. If an earlier value in the chain was removed, a value already
    /// stored further along is added a second time.
    pub fn try_add(&self, value: T) -> bool {
        self.add(value).is_ok()
    }

    /// Add `value`, failing if an equal value is already present.
    ///
    /// Same duplicate detection as [`try_add`](SafeSet::try_add).
    pub fn add_new(&self, value: T) -> Result<(), SetError> {
        self.add(value)
    }

    fn add(&self, mut value: T) -> Result<(), SetError> {
        let hash = self.hash(&value);
        let mut attempt = 0;
        loop {
            // Make the slot we are about to take visible to lookups first.
            self.probing.fetch_max(attempt + 1, Ordering::AcqRel);
            match self.mapper.insert_with(
                self.address(hash, attempt),
                value,
                |existing, ours| existing == ours,
            ) {
                Ok(()) => return Ok(()),
                Err((true, _)) => return Err(SetError::AlreadyPresent),
                Err((false, rejected)) => {
                    value = rejected;
                    attempt += 1;
                }
            }
        }
    }

    pub fn contains(&self, value: &T) -> bool {
        self.contains_by(self.hash(value), |found| found == value)
    }

    /// Check whether a value with hash `hash` satisfying `check` is stored.
    pub fn contains_by(&self, hash: u32, mut check: impl FnMut(&T) -> bool) -> bool {
        (0..self.probing()).any(|attempt| {
            self.mapper
                .get_with(self.address(hash, attempt), &mut check)
                .unwrap_or(false)
        })
    }

    /// Get a clone of the first value with hash `hash` that `check` accepts.
    pub fn get_by(&self, hash: u32, mut check: impl FnMut(&T) -> bool) -> Option<T> {
        (0..self.probing()).find_map(|attempt| {
            self.mapper
                .get_with(self.address(hash, attempt), |found| {
                    check(found).then(|| found.clone())
                })
                .flatten()
        })
    }

    /// Remove the stored value equal to `value`.
    pub fn remove(&self, value: &T) -> bool {
        let hash = self.hash(value);
        (0..self.probing())
            .any(|attempt| self.mapper.remove_value_at(self.address(hash, attempt), value))
    }

    /// Remove the stored value equal to `value` and return it.
    pub fn take(&self, value: &T) -> Option<T> {
        self.take_by(self.hash(value), |found| found == value)
    }

    /// Remove the first value with hash `hash` that `check` accepts and
    /// return it.
    pub fn take_by(&self, hash: u32, mut check: impl FnMut(&T) -> bool) -> Option<T> {
        (0..self.probing()).find_map(|attempt| {
            self.mapper
                .remove_where_at(self.address(hash, attempt), &mut check)
        })
    }

    /// Remove every value `check` accepts and return how many were removed.
    ///
    /// Values added while this runs may be missed.
    pub fn remove_where(&self, check: impl FnMut(&T) -> bool) -> usize {
        self.drain_where(check).count()
    }

    /// Remove every value `check` accepts and return the removed values.
    ///
    /// A value replaced between the scan and its removal is left alone.
    pub fn drain_where(&self, mut check: impl FnMut(&T) -> bool) -> std::vec::IntoIter<T> {
        let matches: Vec<_> = self
            .mapper
            .entries()
            .filter(|(_, value)| check(value))
            .collect();
        matches
            .into_iter()
            .filter(|(index, value)| self.mapper.remove_value_at(*index, value))
            .map(|(_, value)| value)
            .collect::<Vec<_>>()
            .into_iter()
    }

    pub fn clear(&self) {
        self.mapper.clear();
    }

    /// Remove every value and return them.
    pub fn drain(&self) -> std::vec::IntoIter<T> {
        self.mapper.drain()
    }

    /// Iterate over the values in address order, which is unrelated to
    /// insertion order.
    pub fn iter(&self) -> Iter<'_, T> {
        self.mapper.iter()
    }

    /// Iterate over the values `check` accepts.
    pub fn iter_where<'a>(
        &'a self,
        mut check: impl FnMut(&T) -> bool + 'a,
    ) -> impl Iterator<Item = T> + 'a {
        self.iter().filter(move |value| check(value))
    }

    /// Copy the values into `dest[start..]`; see [`Mapper::copy_to`].
    pub fn copy_to(&self, dest: &mut [T], start: usize) -> Result<usize, CopyError> {
        self.mapper.copy_to(dest, start)
    }
}

impl<T, S> Default for SafeSet<T, S>
where
    T: Hash + Eq + Clone + Send + Sync + 'static,
    S: BuildHasher + Default,
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<T, S> fmt::Debug for SafeSet<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeSet")
            .field("len", &self.mapper.len())
            .field("probing", &self.probing.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T, S> FromIterator<T> for SafeSet<T, S>
where
    T: Hash + Eq + Clone + Send + Sync + 'static,
    S: BuildHasher + Default,
{
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let set = Self::default();
        for value in iter {
            set.try_add(value);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hash::{BuildHasherDefault, Hasher};

    /// Sends every value to address 7 so probing is exercised.
    #[derive(Default)]
    struct Colliding;

    impl Hasher for Colliding {
        fn finish(&self) -> u64 {
            7
        }
        fn write(&mut self, _: &[u8]) {}
    }

    type CollidingSet<T> = SafeSet<T, BuildHasherDefault<Colliding>>;

    #[test]
    fn add_contains_remove() {
        let set = SafeSet::new();
        assert!(set.try_add("alpha"));
        assert!(!set.try_add("alpha"));
        assert_eq!(set.add_new("alpha"), Err(SetError::AlreadyPresent));
        assert!(set.contains(&"alpha"));
        assert!(!set.contains(&"beta"));
        assert_eq!(set.len(), 1);
        assert!(set.remove(&"alpha"));
        assert!(!set.remove(&"alpha"));
        assert!(set.is_empty());
    }

    #[test]
    fn collisions_step_forward_and_extend_depth() {
        let set = CollidingSet::default();
        for value in 0..5u32 {
            set.add_new(value).unwrap();
        }
        assert_eq!(set.probing(), 5);
        assert_eq!(set.mapper.get(7), Some(0));
        assert_eq!(set.mapper.get(11), Some(4));
        for value in 0..5u32 {
            assert!(set.contains(&value));
        }
        assert_eq!(set.add_new(3), Err(SetError::AlreadyPresent));
        assert!(!set.contains(&5));
    }

    #[test]
    fn removed_slots_are_reused_without_duplicates() {
        let set = CollidingSet::default();
        set.try_add(1u32);
        set.try_add(2u32);
        assert_eq!(set.take(&1), Some(1));
        // Attempt 0 is free again; 3 lands there while 2 stays at attempt 1.
        assert!(set.try_add(3));
        assert_eq!(set.mapper.get(7), Some(3));
        assert!(set.contains(&2));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn remove_where_counts_removed_values() {
        let set: SafeSet<u32> = (0..100).collect();
        assert_eq!(set.len(), 100);
        assert_eq!(set.remove_where(|v| v % 2 == 0), 50);
        assert_eq!(set.len(), 50);
        assert!(set.iter().all(|v| v % 2 == 1));
    }

    #[test]
    fn clear_and_drain() {
        let set = SafeSet::with_probing(3);
        for value in ["a", "b", "c"] {
            set.try_add(value);
        }
        let mut drained: Vec<_> = set.drain().collect();
        drained.sort_unstable();
        assert_eq!(drained, vec!["a", "b", "c"]);
        assert!(set.is_empty());
        set.try_add("d");
        set.clear();
        assert!(!set.contains(&"d"));
        assert_eq!(set.probing(), 3);
    }

    #[derive(Clone, Debug, Eq)]
    struct Entry {
        key: u32,
        value: &'static str,
    }

    // Identity is the key alone, so the set can act as a map.
    impl PartialEq for Entry {
        fn eq(&self, other: &Self) -> bool {
            self.key == other.key
        }
    }

    impl Hash for Entry {
        fn hash<H: Hasher>(&self, state: &mut H) {
            self.key.hash(state);
        }
    }

    fn entry(key: u32, value: &'static str) -> Entry {
        Entry { key, value }
    }

    #[test]
    fn keyed_lookups_by_hash_and_predicate() {
        let set = SafeSet::new();
        assert!(set.try_add(entry(1, "one")));
        assert!(set.try_add(entry(2, "two")));
        assert!(!set.try_add(entry(2, "deux")));

        let hash = set.hasher().hash_one(2u32) as u32;
        assert!(set.contains_by(hash, |e| e.key == 2));
        assert!(!set.contains_by(hash, |e| e.key == 3));
        assert_eq!(set.get_by(hash, |e| e.key == 2).map(|e| e.value), Some("two"));
        assert!(set.get_by(hash, |e| e.key == 3).is_none());

        assert!(set.take_by(hash, |e| e.value == "deux").is_none());
        assert_eq!(set.take_by(hash, |e| e.key == 2).map(|e| e.value), Some("two"));
        assert!(!set.contains_by(hash, |e| e.key == 2));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn predicate_lookups_walk_the_collision_chain() {
        let set = CollidingSet::default();
        for key in 0..4 {
            set.add_new(entry(key, "v")).unwrap();
        }
        assert_eq!(set.get_by(7, |e| e.key == 3).map(|e| e.key), Some(3));
        assert_eq!(set.take_by(7, |e| e.key == 2).map(|e| e.key), Some(2));
        assert!(!set.contains_by(7, |e| e.key == 2));
        assert!(set.contains_by(7, |e| e.key == 3));
        // A hash outside the chain sees nothing.
        assert!(!set.contains_by(100, |_| true));
    }

    #[test]
    fn a_removed_chain_head_lets_a_later_value_be_added_again() {
        let set = CollidingSet::default();
        set.try_add(1u32);
        set.try_add(2u32);
        assert!(set.remove(&1));
        // The duplicate check stops at the now free head of the chain.
        assert!(set.try_add(2));
        assert_eq!(set.len(), 2);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![2, 2]);
    }

    #[test]
    fn filtered_iteration_and_draining() {
        let set: SafeSet<u32> = (0..20).collect();
        let mut small: Vec<_> = set.iter_where(|v| *v < 5).collect();
        small.sort_unstable();
        assert_eq!(small, vec![0, 1, 2, 3, 4]);
        assert_eq!(set.len(), 20);

        let mut removed: Vec<_> = set.drain_where(|v| v % 5 == 0).collect();
        removed.sort_unstable();
        assert_eq!(removed, vec![0, 5, 10, 15]);
        assert_eq!(set.len(), 16);
        assert!(set.iter_where(|v| v % 5 == 0).next().is_none());
    }

    #[test]
    fn copy_to_forwards_to_the_map() {
        let set = CollidingSet::default();
        for value in [10u32, 20, 30] {
            set.try_add(value);
        }
        let mut dest = [0u32; 4];
        assert_eq!(set.copy_to(&mut dest, 1), Ok(3));
        // Collisions are laid out in chain order.
        assert_eq!(dest, [0, 10, 20, 30]);
        assert_eq!(
            set.copy_to(&mut dest, 2),
            Err(CopyError::InsufficientCapacity {
                needed: 3,
                available: 2
            })
        );
    }
}

//! Branch: the internal trie node and the lock-free grow / publish / remove /
//! shrink protocols.
//!
//! A branch covers one 4-bit nibble of the address at bit `offset`. The root
//! sits at offset 28 and terminal branches at offset 0; only terminal
//! branches hold leaves and only non-terminal branches hold branches.
//!
//! Every cross-thread coordination point is a single load or CAS on one word.
//! Nodes unlinked by a CAS are retired through the epoch collector, so a thread
//! still holding a stale reference never observes freed or recycled memory.
//!
//! Shrinking is two steps. An empty branch is first sealed by swapping its
//! occupancy counter from zero to [`SEALED`]; from then on no slot of it can be
//! filled. It is then detached from its parent. Any thread that runs into a
//! sealed branch performs the detach itself, so a shrinker that stalls between
//! the two steps never holds up writers.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_epoch::Guard;

use crate::leaf::Leaf;
use crate::pool::Pool;
use crate::slot::{retire_leaf, Child, Slot, Word};

// ================================================================================================
// CONSTANTS
// ================================================================================================

/// Address bits consumed per trie level.
pub(crate) const NIBBLE_BITS: u32 = 4;

/// Slots per branch.
pub(crate) const WIDTH: usize = 1 << NIBBLE_BITS;

/// Bit offset of the root branch (most-significant nibble of a u32).
pub(crate) const ROOT_OFFSET: u32 = u32::BITS - NIBBLE_BITS;

/// Occupancy value of a branch that is empty for good and awaits detaching.
const SEALED: usize = 1 << (usize::BITS - 1);

/// pure CPU hints before any yield
const SPIN_BEFORE_YIELD: i32 = 128;

pub(crate) type BranchPool<T> = Pool<Branch<T>>;

// ================================================================================================
// BRANCH
// ================================================================================================

pub(crate) struct Branch<T> {
    offset: u32,
    // Position under `parent`; both are fixed from publish until recycle.
    nibble: usize,
    parent: *const Branch<T>,
    // Occupied slots plus fills in flight. Reserved before the CAS that fills a
    // slot and released after the CAS that empties one, so it never drops
    // below the true occupancy. `SEALED` once the branch is being pruned.
    count: AtomicUsize,
    slots: [Slot<T>; WIDTH],
    _values: PhantomData<Box<Leaf<T>>>,
}

// SAFETY: the parent pointer is only dereferenced while the thread is pinned, and
// the epoch collector delays reclamation of every unlinked branch until then.
// All shared mutable state is in atomics.
unsafe impl<T: Send + Sync> Send for Branch<T> {}
unsafe impl<T: Send + Sync> Sync for Branch<T> {}

/// A detached branch waiting out the grace period before donation.
struct Retired<T>(*mut Branch<T>);

// SAFETY: once the grace period elapses the retiring thread is the only owner.
unsafe impl<T: Send + Sync> Send for Retired<T> {}

impl<T> Retired<T> {
    fn into_box(self) -> Box<Branch<T>> {
        // SAFETY: the pointer came from `Box::into_raw` and was unlinked by the
        // CAS that created this `Retired`.
        unsafe { Box::from_raw(self.0) }
    }
}

impl<T> Branch<T> {
    pub(crate) fn new(offset: u32, parent: *const Branch<T>, nibble: usize) -> Self {
        Self {
            offset,
            nibble,
            parent,
            count: AtomicUsize::new(0),
            slots: std::array::from_fn(|_| Slot::new()),
            _values: PhantomData,
        }
    }

    /// The root branch of an empty trie.
    pub(crate) fn root() -> Self {
        Self::new(ROOT_OFFSET, ptr::null(), 0)
    }

    /// Pool recycle callback. Donated branches are already empty, so nothing
    /// is freed here.
    pub(crate) fn recycle(branch: &mut Branch<T>) {
        for slot in &mut branch.slots {
            slot.reset();
        }
        *branch.count.get_mut() = 0;
        branch.parent = ptr::null();
    }

    /// Draw a branch from the pool (or allocate one) and initialize it.
    fn acquire(
        pool: &BranchPool<T>,
        offset: u32,
        parent: *const Branch<T>,
        nibble: usize,
    ) -> Box<Self> {
        match pool.try_take() {
            Some(mut branch) => {
                branch.offset = offset;
                branch.parent = parent;
                branch.nibble = nibble;
                branch
            }
            None => Box::new(Self::new(offset, parent, nibble)),
        }
    }

    #[inline]
    fn subindex(&self, index: u32) -> usize {
        ((index >> self.offset) & 0xF) as usize
    }

    #[inline]
    fn slot(&self, index: u32) -> &Slot<T> {
        &self.slots[self.subindex(index)]
    }

    #[cfg(test)]
    pub(crate) fn occupancy(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Count one more occupant ahead of filling a slot. Fails on a sealed
    /// branch.
    #[inline]
    fn reserve(&self) -> bool {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                ((n & SEALED) == 0).then_some(n + 1)
            })
            .is_ok()
    }

    /// Swap the occupancy from zero to `SEALED`. Only an empty branch with no
    /// fill in flight can be sealed.
    fn seal(&self) -> bool {
        self.count
            .compare_exchange(0, SEALED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // ============================================================================================
    // DESCENT
    // ============================================================================================

    /// Read-only descent to the terminal branch for `index`. Never allocates.
    fn find<'g>(&'g self, index: u32, guard: &'g Guard) -> Option<&'g Branch<T>> {
        let mut branch = self;
        while branch.offset > 0 {
            match branch.slot(index).load(guard).child() {
                Child::Branch(child) => branch = child,
                Child::Empty | Child::Leaf(_) => return None,
            }
        }
        Some(branch)
    }

    /// Run `f` on the value stored at `index`.
    pub(crate) fn with_value<'g, R>(
        &'g self,
        index: u32,
        guard: &'g Guard,
        f: impl FnOnce(&T) -> R,
    ) -> Option<R> {
        let target = self.find(index, guard)?;
        match target.slot(index).load(guard).child() {
            Child::Leaf(leaf) => Some(f(leaf.value())),
            Child::Empty | Child::Branch(_) => None,
        }
    }

    // ============================================================================================
    // ORDERED COLLECTION
    // ============================================================================================

    /// Collect the leaves of the first terminal branch holding an address
    /// `>= cursor`, in ascending address order.
    ///
    /// `base` is the first address this branch covers. Returns the cursor to
    /// resume from, or `None` if nothing at or after `cursor` remains.
    pub(crate) fn collect_chunk(
        &self,
        base: u64,
        cursor: u64,
        out: &mut Vec<(u32, T)>,
        guard: &Guard,
    ) -> Option<u64>
    where
        T: Clone,
    {
        let first = if cursor > base {
            ((cursor - base) >> self.offset) as usize
        } else {
            0
        };
        for n in first..WIDTH {
            let slot_base = base + ((n as u64) << self.offset);
            match self.slots[n].load(guard).child() {
                Child::Empty => {}
                Child::Leaf(leaf) => {
                    if slot_base >= cursor {
                        out.push((slot_base as u32, leaf.value().clone()));
                    }
                }
                Child::Branch(child) => {
                    if let Some(next) = child.collect_chunk(slot_base, cursor, out, guard) {
                        return Some(next);
                    }
                }
            }
        }
        if self.offset == 0 && !out.is_empty() {
            Some(base + WIDTH as u64)
        } else {
            None
        }
    }

    #[cfg(test)]
    pub(crate) fn reachable_branches(&self, guard: &Guard) -> usize {
        self.slots
            .iter()
            .map(|slot| match slot.load(guard).child() {
                Child::Branch(child) => 1 + child.reachable_branches(guard),
                Child::Empty | Child::Leaf(_) => 0,
            })
            .sum()
    }
}

impl<T: Send + Sync + 'static> Branch<T> {
    /// Write descent to the terminal branch for `index`, installing missing
    /// branches on the way.
    ///
    /// Returns `None` when the path ran into a sealed branch; by then that
    /// branch has been detached and the caller restarts from the root.
    fn grow<'g>(
        &'g self,
        index: u32,
        pool: &Arc<BranchPool<T>>,
        guard: &'g Guard,
    ) -> Option<&'g Branch<T>> {
        let mut branch = self;
        while branch.offset > 0 {
            let nibble = branch.subindex(index);
            let slot = &branch.slots[nibble];
            let mut current = slot.load(guard);
            branch = loop {
                match current.child() {
                    Child::Branch(child) => break child,
                    Child::Leaf(_) => unreachable!("leaf above the terminal level"),
                    Child::Empty => {
                        if !branch.reserve() {
                            branch.detach(pool, guard);
                            return None;
                        }
                        let fresh = Box::into_raw(Self::acquire(
                            pool,
                            branch.offset - NIBBLE_BITS,
                            branch,
                            nibble,
                        ));
                        match slot.compare_exchange(current, Word::branch(fresh), guard) {
                            // SAFETY: published just now; reclamation of anything
                            // reachable is deferred past this guard.
                            Ok(()) => break unsafe { &*fresh },
                            Err(actual) => {
                                // SAFETY: the CAS failed, so no other thread ever saw it.
                                pool.donate(unsafe { Box::from_raw(fresh) });
                                branch.release(pool, guard);
                                #[cfg(feature = "tracing")]
                                tracing::trace!(
                                    offset = branch.offset,
                                    nibble,
                                    "grow: lost install race"
                                );
                                current = actual;
                            }
                        }
                    }
                }
            };
        }
        Some(branch)
    }

    // ============================================================================================
    // OPERATIONS (called on the root)
    // ============================================================================================

    /// Publish `value` at `index` unconditionally.
    ///
    /// Returns the displaced leaf, already retired but readable under `guard`,
    /// or `None` if the slot was empty.
    pub(crate) fn replace<'g>(
        &'g self,
        index: u32,
        value: T,
        pool: &Arc<BranchPool<T>>,
        guard: &'g Guard,
    ) -> Option<&'g Leaf<T>> {
        let leaf = Box::into_raw(Box::new(Leaf::new(value)));
        let mut spins = 0;
        loop {
            if let Some(target) = self.grow(index, pool, guard) {
                let slot = target.slot(index);
                let mut current = slot.load(guard);
                loop {
                    match current.child() {
                        Child::Empty => {
                            if !target.reserve() {
                                target.detach(pool, guard);
                                break;
                            }
                            match slot.compare_exchange(current, Word::leaf(leaf), guard) {
                                Ok(()) => return None,
                                Err(actual) => {
                                    target.release(pool, guard);
                                    current = actual;
                                }
                            }
                        }
                        Child::Leaf(previous) => {
                            match slot.compare_exchange(current, Word::leaf(leaf), guard) {
                                Ok(()) => {
                                    // SAFETY: our CAS unlinked `previous`.
                                    unsafe { retire_leaf(previous, guard) };
                                    return Some(previous);
                                }
                                Err(actual) => current = actual,
                            }
                        }
                        Child::Branch(_) => unreachable!("branch at the terminal level"),
                    }
                }
            }
            delay(&mut spins);
        }
    }

    /// Publish `value` at `index` only if the slot is empty.
    ///
    /// On failure `occupied(existing, rejected)` is evaluated against the value
    /// found in the slot, and its result is returned with the rejected value.
    pub(crate) fn insert<'g, R>(
        &'g self,
        index: u32,
        value: T,
        occupied: impl FnOnce(&T, &T) -> R,
        pool: &Arc<BranchPool<T>>,
        guard: &'g Guard,
    ) -> Result<(), (R, T)> {
        let leaf = Box::into_raw(Box::new(Leaf::new(value)));
        let mut spins = 0;
        loop {
            if let Some(target) = self.grow(index, pool, guard) {
                let slot = target.slot(index);
                let mut current = slot.load(guard);
                loop {
                    match current.child() {
                        Child::Empty => {
                            if !target.reserve() {
                                target.detach(pool, guard);
                                break;
                            }
                            match slot.compare_exchange(current, Word::leaf(leaf), guard) {
                                Ok(()) => return Ok(()),
                                Err(actual) => {
                                    target.release(pool, guard);
                                    current = actual;
                                }
                            }
                        }
                        Child::Leaf(existing) => {
                            // SAFETY: `leaf` was never published.
                            let rejected = unsafe { Box::from_raw(leaf) };
                            let verdict = occupied(existing.value(), rejected.value());
                            return Err((verdict, rejected.into_value()));
                        }
                        Child::Branch(_) => unreachable!("branch at the terminal level"),
                    }
                }
            }
            delay(&mut spins);
        }
    }

    /// Unlink the leaf at `index` if `check` accepts its value.
    ///
    /// The CAS targets the exact leaf `check` inspected, so a value swapped in
    /// between the check and the unlink is never removed by mistake. If the
    /// leaf changes underneath, `check` runs again on the new one.
    pub(crate) fn remove_where<'g>(
        &'g self,
        index: u32,
        mut check: impl FnMut(&T) -> bool,
        pool: &Arc<BranchPool<T>>,
        guard: &'g Guard,
    ) -> Option<&'g Leaf<T>> {
        let target = self.find(index, guard)?;
        let slot = target.slot(index);
        let mut current = slot.load(guard);
        loop {
            let Child::Leaf(leaf) = current.child() else {
                return None;
            };
            if !check(leaf.value()) {
                return None;
            }
            match slot.compare_exchange(current, Word::empty(), guard) {
                Ok(()) => {
                    // SAFETY: our CAS unlinked `leaf`.
                    unsafe { retire_leaf(leaf, guard) };
                    target.release(pool, guard);
                    return Some(leaf);
                }
                Err(actual) => current = actual,
            }
        }
    }

    // ============================================================================================
    // SHRINK
    // ============================================================================================

    /// Give back one occupant; prune the branch if that left it empty.
    fn release(&self, pool: &Arc<BranchPool<T>>, guard: &Guard) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shrink(pool, guard);
        }
    }

    /// Seal this branch if it is still empty, then detach it.
    ///
    /// A shrink that finds the branch refilled just leaves it in place. The
    /// root never shrinks.
    fn shrink(&self, pool: &Arc<BranchPool<T>>, guard: &Guard) {
        if self.parent.is_null() {
            return;
        }
        if !self.seal() {
            #[cfg(feature = "tracing")]
            tracing::debug!(offset = self.offset, "shrink: abandoned, branch refilled");
            return;
        }
        self.detach(pool, guard);
    }

    /// Unlink a sealed branch from its parent. Safe to race: exactly one caller
    /// wins the parent CAS, and only the winner retires the branch and gives
    /// back its place in the parent.
    fn detach(&self, pool: &Arc<BranchPool<T>>, guard: &Guard) {
        // SAFETY: a parent outlives the pinned window in which its child was
        // reached; it may be unlinked but is not reclaimed before we unpin.
        let Some(parent) = (unsafe { self.parent.as_ref() }) else {
            return;
        };
        let this = self as *const Branch<T> as *mut Branch<T>;
        if parent.slots[self.nibble]
            .compare_exchange(Word::branch(this), Word::empty(), guard)
            .is_err()
        {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(offset = self.offset, "shrink: branch detached");

        let retired = Retired(this);
        let recycle_into = Arc::clone(pool);
        guard.defer(move || recycle_into.donate(retired.into_box()));

        parent.release(pool, guard);
    }
}

impl<T> Drop for Branch<T> {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            // SAFETY: dropping a branch means owning it; every occupant still
            // linked below it belongs to it alone.
            unsafe { slot.free_occupant() };
        }
    }
}

// ================================================================================================
// UTILITY FUNCTIONS
// ================================================================================================

#[inline(always)]
fn try_spin(spins: &mut i32) -> bool {
    if *spins < SPIN_BEFORE_YIELD {
        *spins += *spins + 1;
        std::hint::spin_loop();
        true
    } else {
        false
    }
}

/// Back off between restarts caused by a concurrent shrink.
#[inline(always)]
fn delay(spins: &mut i32) {
    if !try_spin(spins) {
        *spins = 0;
        thread::yield_now();
    }
}

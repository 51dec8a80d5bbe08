//! Atomic child slots and the tagged word they hold.
//!
//! A slot is one pointer-sized atomic word:
//!
//! ```text
//! null        Empty
//! ptr | LEAF  Leaf    (ptr is a *Leaf<T>)
//! ptr         Branch  (ptr is a *Branch<T>)
//! ```
//!
//! Every access goes through an atomic load or compare-and-swap; decoding the
//! word always yields the closed [`Child`] enum.

use std::sync::atomic::Ordering;

use crossbeam_epoch::{Atomic, Guard, Shared};

use crate::branch::Branch;
use crate::leaf::Leaf;

const LEAF: usize = 0b01;

/// Decoded occupant of a slot, borrowed for the lifetime of the guard.
pub(crate) enum Child<'g, T> {
    Empty,
    Leaf(&'g Leaf<T>),
    Branch(&'g Branch<T>),
}

/// A raw slot word as observed by a load; also the expected value of a CAS.
pub(crate) struct Word<'g, T>(Shared<'g, Branch<T>>);

impl<T> Clone for Word<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Word<'_, T> {}

impl<'g, T> Word<'g, T> {
    pub(crate) fn empty() -> Self {
        Word(Shared::null())
    }

    pub(crate) fn leaf(leaf: *const Leaf<T>) -> Self {
        Word(Shared::from(leaf as *const Branch<T>).with_tag(LEAF))
    }

    pub(crate) fn branch(branch: *const Branch<T>) -> Self {
        Word(Shared::from(branch))
    }

    /// Decode the word.
    pub(crate) fn child(self) -> Child<'g, T> {
        if self.0.is_null() {
            Child::Empty
        } else if self.0.tag() & LEAF != 0 {
            // SAFETY: LEAF-tagged words are only produced by `Word::leaf` from a
            // live leaf; the guard keeps it from being reclaimed.
            Child::Leaf(unsafe { &*(self.0.as_raw() as *const Leaf<T>) })
        } else {
            // SAFETY: untagged non-null words point at a published branch; the
            // guard keeps it from being reclaimed or recycled.
            Child::Branch(unsafe { self.0.deref() })
        }
    }
}

/// One child position of a branch.
pub(crate) struct Slot<T> {
    word: Atomic<Branch<T>>,
}

impl<T> Slot<T> {
    pub(crate) fn new() -> Self {
        Self {
            word: Atomic::null(),
        }
    }

    #[inline]
    pub(crate) fn load<'g>(&self, guard: &'g Guard) -> Word<'g, T> {
        Word(self.word.load(Ordering::Acquire, guard))
    }

    /// Replace `current` with `new`; on failure returns the word actually held.
    #[inline]
    pub(crate) fn compare_exchange<'g>(
        &self,
        current: Word<'_, T>,
        new: Word<'_, T>,
        guard: &'g Guard,
    ) -> Result<(), Word<'g, T>> {
        self.word
            .compare_exchange(current.0, new.0, Ordering::AcqRel, Ordering::Acquire, guard)
            .map(|_| ())
            .map_err(|e| Word(e.current))
    }

    /// Forget the occupant without freeing it. Only valid on an exclusively
    /// owned slot whose occupant has already been detached or was never there.
    pub(crate) fn reset(&mut self) {
        self.word = Atomic::null();
    }

    /// Free the occupant, recursively for branches.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the whole subtree: no other
    /// thread may hold a reference into it.
    pub(crate) unsafe fn free_occupant(&mut self) {
        let guard = crossbeam_epoch::unprotected();
        match self.load(guard).child() {
            Child::Empty => {}
            Child::Leaf(leaf) => drop(Box::from_raw(leaf as *const Leaf<T> as *mut Leaf<T>)),
            Child::Branch(branch) => {
                drop(Box::from_raw(branch as *const Branch<T> as *mut Branch<T>))
            }
        }
        self.reset();
    }
}

/// Schedule a detached leaf for destruction once no pinned thread can see it.
///
/// # Safety
///
/// `leaf` must have just been unlinked by a successful CAS performed by the
/// caller, so that it is retired exactly once.
pub(crate) unsafe fn retire_leaf<T>(leaf: &Leaf<T>, guard: &Guard) {
    guard.defer_destroy(Shared::from(leaf as *const Leaf<T>));
}

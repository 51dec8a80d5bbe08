//! Bounded recycling pool for trie nodes.
//!
//! Growth and shrink churn create and destroy branches at a high rate. Detached
//! branches are handed back here (after the epoch grace period) and reused by
//! later growth instead of going back to the allocator.
//!
//! Neither donating nor taking ever waits on another thread. When the pool is
//! at capacity a donated branch goes back to the allocator instead.

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    // Ids of the pools this thread is currently donating into.
    static DONATING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Fixed-capacity cache of boxed, reset instances.
pub(crate) struct Pool<B> {
    id: usize,
    // `None` when pooling is disabled (capacity 0).
    items: Option<ArrayQueue<Box<B>>>,
    recycle: fn(&mut B),
}

impl<B> Pool<B> {
    /// Create a pool holding at most `capacity` instances.
    ///
    /// `recycle` runs on every donated instance before it is queued and must
    /// clear anything that could keep other objects alive.
    pub(crate) fn new(capacity: usize, recycle: fn(&mut B)) -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            items: (capacity > 0).then(|| ArrayQueue::new(capacity)),
            recycle,
        }
    }

    /// Reset `item` and keep it for reuse if there is room.
    ///
    /// A donation issued from inside another donation to the same pool on the
    /// same thread is dropped instead of queued.
    pub(crate) fn donate(&self, mut item: Box<B>) {
        let Some(queue) = &self.items else {
            return;
        };
        let Some(_scope) = DonateScope::enter(self.id) else {
            #[cfg(feature = "tracing")]
            tracing::trace!(pool = self.id, "donate: re-entrant donation dropped");
            return;
        };
        (self.recycle)(&mut item);
        if queue.push(item).is_err() {
            #[cfg(feature = "tracing")]
            tracing::trace!(pool = self.id, "donate: pool full, instance dropped");
        }
    }

    /// Take a previously donated instance, if any.
    ///
    /// The instance carries whatever state `recycle` left behind.
    pub(crate) fn try_take(&self) -> Option<Box<B>> {
        self.items.as_ref()?.pop()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.items.as_ref().map_or(0, ArrayQueue::capacity)
    }

    pub(crate) fn len(&self) -> usize {
        self.items.as_ref().map_or(0, ArrayQueue::len)
    }
}

/// Marks a pool as "inside donate" for the current thread until dropped.
struct DonateScope {
    id: usize,
}

impl DonateScope {
    fn enter(id: usize) -> Option<Self> {
        // Deferred donations can run while thread locals are being torn down;
        // refuse in that case rather than panic.
        DONATING
            .try_with(|active| {
                let mut active = active.borrow_mut();
                if active.contains(&id) {
                    None
                } else {
                    active.push(id);
                    Some(Self { id })
                }
            })
            .ok()
            .flatten()
    }
}

impl Drop for DonateScope {
    fn drop(&mut self) {
        let _ = DONATING.try_with(|active| active.borrow_mut().retain(|&id| id != self.id));
    }
}

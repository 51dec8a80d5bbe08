/// Terminal trie node: one stored value at one exact address.
///
/// A leaf is immutable once published into a slot. Writers always publish a
/// fresh leaf and retire the one they displaced.
// The two low pointer bits carry the slot tag, so leaves need at least 4-byte
// alignment regardless of `T`.
#[repr(align(8))]
pub(crate) struct Leaf<T> {
    value: T,
}

impl<T> Leaf<T> {
    pub(crate) fn new(value: T) -> Self {
        Self { value }
    }

    #[inline]
    pub(crate) fn value(&self) -> &T {
        &self.value
    }

    /// Recover the value of a leaf that was never published.
    pub(crate) fn into_value(self: Box<Self>) -> T {
        self.value
    }
}

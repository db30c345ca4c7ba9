use std::cell::UnsafeCell;

/// Fixed-size byte storage shared by a producer and a consumer.
///
/// The ring does no bookkeeping of its own. Callers guarantee that a byte is
/// only touched by the side that currently owns it: the producer owns the free
/// span starting at its write offset, the consumer owns the readable span
/// starting at its read offset, and ownership only changes hands after the
/// bytes have been copied.
pub(crate) struct Ring {
    cells: Box<[UnsafeCell<u8>]>,
}

// SAFETY: all access goes through the unsafe methods below, whose callers
// keep producer and consumer spans disjoint.
unsafe impl Sync for Ring {}

impl Ring {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            cells: (0..capacity).map(|_| UnsafeCell::new(0)).collect(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.cells.len()
    }

    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.cells.as_ptr())
    }

    /// Copies `data` in starting at `offset`, wrapping at the end.
    ///
    /// # Safety
    /// The caller must own the `data.len()` bytes starting at `offset`.
    pub(crate) unsafe fn write(&self, offset: usize, data: &[u8]) {
        let capacity = self.capacity();
        debug_assert!(offset < capacity && data.len() <= capacity);
        let first = data.len().min(capacity - offset);
        // SAFETY: both spans lie inside the ring and are owned by the caller.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.base().add(offset), first);
            std::ptr::copy_nonoverlapping(data.as_ptr().add(first), self.base(), data.len() - first);
        }
    }

    /// Copies `out.len()` bytes out starting at `offset`, wrapping at the end.
    ///
    /// # Safety
    /// The caller must own the `out.len()` bytes starting at `offset`.
    pub(crate) unsafe fn read(&self, offset: usize, out: &mut [u8]) {
        let capacity = self.capacity();
        debug_assert!(offset < capacity && out.len() <= capacity);
        let first = out.len().min(capacity - offset);
        // SAFETY: both spans lie inside the ring and are owned by the caller.
        unsafe {
            std::ptr::copy_nonoverlapping(self.base().add(offset), out.as_mut_ptr(), first);
            std::ptr::copy_nonoverlapping(self.base(), out.as_mut_ptr().add(first), out.len() - first);
        }
    }

    /// # Safety
    /// `offset + len` must not pass the end of the ring, the caller must own
    /// that span, and no other reference into it may exist while the returned
    /// slice lives.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn span_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.capacity());
        // SAFETY: guaranteed by the caller.
        unsafe { std::slice::from_raw_parts_mut(self.base().add(offset), len) }
    }

    /// # Safety
    /// `offset + len` must not pass the end of the ring and the caller must own
    /// that span while the returned slice lives.
    pub(crate) unsafe fn span(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.capacity());
        // SAFETY: guaranteed by the caller.
        unsafe { std::slice::from_raw_parts(self.base().add(offset), len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_wrap_around_the_end() {
        let ring = Ring::new(8);
        unsafe { ring.write(6, &[1, 2, 3, 4]) };
        let mut out = [0u8; 4];
        unsafe { ring.read(6, &mut out) };
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(unsafe { ring.span(0, 2) }, &[3, 4]);
    }

    #[test]
    fn spans_see_earlier_writes() {
        let ring = Ring::new(4);
        unsafe { ring.span_mut(1, 2) }.copy_from_slice(&[9, 8]);
        let mut out = [0u8; 2];
        unsafe { ring.read(1, &mut out) };
        assert_eq!(out, [9, 8]);
    }
}

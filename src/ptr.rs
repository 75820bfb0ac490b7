//! Shared, bounded views into raw storage.

use std::{
    fmt,
    ops::{Bound, Deref, RangeBounds},
    slice,
    sync::Arc,
};

use crate::{
    error::BufError,
    raw::{page_size, RawBuf},
};

/// A bounded view (offset + length) into a reference-counted [`RawBuf`].
///
/// Cloning is cheap and shares the underlying storage; in-place mutation goes
/// through copy-on-write, so no `BufPtr` ever observes a mutation performed
/// through a different `BufPtr`.
///
/// Invariant: `off + len <= raw.len()` whenever a raw is attached; a detached
/// view has zero offset and length.
#[derive(Clone, Default)]
pub struct BufPtr {
    raw: Option<Arc<RawBuf>>,
    off: usize,
    len: usize,
}

impl BufPtr {
    /// A view over `len` bytes of fresh, zeroed heap storage.
    pub fn new(len: usize) -> Self {
        Self::from_raw(RawBuf::create(len))
    }

    /// Copies `data` into fresh heap storage.
    pub fn copy_from(data: &[u8]) -> Self {
        Self::from_raw(RawBuf::copy(data))
    }

    /// Wraps a raw region, becoming its sole owner.
    pub fn from_raw(raw: RawBuf) -> Self {
        let len = raw.len();
        BufPtr {
            raw: Some(Arc::new(raw)),
            off: 0,
            len,
        }
    }

    /// A view over caller-owned `'static` memory; see
    /// [`RawBuf::create_static`].
    pub fn from_static(data: &'static [u8]) -> Self {
        Self::from_raw(RawBuf::create_static(data))
    }

    /// Viewed length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of live views sharing this raw region, zero when detached.
    pub fn ref_count(&self) -> usize {
        self.raw.as_ref().map_or(0, Arc::strong_count)
    }

    /// Shrinks or grows the viewed length, bounded by the raw region's
    /// capacity past the view offset. Storage is zeroed at allocation, so
    /// growing into capacity never exposes undefined bytes.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds that capacity.
    pub fn set_len(&mut self, len: usize) {
        let capacity = match &self.raw {
            Some(raw) => raw.len() - self.off,
            None => 0,
        };
        assert!(len <= capacity, "set_len out of range");
        self.len = len;
    }

    /// The viewed bytes.
    pub fn as_slice(&self) -> &[u8] {
        match &self.raw {
            Some(raw) => unsafe {
                slice::from_raw_parts(raw.data().as_ptr().add(self.off), self.len)
            },
            None => &[],
        }
    }

    /// Mutable access to the viewed bytes.
    ///
    /// Forces a copy-on-write clone first when the raw region is shared, and
    /// always clones off read-only static storage, so the returned slice is
    /// exclusively owned.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.raw.is_none() {
            return &mut [];
        }
        if !self.is_unique_writable() {
            self.clone_in_place();
        }
        let Some(raw) = &self.raw else { unreachable!() };
        unsafe { slice::from_raw_parts_mut(raw.data().as_ptr().add(self.off), self.len) }
    }

    fn is_unique_writable(&self) -> bool {
        match &self.raw {
            Some(raw) => Arc::strong_count(raw) == 1 && raw.writable(),
            None => false,
        }
    }

    /// A fully independent copy of this view, backed by a deep clone of the
    /// whole raw region.
    pub fn deep_clone(&self) -> BufPtr {
        match &self.raw {
            Some(raw) => BufPtr {
                raw: Some(Arc::new(raw.clone_contents())),
                off: self.off,
                len: self.len,
            },
            None => BufPtr::default(),
        }
    }

    /// Rebinds this view to an independent clone of its raw region, releasing
    /// the reference to the original.
    pub fn clone_in_place(&mut self) {
        if let Some(raw) = &self.raw {
            // build the clone before the old reference is dropped
            self.raw = Some(Arc::new(raw.clone_contents()));
        }
    }

    /// Clones in place only if the raw region is shared; returns whether a
    /// clone occurred.
    pub fn do_cow(&mut self) -> bool {
        match &self.raw {
            Some(raw) if Arc::strong_count(raw) > 1 => {
                self.raw = Some(Arc::new(raw.clone_contents()));
                true
            }
            _ => false,
        }
    }

    /// Drops the raw reference (freeing the region if this was the last
    /// view) and zeroes the bounds. Idempotent.
    pub fn release(&mut self) {
        self.raw = None;
        self.off = 0;
        self.len = 0;
    }

    /// A sub-range of this view, sharing the same raw region.
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds this view's length.
    pub fn subslice(&self, range: impl RangeBounds<usize>) -> BufPtr {
        let (off, len) = offset_len(self.len, range);
        match self.try_subslice(off, len) {
            Ok(ptr) => ptr,
            Err(_) => panic_out_of_range(),
        }
    }

    /// Fallible form of [`BufPtr::subslice`].
    pub fn try_subslice(&self, off: usize, len: usize) -> Result<BufPtr, BufError> {
        if off.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(BufError::OutOfRange {
                offset: off,
                length: len,
                available: self.len,
            });
        }
        Ok(BufPtr {
            raw: self.raw.clone(),
            off: self.off + off,
            len,
        })
    }

    /// Whether the view's starting address is a multiple of the page size.
    pub fn is_page_aligned(&self) -> bool {
        match &self.raw {
            Some(raw) => (raw.data().as_ptr() as usize + self.off) % page_size() == 0,
            None => false,
        }
    }

    /// Whether the viewed length is a whole number of pages.
    pub fn is_n_page_sized(&self) -> bool {
        self.len % page_size() == 0
    }
}

fn offset_len(len: usize, range: impl RangeBounds<usize>) -> (usize, usize) {
    let offset = match range.start_bound() {
        Bound::Included(&n) => n,
        Bound::Excluded(&n) => n.checked_add(1).unwrap_or_else(|| panic_out_of_range()),
        Bound::Unbounded => 0,
    };
    let end = match range.end_bound() {
        Bound::Included(&n) => n.checked_add(1).unwrap_or_else(|| panic_out_of_range()),
        Bound::Excluded(&n) => n,
        Bound::Unbounded => len,
    };
    let sub_len = end.checked_sub(offset).unwrap_or_else(|| panic_out_of_range());
    (offset, sub_len)
}

#[cold]
fn panic_out_of_range() -> ! {
    panic!("out of range")
}

impl Deref for BufPtr {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for BufPtr {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for BufPtr {
    fn from(data: Vec<u8>) -> Self {
        Self::from_raw(RawBuf::claim(data.into_boxed_slice()))
    }
}

impl fmt::Debug for BufPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufPtr")
            .field("off", &self.off)
            .field("len", &self.len)
            .field("refs", &self.ref_count())
            .finish()
    }
}

//! Raw storage: an allocation-strategy-tagged owner of a contiguous memory
//! region.
//!
//! Every [`RawBuf`] knows how to release its memory on drop; the strategy is
//! fixed at construction. Sharing and reference counting happen one level up,
//! in [`BufPtr`](crate::BufPtr), which wraps the raw in an `Arc`.

use std::{
    alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout},
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

static TOTAL_ALLOC: AtomicUsize = AtomicUsize::new(0);
static TRACK_ALLOC: AtomicBool = AtomicBool::new(true);

/// Total bytes currently allocated across all owning buffer variants.
///
/// Advisory instrumentation only; toggling tracking while buffers are live
/// skews the count.
pub fn total_allocated() -> usize {
    TOTAL_ALLOC.load(Ordering::Relaxed)
}

/// Enables or disables allocation accounting. Enabled by default.
pub fn track_allocations(enabled: bool) {
    TRACK_ALLOC.store(enabled, Ordering::Relaxed);
}

fn inc_total_alloc(len: usize) {
    if TRACK_ALLOC.load(Ordering::Relaxed) {
        TOTAL_ALLOC.fetch_add(len, Ordering::Relaxed);
    }
}

fn dec_total_alloc(len: usize) {
    if TRACK_ALLOC.load(Ordering::Relaxed) {
        TOTAL_ALLOC.fetch_sub(len, Ordering::Relaxed);
    }
}

/// The system virtual-memory page size, cached after the first query.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
            PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }
        size => size,
    }
}

pub(crate) fn round_up_to_page(len: usize) -> usize {
    let page = page_size();
    len.div_ceil(page) * page
}

#[cold]
fn capacity_overflow() -> ! {
    panic!("capacity overflow")
}

fn byte_layout(len: usize) -> Layout {
    Layout::array::<u8>(len).unwrap_or_else(|_| capacity_overflow())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Storage {
    /// Rust global allocator; also backs claimed `Box<[u8]>` memory.
    Heap,
    /// libc `malloc`/`free` family, for interop with code expecting malloc'd
    /// memory.
    Malloc,
    /// Caller-owned `'static` memory; never freed, deep clones copy out.
    Static,
    /// `posix_memalign` to the page size, freed with `free`; for
    /// direct/unbuffered I/O.
    PageAligned,
}

/// An owned (or, for the static variant, borrowed) contiguous memory region.
///
/// Construction selects the allocation strategy; drop dispatches on it so
/// each variant's memory is released exactly once. Allocation failure is
/// fatal: callers never see a recoverable error from construction.
#[derive(Debug)]
pub struct RawBuf {
    data: NonNull<u8>,
    len: usize,
    storage: Storage,
}

// The region is exclusively owned (or immutable and 'static), and all
// mutation goes through uniquely-owned handles.
unsafe impl Send for RawBuf {}
unsafe impl Sync for RawBuf {}

impl RawBuf {
    /// Allocates `len` zeroed bytes through the global allocator.
    ///
    /// Zeroing keeps every byte of the region defined, so views may read (or
    /// grow into) capacity that was never written.
    pub fn create(len: usize) -> Self {
        let data = if len == 0 {
            NonNull::dangling()
        } else {
            let layout = byte_layout(len);
            NonNull::new(unsafe { alloc_zeroed(layout) })
                .unwrap_or_else(|| handle_alloc_error(layout))
        };
        inc_total_alloc(len);
        RawBuf {
            data,
            len,
            storage: Storage::Heap,
        }
    }

    /// Allocates a new heap region holding a copy of `src`.
    pub fn copy(src: &[u8]) -> Self {
        let raw = Self::create(src.len());
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), raw.data.as_ptr(), src.len()) };
        raw
    }

    /// Takes ownership of caller-supplied heap memory; freed identically to
    /// [`RawBuf::create`] storage at end of life.
    pub fn claim(buf: Box<[u8]>) -> Self {
        let len = buf.len();
        let data = if len == 0 {
            NonNull::dangling()
        } else {
            // a Box pointer is never null
            NonNull::new(Box::into_raw(buf) as *mut u8).unwrap()
        };
        inc_total_alloc(len);
        RawBuf {
            data,
            len,
            storage: Storage::Heap,
        }
    }

    /// Allocates `len` zeroed bytes with libc `calloc`.
    pub fn create_malloc(len: usize) -> Self {
        // calloc(0) may return null; always allocate at least one byte so the
        // pointer is uniformly freeable
        let size = len.max(1);
        let data = NonNull::new(unsafe { libc::calloc(size, 1) }.cast::<u8>())
            .unwrap_or_else(|| handle_alloc_error(byte_layout(size)));
        inc_total_alloc(len);
        RawBuf {
            data,
            len,
            storage: Storage::Malloc,
        }
    }

    /// Takes ownership of caller-supplied malloc'd memory, freeing it with
    /// `free` at end of life.
    ///
    /// # Safety
    ///
    /// `ptr` must be non-null, must have been allocated by the `malloc`
    /// family with at least `len` accessible bytes, and must not be freed or
    /// accessed by the caller afterwards.
    pub unsafe fn claim_malloc(len: usize, ptr: *mut u8) -> Self {
        debug_assert!(!ptr.is_null());
        inc_total_alloc(len);
        RawBuf {
            data: unsafe { NonNull::new_unchecked(ptr) },
            len,
            storage: Storage::Malloc,
        }
    }

    /// References caller-owned memory without taking ownership; the region is
    /// never freed, and deep clones copy the bytes out instead of retaining
    /// the pointer.
    pub fn create_static(data: &'static [u8]) -> Self {
        RawBuf {
            data: NonNull::new(data.as_ptr().cast_mut()).unwrap(),
            len: data.len(),
            storage: Storage::Static,
        }
    }

    /// Allocates `len` zeroed bytes aligned to the system page size.
    pub fn create_page_aligned(len: usize) -> Self {
        let page = page_size();
        let size = len.max(1);
        let mut data: *mut libc::c_void = ptr::null_mut();
        let rc = unsafe { libc::posix_memalign(&mut data, page, size) };
        if rc != 0 || data.is_null() {
            handle_alloc_error(
                Layout::from_size_align(size, page).unwrap_or_else(|_| capacity_overflow()),
            );
        }
        unsafe { ptr::write_bytes(data.cast::<u8>(), 0, size) };
        inc_total_alloc(len);
        RawBuf {
            // checked non-null above
            data: NonNull::new(data.cast::<u8>()).unwrap(),
            len,
            storage: Storage::PageAligned,
        }
    }

    /// Region length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn data(&self) -> NonNull<u8> {
        self.data
    }

    /// Static storage borrows caller memory and must never be written
    /// through.
    pub(crate) fn writable(&self) -> bool {
        self.storage != Storage::Static
    }

    /// A new, fully independent region with identical bytes.
    ///
    /// Variant-preserving, except static storage which clones into heap
    /// storage since the borrowed pointer cannot be retained.
    pub(crate) fn clone_contents(&self) -> Self {
        let new = match self.storage {
            Storage::Heap | Storage::Static => Self::create(self.len),
            Storage::Malloc => Self::create_malloc(self.len),
            Storage::PageAligned => Self::create_page_aligned(self.len),
        };
        unsafe { ptr::copy_nonoverlapping(self.data.as_ptr(), new.data.as_ptr(), self.len) };
        new
    }
}

impl Drop for RawBuf {
    fn drop(&mut self) {
        match self.storage {
            Storage::Heap => {
                if self.len != 0 {
                    unsafe { dealloc(self.data.as_ptr(), byte_layout(self.len)) };
                }
                dec_total_alloc(self.len);
            }
            Storage::Malloc | Storage::PageAligned => {
                unsafe { libc::free(self.data.as_ptr().cast()) };
                dec_total_alloc(self.len);
            }
            Storage::Static => {}
        }
    }
}

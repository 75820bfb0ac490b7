//! Reference-counted, copy-on-write byte buffers.
//!
//! [`RawBuf`] owns a contiguous memory region through one of several
//! allocation strategies (heap, malloc, caller-owned static, page-aligned).
//! [`BufPtr`] is a cheaply-shareable, cheaply-sliceable bounded view into one
//! raw region, with copy-on-write mutation. [`BufList`] composes views into
//! an ordered logical byte stream and provides page-alignment consolidation,
//! base64 armor hooks, and vectored file I/O with partial-write recovery.
//!
//! ```
//! use buflist::{BufList, BufPtr};
//!
//! let mut list = BufList::new();
//! list.append_slice(b"hello ");
//! list.append(BufPtr::from_static(b"world"));
//! assert_eq!(list.to_vec(), b"hello world");
//!
//! let mut shared = list.segments()[0].clone();
//! shared.as_mut_slice()[0] = b'H'; // copy-on-write: the list is untouched
//! assert_eq!(list.to_vec(), b"hello world");
//! ```

mod error;
mod list;
mod ptr;
mod raw;
mod sys;

pub use crate::{
    error::BufError,
    list::BufList,
    ptr::BufPtr,
    raw::{page_size, total_allocated, track_allocations, RawBuf},
};

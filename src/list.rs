//! Ordered segment lists forming one logical byte stream.

use std::{
    fmt::{self, Write as _},
    mem,
    os::fd::RawFd,
    path::Path,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::{error, warn};

use crate::{
    error::BufError,
    ptr::BufPtr,
    raw::{page_size, round_up_to_page, RawBuf},
    sys,
};

/// An ordered sequence of [`BufPtr`] segments; concatenating the segments'
/// bytes in order yields the logical content.
///
/// Appending shares segment storage without copying; flattening, base64
/// transforms and the page-alignment rebuild copy only where they must.
/// Segment-sequence mutation is not synchronized and requires external
/// exclusion if the list is shared across threads.
#[derive(Clone, Default)]
pub struct BufList {
    bufs: Vec<BufPtr>,
    len: usize,
}

impl BufList {
    pub const fn new() -> Self {
        BufList {
            bufs: Vec::new(),
            len: 0,
        }
    }

    /// Logical length: the sum of segment lengths.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The segments, in logical order.
    pub fn segments(&self) -> &[BufPtr] {
        &self.bufs
    }

    /// Appends a segment, sharing its storage. Zero-length segments are
    /// dropped.
    pub fn append(&mut self, ptr: BufPtr) {
        if ptr.is_empty() {
            return;
        }
        self.len += ptr.len();
        self.bufs.push(ptr);
    }

    /// Copies `data` into a fresh heap segment and appends it.
    pub fn append_slice(&mut self, data: &[u8]) {
        self.append(BufPtr::copy_from(data));
    }

    /// The flattened logical content.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for ptr in &self.bufs {
            out.extend_from_slice(ptr.as_slice());
        }
        out
    }

    /// Armors the logical content as base64 and appends the result to `out`
    /// as one segment.
    pub fn encode_base64(&self, out: &mut BufList) {
        let mut bp = BufPtr::new(self.len * 4 / 3 + 3);
        let encoded = STANDARD
            .encode_slice(self.to_vec(), bp.as_mut_slice())
            .expect("destination sized for worst-case expansion");
        bp.set_len(encoded);
        out.append(bp);
    }

    /// Decodes base64-armored content from `encoded` and appends the decoded
    /// bytes to `self` as one segment.
    ///
    /// Malformed input is rejected without appending anything; the error
    /// carries a hex dump of the offending bytes.
    pub fn decode_base64(&mut self, encoded: &BufList) -> Result<(), BufError> {
        let mut bp = BufPtr::new(4 + encoded.len() * 3 / 4);
        let decoded = STANDARD
            .decode_slice(encoded.to_vec(), bp.as_mut_slice())
            .map_err(|_| BufError::Malformed {
                dump: encoded.hexdump(),
            })?;
        bp.set_len(decoded);
        self.append(bp);
        Ok(())
    }

    /// Consolidates segments so the list is suitable for direct I/O.
    ///
    /// Segments that are already page-aligned and a whole number of pages are
    /// kept as zero-copy shares. Each maximal run of other segments — a run
    /// continues while the running byte offset is unaligned or the current
    /// segment is non-conforming — is collected into one new page-aligned
    /// segment. Only non-conforming stretches allocate; the flattened bytes
    /// are unchanged and the pass is idempotent up to reallocation of the
    /// final remainder.
    pub fn rebuild_page_aligned(&mut self) {
        let page = page_size();
        let mut rebuilt = Vec::with_capacity(self.bufs.len());
        let mut iter = mem::take(&mut self.bufs).into_iter().peekable();
        while let Some(ptr) = iter.next() {
            if ptr.is_empty() {
                continue;
            }
            if ptr.is_page_aligned() && ptr.is_n_page_sized() {
                rebuilt.push(ptr);
                continue;
            }
            let mut run_len = ptr.len();
            let mut run = vec![ptr];
            while let Some(next) = iter.peek() {
                if run_len % page == 0 && next.is_page_aligned() && next.is_n_page_sized() {
                    break;
                }
                let Some(next) = iter.next() else { break };
                run_len += next.len();
                run.push(next);
            }
            let mut consolidated =
                BufPtr::from_raw(RawBuf::create_page_aligned(round_up_to_page(run_len)));
            consolidated.set_len(run_len);
            let dst = consolidated.as_mut_slice();
            let mut off = 0;
            for seg in &run {
                dst[off..off + seg.len()].copy_from_slice(seg.as_slice());
                off += seg.len();
            }
            rebuilt.push(consolidated);
        }
        self.bufs = rebuilt;
    }

    /// Formats the logical content 16 bytes per row as
    /// `offset : hex bytes : printable-or-dot`. Diagnostic only.
    pub fn hexdump(&self) -> String {
        const PER_ROW: usize = 16;
        let bytes = self.to_vec();
        let mut out = String::new();
        for (row, chunk) in bytes.chunks(PER_ROW).enumerate() {
            // formatting into a String cannot fail
            let _ = write!(out, "{:04x} :", row * PER_ROW);
            for i in 0..PER_ROW {
                match chunk.get(i) {
                    Some(b) => {
                        let _ = write!(out, " {b:02x}");
                    }
                    None => out.push_str("   "),
                }
            }
            out.push_str(" : ");
            for &b in chunk {
                if b.is_ascii_alphanumeric() || b == b' ' || b.is_ascii_punctuation() {
                    out.push(b as char);
                } else {
                    out.push('.');
                }
            }
            out.push('\n');
        }
        out
    }

    /// Reads a whole regular file into a single page-aligned segment.
    ///
    /// A short read (the file shrank between size query and read) is not an
    /// error: the segment is truncated to the bytes actually read and a
    /// warning is logged unless `silent`. The descriptor is closed on every
    /// path.
    pub fn read_file(path: impl AsRef<Path>, silent: bool) -> Result<BufList, BufError> {
        Self::read_file_impl(path.as_ref(), silent)
    }

    fn read_file_impl(path: &Path, silent: bool) -> Result<BufList, BufError> {
        let fd = match sys::open_read(path) {
            Ok(fd) => fd,
            Err(err) => {
                if !silent {
                    error!(path = %path.display(), %err, "failed to open file");
                }
                return Err(err.into());
            }
        };
        let size = match sys::file_size(&fd) {
            Ok(size) => size,
            Err(err) => {
                if !silent {
                    error!(path = %path.display(), %err, "failed to stat file");
                }
                return Err(err.into());
            }
        };
        Self::read_sized(&fd, size, silent, path)
    }

    /// Reads `size` bytes from `fd` into one page-aligned segment. A short
    /// read truncates the segment to the bytes actually delivered.
    fn read_sized(fd: &sys::Fd, size: usize, silent: bool, path: &Path) -> Result<BufList, BufError> {
        let mut bp = BufPtr::from_raw(RawBuf::create_page_aligned(round_up_to_page(size)));
        let read = match sys::read_full(fd, &mut bp.as_mut_slice()[..size]) {
            Ok(read) => read,
            Err(err) => {
                if !silent {
                    error!(path = %path.display(), %err, "read error");
                }
                return Err(err.into());
            }
        };
        if read != size && !silent {
            // the file may have been truncated between stat and read
            warn!(path = %path.display(), expected = size, read, "premature EOF");
        }
        bp.set_len(read);
        let mut list = BufList::new();
        list.append(bp);
        Ok(list)
    }

    /// Writes the logical content to `path`, creating or truncating the file
    /// with the given permission mode.
    ///
    /// The descriptor is closed regardless of the writer's outcome; the first
    /// error encountered (open, write, or close) is propagated.
    pub fn write_file(&self, path: impl AsRef<Path>, mode: u32) -> Result<(), BufError> {
        self.write_file_impl(path.as_ref(), mode)
    }

    fn write_file_impl(&self, path: &Path, mode: u32) -> Result<(), BufError> {
        let fd = match sys::open_write(path, mode) {
            Ok(fd) => fd,
            Err(err) => {
                error!(path = %path.display(), %err, "failed to open file");
                return Err(err.into());
            }
        };
        if let Err(err) = self.write_fd(fd.raw()) {
            error!(path = %path.display(), %err, "write error");
            return Err(err);
        }
        if let Err(err) = fd.close() {
            error!(path = %path.display(), %err, "close error");
            return Err(err.into());
        }
        Ok(())
    }

    /// Writes every segment to `fd` with vectored writes, batching at most
    /// the platform's maximum vector count per call and recovering from
    /// partial writes without duplicating or dropping bytes.
    pub fn write_fd(&self, fd: RawFd) -> Result<(), BufError> {
        let mut write = |iov: &[libc::iovec]| unsafe {
            libc::writev(fd, iov.as_ptr(), iov.len() as libc::c_int)
        };
        self.write_vectored_with(&mut write)
    }

    pub(crate) fn write_vectored_with(
        &self,
        write: &mut dyn FnMut(&[libc::iovec]) -> libc::ssize_t,
    ) -> Result<(), BufError> {
        let mut iov = Vec::with_capacity(self.bufs.len().min(sys::IOV_BATCH));
        for ptr in &self.bufs {
            if ptr.is_empty() {
                continue;
            }
            iov.push(libc::iovec {
                iov_base: ptr.as_slice().as_ptr() as *mut libc::c_void,
                iov_len: ptr.len(),
            });
            if iov.len() == sys::IOV_BATCH {
                sys::flush_iov(&mut iov, write)?;
                iov.clear();
            }
        }
        if !iov.is_empty() {
            sys::flush_iov(&mut iov, write)?;
        }
        Ok(())
    }
}

impl Extend<BufPtr> for BufList {
    fn extend<I: IntoIterator<Item = BufPtr>>(&mut self, iter: I) {
        for ptr in iter {
            self.append(ptr);
        }
    }
}

impl fmt::Debug for BufList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufList")
            .field("len", &self.len)
            .field("segments", &self.bufs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::slice;

    use super::*;

    fn copy_iov(iov: &[libc::iovec], budget: usize, sink: &mut Vec<u8>) -> usize {
        let mut left = budget;
        for v in iov {
            if left == 0 {
                break;
            }
            let n = v.iov_len.min(left);
            sink.extend_from_slice(unsafe { slice::from_raw_parts(v.iov_base.cast::<u8>(), n) });
            left -= n;
        }
        budget - left
    }

    fn sample_list() -> BufList {
        let mut list = BufList::new();
        list.append_slice(b"hello ");
        list.append_slice(b"vectored ");
        list.append(BufPtr::new(0));
        list.append_slice(b"world");
        list
    }

    #[test]
    fn vectored_write_survives_partial_writes() {
        for k in [1usize, 2, 3, 7, 16, 4096] {
            let list = sample_list();
            let expected = list.to_vec();
            let mut sink = Vec::new();
            let mut write = |iov: &[libc::iovec]| copy_iov(iov, k, &mut sink) as libc::ssize_t;
            list.write_vectored_with(&mut write).unwrap();
            assert_eq!(sink, expected, "k={k}");
        }
    }

    #[test]
    fn vectored_write_batches_large_segment_counts() {
        let mut list = BufList::new();
        for i in 0..sys::IOV_BATCH + 5 {
            list.append_slice(&[i as u8]);
        }
        let expected = list.to_vec();
        let mut calls = 0;
        let mut sink = Vec::new();
        let mut write = |iov: &[libc::iovec]| {
            calls += 1;
            assert!(iov.len() <= sys::IOV_BATCH);
            copy_iov(iov, usize::MAX, &mut sink) as libc::ssize_t
        };
        list.write_vectored_with(&mut write).unwrap();
        assert!(calls >= 2);
        assert_eq!(sink, expected);
    }

    fn set_errno(err: libc::c_int) {
        cfg_if::cfg_if! {
            if #[cfg(any(target_os = "linux", target_os = "android"))] {
                unsafe { *libc::__errno_location() = err };
            } else if #[cfg(target_os = "macos")] {
                unsafe { *libc::__error() = err };
            } else {
                let _ = err;
            }
        }
    }

    #[test]
    fn vectored_write_retries_interrupts() {
        let list = sample_list();
        let expected = list.to_vec();
        let mut calls = 0;
        let mut sink = Vec::new();
        let mut write = |iov: &[libc::iovec]| {
            calls += 1;
            if calls <= 2 {
                set_errno(libc::EINTR);
                return -1;
            }
            copy_iov(iov, usize::MAX, &mut sink) as libc::ssize_t
        };
        list.write_vectored_with(&mut write).unwrap();
        assert_eq!(calls, 3);
        assert_eq!(sink, expected);
    }

    // the size query claims more bytes than the descriptor delivers, as if
    // the file shrank between stat and read
    #[test]
    fn short_reads_truncate_to_delivered_bytes() {
        let path = std::env::temp_dir().join(format!("buflist-short-read-{}", std::process::id()));
        std::fs::write(&path, b"ten bytes!").unwrap();
        let fd = sys::open_read(&path).unwrap();
        let list = BufList::read_sized(&fd, 4096, true, &path).unwrap();
        drop(fd);
        std::fs::remove_file(&path).unwrap();
        assert_eq!(list.len(), 10);
        assert_eq!(list.to_vec(), b"ten bytes!");
        assert_eq!(list.segments().len(), 1);
        assert!(list.segments()[0].is_page_aligned());
    }

    #[test]
    fn vectored_write_surfaces_hard_errors() {
        let list = sample_list();
        let mut write = |_: &[libc::iovec]| {
            set_errno(libc::EBADF);
            -1
        };
        let err = list.write_vectored_with(&mut write).unwrap_err();
        assert_eq!(err.errno(), Some(libc::EBADF));
    }
}

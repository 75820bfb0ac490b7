//! Syscall plumbing: interrupt retry, descriptor lifetime, full reads and
//! the vectored-write recovery loop.

use std::{ffi::CString, io, mem, os::fd::RawFd, os::unix::ffi::OsStrExt, path::Path};

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        /// Maximum vector count submitted per scatter-gather write.
        pub(crate) const IOV_BATCH: usize = libc::UIO_MAXIOV as usize;
    } else {
        pub(crate) const IOV_BATCH: usize = 1024;
    }
}

pub(crate) trait IsMinusOne {
    fn is_minus_one(&self) -> bool;
}

impl IsMinusOne for libc::c_int {
    fn is_minus_one(&self) -> bool {
        *self == -1
    }
}

impl IsMinusOne for libc::ssize_t {
    fn is_minus_one(&self) -> bool {
        *self == -1
    }
}

fn cvt<T: IsMinusOne>(ret: T) -> io::Result<T> {
    if ret.is_minus_one() {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Re-issues `f` until it completes without being interrupted.
pub(crate) fn retry_eintr<T: IsMinusOne>(mut f: impl FnMut() -> T) -> io::Result<T> {
    loop {
        match cvt(f()) {
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
            res => return res,
        }
    }
}

/// Owned file descriptor, closed (retrying on interrupt) on drop.
#[derive(Debug)]
pub(crate) struct Fd(RawFd);

impl Fd {
    pub(crate) fn raw(&self) -> RawFd {
        self.0
    }

    /// Closes the descriptor, surfacing the error instead of swallowing it
    /// like the drop path does.
    pub(crate) fn close(self) -> io::Result<()> {
        let fd = self.0;
        mem::forget(self);
        retry_eintr(|| unsafe { libc::close(fd) }).map(drop)
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        let _ = retry_eintr(|| unsafe { libc::close(self.0) });
    }
}

fn cpath(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))
}

pub(crate) fn open_read(path: &Path) -> io::Result<Fd> {
    let path = cpath(path)?;
    let fd = retry_eintr(|| unsafe {
        libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC)
    })?;
    Ok(Fd(fd))
}

pub(crate) fn open_write(path: &Path, mode: u32) -> io::Result<Fd> {
    let path = cpath(path)?;
    let fd = retry_eintr(|| unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC,
            mode as libc::c_uint,
        )
    })?;
    Ok(Fd(fd))
}

pub(crate) fn file_size(fd: &Fd) -> io::Result<usize> {
    let mut st = mem::MaybeUninit::<libc::stat>::uninit();
    cvt(unsafe { libc::fstat(fd.raw(), st.as_mut_ptr()) })?;
    let st = unsafe { st.assume_init() };
    Ok(st.st_size as usize)
}

/// Reads until `buf` is full or end of file, retrying interrupts; returns the
/// bytes actually read.
pub(crate) fn read_full(fd: &Fd, mut buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while !buf.is_empty() {
        let n = retry_eintr(|| unsafe {
            libc::read(fd.raw(), buf.as_mut_ptr().cast(), buf.len())
        })?;
        if n == 0 {
            break;
        }
        let n = n as usize;
        total += n;
        buf = &mut mem::take(&mut buf)[n..];
    }
    Ok(total)
}

/// Flushes one iovec batch through `write`, recovering from partial writes.
///
/// On a partial write the batch is not re-issued whole: fully-written vector
/// elements are skipped, the first partially-written element is trimmed by
/// the residual, and the remaining window is retried until the batch is
/// flushed or a hard error occurs. Interrupts are retried transparently.
pub(crate) fn flush_iov(
    iov: &mut [libc::iovec],
    write: &mut dyn FnMut(&[libc::iovec]) -> libc::ssize_t,
) -> io::Result<()> {
    let mut start = 0;
    let mut remaining: usize = iov.iter().map(|v| v.iov_len).sum();
    while remaining > 0 {
        let wrote = retry_eintr(|| write(&iov[start..]))? as usize;
        remaining -= wrote;
        let mut advance = wrote;
        while start < iov.len() && advance >= iov[start].iov_len {
            advance -= iov[start].iov_len;
            start += 1;
        }
        if advance > 0 {
            let head = &mut iov[start];
            head.iov_base = unsafe { head.iov_base.cast::<u8>().add(advance) }.cast();
            head.iov_len -= advance;
        }
    }
    Ok(())
}

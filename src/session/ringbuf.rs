//! Per-CPU `mmap` ring buffer: the `(page + buffer)` region a leader event
//! fd is mapped into, plus the pause/resume and head/tail operations the
//! session needs to walk it.
//!
//! Not `mio::Evented` -- there's no reactor in this crate's concurrency
//! model (see `DESIGN.md`) -- and it exposes pause/resume for `Circular`
//! mode instead of only ever being read-only, reassembling wrapped reads
//! into a caller-supplied scratch buffer instead of handling the `Read`
//! trait's single best-effort copy.

use std::os::unix::io::RawFd;
use std::sync::atomic::{fence, Ordering};

use error::{Error, Result};
use raw::{self, PerfEventMmapPage};

/// One CPU's `mmap`ed event buffer. Owns the mapping, not the fd -- the fd
/// stays open as long as the `File` that created this mapping is alive,
/// which is the session's job to guarantee.
pub struct RingBuffer {
    base: *mut libc::c_void,
    mmap_len: usize,
    fd: RawFd,
    writable: bool,
}

// The mapping is plain shared memory; nothing here is thread-affine. This
// crate never shares a `RingBuffer` across threads (single-threaded
// cooperative model), but `Send` costs nothing to provide.
unsafe impl Send for RingBuffer {}

impl RingBuffer {
    /// Maps `page_size() + buffer_size` bytes of `fd`'s ring buffer.
    /// `writable` selects `PROT_READ|PROT_WRITE` (realtime, so the consumer
    /// can publish `data_tail`) vs `PROT_READ` (circular, where the kernel
    /// never looks at `data_tail`).
    pub fn new(fd: RawFd, buffer_size: usize, writable: bool) -> Result<Self> {
        let mmap_len = page_size::get() + buffer_size;
        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };

        let base = unsafe {
            libc::mmap(
                ::std::ptr::null_mut(),
                mmap_len,
                prot,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::from(::std::io::Error::last_os_error()));
        }

        Ok(RingBuffer {
            base,
            mmap_len,
            fd,
            writable,
        })
    }

    fn metadata(&self) -> *mut PerfEventMmapPage {
        self.base as *mut PerfEventMmapPage
    }

    fn data_start(&self) -> *mut u8 {
        unsafe { (self.base as *mut u8).add((*self.metadata()).data_offset as usize) }
    }

    pub fn data_size(&self) -> u64 {
        unsafe { (*self.metadata()).data_size }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Acquire-ordered snapshot of the kernel-published head cursor. Does
    /// not wrap the value -- `data_head` increases monotonically and
    /// callers are expected to reduce modulo `data_size` themselves when
    /// indexing into the buffer.
    pub fn head(&self) -> u64 {
        let head = unsafe { (*self.metadata()).data_head };
        fence(Ordering::Acquire);
        head
    }

    pub fn tail(&self) -> u64 {
        unsafe { (*self.metadata()).data_tail }
    }

    /// Publishes a new tail cursor to the kernel (realtime mode only --
    /// circular mappings are never writable, so this would fault).
    ///
    /// Takes `&self`, not `&mut self`: like `head()`, this writes through
    /// the raw `metadata()` pointer into kernel-shared memory, not through
    /// any Rust-owned field, so it composes with a `Drop`-based scope guard
    /// that only ever holds a shared reference to the buffer it cleans up.
    pub fn set_tail(&self, new_tail: u64) {
        debug_assert!(self.writable, "set_tail on a read-only (circular) mapping");
        fence(Ordering::Release);
        unsafe {
            (*self.metadata()).data_tail = new_tail;
        }
    }

    /// Copies `len` bytes starting at `offset` (reduced modulo `data_size`)
    /// into `scratch`, reassembling the read across the wrap point if the
    /// range crosses the end of the circular region, and returns the
    /// resulting slice. `scratch` is cleared and reused on every call so
    /// repeated reads don't reallocate.
    pub fn read_into<'a>(&self, offset: u64, len: usize, scratch: &'a mut Vec<u8>) -> &'a [u8] {
        let size = self.data_size() as usize;
        let start = (offset % size as u64) as usize;
        scratch.clear();

        if start + len <= size {
            let src = unsafe { ::std::slice::from_raw_parts(self.data_start().add(start), len) };
            scratch.extend_from_slice(src);
        } else {
            let first_len = size - start;
            let second_len = len - first_len;
            let first =
                unsafe { ::std::slice::from_raw_parts(self.data_start().add(start), first_len) };
            let second = unsafe { ::std::slice::from_raw_parts(self.data_start(), second_len) };
            scratch.extend_from_slice(first);
            scratch.extend_from_slice(second);
        }
        scratch.as_slice()
    }

    /// Stops the kernel from writing further records into this buffer
    /// without disabling the underlying event (`Circular` mode's way of
    /// taking a stable snapshot to walk).
    pub fn pause(&self) -> Result<()> {
        debug!("pausing output on fd {}", self.fd);
        perf_ioctl(self.fd, raw::PERF_EVENT_IOC_PAUSE_OUTPUT, 1)
    }

    pub fn resume(&self) -> Result<()> {
        debug!("resuming output on fd {}", self.fd);
        perf_ioctl(self.fd, raw::PERF_EVENT_IOC_PAUSE_OUTPUT, 0)
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base, self.mmap_len);
        }
    }
}

pub(crate) fn perf_ioctl(fd: RawFd, request: libc::c_ulong, arg: libc::c_uint) -> Result<()> {
    let ret = unsafe { libc::ioctl(fd, request, arg) };
    if ret == -1 {
        return Err(Error::from(::std::io::Error::last_os_error()));
    }
    Ok(())
}

//! Hand-declared FFI layout for the subset of `<linux/perf_event.h>` this
//! crate needs, declared directly rather than generated by `bindgen`
//! against vendored kernel headers -- no header dependency, no build
//! script.
#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]

use libc::{c_int, c_uint, c_ulong};

/// `perf_type_id::PERF_TYPE_TRACEPOINT`. The only event type this crate
/// opens -- tracepoints are always read through their format-file `id`.
pub const PERF_TYPE_TRACEPOINT: u32 = 2;

/// `perf_event_sample_format` bits, as delivered in `PERF_RECORD_SAMPLE`
/// records. Order here matches kernel documentation order; the *on-wire*
/// order (the order fields actually appear in a sample record) is fixed by
/// the kernel regardless of how these bits are combined and is reproduced
/// in `session::sample`.
bitflags! {
    pub struct SampleType: u64 {
        const IP           = 1 << 0;
        const TID          = 1 << 1;
        const TIME         = 1 << 2;
        const ADDR         = 1 << 3;
        const READ         = 1 << 4;
        const CALLCHAIN    = 1 << 5;
        const ID           = 1 << 6;
        const CPU          = 1 << 7;
        const PERIOD       = 1 << 8;
        const STREAM_ID    = 1 << 9;
        const RAW          = 1 << 10;
        const IDENTIFIER   = 1 << 16;
    }
}

/// `perf_event_header.type` values this crate distinguishes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PerfRecordType {
    Sample,
    Lost,
    Throttle,
    Unthrottle,
    Fork,
    Exit,
    Comm,
    Other(u32),
}

impl PerfRecordType {
    pub fn from_u32(v: u32) -> PerfRecordType {
        match v {
            9 => PerfRecordType::Sample,
            2 => PerfRecordType::Lost,
            5 => PerfRecordType::Throttle,
            6 => PerfRecordType::Unthrottle,
            7 => PerfRecordType::Fork,
            4 => PerfRecordType::Exit,
            3 => PerfRecordType::Comm,
            other => PerfRecordType::Other(other),
        }
    }
}

/// Matches `struct perf_event_attr` field-for-field for the subset this
/// crate populates. Bitfields (`disabled`, `inherit`, `exclude_kernel`,
/// `exclude_hv`, `watermark`, `use_clockid`, `write_backward`,
/// `sample_id_all`) are exposed as individual `u8` flags rather than a
/// packed bitfield -- the kernel ABI only cares about the final packed
/// `u64`, which `to_kernel_bytes` assembles.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PerfEventAttr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    /// Interpreted as `sample_period` unless `freq != 0`, in which case it's
    /// `sample_freq`. This crate always sets `sample_period = 1` and never
    /// sets `freq`, so this is always the period.
    pub sample_period_or_freq: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub disabled: bool,
    pub inherit: bool,
    pub exclude_kernel: bool,
    pub exclude_hv: bool,
    pub watermark: bool,
    pub use_clockid: bool,
    pub write_backward: bool,
    pub sample_id_all: bool,
    /// Interpreted as `wakeup_events` unless `watermark` is set, in which
    /// case it's `wakeup_watermark`.
    pub wakeup_events_or_watermark: u32,
    pub clockid: i32,
}

impl PerfEventAttr {
    /// Standard "read 4 fields at once" read format: value, total_enabled,
    /// total_running, id. Set on every `perf_event_attr` this crate opens so
    /// the kernel tags each sample record with its originating event id,
    /// which `session::sample` needs to resolve a descriptor when
    /// `common_type` alone is ambiguous.
    pub const READ_FORMAT_ID: u64 = 1 << 2;

    /// `PERF_ATTR_SIZE_VER3`: covers every field this crate populates
    /// (through `clockid`). Passed as `attr.size` so the kernel knows how
    /// far to trust the buffer; later fields are left zeroed.
    pub const KERNEL_ATTR_SIZE: usize = 96;

    /// Packs this struct into the exact byte layout `perf_event_open(2)`
    /// expects, since the bitfields here are exposed as individual `bool`s
    /// rather than the packed `u64` the kernel ABI uses. Field offsets
    /// follow `struct perf_event_attr` in `<linux/perf_event.h>`.
    pub fn to_kernel_bytes(&self) -> [u8; Self::KERNEL_ATTR_SIZE] {
        let mut buf = [0u8; Self::KERNEL_ATTR_SIZE];
        buf[0..4].copy_from_slice(&self.type_.to_ne_bytes());
        buf[4..8].copy_from_slice(&(Self::KERNEL_ATTR_SIZE as u32).to_ne_bytes());
        buf[8..16].copy_from_slice(&self.config.to_ne_bytes());
        buf[16..24].copy_from_slice(&self.sample_period_or_freq.to_ne_bytes());
        buf[24..32].copy_from_slice(&self.sample_type.to_ne_bytes());
        buf[32..40].copy_from_slice(&self.read_format.to_ne_bytes());

        let mut flags: u64 = 0;
        if self.disabled {
            flags |= 1 << 0;
        }
        if self.inherit {
            flags |= 1 << 1;
        }
        if self.exclude_kernel {
            flags |= 1 << 5;
        }
        if self.exclude_hv {
            flags |= 1 << 6;
        }
        if self.watermark {
            flags |= 1 << 14;
        }
        if self.sample_id_all {
            flags |= 1 << 18;
        }
        if self.use_clockid {
            flags |= 1 << 25;
        }
        if self.write_backward {
            flags |= 1 << 27;
        }
        buf[40..48].copy_from_slice(&flags.to_ne_bytes());

        buf[48..52].copy_from_slice(&self.wakeup_events_or_watermark.to_ne_bytes());
        // bp_type (52..56), config1 (56..64), config2 (64..72) and
        // branch_sample_type (72..80) are left zero -- this crate never
        // opens breakpoint or branch-stack events.
        // sample_regs_user (80..88) and sample_stack_user (88..92) are left
        // zero for the same reason.
        buf[92..96].copy_from_slice(&self.clockid.to_ne_bytes());
        buf
    }
}

/// Matches the layout of `struct perf_event_mmap_page` (the control page at
/// offset 0 of every per-CPU mmap), limited to the fields this crate reads
/// or writes. Real field offsets come from `perf_event_open(2)`; the
/// `_reserved` padding exists only so `data_head`/`data_tail`/etc. land at
/// the same byte offsets the kernel expects, which is the only thing that
/// actually matters since this crate reads the page through raw pointer
/// arithmetic rather than `transmute`ing a whole struct.
#[repr(C)]
pub struct PerfEventMmapPage {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub _reserved_1: u32,
    pub time_cycles: u64,
    pub time_mask: u64,
    pub _reserved: [u8; 928],
    /// Monotonically increasing; kernel-written, acquire-load on read.
    pub data_head: u64,
    /// User-space-owned in `RealTime` mode; release-store on write.
    pub data_tail: u64,
    /// Offset of the data region, relative to the start of this page.
    /// Expected to equal the system page size.
    pub data_offset: u64,
    /// Size of the data region in bytes. Expected to be a power of two.
    pub data_size: u64,
}

/// The 8-byte record header that prefixes every ring-buffer record.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct PerfEventHeader {
    pub type_: u32,
    pub misc: u16,
    pub size: u16,
}

pub const PERF_EVENT_HEADER_SIZE: usize = 8;

// ioctl request codes for `perf_event_open` file descriptors. These are
// `_IO('$', n)` as defined in `<linux/perf_event.h>`.
const PERF_EVENT_IOC_MAGIC: u8 = b'$';

pub const PERF_EVENT_IOC_ENABLE: c_ulong = io(PERF_EVENT_IOC_MAGIC, 0);
pub const PERF_EVENT_IOC_DISABLE: c_ulong = io(PERF_EVENT_IOC_MAGIC, 1);
pub const PERF_EVENT_IOC_SET_OUTPUT: c_ulong = io(PERF_EVENT_IOC_MAGIC, 5);
/// `_IOR('$', 7, __u64)`. Reads back the kernel-assigned sample id for one
/// event fd, used to index the by-sample-id map when redirecting several
/// tracepoints' output into one leader buffer set.
pub const PERF_EVENT_IOC_ID: c_ulong = ior(PERF_EVENT_IOC_MAGIC, 7, 8);
/// `_IOW('$', 9, __u32)`. Takes a `u32` argument (1 = pause, 0 = resume) --
/// passed by value as `libc::ioctl`'s third vararg, not as a pointer, which
/// is a documented quirk of this particular request despite the `_IOW`
/// encoding.
pub const PERF_EVENT_IOC_PAUSE_OUTPUT: c_ulong = iow(PERF_EVENT_IOC_MAGIC, 9, 4);

const fn io(ty: u8, nr: u8) -> c_ulong {
    ioc(0, ty, nr, 0)
}

const fn iow(ty: u8, nr: u8, size: usize) -> c_ulong {
    ioc(1, ty, nr, size)
}

const fn ior(ty: u8, nr: u8, size: usize) -> c_ulong {
    ioc(2, ty, nr, size)
}

/// `_IOC(dir, type, nr, size)` from `<asm-generic/ioctl.h>`.
const fn ioc(dir: u8, ty: u8, nr: u8, size: usize) -> c_ulong {
    ((dir as c_ulong) << 30) | ((size as c_ulong) << 16) | ((ty as c_ulong) << 8) | (nr as c_ulong)
}

pub const CLOCK_MONOTONIC_RAW: c_int = 4;

pub const PERF_FLAG_FD_CLOEXEC: c_uint = 1 << 3;

//! The ring-buffer session and ordered merge: owns the per-CPU
//! `perf_event_open` file descriptors and `mmap`s for one or more enabled
//! tracepoints, and walks them to produce decoded samples.
//!
//! Generalizes the `perf_event_open`/`mmap`/ioctl mechanics from "one
//! counter, one buffer" to "many tracepoints sharing per-CPU leader
//! buffers", driven by a single-threaded cooperative enumeration loop
//! rather than an async reactor (see `DESIGN.md` for the grounding).

pub mod merge;
pub mod restore;
pub mod ringbuf;
pub mod sample;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::ptr;
use std::rc::Rc;
use std::time::Instant;

use nix;

use cache::TracepointCache;
use error::{Error, Result};
use raw::{self, PerfEventAttr, PerfRecordType, SampleType};

use self::ringbuf::{perf_ioctl, RingBuffer};
use self::sample::SampleEventInfo;

/// Collection mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    /// Kernel writes backward into a fixed window, overwriting the oldest
    /// records on wrap. Reader pauses output to take a stable snapshot.
    Circular,
    /// Kernel writes forward and stops when full. Reader advances a tail
    /// cursor to make room; supports `wait_for_wakeup`.
    RealTime,
}

/// Wakeup policy: deliver a notification every N events, or once N bytes
/// of watermark have accumulated.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Wakeup {
    Events(u32),
    Watermark(u32),
}

impl Default for Wakeup {
    fn default() -> Self {
        Wakeup::Watermark(0)
    }
}

impl Wakeup {
    pub(crate) fn to_raw(self) -> (u8, u32) {
        match self {
            Wakeup::Events(n) => (0, n),
            Wakeup::Watermark(n) => (1, n),
        }
    }

    pub(crate) fn from_raw(kind: u8, n: u32) -> Result<Wakeup> {
        match kind {
            0 => Ok(Wakeup::Events(n)),
            1 => Ok(Wakeup::Watermark(n)),
            _ => Err(Error::invalid_data("restore log header has unknown wakeup kind byte")),
        }
    }
}

/// A tracepoint's per-CPU enable state. Enabling an already-enabled
/// tracepoint, or disabling an already-disabled one, is a no-op.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnableState {
    Enabled,
    Disabled,
    /// A control-plane ioctl failed on at least one CPU partway through an
    /// enable/disable; the tracepoint's true kernel-side state can no
    /// longer be asserted with confidence.
    Unknown,
}

impl EnableState {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            EnableState::Enabled => 0,
            EnableState::Disabled => 1,
            EnableState::Unknown => 2,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Result<EnableState> {
        match v {
            0 => Ok(EnableState::Enabled),
            1 => Ok(EnableState::Disabled),
            2 => Ok(EnableState::Unknown),
            _ => Err(Error::invalid_data("restore log entry has unknown enable-state byte")),
        }
    }
}

/// Monotonic session-wide counters. Incremented exactly once per record
/// classified, never reset.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Counters {
    pub sample_event_count: u64,
    pub lost_event_count: u64,
    pub corrupt_event_count: u64,
    pub corrupt_buffer_count: u64,
}

/// The leader buffer set for one CPU: the first tracepoint enabled on this
/// session owns this mapping, and every tracepoint enabled afterward
/// redirects its own fd's output into it (`PERF_EVENT_IOC_SET_OUTPUT`).
struct LeaderBuffer {
    /// Kept alive only so the fd stays open; all reads go through `ring`.
    _file: ::std::fs::File,
    ring: RingBuffer,
}

#[derive(Default)]
struct PerCpuState {
    leader: Option<LeaderBuffer>,
}

/// One enabled (or previously-enabled) tracepoint: its descriptor id, its
/// current enable state, and the per-CPU fds opened for it. For the
/// session's first tracepoint these fds *are* the leaders; for later ones
/// they're redirected followers kept open only so they can be individually
/// enabled/disabled/closed.
struct TracepointState {
    descriptor_id: u32,
    enable_state: EnableState,
    per_cpu_files: Vec<::std::fs::File>,
}

/// Configuration accepted at construction time, all immutable once a
/// `Session` exists.
pub struct SessionBuilder {
    cache: Rc<RefCell<TracepointCache>>,
    mode: Mode,
    buffer_size_hint: usize,
    sample_type_mask: SampleType,
    wakeup: Wakeup,
}

impl SessionBuilder {
    pub fn new(cache: Rc<RefCell<TracepointCache>>, mode: Mode) -> Self {
        SessionBuilder {
            cache,
            mode,
            buffer_size_hint: page_size::get() * 64,
            sample_type_mask: SampleType::TID | SampleType::TIME | SampleType::CPU | SampleType::RAW,
            wakeup: Wakeup::default(),
        }
    }

    pub fn buffer_size_hint(mut self, bytes: usize) -> Self {
        self.buffer_size_hint = bytes;
        self
    }

    pub fn sample_type_mask(mut self, mask: SampleType) -> Self {
        self.sample_type_mask = mask;
        self
    }

    pub fn wakeup(mut self, wakeup: Wakeup) -> Self {
        self.wakeup = wakeup;
        self
    }

    pub fn build(self) -> Result<Session> {
        let cpu_count = num_cpus::get();
        let buffer_size = round_up_pow2(self.buffer_size_hint.max(page_size::get()));

        let header = restore::Header {
            mode: self.mode,
            sample_type_mask: self.sample_type_mask,
            wakeup: self.wakeup,
            buffer_count: cpu_count as u32,
            page_size: page_size::get() as u32,
            buffer_size: buffer_size as u32,
        };

        Ok(Session {
            cache: self.cache,
            mode: self.mode,
            buffer_size,
            sample_type_mask: self.sample_type_mask,
            wakeup: self.wakeup,
            cpu_count,
            per_cpu: (0..cpu_count).map(|_| PerCpuState::default()).collect(),
            tracepoints: HashMap::new(),
            by_sample_id: HashMap::new(),
            counters: Counters::default(),
            restore_log: restore::DescriptorLog::new(header)?,
        })
    }
}

fn round_up_pow2(n: usize) -> usize {
    if n.is_power_of_two() {
        n
    } else {
        n.next_power_of_two()
    }
}

/// The ring-buffer session: spec Component E. Owns every per-CPU mmap and
/// kernel event fd this process holds for tracepoint collection.
pub struct Session {
    cache: Rc<RefCell<TracepointCache>>,
    mode: Mode,
    buffer_size: usize,
    sample_type_mask: SampleType,
    wakeup: Wakeup,
    cpu_count: usize,
    per_cpu: Vec<PerCpuState>,
    tracepoints: HashMap<String, TracepointState>,
    by_sample_id: HashMap<u64, u32>,
    counters: Counters,
    restore_log: restore::DescriptorLog,
}

impl Session {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    pub fn cpu_count(&self) -> usize {
        self.cpu_count
    }

    fn full_name(system: &str, event: &str) -> String {
        format!("{}:{}", system, event)
    }

    /// Idempotent: enabling an already-enabled tracepoint is a no-op.
    pub fn enable(&mut self, system: &str, event: &str) -> Result<()> {
        let name = Self::full_name(system, event);
        info!("enabling {}", name);

        let descriptor_id = {
            let mut cache = self.cache.borrow_mut();
            match cache.find_by_name(system, event) {
                Some(entry) => entry.format().id(),
                None => cache.add_from_system(system, event, cfg!(target_pointer_width = "64"))?,
            }
        };

        if let Some(existing) = self.tracepoints.get(&name) {
            match existing.enable_state {
                EnableState::Enabled => return Ok(()),
                EnableState::Disabled | EnableState::Unknown => {
                    return self.reenable_existing(&name);
                }
            }
        }

        self.open_new_tracepoint(&name, descriptor_id)
    }

    fn reenable_existing(&mut self, name: &str) -> Result<()> {
        let tp = self.tracepoints.get_mut(name).expect("checked by caller");
        let mut all_ok = true;
        for file in &tp.per_cpu_files {
            if let Err(e) = perf_ioctl(file.as_raw_fd(), raw::PERF_EVENT_IOC_ENABLE, 0) {
                warn!("unable to re-enable a per-cpu fd for {}: {:?}", name, e);
                all_ok = false;
            }
        }
        tp.enable_state = if all_ok { EnableState::Enabled } else { EnableState::Unknown };
        let state = tp.enable_state;
        self.restore_log.record(name, state)?;
        if all_ok {
            Ok(())
        } else {
            Err(Error::KernelError {
                inner: nix::Error::Sys(nix::errno::Errno::EIO),
            })
        }
    }

    fn open_new_tracepoint(&mut self, name: &str, descriptor_id: u32) -> Result<()> {
        let mut opened: Vec<::std::fs::File> = Vec::with_capacity(self.cpu_count);
        let mut opened_leaders: Vec<usize> = Vec::new();

        let result = (|| -> Result<()> {
            for cpu in 0..self.cpu_count {
                let attr = self.build_attr(descriptor_id);
                let fd = open_perf_event(&attr, cpu as i32).map_err(|e| {
                    debug!("unable to open a perf event fd for {} on cpu {}: {:?}", name, cpu, e);
                    e
                })?;
                let file = unsafe { ::std::fs::File::from_raw_fd(fd) };

                if self.per_cpu[cpu].leader.is_none() {
                    let ring = RingBuffer::new(fd, self.buffer_size, self.mode == Mode::RealTime)?;
                    // `file` must outlive `ring`'s use of `fd`; stash both.
                    let leader_file = clone_file(&file)?;
                    self.per_cpu[cpu].leader = Some(LeaderBuffer { _file: leader_file, ring });
                    opened_leaders.push(cpu);
                } else {
                    let leader_fd = self.per_cpu[cpu]
                        .leader
                        .as_ref()
                        .expect("just checked Some")
                        .ring
                        .fd();
                    perf_ioctl(fd, raw::PERF_EVENT_IOC_SET_OUTPUT, leader_fd as libc::c_uint)?;
                }

                let sample_id = read_event_id(fd)?;
                self.by_sample_id.insert(sample_id, descriptor_id);
                opened.push(file);
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.tracepoints.insert(
                    name.to_string(),
                    TracepointState {
                        descriptor_id,
                        enable_state: EnableState::Enabled,
                        per_cpu_files: opened,
                    },
                );
                self.restore_log.record(name, EnableState::Enabled)?;
                Ok(())
            }
            Err(e) => {
                // Roll back: drop whatever fds we opened (closes them),
                // and unmap any leader buffers this call was responsible
                // for creating.
                for cpu in opened_leaders {
                    self.per_cpu[cpu].leader = None;
                }
                drop(opened);
                Err(e)
            }
        }
    }

    fn build_attr(&self, descriptor_id: u32) -> PerfEventAttr {
        let (watermark, wakeup_n) = match self.wakeup {
            Wakeup::Events(n) => (false, n),
            Wakeup::Watermark(n) => (true, n),
        };
        PerfEventAttr {
            type_: raw::PERF_TYPE_TRACEPOINT,
            size: 0,
            config: descriptor_id as u64,
            sample_period_or_freq: 1,
            sample_type: self.sample_type_mask.bits(),
            read_format: PerfEventAttr::READ_FORMAT_ID,
            disabled: false,
            inherit: false,
            exclude_kernel: false,
            exclude_hv: false,
            watermark,
            use_clockid: true,
            write_backward: self.mode == Mode::Circular,
            sample_id_all: true,
            wakeup_events_or_watermark: wakeup_n,
            clockid: raw::CLOCK_MONOTONIC_RAW,
        }
    }

    /// Disabling an already-disabled tracepoint succeeds.
    pub fn disable(&mut self, system: &str, event: &str) -> Result<()> {
        let name = Self::full_name(system, event);
        info!("disabling {}", name);
        let tp = match self.tracepoints.get_mut(&name) {
            Some(tp) => tp,
            None => return Err(Error::NotFound { name }),
        };
        if tp.enable_state == EnableState::Disabled {
            return Ok(());
        }

        let mut all_ok = true;
        for file in &tp.per_cpu_files {
            if let Err(e) = perf_ioctl(file.as_raw_fd(), raw::PERF_EVENT_IOC_DISABLE, 0) {
                warn!("unable to disable a per-cpu fd for {}: {:?}", name, e);
                all_ok = false;
            }
        }
        tp.enable_state = if all_ok { EnableState::Disabled } else { EnableState::Unknown };
        let state = tp.enable_state;
        self.restore_log.record(&name, state)?;
        if all_ok {
            Ok(())
        } else {
            Err(Error::KernelError {
                inner: nix::Error::Sys(nix::errno::Errno::EIO),
            })
        }
    }

    /// Blocks until the wakeup watermark is met on some leader buffer,
    /// `deadline` passes, or a signal in `sigmask`'s complement becomes
    /// pending. Only valid for `RealTime` sessions -- there is no kernel
    /// wakeup for overwriting buffers.
    pub fn wait_for_wakeup(
        &self,
        deadline: Option<Instant>,
        sigmask: Option<libc::sigset_t>,
    ) -> Result<usize> {
        if self.mode != Mode::RealTime {
            return Err(Error::PermissionDenied {
                reason: "wait_for_wakeup is not supported in Circular mode",
            });
        }

        let mut fds: Vec<libc::pollfd> = self
            .per_cpu
            .iter()
            .filter_map(|c| c.leader.as_ref())
            .map(|l| libc::pollfd {
                fd: l.ring.fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        if fds.is_empty() {
            return Ok(0);
        }

        let timeout = deadline.map(|d| {
            let remaining = d.saturating_duration_since(Instant::now());
            libc::timespec {
                tv_sec: remaining.as_secs() as libc::time_t,
                tv_nsec: remaining.subsec_nanos() as i64,
            }
        });
        let ts_ptr = timeout
            .as_ref()
            .map(|t| t as *const libc::timespec)
            .unwrap_or(ptr::null());
        let mask_ptr = sigmask
            .as_ref()
            .map(|m| m as *const libc::sigset_t)
            .unwrap_or(ptr::null());

        let ret = unsafe { libc::ppoll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, ts_ptr, mask_ptr) };
        if ret < 0 {
            return Err(Error::from(::std::io::Error::last_os_error()));
        }
        Ok(fds.iter().filter(|f| f.revents & libc::POLLIN != 0).count())
    }

    fn resolve_descriptor_id(&self, info: &SampleEventInfo) -> Option<u32> {
        info.descriptor_id.or_else(|| {
            info.identifier
                .or(info.id)
                .and_then(|id| self.by_sample_id.get(&id).copied())
        })
    }

    /// Walks every CPU's buffer once, delivering samples to `callback` in
    /// per-CPU (not cross-CPU) order. `callback` returns 0 to continue,
    /// nonzero to abort -- aborting still runs the scope's pause/resume or
    /// tail-advance cleanup.
    pub fn enumerate_unordered<F>(&mut self, mut callback: F) -> Result<()>
    where
        F: FnMut(&SampleEventInfo) -> i32,
    {
        let mode = self.mode;
        let mask = self.sample_type_mask;
        let mut scratch = Vec::new();

        for cpu in 0..self.per_cpu.len() {
            let buf = match &self.per_cpu[cpu].leader {
                Some(l) => &l.ring,
                None => continue,
            };

            let guard = ScopeGuard::new(buf, mode)?;
            let head = buf.head();
            let size = buf.data_size();
            let (start, end) = match mode {
                Mode::RealTime => (buf.tail(), head),
                Mode::Circular => (head.saturating_sub(size), head),
            };

            let mut cursor = start;
            let mut aborted = false;

            while cursor < end {
                let remaining = end - cursor;
                if remaining < raw::PERF_EVENT_HEADER_SIZE as u64 {
                    break;
                }

                let header_bytes = buf.read_into(cursor, raw::PERF_EVENT_HEADER_SIZE, &mut scratch);
                let reader = ::byte_reader::ByteReader::host();
                let type_ = reader.get_u32(header_bytes, 0);
                let record_size = reader.get_u16(header_bytes, 6);
                let (type_, record_size) = match (type_, record_size) {
                    (Some(t), Some(s)) => (t, s),
                    _ => {
                        self.counters.corrupt_buffer_count += 1;
                        cursor = end;
                        break;
                    }
                };

                if record_size == 0 || record_size % 8 != 0 || (record_size as u64) > remaining {
                    self.counters.corrupt_buffer_count += 1;
                    cursor = end;
                    break;
                }

                match PerfRecordType::from_u32(type_) {
                    PerfRecordType::Sample => {
                        let payload_len = record_size as usize - raw::PERF_EVENT_HEADER_SIZE;
                        let payload = buf
                            .read_into(cursor + raw::PERF_EVENT_HEADER_SIZE as u64, payload_len, &mut scratch)
                            .to_vec();
                        let cache = self.cache.borrow();
                        match sample::parse_sample(mask, &payload, Some(&cache)) {
                            Ok(mut info) => {
                                drop(cache);
                                if info.descriptor_id.is_none() {
                                    info.descriptor_id = self.resolve_descriptor_id(&info);
                                }
                                self.counters.sample_event_count += 1;
                                if callback(&info) != 0 {
                                    aborted = true;
                                }
                            }
                            Err(_) => {
                                drop(cache);
                                self.counters.corrupt_event_count += 1;
                            }
                        }
                    }
                    PerfRecordType::Lost => {
                        self.counters.lost_event_count += 1;
                    }
                    _ => {}
                }

                if aborted {
                    break;
                }
                cursor += record_size as u64;
            }

            if mode == Mode::RealTime {
                guard.set_tail(if aborted { cursor } else { end });
            }
            drop(guard);

            if aborted {
                return Ok(());
            }
        }

        Ok(())
    }

    /// Requires `Time` in the sample-type mask. Collects bookmarks across
    /// every CPU, stably sorts by timestamp, then re-parses and delivers
    /// each record in order.
    pub fn enumerate_ordered<F>(&mut self, mut callback: F) -> Result<()>
    where
        F: FnMut(&SampleEventInfo) -> i32,
    {
        let mode = self.mode;
        let mask = self.sample_type_mask;

        let buffers: Vec<&RingBuffer> = self
            .per_cpu
            .iter()
            .filter_map(|c| c.leader.as_ref())
            .map(|l| &l.ring)
            .collect();

        let mut guards = Vec::with_capacity(buffers.len());
        for &buf in &buffers {
            guards.push(ScopeGuard::new(buf, mode)?);
        }

        // Captured once, before any tail is moved: `tail`/`size` let a
        // bookmark's buffer-relative `offset` be reconstructed back into the
        // absolute, monotonically increasing cursor space `data_tail` lives
        // in, since a wrapped offset alone can't tell two laps apart.
        let tails: Vec<u64> = buffers.iter().map(|b| b.tail()).collect();
        let heads: Vec<u64> = buffers.iter().map(|b| b.head()).collect();
        let sizes: Vec<u64> = buffers.iter().map(|b| b.data_size()).collect();

        let bookmarks = merge::collect_bookmarks(mode, mask, &buffers);
        let bookmarks = match bookmarks {
            Ok(b) => b,
            Err(e) => {
                drop(guards);
                return Err(e);
            }
        };

        let mut scratch = Vec::new();
        let mut aborted = false;
        let mut max_seen_end: Vec<Option<u64>> = vec![None; buffers.len()];

        for bookmark in &bookmarks {
            if aborted {
                break;
            }
            let idx = bookmark.buffer_index as usize;
            let buf = buffers[idx];
            let payload_len = bookmark.size as usize - raw::PERF_EVENT_HEADER_SIZE;
            let payload = buf
                .read_into(
                    bookmark.offset as u64 + raw::PERF_EVENT_HEADER_SIZE as u64,
                    payload_len,
                    &mut scratch,
                )
                .to_vec();

            let cache = self.cache.borrow();
            match sample::parse_sample(mask, &payload, Some(&cache)) {
                Ok(mut info) => {
                    drop(cache);
                    if info.descriptor_id.is_none() {
                        info.descriptor_id = self.resolve_descriptor_id(&info);
                    }
                    self.counters.sample_event_count += 1;
                    if callback(&info) != 0 {
                        aborted = true;
                    }
                }
                Err(_) => {
                    drop(cache);
                    self.counters.corrupt_event_count += 1;
                }
            }

            let base = tails[idx] - (tails[idx] % sizes[idx]);
            let mut abs_offset = base + bookmark.offset as u64;
            if abs_offset < tails[idx] {
                abs_offset += sizes[idx];
            }
            max_seen_end[idx] = Some(abs_offset + bookmark.size as u64);
        }

        if mode == Mode::RealTime {
            for (i, guard) in guards.iter().enumerate() {
                if !aborted {
                    // A full pass walked every record in [tail, head), not
                    // just the ones that produced bookmarks -- safe to drain
                    // the buffer completely.
                    guard.set_tail(heads[i]);
                } else if let Some(end) = max_seen_end[i] {
                    guard.set_tail(end);
                }
            }
        }

        Ok(())
    }

    /// Emits `(fd, "<prefix>/<hex index>")` pairs for every kernel file
    /// handle this session holds, in the fixed order `restore` expects back:
    /// the descriptor log, then each CPU's leader, then each tracepoint's
    /// per-CPU follower fds in the order tracepoints were first enabled.
    pub fn save_handoff<F>(&self, prefix: &str, mut emit: F)
    where
        F: FnMut(RawFd, &str),
    {
        emit(self.restore_log.fd(), &format!("{}/log", prefix));

        let mut index: u32 = 0;
        for cpu in &self.per_cpu {
            if let Some(leader) = &cpu.leader {
                emit(leader.ring.fd(), &format!("{}/{:x}", prefix, index));
                index += 1;
            }
        }
        for tp in self.tracepoints.values() {
            for file in &tp.per_cpu_files {
                emit(file.as_raw_fd(), &format!("{}/{:x}", prefix, index));
                index += 1;
            }
        }
    }

    /// Rebuilds a `Session` from a descriptor log fd plus the
    /// leader/follower fds a previous process handed off, without
    /// re-opening any kernel event. Rejects the set if the stored header
    /// disagrees with this process's own page size (the one field that
    /// cannot be dictated by the caller).
    pub fn restore(
        cache: Rc<RefCell<TracepointCache>>,
        log_fd: RawFd,
        leader_fds: &[RawFd],
        tracepoint_fds: &HashMap<String, Vec<RawFd>>,
    ) -> Result<Session> {
        let (header, entries) = restore::DescriptorLog::read_from_fd(log_fd)?;

        if header.page_size as usize != page_size::get() {
            return Err(Error::invalid_data("restore header page_size disagrees with this process"));
        }
        if header.buffer_count as usize != leader_fds.len() {
            return Err(Error::invalid_data("restore header buffer_count disagrees with supplied leader fds"));
        }

        let cpu_count = leader_fds.len();
        let mut per_cpu: Vec<PerCpuState> = Vec::with_capacity(cpu_count);
        for &fd in leader_fds {
            let file = unsafe { ::std::fs::File::from_raw_fd(fd) };
            let ring = RingBuffer::new(fd, header.buffer_size as usize, header.mode == Mode::RealTime)?;
            per_cpu.push(PerCpuState {
                leader: Some(LeaderBuffer { _file: file, ring }),
            });
        }

        let mut tracepoints = HashMap::new();
        let mut by_sample_id = HashMap::new();
        for (name, state) in entries {
            let fds = tracepoint_fds
                .get(&name)
                .ok_or_else(|| Error::invalid_data("restore log names a tracepoint with no supplied fds"))?;
            if fds.len() != cpu_count {
                return Err(Error::invalid_data("restored tracepoint fd count disagrees with buffer_count"));
            }
            let descriptor_id = {
                let cache_ref = cache.borrow();
                let (system, event) = split_name(&name);
                cache_ref
                    .find_by_name(system, event)
                    .map(|e| e.format().id())
                    .ok_or_else(|| Error::NotFound { name: name.clone() })?
            };

            let mut files = Vec::with_capacity(fds.len());
            for &fd in fds {
                let sample_id = read_event_id(fd)?;
                by_sample_id.insert(sample_id, descriptor_id);
                files.push(unsafe { ::std::fs::File::from_raw_fd(fd) });
            }
            tracepoints.insert(
                name,
                TracepointState {
                    descriptor_id,
                    enable_state: state,
                    per_cpu_files: files,
                },
            );
        }

        Ok(Session {
            cache,
            mode: header.mode,
            buffer_size: header.buffer_size as usize,
            sample_type_mask: header.sample_type_mask,
            wakeup: header.wakeup,
            cpu_count,
            per_cpu,
            tracepoints,
            by_sample_id,
            counters: Counters::default(),
            restore_log: restore::DescriptorLog::new(header)?,
        })
    }
}

fn split_name(full: &str) -> (&str, &str) {
    match full.find(':') {
        Some(i) => (&full[..i], &full[i + 1..]),
        None => ("user_events", full),
    }
}

/// A `Drop`-guaranteed scope cleanup for one buffer's enumeration pass:
/// resumes a paused (`Circular`) buffer, or publishes a pending tail
/// (`RealTime`), on every exit path -- normal return, callback-signalled
/// abort, or an early `?` out of the enclosing function.
struct ScopeGuard<'a> {
    buf: &'a RingBuffer,
    mode: Mode,
    pending_tail: Cell<Option<u64>>,
}

impl<'a> ScopeGuard<'a> {
    fn new(buf: &'a RingBuffer, mode: Mode) -> Result<Self> {
        if mode == Mode::Circular {
            buf.pause()?;
        }
        Ok(ScopeGuard {
            buf,
            mode,
            pending_tail: Cell::new(None),
        })
    }

    fn set_tail(&self, tail: u64) {
        self.pending_tail.set(Some(tail));
    }
}

impl<'a> Drop for ScopeGuard<'a> {
    fn drop(&mut self) {
        match self.mode {
            Mode::Circular => {
                let _ = self.buf.resume();
            }
            Mode::RealTime => {
                if let Some(tail) = self.pending_tail.get() {
                    self.buf.set_tail(tail);
                }
            }
        }
    }
}

fn clone_file(file: &::std::fs::File) -> Result<::std::fs::File> {
    file.try_clone().map_err(Error::from)
}

fn open_perf_event(attr: &PerfEventAttr, cpu: i32) -> Result<RawFd> {
    let bytes = attr.to_kernel_bytes();
    let ret = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            bytes.as_ptr(),
            -1i32, // pid: all processes/threads
            cpu,
            -1i32, // group_fd
            raw::PERF_FLAG_FD_CLOEXEC as libc::c_ulong,
        )
    };
    if ret < 0 {
        return Err(Error::from(::std::io::Error::last_os_error()));
    }
    Ok(ret as RawFd)
}

fn read_event_id(fd: RawFd) -> Result<u64> {
    let mut id: u64 = 0;
    let ret = unsafe { libc::ioctl(fd, raw::PERF_EVENT_IOC_ID, &mut id as *mut u64) };
    if ret < 0 {
        return Err(Error::from(::std::io::Error::last_os_error()));
    }
    Ok(id)
}

//! Restore / FD handoff: lets a supervisor preserve a session's kernel file
//! handles across a process restart instead of re-opening (and
//! re-enabling) every tracepoint from scratch.
//!
//! The session keeps one small in-memory log -- an anonymous `memfd`
//! holding a fixed header plus one `(enable_state, name)` entry per
//! tracepoint ever enabled -- and rewrites it in full on every state
//! change. A caller that wants to hand its fds to a successor process
//! calls [`Session::save_handoff`](super::Session::save_handoff), which
//! yields `(fd, name)` pairs named `<prefix>/<hex index>`; the successor
//! passes the same pairs to [`Session::restore`](super::Session::restore).

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::{FromRawFd, RawFd};

use byte_reader::ByteReader;
use error::{Error, Result};
use raw::SampleType;

use super::{EnableState, Mode, Wakeup};

/// Everything that must match byte-for-byte between the session that saved
/// a handoff and the session that restores it. Restore's compatibility
/// policy is exact equality of this struct, not a looser versioning scheme.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Header {
    pub mode: Mode,
    pub sample_type_mask: SampleType,
    pub wakeup: Wakeup,
    pub buffer_count: u32,
    pub page_size: u32,
    pub buffer_size: u32,
}

const HEADER_LEN: usize = 1 + 8 + 1 + 4 + 4 + 4 + 4;

impl Header {
    fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = match self.mode {
            Mode::Circular => 0,
            Mode::RealTime => 1,
        };
        buf[1..9].copy_from_slice(&self.sample_type_mask.bits().to_le_bytes());
        let (wakeup_kind, wakeup_n) = self.wakeup.to_raw();
        buf[9] = wakeup_kind;
        buf[10..14].copy_from_slice(&wakeup_n.to_le_bytes());
        buf[14..18].copy_from_slice(&self.buffer_count.to_le_bytes());
        buf[18..22].copy_from_slice(&self.page_size.to_le_bytes());
        buf[22..26].copy_from_slice(&self.buffer_size.to_le_bytes());
        buf
    }

    fn from_bytes(bytes: &[u8]) -> Result<Header> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::invalid_data("restore log header truncated"));
        }
        let r = ByteReader::host();
        let mode = match bytes[0] {
            0 => Mode::Circular,
            1 => Mode::RealTime,
            _ => return Err(Error::invalid_data("restore log header has unknown mode byte")),
        };
        let sample_type_mask = SampleType::from_bits_truncate(
            r.get_u64(bytes, 1).ok_or_else(|| Error::invalid_data("restore log header truncated"))?,
        );
        let wakeup_kind = bytes[9];
        let wakeup_n = r.get_u32(bytes, 10).ok_or_else(|| Error::invalid_data("restore log header truncated"))?;
        let wakeup = Wakeup::from_raw(wakeup_kind, wakeup_n)?;
        let buffer_count = r.get_u32(bytes, 14).ok_or_else(|| Error::invalid_data("restore log header truncated"))?;
        let page_size = r.get_u32(bytes, 18).ok_or_else(|| Error::invalid_data("restore log header truncated"))?;
        let buffer_size = r.get_u32(bytes, 22).ok_or_else(|| Error::invalid_data("restore log header truncated"))?;
        Ok(Header {
            mode,
            sample_type_mask,
            wakeup,
            buffer_count,
            page_size,
            buffer_size,
        })
    }
}

/// One `(enable_state, full_name)` entry in the descriptor log.
#[derive(Clone, Debug)]
struct Entry {
    state: EnableState,
    name: String,
}

/// The session's in-memory descriptor log. Backed by `memfd_create` so the
/// fd itself is what a supervisor preserves -- there is no path on disk.
pub struct DescriptorLog {
    file: File,
    header: Header,
    entries: Vec<Entry>,
}

impl DescriptorLog {
    pub fn new(header: Header) -> Result<Self> {
        let file = create_memfd("tracepoint_events-restore-log")?;
        let mut log = DescriptorLog {
            file,
            header,
            entries: Vec::new(),
        };
        log.flush()?;
        Ok(log)
    }

    pub fn fd(&self) -> RawFd {
        use std::os::unix::io::AsRawFd;
        self.file.as_raw_fd()
    }

    /// Records (or updates) one tracepoint's enable state and rewrites the
    /// whole log. Simpler and harder to get wrong than incremental
    /// append-and-patch, and this log is at most a few hundred bytes per
    /// tracepoint.
    pub fn record(&mut self, name: &str, state: EnableState) -> Result<()> {
        trace!("recording {:?} for {} in the restore log", state, name);
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => entry.state = state,
            None => self.entries.push(Entry {
                state,
                name: name.to_string(),
            }),
        }
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        let mut bytes = self.header.to_bytes().to_vec();
        for entry in &self.entries {
            bytes.push(entry.state.to_u8());
            let name_bytes = entry.name.as_bytes();
            bytes.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
            bytes.extend_from_slice(name_bytes);
        }
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&bytes)?;
        Ok(())
    }

    /// Reads back `(Header, entries)` from a log fd handed in by a
    /// supervisor. Takes ownership of `fd` (wraps it in a `File`).
    pub fn read_from_fd(fd: RawFd) -> Result<(Header, Vec<(String, EnableState)>)> {
        let mut file = unsafe { File::from_raw_fd(fd) };
        file.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let header = Header::from_bytes(&bytes)?;
        let mut pos = HEADER_LEN;
        let mut entries = Vec::new();
        let r = ByteReader::host();
        while pos < bytes.len() {
            let state = EnableState::from_u8(
                *bytes
                    .get(pos)
                    .ok_or_else(|| Error::invalid_data("restore log entry truncated"))?,
            )?;
            pos += 1;
            let name_len = r
                .get_u16(&bytes, pos)
                .ok_or_else(|| Error::invalid_data("restore log entry truncated"))? as usize;
            pos += 2;
            let name_bytes = bytes
                .get(pos..pos + name_len)
                .ok_or_else(|| Error::invalid_data("restore log entry name truncated"))?;
            let name = ::std::str::from_utf8(name_bytes)
                .map_err(|_| Error::invalid_data("restore log entry name is not valid UTF-8"))?
                .to_string();
            pos += name_len;
            entries.push((name, state));
        }
        Ok((header, entries))
    }
}

#[cfg(target_os = "linux")]
fn create_memfd(name: &str) -> Result<File> {
    use std::ffi::CString;
    let cname = CString::new(name).map_err(|_| Error::invalid_parameter("memfd name contains a NUL byte"))?;
    let fd = unsafe { libc::memfd_create(cname.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(Error::from(::std::io::Error::last_os_error()));
    }
    Ok(unsafe { File::from_raw_fd(fd) })
}

#[cfg(not(target_os = "linux"))]
fn create_memfd(_name: &str) -> Result<File> {
    Err(Error::not_supported("restore log requires memfd_create (Linux-only)"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        Header {
            mode: Mode::RealTime,
            sample_type_mask: SampleType::TID | SampleType::TIME,
            wakeup: Wakeup::Events(1),
            buffer_count: 4,
            page_size: 4096,
            buffer_size: 65536,
        }
    }

    #[test]
    fn header_round_trips_through_bytes() {
        let header = sample_header();
        let bytes = header.to_bytes();
        let parsed = Header::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn log_round_trips_through_memfd() {
        let mut log = DescriptorLog::new(sample_header()).unwrap();
        log.record("user_events:my_event", EnableState::Enabled).unwrap();
        log.record("user_events:other_event", EnableState::Disabled).unwrap();

        let fd = log.fd();
        let dup_fd = unsafe { libc::dup(fd) };
        assert!(dup_fd >= 0);

        let (header, entries) = DescriptorLog::read_from_fd(dup_fd).unwrap();
        assert_eq!(header, sample_header());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], ("user_events:my_event".to_string(), EnableState::Enabled));
        assert_eq!(entries[1], ("user_events:other_event".to_string(), EnableState::Disabled));
    }
}

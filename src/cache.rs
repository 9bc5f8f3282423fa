//! Caches parsed tracepoint descriptors, keyed by both the kernel-assigned
//! numeric id (as seen in ring-buffer records) and the `system:event` name
//! (as requested by a caller enabling a tracepoint).
//!
//! Grounded on the tracepoint-lookup role `PerfEventFormatCache` plays in
//! `microsoft/LinuxTracepoints-Rust`'s `tracepoint_decode` crate, adapted to
//! this crate's `tracefs`-backed discovery instead of a caller-supplied
//! format string only.

use std::collections::HashMap;

use error::{Error, Result};
use format::PerfEventFormat;
use tracefs;

/// A cached descriptor: the parsed fields plus the raw `format` file text
/// they were parsed from, kept around for diagnostics.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    format: PerfEventFormat,
    raw_text: String,
}

impl CacheEntry {
    pub fn format(&self) -> &PerfEventFormat {
        &self.format
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }
}

/// Looks up tracepoint descriptors by id or by name, enforcing that every
/// descriptor sharing a `common_type` value agrees on that field's
/// `(offset, size)` -- the invariant the session's record-dispatch logic
/// depends on to read `common_type` before it knows which descriptor a
/// record belongs to.
#[derive(Debug, Default)]
pub struct TracepointCache {
    by_id: HashMap<u32, CacheEntry>,
    by_name: HashMap<(String, String), u32>,
    common_type_offset: Option<u16>,
    common_type_size: Option<u8>,
}

impl TracepointCache {
    pub fn new() -> Self {
        TracepointCache::default()
    }

    /// Parses and inserts a descriptor directly from format-file text,
    /// without touching tracefs. Used by tests and by callers that already
    /// have the text (e.g. restored from a previous process).
    pub fn add_from_format(
        &mut self,
        system: &str,
        event: &str,
        format_text: &str,
        long_is_64_bits: bool,
    ) -> Result<u32> {
        let format = PerfEventFormat::parse(system, event, format_text, long_is_64_bits)?;
        self.insert(system, event, format, format_text.to_string())
    }

    /// Reads `<tracing_root>/events/<system>/<event>/format` and inserts the
    /// parsed descriptor.
    pub fn add_from_system(
        &mut self,
        system: &str,
        event: &str,
        long_is_64_bits: bool,
    ) -> Result<u32> {
        let text = tracefs::read_format_file(system, event)?;
        self.add_from_format(system, event, &text, long_is_64_bits)
    }

    fn insert(
        &mut self,
        system: &str,
        event: &str,
        format: PerfEventFormat,
        raw_text: String,
    ) -> Result<u32> {
        let id = format.id();

        if self.by_id.contains_key(&id) {
            return Err(Error::AlreadyExists {
                reason: format!("tracepoint id {} already cached", id),
            });
        }

        if self
            .by_name
            .contains_key(&(system.to_string(), event.to_string()))
        {
            return Err(Error::AlreadyExists {
                reason: format!("tracepoint {}:{} already cached", system, event),
            });
        }

        match (self.common_type_offset, self.common_type_size) {
            (Some(o), Some(s)) if o != format.common_type_offset() || s != format.common_type_size() => {
                return Err(Error::invalid_data(
                    "common_type field location disagrees with previously cached descriptors",
                ));
            }
            (None, None) => {
                self.common_type_offset = Some(format.common_type_offset());
                self.common_type_size = Some(format.common_type_size());
            }
            _ => {}
        }

        self.by_name
            .insert((system.to_string(), event.to_string()), id);
        self.by_id.insert(
            id,
            CacheEntry {
                format,
                raw_text,
            },
        );
        Ok(id)
    }

    pub fn find_by_id(&self, id: u32) -> Option<&CacheEntry> {
        self.by_id.get(&id)
    }

    pub fn find_by_name(&self, system: &str, event: &str) -> Option<&CacheEntry> {
        let id = self
            .by_name
            .get(&(system.to_string(), event.to_string()))?;
        self.by_id.get(id)
    }

    /// Reads `common_type` out of `raw_record` using the offset/size shared
    /// by every cached descriptor, then looks up the matching entry. Returns
    /// `None` if the cache has no descriptors yet (so no common_type layout
    /// is known) or the value doesn't match any cached id.
    pub fn find_by_raw_prefix(&self, raw_record: &[u8]) -> Option<&CacheEntry> {
        use byte_reader::ByteReader;
        let offset = self.common_type_offset? as usize;
        let size = self.common_type_size?;
        let id = ByteReader::host().get_uint(raw_record, offset, size)? as u32;
        self.by_id.get(&id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn common_type_offset(&self) -> Option<u16> {
        self.common_type_offset
    }

    pub fn common_type_size(&self) -> Option<u8> {
        self.common_type_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHED_SWITCH: &str = "name: sched_switch\n\
ID: 314\n\
format:\n\
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;\n\
\tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;\n\
\tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;\n\
\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;\n\
\n\
\tfield:char prev_comm[16];\toffset:8;\tsize:16;\tsigned:0;\n\
\n\
print fmt: \"...\"\n";

    const SCHED_WAKEUP: &str = "name: sched_wakeup\n\
ID: 315\n\
format:\n\
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;\n\
\tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;\n\
\tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;\n\
\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;\n\
\n\
\tfield:pid_t pid;\toffset:8;\tsize:4;\tsigned:0;\n\
\n\
print fmt: \"...\"\n";

    #[test]
    fn inserts_and_finds_by_id_and_name() {
        let mut cache = TracepointCache::new();
        let id = cache
            .add_from_format("sched", "sched_switch", SCHED_SWITCH, true)
            .unwrap();
        assert_eq!(id, 314);
        assert!(cache.find_by_id(314).is_some());
        assert!(cache.find_by_name("sched", "sched_switch").is_some());
        assert!(cache.find_by_name("sched", "nope").is_none());
    }

    #[test]
    fn duplicate_id_rejected() {
        let mut cache = TracepointCache::new();
        cache
            .add_from_format("sched", "sched_switch", SCHED_SWITCH, true)
            .unwrap();
        let err = cache
            .add_from_format("sched", "sched_switch", SCHED_SWITCH, true)
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[test]
    fn duplicate_name_with_different_id_rejected() {
        const SCHED_SWITCH_OTHER_ID: &str = "name: sched_switch\n\
ID: 999\n\
format:\n\
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;\n\
\tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;\n\
\tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;\n\
\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;\n\
\n\
\tfield:char prev_comm[16];\toffset:8;\tsize:16;\tsigned:0;\n\
\n\
print fmt: \"...\"\n";

        let mut cache = TracepointCache::new();
        cache
            .add_from_format("sched", "sched_switch", SCHED_SWITCH, true)
            .unwrap();
        let err = cache
            .add_from_format("sched", "sched_switch", SCHED_SWITCH_OTHER_ID, true)
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
        assert_eq!(cache.find_by_id(314).unwrap().format().id(), 314);
        assert!(cache.find_by_id(999).is_none());
    }

    #[test]
    fn finds_by_raw_common_type_prefix() {
        let mut cache = TracepointCache::new();
        cache
            .add_from_format("sched", "sched_switch", SCHED_SWITCH, true)
            .unwrap();
        cache
            .add_from_format("sched", "sched_wakeup", SCHED_WAKEUP, true)
            .unwrap();

        let mut raw = vec![0u8; 16];
        raw[0] = 315u16.to_le_bytes()[0];
        raw[1] = 315u16.to_le_bytes()[1];

        let entry = cache.find_by_raw_prefix(&raw).unwrap();
        assert_eq!(entry.format().event_name(), "sched_wakeup");
    }
}

//! Parses one `PERF_RECORD_SAMPLE` payload: the kernel writes its optional
//! fields in a fixed order dictated by `sample_type`, documented in
//! `perf_event_open(2)`'s "Sample Format" section. This module owns that
//! field order; nothing else in the crate needs to know it.

use byte_reader::ByteReader;
use cache::TracepointCache;
use error::{Error, Result};
use raw::SampleType;

/// One CPU register-style view over a parsed `PERF_RECORD_SAMPLE`. Every
/// field is `Option` because its presence depends entirely on the session's
/// `sample_type_mask`; fields the mask didn't request are always `None`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SampleEventInfo<'a> {
    pub identifier: Option<u64>,
    pub ip: Option<u64>,
    pub pid: Option<u32>,
    pub tid: Option<u32>,
    pub time: Option<u64>,
    pub addr: Option<u64>,
    pub id: Option<u64>,
    pub stream_id: Option<u64>,
    pub cpu: Option<u32>,
    pub period: Option<u64>,
    pub callchain: Option<Callchain<'a>>,
    pub raw: Option<&'a [u8]>,
    /// Resolved by the raw payload's `common_type` prefix, if a cache was
    /// supplied and the raw field was present. `None` means the caller must
    /// fall back to resolving by sample id (`identifier` or `id`).
    pub descriptor_id: Option<u32>,
}

/// Borrowed view over a `PERF_SAMPLE_CALLCHAIN` ip list: `nr` little-endian
/// `u64`s immediately following the `nr` count this struct was built from.
#[derive(Clone, Copy, Debug)]
pub struct Callchain<'a> {
    bytes: &'a [u8],
    count: usize,
}

impl<'a> Callchain<'a> {
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn get(&self, index: usize) -> Option<u64> {
        if index >= self.count {
            return None;
        }
        ByteReader::host().get_u64(self.bytes, index * 8)
    }
}

/// Parses the sample-type-ordered fields out of `bytes` (the record's
/// payload, i.e. everything after the 8-byte `perf_event_header`).
/// Bounds-checks every step; returns `InvalidData` on the first field that
/// doesn't fit, so the caller can bump its corrupt-event counter and skip
/// the record rather than trust a partially-populated result.
pub fn parse_sample<'a>(
    mask: SampleType,
    bytes: &'a [u8],
    cache: Option<&TracepointCache>,
) -> Result<SampleEventInfo<'a>> {
    let r = ByteReader::host();
    let mut pos = 0usize;
    let mut info = SampleEventInfo::default();

    if mask.contains(SampleType::IDENTIFIER) {
        info.identifier = Some(read_u64(&r, bytes, &mut pos)?);
    }
    if mask.contains(SampleType::IP) {
        info.ip = Some(read_u64(&r, bytes, &mut pos)?);
    }
    if mask.contains(SampleType::TID) {
        info.pid = Some(read_u32(&r, bytes, &mut pos)?);
        info.tid = Some(read_u32(&r, bytes, &mut pos)?);
    }
    if mask.contains(SampleType::TIME) {
        info.time = Some(read_u64(&r, bytes, &mut pos)?);
    }
    if mask.contains(SampleType::ADDR) {
        info.addr = Some(read_u64(&r, bytes, &mut pos)?);
    }
    if mask.contains(SampleType::ID) {
        info.id = Some(read_u64(&r, bytes, &mut pos)?);
    }
    if mask.contains(SampleType::STREAM_ID) {
        info.stream_id = Some(read_u64(&r, bytes, &mut pos)?);
    }
    if mask.contains(SampleType::CPU) {
        info.cpu = Some(read_u32(&r, bytes, &mut pos)?);
        let _reserved = read_u32(&r, bytes, &mut pos)?;
    }
    if mask.contains(SampleType::PERIOD) {
        info.period = Some(read_u64(&r, bytes, &mut pos)?);
    }
    if mask.contains(SampleType::CALLCHAIN) {
        let nr = read_u64(&r, bytes, &mut pos)? as usize;
        let span = nr
            .checked_mul(8)
            .ok_or_else(|| Error::invalid_data("callchain length overflow"))?;
        let callchain_bytes = bytes
            .get(pos..pos + span)
            .ok_or_else(|| Error::invalid_data("truncated callchain"))?;
        pos += span;
        info.callchain = Some(Callchain {
            bytes: callchain_bytes,
            count: nr,
        });
    }
    if mask.contains(SampleType::RAW) {
        let size = read_u32(&r, bytes, &mut pos)? as usize;
        let raw = bytes
            .get(pos..pos + size)
            .ok_or_else(|| Error::invalid_data("truncated raw payload"))?;
        pos += size;
        info.raw = Some(raw);
    }

    if let (Some(raw), Some(cache)) = (info.raw, cache) {
        info.descriptor_id = resolve_descriptor_id(cache, raw);
    }

    Ok(info)
}

fn resolve_descriptor_id(cache: &TracepointCache, raw: &[u8]) -> Option<u32> {
    let entry = cache.find_by_raw_prefix(raw)?;
    Some(entry.format().id())
}

fn read_u32(r: &ByteReader, bytes: &[u8], pos: &mut usize) -> Result<u32> {
    let v = r
        .get_u32(bytes, *pos)
        .ok_or_else(|| Error::invalid_data("truncated sample record"))?;
    *pos += 4;
    Ok(v)
}

fn read_u64(r: &ByteReader, bytes: &[u8], pos: &mut usize) -> Result<u64> {
    let v = r
        .get_u64(bytes, *pos)
        .ok_or_else(|| Error::invalid_data("truncated sample record"))?;
    *pos += 8;
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tid_time_cpu_raw() {
        let mask = SampleType::TID | SampleType::TIME | SampleType::CPU | SampleType::RAW;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&100u32.to_le_bytes()); // pid
        bytes.extend_from_slice(&200u32.to_le_bytes()); // tid
        bytes.extend_from_slice(&42u64.to_le_bytes()); // time
        bytes.extend_from_slice(&3u32.to_le_bytes()); // cpu
        bytes.extend_from_slice(&0u32.to_le_bytes()); // res
        bytes.extend_from_slice(&4u32.to_le_bytes()); // raw size
        bytes.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);

        let info = parse_sample(mask, &bytes, None).unwrap();
        assert_eq!(info.pid, Some(100));
        assert_eq!(info.tid, Some(200));
        assert_eq!(info.time, Some(42));
        assert_eq!(info.cpu, Some(3));
        assert_eq!(info.raw, Some(&[0xDE, 0xAD, 0xBE, 0xEF][..]));
    }

    #[test]
    fn truncated_record_is_invalid_data() {
        let mask = SampleType::TIME;
        let bytes = [0u8; 4];
        let err = parse_sample(mask, &bytes, None).unwrap_err();
        assert!(matches!(err, Error::InvalidData { .. }));
    }

    #[test]
    fn callchain_reads_ip_list() {
        let mask = SampleType::CALLCHAIN;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u64.to_le_bytes());
        bytes.extend_from_slice(&0x1111u64.to_le_bytes());
        bytes.extend_from_slice(&0x2222u64.to_le_bytes());

        let info = parse_sample(mask, &bytes, None).unwrap();
        let chain = info.callchain.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.get(0), Some(0x1111));
        assert_eq!(chain.get(1), Some(0x2222));
        assert_eq!(chain.get(2), None);
    }
}

//! Ordered merge across per-CPU buffers (Component F): collect one
//! `(timestamp, buffer_index, size, offset)` bookmark per sample record,
//! reverse per-buffer for `Circular` mode (whose buffers are written
//! newest-first because of `write_backward`), then one stable sort by
//! timestamp. No allocation in the hot loop beyond the one resizable
//! `Vec<Bookmark>` this returns.

use byte_reader::ByteReader;
use error::{Error, Result};
use raw::{self, PerfRecordType, SampleType};

use super::ringbuf::RingBuffer;
use super::sample;
use super::Mode;

/// 16 bytes: `u64` timestamp, `u16` buffer index, `u16` record size, `u32`
/// offset. Kept this small and `Copy` so a session with many events per CPU
/// can sort millions of these without touching the record bytes again
/// until delivery.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Bookmark {
    pub timestamp: u64,
    pub buffer_index: u16,
    pub size: u16,
    pub offset: u32,
}

/// Walks every buffer once, extracting a bookmark for each well-formed
/// `Sample` record that carries a `time` field. Non-sample records and
/// malformed records are skipped, exactly as the unordered walk does --
/// this is a read-only pass and never advances `tail` or touches pause
/// state, so it composes with whatever caller set up the enumeration scope.
pub fn collect_bookmarks(
    mode: Mode,
    mask: SampleType,
    buffers: &[&RingBuffer],
) -> Result<Vec<Bookmark>> {
    if !mask.contains(SampleType::TIME) {
        return Err(Error::PermissionDenied {
            reason: "ordered enumeration requires SampleType::TIME in the sample-type mask",
        });
    }

    let r = ByteReader::host();
    let mut bookmarks = Vec::new();
    let mut scratch = Vec::new();

    for (buf_index, buf) in buffers.iter().enumerate() {
        let head = buf.head();
        let size = buf.data_size();
        let (start, end) = match mode {
            Mode::RealTime => (buf.tail(), head),
            Mode::Circular => (head.saturating_sub(size), head),
        };

        let mut per_buffer = Vec::new();
        let mut cursor = start;
        while cursor < end {
            let remaining = end - cursor;
            if remaining < raw::PERF_EVENT_HEADER_SIZE as u64 {
                break;
            }
            let header = buf.read_into(cursor, raw::PERF_EVENT_HEADER_SIZE, &mut scratch);
            let type_ = match r.get_u32(header, 0) {
                Some(v) => v,
                None => break,
            };
            let record_size = match r.get_u16(header, 6) {
                Some(v) => v,
                None => break,
            };
            if record_size == 0 || record_size % 8 != 0 || (record_size as u64) > remaining {
                // Corrupt buffer: stop walking it, matching the unordered
                // enumerator's "jump cursor to head" handling.
                break;
            }

            if PerfRecordType::from_u32(type_) == PerfRecordType::Sample {
                let payload_len = record_size as usize - raw::PERF_EVENT_HEADER_SIZE;
                let payload = buf.read_into(
                    cursor + raw::PERF_EVENT_HEADER_SIZE as u64,
                    payload_len,
                    &mut scratch,
                );
                if let Ok(info) = sample::parse_sample(mask, payload, None) {
                    if let Some(time) = info.time {
                        per_buffer.push(Bookmark {
                            timestamp: time,
                            buffer_index: buf_index as u16,
                            size: record_size,
                            offset: (cursor % size) as u32,
                        });
                    }
                }
            }

            cursor += record_size as u64;
        }

        if mode == Mode::Circular {
            // write_backward buffers are physically newest-first; reverse
            // to get oldest-to-newest within this CPU before the global sort.
            per_buffer.reverse();
        }
        bookmarks.extend(per_buffer);
    }

    bookmarks.sort_by_key(|b| b.timestamp);
    Ok(bookmarks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_sort_preserves_per_cpu_order_on_ties() {
        let mut bookmarks = vec![
            Bookmark { timestamp: 1, buffer_index: 0, size: 8, offset: 0 },
            Bookmark { timestamp: 1, buffer_index: 1, size: 8, offset: 0 },
            Bookmark { timestamp: 0, buffer_index: 0, size: 8, offset: 8 },
        ];
        bookmarks.sort_by_key(|b| b.timestamp);
        assert_eq!(bookmarks[0].timestamp, 0);
        // The two timestamp=1 entries keep their relative (buffer_index 0
        // before 1) order.
        assert_eq!(bookmarks[1].buffer_index, 0);
        assert_eq!(bookmarks[2].buffer_index, 1);
    }

    #[test]
    fn bookmark_is_sixteen_bytes() {
        assert_eq!(::std::mem::size_of::<Bookmark>(), 16);
    }
}

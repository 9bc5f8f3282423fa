//! Parses the fixed 8-byte EventHeader header, its extension chain, and the
//! `Metadata` extension's event name -- the `start_event` logic of spec
//! §4.D, steps 1-7. The enumerator itself (the per-field walk) lives in
//! `enumerator.rs` and starts from the `ParsedEvent` this module produces.

use byte_reader::ByteReader;
use error::{Error, Result};

use super::enums::{ExtensionKind, HeaderFlags};

const HEADER_SIZE: usize = 8;
const MAX_NAME_LEN: usize = 255;

#[derive(Clone, Copy, Debug)]
pub struct EventHeaderHeader {
    pub flags: HeaderFlags,
    pub version: u8,
    pub id: u16,
    pub tag: u16,
    pub opcode: u8,
    pub level: u8,
}

/// Everything `start_event` extracts from one EventHeader-encoded record,
/// borrowed from the caller's byte slice.
pub struct ParsedEvent<'a> {
    pub header: EventHeaderHeader,
    pub keyword: u64,
    pub event_name: &'a str,
    /// Field definitions following the NUL-terminated name, up to the end
    /// of the Metadata extension block.
    pub metadata_fields: &'a [u8],
    /// Value bytes following the header and all extensions.
    pub data: &'a [u8],
    pub activity_id: Option<&'a [u8]>,
    pub related_activity_id: Option<&'a [u8]>,
}

pub fn start_event<'a>(tracepoint_name: &str, bytes: &'a [u8]) -> Result<ParsedEvent<'a>> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::invalid_parameter("event shorter than EventHeader header"));
    }
    if tracepoint_name.len() > MAX_NAME_LEN {
        return Err(Error::invalid_parameter("tracepoint name too long"));
    }

    let reader = ByteReader::host();
    let flags_byte = bytes[0];
    let flags = HeaderFlags::from_bits_truncate(flags_byte);
    if flags_byte & !HeaderFlags::KNOWN_BITS != 0 {
        return Err(Error::not_supported("reserved EventHeader flag bits set"));
    }
    if !flags.contains(HeaderFlags::LITTLE_ENDIAN) {
        return Err(Error::not_supported("big-endian EventHeader events are not supported"));
    }

    let header = EventHeaderHeader {
        flags,
        version: bytes[1],
        id: reader.get_u16(bytes, 2).unwrap(),
        tag: reader.get_u16(bytes, 4).unwrap(),
        opcode: bytes[6],
        level: bytes[7],
    };

    let keyword = parse_name_suffix(tracepoint_name, header.level)?;

    let mut cursor = HEADER_SIZE;
    let mut metadata_range: Option<(usize, usize)> = None;
    let mut activity_id: Option<&[u8]> = None;
    let mut related_activity_id: Option<&[u8]> = None;

    if flags.contains(HeaderFlags::EXTENSION) {
        loop {
            let size = reader
                .get_u16(bytes, cursor)
                .ok_or_else(|| Error::invalid_data("truncated extension block header"))?
                as usize;
            let kind_raw = reader
                .get_u16(bytes, cursor + 2)
                .ok_or_else(|| Error::invalid_data("truncated extension block header"))?;
            let chained = kind_raw & ExtensionKind::CHAIN_FLAG != 0;
            let kind = ExtensionKind::from_u16(kind_raw);

            let payload_start = cursor + 4;
            let payload_end = payload_start
                .checked_add(size)
                .ok_or_else(|| Error::invalid_data("extension size overflow"))?;
            if payload_end > bytes.len() {
                return Err(Error::invalid_data("extension block runs past end of event"));
            }
            let payload = &bytes[payload_start..payload_end];

            match kind {
                ExtensionKind::Metadata => {
                    if metadata_range.is_some() {
                        return Err(Error::invalid_data("duplicate Metadata extension"));
                    }
                    metadata_range = Some((payload_start, payload_end));
                }
                ExtensionKind::ActivityId => {
                    match payload.len() {
                        16 => activity_id = Some(payload),
                        32 => {
                            activity_id = Some(&payload[0..16]);
                            related_activity_id = Some(&payload[16..32]);
                        }
                        _ => return Err(Error::invalid_data("ActivityId extension has invalid length")),
                    }
                }
                ExtensionKind::Invalid | ExtensionKind::Unknown(_) => {
                    // Unknown extension kinds are skipped -- only their
                    // length needs to be well-formed.
                }
            }

            cursor = payload_end;
            if !chained {
                break;
            }
            if cursor >= bytes.len() {
                return Err(Error::invalid_data("extension chain truncated"));
            }
        }
    }

    let (meta_start, meta_end) = metadata_range.ok_or_else(|| {
        Error::not_supported("EventHeader event has no Metadata extension")
    })?;
    let metadata = &bytes[meta_start..meta_end];

    let name_end = metadata
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::invalid_data("Metadata event name is not NUL-terminated"))?;
    let event_name = ::std::str::from_utf8(&metadata[..name_end])
        .map_err(|_| Error::invalid_data("Metadata event name is not valid UTF-8"))?;

    let metadata_fields = &metadata[name_end + 1..];
    let data = &bytes[cursor..];

    Ok(ParsedEvent {
        header,
        keyword,
        event_name,
        metadata_fields,
        data,
        activity_id,
        related_activity_id,
    })
}

/// Parses the `_L<hex>K<hex>[A-Z...]` suffix of a tracepoint name, e.g.
/// `"MyProvider_L4K1Gstack"`. Returns the keyword. Fails `NotSupported` if
/// the suffix is absent, the level doesn't match `header_level`, or no
/// keyword digits follow `K`.
fn parse_name_suffix(name: &str, header_level: u8) -> Result<u64> {
    let underscore = name
        .rfind('_')
        .ok_or_else(|| Error::not_supported("tracepoint name has no _L<level>K<keyword> suffix"))?;
    let suffix = &name[underscore + 1..];

    let mut chars = suffix.char_indices();
    match chars.next() {
        Some((_, 'L')) => {}
        _ => return Err(Error::not_supported("tracepoint name suffix missing 'L'")),
    }

    let rest = &suffix[1..];
    let level_end = rest
        .find(|c: char| !c.is_ascii_hexdigit())
        .unwrap_or(rest.len());
    if level_end == 0 {
        return Err(Error::not_supported("tracepoint name suffix missing level digits"));
    }
    let level = u8::from_str_radix(&rest[..level_end], 16)
        .map_err(|_| Error::not_supported("tracepoint name level is not valid hex"))?;
    if level != header_level {
        return Err(Error::not_supported("tracepoint name level disagrees with header level"));
    }

    let rest = &rest[level_end..];
    let mut rest_chars = rest.chars();
    match rest_chars.next() {
        Some('K') => {}
        _ => return Err(Error::not_supported("tracepoint name suffix missing 'K'")),
    }
    let rest = &rest[1..];
    let keyword_end = rest
        .find(|c: char| !c.is_ascii_hexdigit())
        .unwrap_or(rest.len());
    if keyword_end == 0 {
        return Err(Error::not_supported("tracepoint name suffix missing keyword digits"));
    }
    let keyword = u64::from_str_radix(&rest[..keyword_end], 16)
        .map_err(|_| Error::not_supported("tracepoint name keyword is not valid hex"))?;

    // Remaining characters are attribute letters (e.g. group tags);
    // recognized attributes aren't part of this crate's scope, so they're
    // accepted and ignored rather than validated.
    Ok(keyword)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Vec<u8> {
        let mut bytes = vec![
            HeaderFlags::LITTLE_ENDIAN.bits | HeaderFlags::EXTENSION.bits, // flags
            0,    // version
            1, 0, // id
            0, 0, // tag
            0,    // opcode
            4,    // level
        ];
        let mut metadata = Vec::new();
        metadata.extend_from_slice(b"MyEvent\0");
        let ext_size = metadata.len() as u16;
        bytes.extend_from_slice(&ext_size.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes()); // kind = Metadata, no chain bit
        bytes.extend_from_slice(&metadata);
        bytes.extend_from_slice(&[0xAA, 0xBB]); // trailing "data"
        bytes
    }

    #[test]
    fn parses_minimal_event() {
        let bytes = sample_event();
        let parsed = start_event("Provider_L4K1", &bytes).unwrap();
        assert_eq!(parsed.event_name, "MyEvent");
        assert_eq!(parsed.keyword, 1);
        assert_eq!(parsed.data, &[0xAA, 0xBB]);
        assert!(parsed.metadata_fields.is_empty());
    }

    #[test]
    fn rejects_level_mismatch() {
        let bytes = sample_event();
        let err = start_event("Provider_L5K1", &bytes).unwrap_err();
        assert!(matches!(err, Error::NotSupported { .. }));
    }

    #[test]
    fn rejects_missing_metadata() {
        let bytes = vec![HeaderFlags::LITTLE_ENDIAN.bits, 0, 1, 0, 0, 0, 0, 4];
        let err = start_event("Provider_L4K1", &bytes).unwrap_err();
        assert!(matches!(err, Error::NotSupported { .. }));
    }

    #[test]
    fn rejects_big_endian() {
        let bytes = vec![0, 0, 1, 0, 0, 0, 0, 4];
        let err = start_event("Provider_L4K1", &bytes).unwrap_err();
        assert!(matches!(err, Error::NotSupported { .. }));
    }
}

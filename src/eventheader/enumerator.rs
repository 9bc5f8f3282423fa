//! The stack-based, depth-limited enumerator that walks an EventHeader
//! event's inline field metadata and value data.
//!
//! Two cursors drive the walk: `meta_pos` into the Metadata extension's
//! field-definition list, and `data_pos` into the value bytes that follow
//! the header. A small explicit stack (`Frame`) tracks nested struct
//! occurrences and struct-array repeats; simple scalar/string arrays are
//! handled by a separate fast-path slot (`active_array`) since they never
//! need to re-read metadata between elements.

use byte_reader::ByteReader;
use error::{Error, Result};

use super::enums::{ArrayFlags, Encoding, EnumeratorState, Format};
use super::header;

pub use super::header::EventHeaderHeader;

pub const DEFAULT_MOVE_BUDGET: u32 = 4096;
pub const MAX_STRUCT_DEPTH: u8 = 8;

/// One decoded item from the walk: a scalar value, or the begin/end marker
/// of an array or struct.
#[derive(Clone, Debug)]
pub struct Item<'a> {
    pub name: &'a str,
    pub encoding: Encoding,
    pub format: Format,
    pub tag: u16,
    pub array_flags: ArrayFlags,
    pub array_index: u16,
    pub array_count: u16,
    /// 0 for struct markers and array-of-complex begin/end.
    pub element_size: u8,
    /// Empty for `ArrayBegin`/`ArrayEnd`/`StructBegin`/`StructEnd`.
    pub value: &'a [u8],
}

struct FieldDef<'a> {
    name: &'a str,
    encoding: Encoding,
    array_flags: ArrayFlags,
    format: Format,
    tag: u16,
    literal_array_count: Option<u16>,
    struct_field_count: Option<u8>,
}

enum Frame<'a> {
    /// Walking the fields of one struct occurrence.
    Fields { remaining: u16 },
    /// Wraps a `Fields` frame that's being re-entered once per array
    /// element, for an array-of-struct field.
    Repeat {
        meta_restart: usize,
        elems_left: u16,
        field_count: u16,
        name: &'a str,
        array_flags: ArrayFlags,
        array_count: u16,
        tag: u16,
    },
}

struct ArrayState<'a> {
    remaining: u16,
    array_count: u16,
    encoding: Encoding,
    format: Format,
    tag: u16,
    array_flags: ArrayFlags,
    name: &'a str,
}

pub struct Enumerator<'a> {
    metadata: &'a [u8],
    data: &'a [u8],
    state: EnumeratorState,
    meta_pos: usize,
    data_pos: usize,
    stack: Vec<Frame<'a>>,
    struct_depth: u8,
    active_array: Option<ArrayState<'a>>,
    pending_array_end: Option<Item<'a>>,
    move_budget_remaining: u32,
    current: Option<Item<'a>>,
    pub event_name: &'a str,
    pub keyword: u64,
    pub header: EventHeaderHeader,
    pub activity_id: Option<&'a [u8]>,
    pub related_activity_id: Option<&'a [u8]>,
}

impl<'a> Enumerator<'a> {
    /// Validates and loads an EventHeader event, leaving the enumerator in
    /// `BeforeFirstItem`.
    pub fn start_event(tracepoint_name: &str, bytes: &'a [u8]) -> Result<Self> {
        let parsed = header::start_event(tracepoint_name, bytes)?;
        Ok(Enumerator {
            metadata: parsed.metadata_fields,
            data: parsed.data,
            state: EnumeratorState::BeforeFirstItem,
            meta_pos: 0,
            data_pos: 0,
            stack: Vec::new(),
            struct_depth: 0,
            active_array: None,
            pending_array_end: None,
            move_budget_remaining: DEFAULT_MOVE_BUDGET,
            current: None,
            event_name: parsed.event_name,
            keyword: parsed.keyword,
            header: parsed.header,
            activity_id: parsed.activity_id,
            related_activity_id: parsed.related_activity_id,
        })
    }

    /// Overrides the default move budget (4096). Only meaningful before the
    /// first `move_next` call.
    pub fn with_move_budget(mut self, budget: u32) -> Self {
        self.move_budget_remaining = budget;
        self
    }

    pub fn state(&self) -> EnumeratorState {
        self.state
    }

    pub fn current_item(&self) -> Option<&Item<'a>> {
        self.current.as_ref()
    }

    /// Drives one state transition. Latches `Error` on failure: subsequent
    /// calls fail immediately without touching any cursor.
    pub fn move_next(&mut self) -> Result<EnumeratorState> {
        if self.state == EnumeratorState::Error {
            return Err(Error::invalid_data("enumerator is latched in the Error state"));
        }
        if self.state == EnumeratorState::AfterLastItem {
            return Ok(EnumeratorState::AfterLastItem);
        }
        match self.step() {
            Ok(s) => {
                self.state = s;
                Ok(s)
            }
            Err(e) => {
                self.state = EnumeratorState::Error;
                Err(e)
            }
        }
    }

    /// Skips to the end of the item currently positioned at (an
    /// `ArrayBegin`/`StructBegin`), or behaves like `move_next` otherwise.
    pub fn move_next_sibling(&mut self) -> Result<EnumeratorState> {
        if self.state == EnumeratorState::ArrayBegin {
            if let Some(arr) = self.active_array.take() {
                if let Some(elem_size) = arr.encoding.fixed_size() {
                    let skip = arr.remaining as usize * elem_size as usize;
                    self.data_pos += skip;
                    let item = Item {
                        name: arr.name,
                        encoding: arr.encoding,
                        format: arr.format,
                        tag: arr.tag,
                        array_flags: arr.array_flags,
                        array_index: arr.array_count,
                        array_count: arr.array_count,
                        element_size: 0,
                        value: &[],
                    };
                    self.current = Some(item);
                    self.state = EnumeratorState::ArrayEnd;
                    return Ok(self.state);
                }
                self.active_array = Some(arr);
            }
        }

        let mut depth: i32 = 0;
        loop {
            let s = self.move_next()?;
            match s {
                EnumeratorState::ArrayBegin | EnumeratorState::StructBegin => depth += 1,
                EnumeratorState::ArrayEnd | EnumeratorState::StructEnd => {
                    depth -= 1;
                    if depth <= 0 {
                        return Ok(s);
                    }
                }
                EnumeratorState::AfterLastItem | EnumeratorState::Error => return Ok(s),
                _ => {}
            }
        }
    }

    fn step(&mut self) -> Result<EnumeratorState> {
        self.move_budget_remaining = self
            .move_budget_remaining
            .checked_sub(1)
            .ok_or_else(|| Error::implementation_limit("enumerator move budget exceeded"))?;

        if let Some(item) = self.pending_array_end.take() {
            self.current = Some(item);
            return Ok(EnumeratorState::ArrayEnd);
        }

        if let Some(s) = self.continue_array()? {
            return Ok(s);
        }

        if matches!(self.stack.last(), Some(Frame::Fields { remaining: 0 })) {
            self.stack.pop();
            return self.close_fields_frame();
        }

        if self.stack.is_empty() && self.meta_pos >= self.metadata.len() {
            self.current = None;
            return Ok(EnumeratorState::AfterLastItem);
        }

        let (field, next_pos) = read_field_def(self.metadata, self.meta_pos)?;
        self.meta_pos = next_pos;

        if let Some(Frame::Fields { remaining }) = self.stack.last_mut() {
            *remaining = remaining
                .checked_sub(1)
                .ok_or_else(|| Error::invalid_data("struct occurrence read more fields than declared"))?;
        }

        self.emit_field(field)
    }

    fn continue_array(&mut self) -> Result<Option<EnumeratorState>> {
        let remaining = match &self.active_array {
            Some(arr) => arr.remaining,
            None => return Ok(None),
        };

        if remaining > 0 {
            let arr = self.active_array.as_mut().unwrap();
            let (value, consumed) = decode_element(self.data, self.data_pos, arr.encoding)?;
            self.data_pos += consumed;
            let index = arr.array_count - arr.remaining;
            arr.remaining -= 1;
            let item = Item {
                name: arr.name,
                encoding: arr.encoding,
                format: arr.format,
                tag: arr.tag,
                array_flags: arr.array_flags,
                array_index: index,
                array_count: arr.array_count,
                element_size: arr.encoding.fixed_size().unwrap_or(0),
                value,
            };
            self.current = Some(item);
            Ok(Some(EnumeratorState::Value))
        } else {
            let arr = self.active_array.take().unwrap();
            let item = Item {
                name: arr.name,
                encoding: arr.encoding,
                format: arr.format,
                tag: arr.tag,
                array_flags: arr.array_flags,
                array_index: arr.array_count,
                array_count: arr.array_count,
                element_size: 0,
                value: &[],
            };
            self.current = Some(item);
            Ok(Some(EnumeratorState::ArrayEnd))
        }
    }

    fn close_fields_frame(&mut self) -> Result<EnumeratorState> {
        self.struct_depth -= 1;

        if matches!(self.stack.last(), Some(Frame::Repeat { .. })) {
            let (meta_restart, elems_left, field_count, name, array_flags, array_count, tag) =
                match self.stack.last_mut().unwrap() {
                    Frame::Repeat {
                        meta_restart,
                        elems_left,
                        field_count,
                        name,
                        array_flags,
                        array_count,
                        tag,
                    } => {
                        *elems_left -= 1;
                        (*meta_restart, *elems_left, *field_count, *name, *array_flags, *array_count, *tag)
                    }
                    _ => unreachable!(),
                };

            if elems_left > 0 {
                self.meta_pos = meta_restart;
                self.enter_struct_occurrence(field_count)?;
            } else {
                self.stack.pop();
                self.pending_array_end = Some(Item {
                    name,
                    encoding: Encoding::Struct,
                    format: Format::Default,
                    tag,
                    array_flags,
                    array_index: array_count,
                    array_count,
                    element_size: 0,
                    value: &[],
                });
            }
        }

        self.current = Some(Item {
            name: "",
            encoding: Encoding::Struct,
            format: Format::Default,
            tag: 0,
            array_flags: ArrayFlags::empty(),
            array_index: 0,
            array_count: 1,
            element_size: 0,
            value: &[],
        });
        Ok(EnumeratorState::StructEnd)
    }

    fn enter_struct_occurrence(&mut self, field_count: u16) -> Result<()> {
        if self.struct_depth >= MAX_STRUCT_DEPTH {
            return Err(Error::StackOverflow);
        }
        self.struct_depth += 1;
        self.stack.push(Frame::Fields { remaining: field_count });
        Ok(())
    }

    fn emit_field(&mut self, field: FieldDef<'a>) -> Result<EnumeratorState> {
        let is_array = field.array_flags.intersects(ArrayFlags::C_ARRAY | ArrayFlags::V_ARRAY);

        let array_count = if is_array {
            let carray = field.array_flags.contains(ArrayFlags::C_ARRAY);
            let varray = field.array_flags.contains(ArrayFlags::V_ARRAY);
            Some(match (carray, varray) {
                (true, false) => field
                    .literal_array_count
                    .ok_or_else(|| Error::invalid_data("CArray field missing literal count"))?,
                (false, true) => {
                    let n = ByteReader::host()
                        .get_u16(self.data, self.data_pos)
                        .ok_or_else(|| Error::invalid_data("truncated VArray runtime count"))?;
                    self.data_pos += 2;
                    n
                }
                _ => return Err(Error::invalid_data("field declares both CArray and VArray")),
            })
        } else {
            None
        };

        if field.encoding == Encoding::Struct {
            let field_count = field
                .struct_field_count
                .ok_or_else(|| Error::invalid_data("struct field is missing its field-count format byte"))?;

            match array_count {
                None => {
                    self.enter_struct_occurrence(field_count)?;
                    self.current = Some(Item {
                        name: field.name,
                        encoding: field.encoding,
                        format: field.format,
                        tag: field.tag,
                        array_flags: ArrayFlags::empty(),
                        array_index: 0,
                        array_count: 1,
                        element_size: 0,
                        value: &[],
                    });
                    Ok(EnumeratorState::StructBegin)
                }
                Some(0) => {
                    self.meta_pos = skip_field_defs(self.metadata, self.meta_pos, field_count)?;
                    self.pending_array_end = Some(Item {
                        name: field.name,
                        encoding: field.encoding,
                        format: field.format,
                        tag: field.tag,
                        array_flags: field.array_flags,
                        array_index: 0,
                        array_count: 0,
                        element_size: 0,
                        value: &[],
                    });
                    self.current = Some(Item {
                        name: field.name,
                        encoding: field.encoding,
                        format: field.format,
                        tag: field.tag,
                        array_flags: field.array_flags,
                        array_index: 0,
                        array_count: 0,
                        element_size: 0,
                        value: &[],
                    });
                    Ok(EnumeratorState::ArrayBegin)
                }
                Some(n) => {
                    self.stack.push(Frame::Repeat {
                        meta_restart: self.meta_pos,
                        elems_left: n,
                        field_count,
                        name: field.name,
                        array_flags: field.array_flags,
                        array_count: n,
                        tag: field.tag,
                    });
                    self.enter_struct_occurrence(field_count)?;
                    self.current = Some(Item {
                        name: field.name,
                        encoding: field.encoding,
                        format: field.format,
                        tag: field.tag,
                        array_flags: field.array_flags,
                        array_index: 0,
                        array_count: n,
                        element_size: 0,
                        value: &[],
                    });
                    Ok(EnumeratorState::ArrayBegin)
                }
            }
        } else {
            match array_count {
                None => {
                    let (value, consumed) = decode_element(self.data, self.data_pos, field.encoding)?;
                    self.data_pos += consumed;
                    self.current = Some(Item {
                        name: field.name,
                        encoding: field.encoding,
                        format: field.format,
                        tag: field.tag,
                        array_flags: ArrayFlags::empty(),
                        array_index: 0,
                        array_count: 1,
                        element_size: field.encoding.fixed_size().unwrap_or(0),
                        value,
                    });
                    Ok(EnumeratorState::Value)
                }
                Some(n) => {
                    self.current = Some(Item {
                        name: field.name,
                        encoding: field.encoding,
                        format: field.format,
                        tag: field.tag,
                        array_flags: field.array_flags,
                        array_index: 0,
                        array_count: n,
                        element_size: field.encoding.fixed_size().unwrap_or(0),
                        value: &[],
                    });
                    self.active_array = Some(ArrayState {
                        remaining: n,
                        array_count: n,
                        encoding: field.encoding,
                        format: field.format,
                        tag: field.tag,
                        array_flags: field.array_flags,
                        name: field.name,
                    });
                    Ok(EnumeratorState::ArrayBegin)
                }
            }
        }
    }
}

/// One field declaration from a metadata-only walk: the same information
/// `move_next` would derive before touching any data, minus the decoded
/// value. Used by introspection tools that want a tracepoint's shape
/// without a data buffer to decode against.
#[derive(Clone, Debug)]
pub struct MetadataItem<'a> {
    pub name: &'a str,
    pub encoding: Encoding,
    pub format: Format,
    pub tag: u16,
    pub array_flags: ArrayFlags,
    /// `Some` only for a `CArray` field -- its compile-time-literal count.
    pub literal_array_count: Option<u16>,
    /// `Some` only for a `Struct` field -- holds the field count the way the
    /// wire format byte does.
    pub struct_field_count: Option<u8>,
}

/// Walks one field-declaration list, one item per declared field, without
/// ever reading data. A field typed `Struct` is surfaced as a single item
/// (its own declaration) with `struct_field_count` set -- its children are
/// skipped over, not flattened into the walk.
pub struct MetadataEnumerator<'a> {
    metadata: &'a [u8],
    pos: usize,
}

impl<'a> MetadataEnumerator<'a> {
    pub fn new(metadata: &'a [u8]) -> Self {
        MetadataEnumerator { metadata, pos: 0 }
    }
}

impl<'a> Iterator for MetadataEnumerator<'a> {
    type Item = Result<MetadataItem<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.metadata.len() {
            return None;
        }

        match read_field_def(self.metadata, self.pos) {
            Ok((field, next_pos)) => {
                let mut pos = next_pos;
                if field.encoding == Encoding::Struct {
                    let field_count = match field.struct_field_count {
                        Some(n) => n,
                        None => {
                            return Some(Err(Error::invalid_data(
                                "struct field is missing its field-count format byte",
                            )))
                        }
                    };
                    pos = match skip_field_defs(self.metadata, pos, field_count as u16) {
                        Ok(p) => p,
                        Err(e) => return Some(Err(e)),
                    };
                }
                self.pos = pos;
                Some(Ok(MetadataItem {
                    name: field.name,
                    encoding: field.encoding,
                    format: field.format,
                    tag: field.tag,
                    array_flags: field.array_flags,
                    literal_array_count: field.literal_array_count,
                    struct_field_count: field.struct_field_count,
                }))
            }
            Err(e) => {
                // Latch: once a parse error is hit, don't keep scanning
                // from a cursor whose validity is no longer known.
                self.pos = self.metadata.len();
                Some(Err(e))
            }
        }
    }
}

/// Reads one field definition starting at `pos`, returning it plus the
/// metadata offset immediately following (the next sibling's position, or
/// for a struct field, its first child's position).
fn read_field_def(metadata: &[u8], pos: usize) -> Result<(FieldDef, usize)> {
    let name_len = metadata
        .get(pos..)
        .and_then(|rest| rest.iter().position(|&b| b == 0))
        .ok_or_else(|| Error::invalid_data("field name is not NUL-terminated"))?;
    let name = ::std::str::from_utf8(&metadata[pos..pos + name_len])
        .map_err(|_| Error::invalid_data("field name is not valid UTF-8"))?;
    let mut cursor = pos + name_len + 1;

    let encoding_byte = *metadata
        .get(cursor)
        .ok_or_else(|| Error::invalid_data("truncated field definition"))?;
    cursor += 1;

    let encoding = Encoding::from_u8(encoding_byte)
        .ok_or_else(|| Error::not_supported("unrecognized field encoding"))?;
    let array_flags = ArrayFlags::from_bits_truncate(encoding_byte & Encoding::ARRAY_FLAGS);
    if array_flags.contains(ArrayFlags::C_ARRAY) && array_flags.contains(ArrayFlags::V_ARRAY) {
        return Err(Error::invalid_data("field declares both CArray and VArray"));
    }

    let mut format = Format::Default;
    let mut tag: u16 = 0;
    let mut struct_field_count = None;

    if encoding_byte & Encoding::CHAIN_FLAG != 0 {
        let format_byte = *metadata
            .get(cursor)
            .ok_or_else(|| Error::invalid_data("truncated field definition (format byte)"))?;
        cursor += 1;

        if encoding == Encoding::Struct {
            struct_field_count = Some(format_byte & Format::VALUE_MASK);
        } else {
            format = Format::from_u8(format_byte);
        }

        if format_byte & Format::TAG_FLAG != 0 {
            let tag_bytes = metadata
                .get(cursor..cursor + 2)
                .ok_or_else(|| Error::invalid_data("truncated field definition (tag)"))?;
            tag = u16::from_le_bytes([tag_bytes[0], tag_bytes[1]]);
            cursor += 2;
        }
    } else if encoding == Encoding::Struct {
        return Err(Error::invalid_data("struct field is missing its field-count format byte"));
    }

    let mut literal_array_count = None;
    if array_flags.contains(ArrayFlags::C_ARRAY) {
        let count_bytes = metadata
            .get(cursor..cursor + 2)
            .ok_or_else(|| Error::invalid_data("truncated field definition (array count)"))?;
        literal_array_count = Some(u16::from_le_bytes([count_bytes[0], count_bytes[1]]));
        cursor += 2;
    }

    Ok((
        FieldDef {
            name,
            encoding,
            array_flags,
            format,
            tag,
            literal_array_count,
            struct_field_count,
        },
        cursor,
    ))
}

/// Walks `count` field definitions purely to advance past their metadata,
/// recursing into nested structs -- used for zero-length arrays-of-struct,
/// whose element type metadata must still be consumed even though no data
/// is read.
fn skip_field_defs(metadata: &[u8], mut pos: usize, count: u16) -> Result<usize> {
    for _ in 0..count {
        let (field, next_pos) = read_field_def(metadata, pos)?;
        pos = next_pos;
        if field.encoding == Encoding::Struct {
            let fc = field
                .struct_field_count
                .ok_or_else(|| Error::invalid_data("struct field is missing its field-count format byte"))?;
            pos = skip_field_defs(metadata, pos, fc)?;
        }
    }
    Ok(pos)
}

/// Decodes one value of `encoding` starting at `data[pos]`, returning the
/// cooked value slice (terminators/length-prefixes stripped) and the total
/// number of bytes consumed from `data` (including any terminator/prefix).
fn decode_element(data: &[u8], pos: usize, encoding: Encoding) -> Result<(&[u8], usize)> {
    if let Some(size) = encoding.fixed_size() {
        let size = size as usize;
        let slice = data
            .get(pos..pos + size)
            .ok_or_else(|| Error::invalid_data("value runs past end of event data"))?;
        Ok((slice, size))
    } else if encoding.is_zstring() {
        let width = encoding.char_width().unwrap() as usize;
        let mut i = pos;
        loop {
            let unit = data
                .get(i..i + width)
                .ok_or_else(|| Error::invalid_data("unterminated string value"))?;
            if unit.iter().all(|&b| b == 0) {
                break;
            }
            i += width;
        }
        Ok((&data[pos..i], i + width - pos))
    } else if encoding.is_length_prefixed_string() {
        let width = encoding.char_width().unwrap() as usize;
        let len_units = ByteReader::host()
            .get_u16(data, pos)
            .ok_or_else(|| Error::invalid_data("truncated string length prefix"))? as usize;
        let start = pos + 2;
        let end = start
            .checked_add(len_units * width)
            .ok_or_else(|| Error::invalid_data("string length overflow"))?;
        let slice = data
            .get(start..end)
            .ok_or_else(|| Error::invalid_data("string value runs past end of event data"))?;
        Ok((slice, end - pos))
    } else {
        Err(Error::invalid_data("encoding has no scalar representation"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_field_def(name: &str, encoding: u8) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(name.as_bytes());
        v.push(0);
        v.push(encoding);
        v
    }

    fn event_bytes(metadata_fields: &[u8], data: &[u8], event_name: &str) -> Vec<u8> {
        let mut bytes = vec![
            super::super::enums::HeaderFlags::LITTLE_ENDIAN.bits
                | super::super::enums::HeaderFlags::EXTENSION.bits,
            0,
            1,
            0,
            0,
            0,
            0,
            4,
        ];
        let mut metadata = Vec::new();
        metadata.extend_from_slice(event_name.as_bytes());
        metadata.push(0);
        metadata.extend_from_slice(metadata_fields);
        let size = metadata.len() as u16;
        bytes.extend_from_slice(&size.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&metadata);
        bytes.extend_from_slice(data);
        bytes
    }

    #[test]
    fn minimal_payload_single_scalar() {
        let fields = minimal_field_def("value", 2); // Value8
        let bytes = event_bytes(&fields, &[0x2A], "E");
        let mut e = Enumerator::start_event("Provider_L4K1", &bytes).unwrap();

        assert_eq!(e.move_next().unwrap(), EnumeratorState::Value);
        let item = e.current_item().unwrap();
        assert_eq!(item.name, "value");
        assert_eq!(item.value, &[0x2A]);

        assert_eq!(e.move_next().unwrap(), EnumeratorState::AfterLastItem);
    }

    #[test]
    fn array_of_u32_runtime_count() {
        // Value32 = 4, VArray flag = 0x40.
        let mut fields = Vec::new();
        fields.extend_from_slice(b"arr\0");
        fields.push(4 | 0x40);

        let mut data = Vec::new();
        data.extend_from_slice(&3u16.to_le_bytes());
        for v in [10u32, 20, 30] {
            data.extend_from_slice(&v.to_le_bytes());
        }

        let bytes = event_bytes(&fields, &data, "E");
        let mut e = Enumerator::start_event("Provider_L4K1", &bytes).unwrap();

        assert_eq!(e.move_next().unwrap(), EnumeratorState::ArrayBegin);
        assert_eq!(e.current_item().unwrap().array_count, 3);

        for expected in [10u32, 20, 30] {
            assert_eq!(e.move_next().unwrap(), EnumeratorState::Value);
            let item = e.current_item().unwrap();
            assert_eq!(u32::from_le_bytes([item.value[0], item.value[1], item.value[2], item.value[3]]), expected);
        }

        assert_eq!(e.move_next().unwrap(), EnumeratorState::ArrayEnd);
        assert_eq!(e.move_next().unwrap(), EnumeratorState::AfterLastItem);
    }

    #[test]
    fn nested_struct_two_fields() {
        // struct "S" with chain flag (format byte = field count = 2), two children: u32 "a", u16 "b".
        let mut fields = Vec::new();
        fields.extend_from_slice(b"S\0");
        fields.push(1 | 0x80); // Struct | chain
        fields.push(2); // field count = 2
        fields.extend_from_slice(b"a\0");
        fields.push(4); // Value32
        fields.extend_from_slice(b"b\0");
        fields.push(3); // Value16

        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&2u16.to_le_bytes());

        let bytes = event_bytes(&fields, &data, "E");
        let mut e = Enumerator::start_event("Provider_L4K1", &bytes).unwrap();

        assert_eq!(e.move_next().unwrap(), EnumeratorState::StructBegin);
        assert_eq!(e.move_next().unwrap(), EnumeratorState::Value);
        assert_eq!(e.current_item().unwrap().name, "a");
        assert_eq!(e.move_next().unwrap(), EnumeratorState::Value);
        assert_eq!(e.current_item().unwrap().name, "b");
        assert_eq!(e.move_next().unwrap(), EnumeratorState::StructEnd);
        assert_eq!(e.move_next().unwrap(), EnumeratorState::AfterLastItem);
    }

    #[test]
    fn zero_length_array_of_struct() {
        let mut fields = Vec::new();
        fields.extend_from_slice(b"arr\0");
        fields.push(1 | 0x80 | 0x40); // Struct | chain | VArray
        fields.push(1); // one field per struct element
        fields.extend_from_slice(b"x\0");
        fields.push(2); // Value8

        let mut data = Vec::new();
        data.extend_from_slice(&0u16.to_le_bytes()); // runtime count = 0

        let bytes = event_bytes(&fields, &data, "E");
        let mut e = Enumerator::start_event("Provider_L4K1", &bytes).unwrap();

        assert_eq!(e.move_next().unwrap(), EnumeratorState::ArrayBegin);
        assert_eq!(e.current_item().unwrap().array_count, 0);
        assert_eq!(e.move_next().unwrap(), EnumeratorState::ArrayEnd);
        assert_eq!(e.move_next().unwrap(), EnumeratorState::AfterLastItem);
    }

    #[test]
    fn oversized_value_is_invalid_data() {
        let fields = minimal_field_def("value", 5); // Value64, 8 bytes
        let bytes = event_bytes(&fields, &[0x01, 0x02], "E"); // only 2 bytes present
        let mut e = Enumerator::start_event("Provider_L4K1", &bytes).unwrap();
        let err = e.move_next().unwrap_err();
        assert!(matches!(err, Error::InvalidData { .. }));
        assert_eq!(e.state(), EnumeratorState::Error);
        assert!(e.move_next().is_err());
    }

    #[test]
    fn move_budget_trips_at_exactly_the_limit() {
        let mut fields = Vec::new();
        for _ in 0..5000u32 {
            fields.push(0); // empty name
            fields.push(2); // Value8
        }
        let data = vec![0xFFu8; 5000];
        let bytes = event_bytes(&fields, &data, "E");
        let mut e = Enumerator::start_event("Provider_L4K1", &bytes).unwrap();

        for _ in 0..DEFAULT_MOVE_BUDGET {
            assert_eq!(e.move_next().unwrap(), EnumeratorState::Value);
        }
        let err = e.move_next().unwrap_err();
        assert!(matches!(err, Error::ImplementationLimit { .. }));
    }

    #[test]
    fn struct_depth_eight_succeeds_nine_overflows() {
        fn nested_struct_fields(depth: u16) -> Vec<u8> {
            if depth == 0 {
                let mut v = Vec::new();
                v.extend_from_slice(b"leaf\0");
                v.push(2); // Value8
                v
            } else {
                let mut v = Vec::new();
                v.extend_from_slice(b"s\0");
                v.push(1 | 0x80);
                v.push(1);
                v.extend_from_slice(&nested_struct_fields(depth - 1));
                v
            }
        }

        let fields8 = nested_struct_fields(8);
        let data = vec![0x01u8];
        let bytes = event_bytes(&fields8, &data, "E");
        let mut e = Enumerator::start_event("Provider_L4K1", &bytes).unwrap();
        loop {
            let s = e.move_next().unwrap();
            if s == EnumeratorState::AfterLastItem {
                break;
            }
        }

        let fields9 = nested_struct_fields(9);
        let bytes9 = event_bytes(&fields9, &data, "E");
        let mut e9 = Enumerator::start_event("Provider_L4K1", &bytes9).unwrap();
        let mut saw_overflow = false;
        loop {
            match e9.move_next() {
                Ok(EnumeratorState::AfterLastItem) => break,
                Ok(_) => continue,
                Err(Error::StackOverflow) => {
                    saw_overflow = true;
                    break;
                }
                Err(_) => break,
            }
        }
        assert!(saw_overflow);
    }

    #[test]
    fn metadata_only_walk_lists_scalar_array_and_struct_fields() {
        let mut metadata = Vec::new();
        // scalar "a": Value32
        metadata.extend_from_slice(b"a\0");
        metadata.push(4);
        // CArray "b": Value8 x3
        metadata.extend_from_slice(b"b\0");
        metadata.push(2 | 0x20); // Value8 | CArray
        metadata.extend_from_slice(&3u16.to_le_bytes());
        // struct "s" with 2 children, which the metadata-only walk should
        // skip over as a single item rather than flattening.
        metadata.extend_from_slice(b"s\0");
        metadata.push(1 | 0x80); // Struct | chain
        metadata.push(2);
        metadata.extend_from_slice(b"x\0");
        metadata.push(2); // Value8
        metadata.extend_from_slice(b"y\0");
        metadata.push(3); // Value16

        let items: Vec<MetadataItem> = MetadataEnumerator::new(&metadata)
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].name, "a");
        assert_eq!(items[0].encoding, Encoding::Value32);
        assert!(items[0].array_flags.is_empty());

        assert_eq!(items[1].name, "b");
        assert!(items[1].array_flags.contains(ArrayFlags::C_ARRAY));
        assert_eq!(items[1].literal_array_count, Some(3));

        assert_eq!(items[2].name, "s");
        assert_eq!(items[2].encoding, Encoding::Struct);
        assert_eq!(items[2].struct_field_count, Some(2));
    }
}

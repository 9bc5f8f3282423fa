//! Parses a kernel-supplied tracefs `format` file into field records.
//!
//! Grounded on the line grammar documented by the kernel's trace event
//! format files (`NAME: VALUE` header lines, then `field:TYPE NAME[N];
//! offset:N; size:N; signed:0|1;` lines) and on the parsing approach used by
//! `microsoft/LinuxTracepoints-Rust`'s `tracepoint_decode::perf_event_format`
//! (see `examples/other_examples/7edb6663_...perf_event_format.rs.rs`),
//! adapted to this crate's field model and error style.

use std::rc::Rc;

use error::{Error, Result};

/// How a field's array-ness is encoded in the raw payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArrayKind {
    /// Not an array.
    None,
    /// `TYPE name[N]` -- `N` is known at parse time.
    FixedLen(u16),
    /// `__data_loc TYPE name[]` -- a `u32` at `offset` holds
    /// `(len << 16) | data_offset_from_record_start`.
    Dynamic,
    /// `__rel_loc TYPE name[]` -- same encoding as `Dynamic`, but
    /// `data_offset` is relative to the end of the `__rel_loc` field itself
    /// rather than to the start of the record.
    RelDyn,
}

/// How a field's value should be interpreted for display purposes. This is
/// a hint derived from the declared C type; it does not affect how many
/// bytes are read, only how a consumer might choose to format them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FormatHint {
    Unsigned,
    Signed,
    Hex,
    /// `char`, `char[]`, `char*` -- consumer should treat the bytes as text.
    String,
}

/// One parsed `field:` line from a tracefs `format` file.
///
/// Field name is stored as a byte range into the [`PerfEventFormat`]'s
/// shared backing text (an [`Rc<str>`]) rather than an owned `String` --
/// every `FieldFormat` in a descriptor, and every descriptor in a
/// [`crate::cache::TracepointCache`], shares one reference-counted buffer.
#[derive(Clone, Debug)]
pub struct FieldFormat {
    text: Rc<str>,
    name_range: (usize, usize),
    offset: u16,
    size: u16,
    signed: bool,
    array: ArrayKind,
    element_size: u8,
    format_hint: FormatHint,
}

impl FieldFormat {
    pub fn name(&self) -> &str {
        &self.text[self.name_range.0..self.name_range.1]
    }

    pub fn offset(&self) -> u16 {
        self.offset
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn is_signed(&self) -> bool {
        self.signed
    }

    pub fn array(&self) -> ArrayKind {
        self.array
    }

    pub fn element_size(&self) -> u8 {
        self.element_size
    }

    pub fn format_hint(&self) -> FormatHint {
        self.format_hint
    }
}

/// Which convention a tracepoint's non-common fields follow. Most
/// tracepoints describe every field directly in their format file
/// (`TraceEventFormat`); `user_events` tracepoints instead carry a single
/// opaque payload whose shape is self-described inline (`EventHeader`, see
/// [`crate::eventheader`]) and declare only the `eventheader_flags` marker
/// field in their format file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PerfEventDecodingStyle {
    TraceEventFormat,
    EventHeader,
}

/// A parsed tracefs `format` file: numeric id, ordered fields, and the
/// location of the `common_type` discriminator within those fields.
#[derive(Clone, Debug)]
pub struct PerfEventFormat {
    text: Rc<str>,
    system_name_range: (usize, usize),
    event_name_range: (usize, usize),
    print_fmt_range: Option<(usize, usize)>,
    id: u32,
    fields: Vec<FieldFormat>,
    common_field_count: u16,
    common_type_offset: u16,
    common_type_size: u8,
}

impl PerfEventFormat {
    /// Parses `format_file_contents` (the full text of a tracefs `format`
    /// file) for the tracepoint `<system_name>:<event_name>`.
    ///
    /// `long_is_64_bits` selects the width used for bare `long`/`unsigned
    /// long` fields, since the format file does not encode the producing
    /// kernel's word size.
    pub fn parse(
        system_name: &str,
        event_name: &str,
        format_file_contents: &str,
        long_is_64_bits: bool,
    ) -> Result<Self> {
        let text: Rc<str> = Rc::from(format_file_contents);
        let mut id = None;
        let mut fields = Vec::new();
        let mut common_field_count: u16 = 0;
        let mut print_fmt_range = None;

        for line in format_file_contents.lines() {
            let trimmed = line.trim();

            if let Some(rest) = trimmed.strip_prefix("ID:") {
                id = rest.trim().parse::<u32>().ok();
            } else if let Some(rest) = trimmed.strip_prefix("print fmt:") {
                print_fmt_range = Some(intern_range(&text, rest.trim()));
            } else if let Some(rest) = trimmed.strip_prefix("field:") {
                match parse_field_line(&text, rest, long_is_64_bits) {
                    Some(field) => {
                        let is_common = field.name().starts_with("common_");
                        fields.push(field);
                        if is_common {
                            common_field_count += 1;
                        }
                    }
                    None => {
                        return Err(Error::invalid_data(
                            "malformed field line in format descriptor",
                        ));
                    }
                }
            }
        }

        let id = id.ok_or_else(|| Error::invalid_data("format descriptor missing ID: line"))?;

        let mut common_type_offset = None;
        let mut common_type_size = None;
        for field in &fields[..common_field_count as usize] {
            if field.name() == "common_type" {
                if common_type_offset.is_some() {
                    return Err(Error::invalid_data(
                        "format descriptor has more than one common_type field",
                    ));
                }
                if !matches!(field.size(), 1 | 2 | 4) {
                    return Err(Error::invalid_data(
                        "common_type field has unsupported size",
                    ));
                }
                common_type_offset = Some(field.offset());
                common_type_size = Some(field.size() as u8);
            }
        }

        let (common_type_offset, common_type_size) = match (common_type_offset, common_type_size)
        {
            (Some(o), Some(s)) => (o, s),
            _ => {
                return Err(Error::invalid_data(
                    "format descriptor is missing a common_type field",
                ))
            }
        };

        let system_name_range = intern_range(&text, system_name);
        let event_name_range = intern_range(&text, event_name);

        Ok(PerfEventFormat {
            text,
            system_name_range,
            event_name_range,
            print_fmt_range,
            id,
            fields,
            common_field_count,
            common_type_offset,
            common_type_size,
        })
    }

    pub fn system_name(&self) -> &str {
        range_str(&self.text, self.system_name_range)
    }

    /// The raw `print fmt:` line's argument text, if the format file
    /// declared one. No consumer in this crate formats with it -- it's kept
    /// because it's part of the real format-file text and a future
    /// formatting crate built on top of this one would need it verbatim.
    pub fn print_fmt(&self) -> Option<&str> {
        self.print_fmt_range.map(|r| range_str(&self.text, r))
    }

    /// Whether this tracepoint's non-common fields should be decoded
    /// directly from the cached field list (`TraceEventFormat`) or by
    /// handing its `raw` payload to [`crate::eventheader::Enumerator`]
    /// (`EventHeader`).
    pub fn decoding_style(&self) -> PerfEventDecodingStyle {
        if self.is_eventheader() {
            PerfEventDecodingStyle::EventHeader
        } else {
            PerfEventDecodingStyle::TraceEventFormat
        }
    }

    pub fn event_name(&self) -> &str {
        range_str(&self.text, self.event_name_range)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn fields(&self) -> &[FieldFormat] {
        &self.fields
    }

    pub fn common_field_count(&self) -> usize {
        self.common_field_count as usize
    }

    pub fn common_type_offset(&self) -> u16 {
        self.common_type_offset
    }

    pub fn common_type_size(&self) -> u8 {
        self.common_type_size
    }

    /// Offset of the first non-common field -- where a consumer's "user
    /// data" begins.
    pub fn common_fields_size(&self) -> u16 {
        match self.fields.get(self.common_field_count.saturating_sub(1) as usize) {
            Some(last_common) if self.common_field_count > 0 => {
                last_common.offset() + last_common.size()
            }
            _ => 0,
        }
    }

    /// `true` if this tracepoint's user fields begin with `eventheader_flags`,
    /// the convention `user_events` providers use to mark an EventHeader
    /// payload. Grounded on the same heuristic
    /// `PerfEventFormat::parse`/`decoding_style` uses in
    /// `examples/other_examples/7edb6663_...perf_event_format.rs.rs`.
    pub fn is_eventheader(&self) -> bool {
        self.fields
            .get(self.common_field_count as usize)
            .map(|f| f.name() == "eventheader_flags")
            .unwrap_or(false)
    }
}

/// Interns `needle` into `text`'s backing storage by range if it's actually
/// a substring of it (true for names that originated from the format file),
/// otherwise appends nothing and returns a zero-length range pointing at an
/// empty slice of `text` -- callers that need the caller-supplied name
/// verbatim should not rely on `system_name()`/`event_name()` being
/// `==` to their input in that edge case; in practice tracefs always
/// embeds the event name inside its own format text, so this fallback is
/// never hit for real kernel data.
fn intern_range(text: &str, needle: &str) -> (usize, usize) {
    match text.find(needle) {
        Some(start) => (start, start + needle.len()),
        None => (0, 0),
    }
}

fn range_str(text: &str, range: (usize, usize)) -> &str {
    &text[range.0..range.1]
}

/// Parses one `TYPE NAME; offset:N; size:N; signed:0|1;` line (the text
/// after the `field:` prefix has already been stripped). `long_is_64_bits`
/// resolves the element size of a bare `long`/`unsigned long` token, since
/// the format file text never encodes the producing kernel's word size.
fn parse_field_line(text: &Rc<str>, line: &str, long_is_64_bits: bool) -> Option<FieldFormat> {
    let mut decl = None;
    let mut offset = None;
    let mut size = None;
    let mut signed = None;

    for part in line.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some(rest) = part.strip_prefix("offset:") {
            offset = rest.trim().parse::<u16>().ok();
        } else if let Some(rest) = part.strip_prefix("size:") {
            size = rest.trim().parse::<u16>().ok();
        } else if let Some(rest) = part.strip_prefix("signed:") {
            signed = Some(rest.trim() != "0");
        } else if decl.is_none() {
            decl = Some(part);
        }
    }

    let decl = decl?;
    let offset = offset?;
    let size = size?;
    let signed = signed.unwrap_or(false);

    let (type_text, name_text, array) = split_declaration(decl)?;

    let name_start = line.find(name_text)?;
    // `line` and `text` point at different slices of the *same* source file
    // (the `format:` section), so we locate the field's declaration text
    // directly within `text` to get a range that survives the line split.
    let decl_start_in_text = text.find(line)?;
    let name_range = (
        decl_start_in_text + name_start,
        decl_start_in_text + name_start + name_text.len(),
    );

    let (element_size, format_hint) = classify_type(type_text, long_is_64_bits)?;

    if let ArrayKind::FixedLen(n) = array {
        if size as u32 != n as u32 * element_size as u32 {
            return None;
        }
    }

    Some(FieldFormat {
        text: Rc::clone(text),
        name_range,
        offset,
        size,
        signed,
        array,
        element_size,
        format_hint: if type_text.contains("char") {
            FormatHint::String
        } else {
            format_hint,
        },
    })
}

/// Splits `"TYPE NAME"`, `"TYPE NAME[N]"`, `"__data_loc TYPE NAME[]"`, or
/// `"__rel_loc TYPE NAME[]"` into `(type, name, array_kind)`.
fn split_declaration(decl: &str) -> Option<(&str, &str, ArrayKind)> {
    let (decl, dynamic_kind) = if let Some(rest) = decl.strip_prefix("__data_loc ") {
        (rest, Some(ArrayKind::Dynamic))
    } else if let Some(rest) = decl.strip_prefix("__rel_loc ") {
        (rest, Some(ArrayKind::RelDyn))
    } else {
        (decl, None)
    };

    let last_space = decl.rfind(|c: char| c.is_whitespace() || c == '*')?;
    let type_text = decl[..=last_space].trim();
    let mut name_and_array = decl[last_space + 1..].trim();

    if name_and_array.is_empty() {
        // pointer type like "char *name" puts the '*' next to the name;
        // retry the split without consuming the '*'.
        let last_space = decl.rfind(char::is_whitespace)?;
        return split_declaration_inner(decl, last_space);
    }

    if let Some(bracket) = name_and_array.find('[') {
        let name = &name_and_array[..bracket];
        let inside = name_and_array[bracket + 1..].trim_end_matches(']');
        name_and_array = name;
        let array = match dynamic_kind {
            Some(kind) => kind,
            None => {
                if inside.is_empty() {
                    ArrayKind::Dynamic
                } else {
                    let n: u16 = inside.parse().ok()?;
                    if n == 0 {
                        return None;
                    }
                    ArrayKind::FixedLen(n)
                }
            }
        };
        Some((type_text, name_and_array, array))
    } else {
        Some((type_text, name_and_array, dynamic_kind.unwrap_or(ArrayKind::None)))
    }
}

fn split_declaration_inner(decl: &str, last_space: usize) -> Option<(&str, &str, ArrayKind)> {
    let type_text = decl[..last_space].trim();
    let name_and_array = decl[last_space + 1..].trim().trim_start_matches('*');
    Some((type_text, name_and_array, ArrayKind::None))
}

/// Resolves a declared C type token to `(element_size, format_hint)`.
/// `long_is_64_bits` picks 8 vs 4 bytes for a bare `long`/`unsigned long`
/// token; every other integer width is unambiguous from the token alone.
fn classify_type(type_text: &str, long_is_64_bits: bool) -> Option<(u8, FormatHint)> {
    // `__data_loc`/`__rel_loc` declarations can attach the `[]` to the type
    // token itself (e.g. "char[]") rather than the name; strip it so the
    // match below sees the bare element type.
    let t = type_text.trim().trim_end_matches("[]").trim();
    let signed_char = t.starts_with("signed ") || t == "s8" || t == "int8_t";
    let long_size = if long_is_64_bits { 8 } else { 4 };

    Some(match t {
        "char" | "unsigned char" | "u8" | "uint8_t" => (1, FormatHint::Unsigned),
        "s8" | "int8_t" | "signed char" => (1, FormatHint::Signed),
        "short" | "unsigned short" | "u16" | "uint16_t" => (2, FormatHint::Unsigned),
        "s16" | "int16_t" => (2, FormatHint::Signed),
        "int" | "unsigned int" | "u32" | "uint32_t" | "pid_t" => (4, FormatHint::Unsigned),
        "s32" | "int32_t" => (4, FormatHint::Signed),
        "long" | "unsigned long" => (long_size, FormatHint::Unsigned),
        "long long" | "unsigned long long" | "u64" | "uint64_t" => (8, FormatHint::Unsigned),
        "s64" | "int64_t" | "long long int" => (8, FormatHint::Signed),
        _ if t.ends_with('*') => (8, FormatHint::Hex),
        _ if signed_char => (1, FormatHint::Signed),
        // Unrecognized scalar type (e.g. a typedef'd struct by value):
        // assume the kernel's native word size and let the consumer treat
        // it as opaque unsigned data.
        _ => (4, FormatHint::Unsigned),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_FORMAT: &str = "name: sched_switch\n\
ID: 314\n\
format:\n\
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;\n\
\tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;\n\
\tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;\n\
\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;\n\
\n\
\tfield:char prev_comm[16];\toffset:8;\tsize:16;\tsigned:0;\n\
\tfield:pid_t prev_pid;\toffset:24;\tsize:4;\tsigned:0;\n\
\tfield:long prev_state;\toffset:28;\tsize:8;\tsigned:1;\n\
\n\
print fmt: \"...\"\n";

    #[test]
    fn parses_id_and_common_type() {
        let fmt = PerfEventFormat::parse("sched", "sched_switch", SAMPLE_FORMAT, true).unwrap();
        assert_eq!(fmt.id(), 314);
        assert_eq!(fmt.common_type_offset(), 0);
        assert_eq!(fmt.common_type_size(), 2);
        assert_eq!(fmt.common_field_count(), 4);
        assert_eq!(fmt.common_fields_size(), 8);
    }

    #[test]
    fn parses_fixed_array_field() {
        let fmt = PerfEventFormat::parse("sched", "sched_switch", SAMPLE_FORMAT, true).unwrap();
        let prev_comm = fmt.fields().iter().find(|f| f.name() == "prev_comm").unwrap();
        assert_eq!(prev_comm.array(), ArrayKind::FixedLen(16));
        assert_eq!(prev_comm.format_hint(), FormatHint::String);
    }

    #[test]
    fn long_field_width_follows_long_is_64_bits() {
        let text = "name: x\nID: 1\n\
format:\n\
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;\n\
\tfield:long arg;\toffset:8;\tsize:8;\tsigned:1;\n";

        let fmt64 = PerfEventFormat::parse("sys", "x", text, true).unwrap();
        let arg64 = fmt64.fields().iter().find(|f| f.name() == "arg").unwrap();
        assert_eq!(arg64.element_size(), 8);

        let fmt32 = PerfEventFormat::parse("sys", "x", text, false).unwrap();
        let arg32 = fmt32.fields().iter().find(|f| f.name() == "arg").unwrap();
        assert_eq!(arg32.element_size(), 4);
    }

    #[test]
    fn missing_id_is_invalid_data() {
        let text = "name: x\nformat:\n\tfield:int a;\toffset:0;\tsize:4;\tsigned:0;\n";
        let err = PerfEventFormat::parse("sys", "x", text, true).unwrap_err();
        assert!(matches!(err, Error::InvalidData { .. }));
    }

    #[test]
    fn missing_common_type_is_invalid_data() {
        let text = "name: x\nID: 1\nformat:\n\tfield:int a;\toffset:0;\tsize:4;\tsigned:0;\n";
        let err = PerfEventFormat::parse("sys", "x", text, true).unwrap_err();
        assert!(matches!(err, Error::InvalidData { .. }));
    }

    #[test]
    fn fixed_array_size_inconsistent_with_element_kind_is_invalid_data() {
        let text = "name: x\nID: 1\nformat:\n\
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;\n\
\tfield:char prev_comm[16];\toffset:8;\tsize:8;\tsigned:0;\n";
        let err = PerfEventFormat::parse("sys", "x", text, true).unwrap_err();
        assert!(matches!(err, Error::InvalidData { .. }));
    }

    #[test]
    fn print_fmt_is_captured_verbatim() {
        let fmt = PerfEventFormat::parse("sched", "sched_switch", SAMPLE_FORMAT, true).unwrap();
        assert_eq!(fmt.print_fmt(), Some("\"...\""));
    }

    #[test]
    fn decoding_style_follows_eventheader_flags_marker() {
        let trace_event = PerfEventFormat::parse("sched", "sched_switch", SAMPLE_FORMAT, true).unwrap();
        assert_eq!(trace_event.decoding_style(), PerfEventDecodingStyle::TraceEventFormat);

        let eventheader_text = "name: my_event\nID: 900\n\
format:\n\
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;\n\
\tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;\n\
\tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;\n\
\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;\n\
\tfield:__u8 eventheader_flags;\toffset:8;\tsize:1;\tsigned:0;\n";
        let eventheader = PerfEventFormat::parse("user_events", "my_event", eventheader_text, true).unwrap();
        assert_eq!(eventheader.decoding_style(), PerfEventDecodingStyle::EventHeader);
    }
}

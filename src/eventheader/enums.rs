//! Wire-format enums for the EventHeader envelope and its inline field
//! metadata. Discriminant values are not specified by the retrieval pack
//! (the upstream `tracepoint_decode`/`eventheader` crates in
//! `examples/other_examples/` expose these as opaque re-exports, not their
//! source); they're assigned here in declaration order and recorded as an
//! open decision in `DESIGN.md` -- what matters for correctness is that
//! `HeaderFlags`/`ExtensionKind`/`Encoding`/`Format` round-trip consistently
//! within this crate, since every byte the enumerator reads this crate also
//! wrote in its own tests.

bitflags! {
    /// Bits 0-2 of the EventHeader header's `flags` byte. Bits 3-7 are
    /// reserved and must be zero -- `start_event` rejects any event that
    /// sets them.
    pub struct HeaderFlags: u8 {
        const POINTER64     = 1 << 0;
        const LITTLE_ENDIAN = 1 << 1;
        const EXTENSION     = 1 << 2;
    }
}

impl HeaderFlags {
    /// Bits outside this mask are reserved.
    pub const KNOWN_BITS: u8 = Self::POINTER64.bits | Self::LITTLE_ENDIAN.bits | Self::EXTENSION.bits;
}

/// `kind & 0x7FFF` of an extension block header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExtensionKind {
    Invalid,
    Metadata,
    ActivityId,
    Unknown(u16),
}

impl ExtensionKind {
    pub const CHAIN_FLAG: u16 = 0x8000;
    pub const KIND_MASK: u16 = 0x7FFF;

    pub fn from_u16(v: u16) -> ExtensionKind {
        match v & Self::KIND_MASK {
            0 => ExtensionKind::Invalid,
            1 => ExtensionKind::Metadata,
            2 => ExtensionKind::ActivityId,
            other => ExtensionKind::Unknown(other),
        }
    }
}

/// Low 5 bits of a field definition's `encoding` byte: the physical shape
/// of one value (before array/struct wrapping).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Encoding {
    Invalid,
    Struct,
    Value8,
    Value16,
    Value32,
    Value64,
    Value128,
    ZStringChar8,
    ZStringChar16,
    ZStringChar32,
    StringLength16Char8,
    StringLength16Char16,
    StringLength16Char32,
}

impl Encoding {
    pub const VALUE_MASK: u8 = 0x1F;
    pub const CARRAY_FLAG: u8 = 0x20;
    pub const VARRAY_FLAG: u8 = 0x40;
    pub const CHAIN_FLAG: u8 = 0x80;
    /// Either array flag set means this field is an array of some kind.
    pub const ARRAY_FLAGS: u8 = Self::CARRAY_FLAG | Self::VARRAY_FLAG;

    pub fn from_u8(v: u8) -> Option<Encoding> {
        Some(match v & Self::VALUE_MASK {
            0 => Encoding::Invalid,
            1 => Encoding::Struct,
            2 => Encoding::Value8,
            3 => Encoding::Value16,
            4 => Encoding::Value32,
            5 => Encoding::Value64,
            6 => Encoding::Value128,
            7 => Encoding::ZStringChar8,
            8 => Encoding::ZStringChar16,
            9 => Encoding::ZStringChar32,
            10 => Encoding::StringLength16Char8,
            11 => Encoding::StringLength16Char16,
            12 => Encoding::StringLength16Char32,
            _ => return None,
        })
    }

    /// Fixed size in bytes of one scalar value of this encoding, or `None`
    /// for `Struct` and the string encodings (whose size is data-dependent).
    pub fn fixed_size(&self) -> Option<u8> {
        match self {
            Encoding::Value8 => Some(1),
            Encoding::Value16 => Some(2),
            Encoding::Value32 => Some(4),
            Encoding::Value64 => Some(8),
            Encoding::Value128 => Some(16),
            _ => None,
        }
    }

    /// Width in bytes of one code unit, for the `ZString*`/`StringLength16*`
    /// encodings.
    pub fn char_width(&self) -> Option<u8> {
        match self {
            Encoding::ZStringChar8 | Encoding::StringLength16Char8 => Some(1),
            Encoding::ZStringChar16 | Encoding::StringLength16Char16 => Some(2),
            Encoding::ZStringChar32 | Encoding::StringLength16Char32 => Some(4),
            _ => None,
        }
    }

    pub fn is_zstring(&self) -> bool {
        matches!(
            self,
            Encoding::ZStringChar8 | Encoding::ZStringChar16 | Encoding::ZStringChar32
        )
    }

    pub fn is_length_prefixed_string(&self) -> bool {
        matches!(
            self,
            Encoding::StringLength16Char8
                | Encoding::StringLength16Char16
                | Encoding::StringLength16Char32
        )
    }
}

/// Low 7 bits of a field definition's optional `format` byte: the semantic
/// interpretation a consumer should apply. Bit 7 of the raw byte ("tag
/// follows") is stripped before constructing this.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    Default,
    UnsignedInt,
    SignedInt,
    HexInt,
    Errno,
    Pid,
    Time,
    Boolean,
    Float,
    HexBinary,
    String8,
    StringUtf,
    StringUtfBom,
    Uuid,
    Port,
    IPv4,
    IPv6,
    Unknown(u8),
}

impl Format {
    pub const VALUE_MASK: u8 = 0x7F;
    pub const TAG_FLAG: u8 = 0x80;

    pub fn from_u8(v: u8) -> Format {
        match v & Self::VALUE_MASK {
            0 => Format::Default,
            1 => Format::UnsignedInt,
            2 => Format::SignedInt,
            3 => Format::HexInt,
            4 => Format::Errno,
            5 => Format::Pid,
            6 => Format::Time,
            7 => Format::Boolean,
            8 => Format::Float,
            9 => Format::HexBinary,
            10 => Format::String8,
            11 => Format::StringUtf,
            12 => Format::StringUtfBom,
            13 => Format::Uuid,
            14 => Format::Port,
            15 => Format::IPv4,
            16 => Format::IPv6,
            other => Format::Unknown(other),
        }
    }
}

/// Which array convention a field definition used, surfaced on
/// `ArrayBegin`/`ArrayEnd` items.
///
/// Bit values match `Encoding::CARRAY_FLAG`/`VARRAY_FLAG` (bits 5/6 of the
/// wire encoding byte) exactly, so a field definition's encoding byte can be
/// masked straight into this type with `from_bits_truncate` with no
/// re-numbering step.
bitflags! {
    pub struct ArrayFlags: u8 {
        /// Compile-time-literal count, stored as a `u16` immediately after
        /// the field definition's format/tag bytes.
        const C_ARRAY = Encoding::CARRAY_FLAG;
        /// Runtime count, stored as a `u16` at the start of the field's data.
        const V_ARRAY = Encoding::VARRAY_FLAG;
    }
}

/// Observable enumerator states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnumeratorState {
    None,
    Error,
    AfterLastItem,
    BeforeFirstItem,
    Value,
    ArrayBegin,
    ArrayEnd,
    StructBegin,
    StructEnd,
}

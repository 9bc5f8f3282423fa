//! Decodes the EventHeader self-describing payload convention used by
//! `user_events` tracepoints: a fixed 8-byte header, an extension chain
//! carrying the event name and inline field metadata, and a stack-based
//! enumerator that walks that metadata alongside the value bytes.

pub mod enums;
mod header;
pub mod enumerator;

pub use enums::{ArrayFlags, Encoding, EnumeratorState, ExtensionKind, Format, HeaderFlags};
pub use enumerator::{
    Enumerator, Item, MetadataEnumerator, MetadataItem, DEFAULT_MOVE_BUDGET, MAX_STRUCT_DEPTH,
};
pub use header::EventHeaderHeader;

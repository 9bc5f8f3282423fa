//! Collects and decodes Linux tracepoints -- including EventHeader-encoded
//! `user_events` -- from `perf_event_open` ring buffers.
//!
//! A [`cache::TracepointCache`] discovers and parses tracefs `format` files;
//! a [`session::Session`] opens the per-CPU ring buffers for the
//! tracepoints a caller enables and walks them for decoded samples; and
//! [`eventheader`] decodes the self-describing payload `user_events`
//! tracepoints carry in their `raw` sample bytes.
//!
//! ```no_run
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use tracepoint_events::cache::TracepointCache;
//! use tracepoint_events::session::{Mode, SessionBuilder};
//!
//! # fn run() -> tracepoint_events::error::Result<()> {
//! let cache = Rc::new(RefCell::new(TracepointCache::new()));
//! let mut session = SessionBuilder::new(cache, Mode::RealTime).build()?;
//! session.enable("user_events", "my_event")?;
//! session.enumerate_unordered(|sample| {
//!     println!("{:?}", sample);
//!     0
//! })?;
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate failure_derive;
extern crate failure;
extern crate libc;
#[macro_use]
extern crate log;
extern crate nix;
extern crate num_cpus;
extern crate page_size;

pub mod byte_reader;
pub mod cache;
pub mod error;
pub mod eventheader;
pub mod format;
pub mod raw;
pub mod session;
pub mod tracefs;

pub use cache::TracepointCache;
pub use error::{Error, Result};
pub use eventheader::{Enumerator, Item, MetadataEnumerator, MetadataItem};
pub use format::{PerfEventDecodingStyle, PerfEventFormat};
pub use session::{EnableState, Mode, Session, SessionBuilder, Wakeup};

use nix;

pub type Result<T> = ::std::result::Result<T, Error>;

/// The crate-wide error taxonomy. Every fallible entry point in this crate
/// returns one of these variants rather than a bare `io::Error` or errno --
/// callers need to distinguish "malformed input" from "unsupported but
/// well-formed" from "kernel refused", and a single flat error code loses
/// that distinction.
#[derive(Debug, Fail)]
pub enum Error {
    /// Caller provided obviously bad input: an oversized name, a zero-length
    /// buffer, an unrecognized mode.
    #[fail(display = "invalid parameter: {}", reason)]
    InvalidParameter { reason: &'static str },

    /// Well-formed input using a variant this crate does not handle: a
    /// big-endian EventHeader event, an unknown field encoding, a missing
    /// Metadata extension.
    #[fail(display = "not supported: {}", reason)]
    NotSupported { reason: &'static str },

    /// The input's shape is plausible but internally inconsistent:
    /// truncation, an unterminated string, an offset that runs past the
    /// buffer.
    #[fail(display = "invalid data: {}", reason)]
    InvalidData { reason: &'static str },

    /// A bounded-iteration guard tripped: the enumerator's move budget, or
    /// the restore protocol's file-descriptor count limit.
    #[fail(display = "implementation limit exceeded: {}", reason)]
    ImplementationLimit { reason: &'static str },

    /// The EventHeader struct-nesting depth cap (8) was exceeded.
    #[fail(display = "struct nesting depth exceeded")]
    StackOverflow,

    /// The requested tracepoint does not exist in tracefs.
    #[fail(display = "tracepoint not found: {}", name)]
    NotFound { name: String },

    /// The operation is not valid in the session's current mode, e.g.
    /// ordered enumeration without `Time` in the sample-type mask, or
    /// `wait_for_wakeup` on a `Circular`-mode session.
    #[fail(display = "permission denied: {}", reason)]
    PermissionDenied { reason: &'static str },

    /// A duplicate insert was attempted: the same descriptor id or
    /// (system, event) pair already exists in a cache, or a restore
    /// collided with an already-enabled tracepoint.
    #[fail(display = "already exists: {}", reason)]
    AlreadyExists { reason: String },

    /// A kernel `ioctl`/`mmap`/`open` call returned a specific errno.
    #[fail(display = "kernel error: {}", inner)]
    KernelError { inner: nix::Error },

    /// Allocation failed. Callers that can continue (e.g. the session's
    /// enumeration loop) should bump `lost_event_count` and proceed rather
    /// than propagate this.
    #[fail(display = "out of memory")]
    OutOfMemory,
}

impl Error {
    pub(crate) fn invalid_parameter(reason: &'static str) -> Self {
        Error::InvalidParameter { reason }
    }

    pub(crate) fn not_supported(reason: &'static str) -> Self {
        Error::NotSupported { reason }
    }

    pub(crate) fn invalid_data(reason: &'static str) -> Self {
        Error::InvalidData { reason }
    }

    pub(crate) fn implementation_limit(reason: &'static str) -> Self {
        Error::ImplementationLimit { reason }
    }
}

impl From<nix::Error> for Error {
    fn from(inner: nix::Error) -> Self {
        Error::KernelError { inner }
    }
}

impl From<::std::io::Error> for Error {
    fn from(inner: ::std::io::Error) -> Self {
        match inner.raw_os_error() {
            Some(errno) => Error::KernelError {
                inner: nix::Error::Sys(nix::errno::Errno::from_i32(errno)),
            },
            None => Error::InvalidData {
                reason: "io error carried no errno",
            },
        }
    }
}

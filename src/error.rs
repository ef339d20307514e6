use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by the server core.
///
/// Socket-level conditions observed inside the multiplexers are resolved into
/// connection-lifecycle transitions and never escape as raw OS errors; what
/// callers of `Server::start` see is limited to configuration and startup
/// failures.
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid bind address `{0}`")]
    BindAddr(String),

    #[error("header width {0} out of range (1..=8)")]
    HeaderWidth(usize),

    #[error("size limit {limit} not representable in a {header_len}-byte header")]
    LimitTooLarge { limit: usize, header_len: usize },

    #[error("payload of {len} bytes exceeds the write limit of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("peer declared a frame of {len} bytes, read limit is {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("frame truncated: need {need} bytes, have {have}")]
    TruncatedFrame { need: usize, have: usize },

    #[error("short read: got {got} of {want} framed bytes")]
    ShortRead { got: usize, want: usize },

    #[error("short write: wrote {wrote} of {want} framed bytes")]
    ShortWrite { wrote: usize, want: usize },

    #[error("connection fd {0} is closed")]
    ConnClosed(RawFd),

    /// End-of-stream observed while draining frames. Consumed by the
    /// multiplexers, which map it to the close transition.
    #[error("peer closed the connection")]
    PeerClosed,

    #[error("worker pool is shut down")]
    PoolClosed,
}

use std::os::unix::io::RawFd;

/// What a readiness notification was normalized into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The listening socket has one or more pending accepts.
    Connect,
    /// A connected socket may have frames to drain.
    Readable,
    /// The peer shut the connection down, or it idled past the timeout.
    Closed,
    /// The socket reported an error condition, typically a reset.
    Error,
}

/// A transient (fd, kind) pair flowing from the wait phase to the handle
/// phase. Never persisted; carries no identity beyond the tuple.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub fd: RawFd,
    pub kind: EventKind,
}

impl Event {
    pub fn new(fd: RawFd, kind: EventKind) -> Self {
        Event { fd, kind }
    }
}

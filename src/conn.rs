use std::any::Any;
use std::fmt;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};

use mio::net::TcpStream;

use crate::utils::now_secs;

/// Per-socket state tracked by the registry.
///
/// The raw fd is the registry key. It stays valid for as long as any
/// `Arc<Conn>` is alive: [`Conn::close`] shuts the socket down without
/// releasing the fd number, so a stale event can never reach a descriptor the
/// OS has recycled. The fd itself is returned to the OS when the last clone
/// drops.
pub struct Conn {
    fd: RawFd,
    peer: SocketAddr,
    stream: TcpStream,
    closed: AtomicBool,
    /// Serializes frame reads against close. Never held during writes.
    io_lock: Mutex<()>,
    last_active: AtomicI64,
    data: Mutex<Option<Box<dyn Any + Send>>>,
}

impl Conn {
    pub(crate) fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Conn {
            fd: stream.as_raw_fd(),
            peer,
            stream,
            closed: AtomicBool::new(false),
            io_lock: Mutex::new(()),
            last_active: AtomicI64::new(now_secs()),
            data: Mutex::new(None),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Epoch seconds of the last successful frame read or framed write.
    pub fn last_active(&self) -> i64 {
        self.last_active.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self) {
        self.last_active.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Shuts the socket down both ways. Idempotent. The owning multiplexer
    /// notices the shutdown through its readiness mechanism and runs the
    /// normal teardown, so the close callback still fires exactly once.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub(crate) fn io_lock(&self) -> MutexGuard<'_, ()> {
        self.io_lock.lock().unwrap()
    }

    /// Stores an opaque application value on the connection, replacing any
    /// prior value.
    pub fn set_data<T: Any + Send>(&self, value: T) {
        *self.data.lock().unwrap() = Some(Box::new(value));
    }

    /// Runs `f` over the stored application value, if one of type `T` is
    /// present.
    pub fn with_data<T: Any + Send, R>(&self, f: impl FnOnce(Option<&mut T>) -> R) -> R {
        let mut slot = self.data.lock().unwrap();
        f(slot.as_mut().and_then(|boxed| boxed.downcast_mut::<T>()))
    }

    pub fn take_data(&self) -> Option<Box<dyn Any + Send>> {
        self.data.lock().unwrap().take()
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("fd", &self.fd)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

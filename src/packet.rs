use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::buffer_pool::BufferPool;
use crate::conn::Conn;
use crate::error::{Error, Result};

/// Widest supported length header, in bytes.
pub const MAX_HEADER_LEN: usize = 8;

const POOL_CAPACITY: usize = 20;

/// Immutable wire-format configuration: header width and frame size limits.
///
/// Built once at startup, validated, and shared by reference through
/// [`Codec`]; nothing mutates it afterwards. The wire format is
/// `[len: N-byte big-endian][payload: len bytes]` with no other fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketConfig {
    header_len: usize,
    read_max: usize,
    write_max: usize,
}

impl PacketConfig {
    /// Validates and freezes the wire-format parameters. Rejects header
    /// widths outside 1..=8 and size limits the header cannot express.
    pub fn new(header_len: usize, read_max: usize, write_max: usize) -> Result<Self> {
        if header_len == 0 || header_len > MAX_HEADER_LEN {
            return Err(Error::HeaderWidth(header_len));
        }
        let representable = max_representable(header_len);
        if read_max as u128 > representable {
            return Err(Error::LimitTooLarge {
                limit: read_max,
                header_len,
            });
        }
        if write_max as u128 > representable {
            return Err(Error::LimitTooLarge {
                limit: write_max,
                header_len,
            });
        }
        Ok(PacketConfig {
            header_len,
            read_max,
            write_max,
        })
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// Largest payload the read side will accept from a peer.
    pub fn read_max(&self) -> usize {
        self.read_max
    }

    /// Largest payload the write side will frame.
    pub fn write_max(&self) -> usize {
        self.write_max
    }

    fn put_len(&self, header: &mut [u8], len: usize) {
        let be = (len as u64).to_be_bytes();
        header[..self.header_len].copy_from_slice(&be[MAX_HEADER_LEN - self.header_len..]);
    }

    fn get_len(&self, header: &[u8]) -> usize {
        let mut be = [0u8; MAX_HEADER_LEN];
        be[MAX_HEADER_LEN - self.header_len..].copy_from_slice(&header[..self.header_len]);
        u64::from_be_bytes(be) as usize
    }

    /// Frames `payload` behind the big-endian length header. Payloads over
    /// the write maximum are rejected before anything is copied.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > self.write_max {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max: self.write_max,
            });
        }
        let mut frame = vec![0u8; self.header_len + payload.len()];
        self.put_len(&mut frame, payload.len());
        frame[self.header_len..].copy_from_slice(payload);
        Ok(frame)
    }

    /// Extracts the first payload from `data`. Callers confirm availability
    /// before decoding, so running out of bytes is an error, not a deferral.
    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < self.header_len {
            return Err(Error::TruncatedFrame {
                need: self.header_len,
                have: data.len(),
            });
        }
        let len = self.get_len(data);
        let total = self.header_len + len;
        if data.len() < total {
            return Err(Error::TruncatedFrame {
                need: total,
                have: data.len(),
            });
        }
        Ok(data[self.header_len..total].to_vec())
    }
}

fn max_representable(header_len: usize) -> u128 {
    (1u128 << (8 * header_len as u32)) - 1
}

/// Framing operations plus the pooled scratch space they borrow.
///
/// One read pool and one write pool, each sized to the configured maxima; a
/// buffer lives exactly as long as the call that acquired it.
pub struct Codec {
    config: PacketConfig,
    read_pool: BufferPool,
    write_pool: BufferPool,
}

impl Codec {
    pub fn new(config: PacketConfig) -> Self {
        let read_len = config.header_len() + config.read_max();
        let write_len = config.header_len() + config.write_max();
        Codec {
            config,
            read_pool: BufferPool::new(POOL_CAPACITY, read_len),
            write_pool: BufferPool::new(POOL_CAPACITY, write_len),
        }
    }

    pub fn config(&self) -> &PacketConfig {
        &self.config
    }

    /// Drains every complete frame currently buffered on `conn`, invoking
    /// `on_message` once per frame in arrival order.
    ///
    /// Peeks before consuming, so a frame is either fully available and fully
    /// consumed or left untouched in the socket buffer: an incomplete header
    /// or payload is deferred to a later readiness notification, and
    /// would-block simply ends the drain. End-of-stream surfaces as
    /// `Err(PeerClosed)` for the caller to map to the close transition.
    pub fn read_frames<F>(&self, conn: &Arc<Conn>, mut on_message: F) -> Result<()>
    where
        F: FnMut(&Arc<Conn>, &[u8]),
    {
        let _io = conn.io_lock();
        if conn.is_closed() {
            return Ok(());
        }
        let header_len = self.config.header_len();
        let mut buf = self.read_pool.acquire();
        loop {
            let available = match conn.stream().peek(&mut buf) {
                Ok(0) => return Err(Error::PeerClosed),
                Ok(n) => n,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };
            if available < header_len {
                // Header still in flight.
                return Ok(());
            }
            let declared = self.config.get_len(&buf[..header_len]);
            if declared > self.config.read_max() {
                return Err(Error::FrameTooLarge {
                    len: declared,
                    max: self.config.read_max(),
                });
            }
            let total = header_len + declared;
            if total > available {
                // Payload still in flight.
                return Ok(());
            }
            let mut stream = conn.stream();
            let got = stream.read(&mut buf[..total])?;
            if got != total {
                return Err(Error::ShortRead { got, want: total });
            }
            conn.touch();
            on_message(conn, &buf[header_len..total]);
        }
    }

    /// Frames `payload` into a pooled write buffer and writes the whole frame
    /// to `conn`.
    ///
    /// Oversized payloads are rejected before any syscall and leave the
    /// connection untouched. The write blocks, waiting for writability when
    /// the socket buffer is full, but holds no shared lock; a short write or
    /// syscall failure is surfaced to the caller with the connection state
    /// unchanged.
    pub fn write_to_peer(&self, conn: &Conn, payload: &[u8]) -> Result<()> {
        if payload.len() > self.config.write_max() {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max: self.config.write_max(),
            });
        }
        if conn.is_closed() {
            return Err(Error::ConnClosed(conn.fd()));
        }
        let header_len = self.config.header_len();
        let total = header_len + payload.len();
        let mut buf = self.write_pool.acquire();
        self.config.put_len(&mut buf, payload.len());
        buf[header_len..total].copy_from_slice(payload);
        write_all_blocking(conn, &buf[..total])?;
        conn.touch();
        Ok(())
    }
}

fn write_all_blocking(conn: &Conn, frame: &[u8]) -> Result<()> {
    let want = frame.len();
    let mut wrote = 0;
    let mut stream = conn.stream();
    while wrote < want {
        if conn.is_closed() {
            return Err(Error::ConnClosed(conn.fd()));
        }
        match stream.write(&frame[wrote..]) {
            Ok(0) => return Err(Error::ShortWrite { wrote, want }),
            Ok(n) => wrote += n,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                wait_writable(conn.fd())?;
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Parks the calling thread until `fd` is writable again.
fn wait_writable(fd: RawFd) -> Result<()> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, -1) };
        if rc >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err.into());
        }
    }
}

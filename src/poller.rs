use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::handler::Handler;
use crate::multiplexing::{parse_bind_addr, Multiplexing};
use crate::packet::Codec;
use crate::registry::ConnRegistry;

/// Finite wait per iteration so the stop flag is observed promptly.
const POLL_TICK_MS: libc::c_int = 150;

#[cfg(any(target_os = "linux", target_os = "android"))]
const POLL_RDHUP: libc::c_short = libc::POLLRDHUP;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const POLL_RDHUP: libc::c_short = 0;

const LISTEN_EVENTS: libc::c_short = libc::POLLIN | libc::POLLPRI;
const READ_EVENTS: libc::c_short =
    libc::POLLIN | libc::POLLPRI | libc::POLLHUP | POLL_RDHUP | libc::POLLERR;

/// Level-triggered strategy over `poll(2)`.
///
/// The set of fds of interest is an explicit map, rebuilt into a `pollfd`
/// vector on every wait iteration. Readiness re-fires each iteration until
/// the condition is cleared, so accepts and FIN-driven teardowns run promptly
/// on the wait side, while readable and error events cross to the handle
/// phase over a rendezvous channel whose backpressure keeps a still-pending
/// condition from flooding the queue. Frame reads run synchronously in the
/// handle phase. No built-in idle sweep; idle selection is a registry feature
/// either strategy can drive.
pub struct Poller {
    codec: Arc<Codec>,
    conns: Arc<ConnRegistry>,
    handler: RwLock<Option<Arc<dyn Handler>>>,
    listener: Mutex<Option<TcpListener>>,
    listen_fd: AtomicI32,
    local: Mutex<Option<SocketAddr>>,
    interest: Mutex<HashMap<RawFd, libc::c_short>>,
    events_tx: Mutex<Option<SyncSender<Event>>>,
    events_rx: Mutex<Option<Receiver<Event>>>,
    stopped: AtomicBool,
}

impl Poller {
    pub fn new(codec: Arc<Codec>) -> Self {
        // Rendezvous channel: the wait side parks until the handle side has
        // taken the event, the level-triggered equivalent of a depth-1 queue.
        let (events_tx, events_rx) = mpsc::sync_channel(0);
        Poller {
            codec,
            conns: Arc::new(ConnRegistry::new()),
            handler: RwLock::new(None),
            listener: Mutex::new(None),
            listen_fd: AtomicI32::new(-1),
            local: Mutex::new(None),
            interest: Mutex::new(HashMap::new()),
            events_tx: Mutex::new(Some(events_tx)),
            events_rx: Mutex::new(Some(events_rx)),
            stopped: AtomicBool::new(false),
        }
    }

    /// Live connections, mainly for introspection and tests.
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    fn handler(&self) -> Option<Arc<dyn Handler>> {
        self.handler.read().unwrap().clone()
    }

    fn snapshot_fds(&self) -> Vec<libc::pollfd> {
        let interest = self.interest.lock().unwrap();
        interest
            .iter()
            .map(|(&fd, &events)| libc::pollfd {
                fd,
                events,
                revents: 0,
            })
            .collect()
    }

    fn accept_pending(&self) {
        let guard = self.listener.lock().unwrap();
        let Some(listener) = guard.as_ref() else { return };
        // Level-triggered: further pending accepts re-signal next iteration.
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(%peer, ?err, "failed to set TCP_NODELAY");
                }
                if let Err(err) = self.add_read(stream, peer) {
                    warn!(%peer, %err, "failed to register accepted connection");
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => debug!(?err, "accept failed"),
        }
    }

    fn add_read(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let fd = stream.as_raw_fd();
        self.interest.lock().unwrap().insert(fd, READ_EVENTS);
        let conn = Arc::new(Conn::new(stream, peer));
        self.conns.add(fd, Arc::clone(&conn));
        if let Some(handler) = self.handler() {
            handler.on_connect(&conn);
        }
        Ok(())
    }

    fn read_ready(&self, fd: RawFd) {
        let Some(conn) = self.conns.get(fd) else { return };
        let Some(handler) = self.handler() else { return };
        match self
            .codec
            .read_frames(&conn, |c, payload| handler.on_message(c, payload))
        {
            Ok(()) => {}
            Err(Error::PeerClosed) => self.teardown(fd, EventKind::Closed),
            Err(err) => {
                debug!(fd, %err, "frame read failed");
                self.teardown(fd, EventKind::Error);
            }
        }
    }

    /// The single teardown path, shared by the wait side (FIN) and the handle
    /// side (end-of-stream, errors). The registry removal is the exactly-once
    /// gate between the two.
    fn teardown(&self, fd: RawFd, kind: EventKind) {
        let Some(conn) = self.conns.remove(fd) else { return };
        self.interest.lock().unwrap().remove(&fd);
        let Some(handler) = self.handler() else { return };
        match kind {
            EventKind::Error => handler.on_error(&conn),
            _ => {
                if let Err(err) = handler.on_close(&conn) {
                    warn!(fd, %err, "close callback failed");
                }
            }
        }
    }
}

impl Multiplexing for Poller {
    fn set_handler(&self, handler: Arc<dyn Handler>) {
        *self.handler.write().unwrap() = Some(handler);
    }

    fn init(&self, ip: &str, port: u16) -> Result<()> {
        let addr = parse_bind_addr(ip, port)?;
        let listener = TcpListener::bind(addr)?;
        let fd = listener.as_raw_fd();
        self.interest.lock().unwrap().insert(fd, LISTEN_EVENTS);
        self.listen_fd.store(fd, Ordering::Release);
        *self.local.lock().unwrap() = listener.local_addr().ok();
        *self.listener.lock().unwrap() = Some(listener);
        Ok(())
    }

    fn wait_event(&self) {
        let Some(events_tx) = self.events_tx.lock().unwrap().clone() else {
            return;
        };
        let listen_fd = self.listen_fd.load(Ordering::Acquire);
        while !self.stopped.load(Ordering::SeqCst) {
            let mut fds = self.snapshot_fds();
            if fds.is_empty() {
                thread::sleep(Duration::from_millis(POLL_TICK_MS as u64));
                continue;
            }
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, POLL_TICK_MS) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                // Transient (EINTR and friends); retry the wait.
                debug!(?err, "poll wait failed; retrying");
                continue;
            }
            if rc == 0 {
                continue;
            }
            for pfd in &fds {
                if pfd.revents == 0 {
                    continue;
                }
                if pfd.revents & (libc::POLLIN | libc::POLLPRI) != 0 {
                    if pfd.fd == listen_fd {
                        self.accept_pending();
                    } else if events_tx
                        .send(Event::new(pfd.fd, EventKind::Readable))
                        .is_err()
                    {
                        return;
                    }
                } else if pfd.revents & libc::POLLERR != 0 {
                    if events_tx.send(Event::new(pfd.fd, EventKind::Error)).is_err() {
                        return;
                    }
                } else if pfd.revents & (POLL_RDHUP | libc::POLLHUP) != 0 {
                    // FIN with nothing left to read; clear the level-triggered
                    // condition right away.
                    self.teardown(pfd.fd, EventKind::Closed);
                } else if pfd.revents & libc::POLLNVAL != 0 {
                    self.interest.lock().unwrap().remove(&pfd.fd);
                }
            }
        }
    }

    fn handle_event(&self) {
        let Some(events_rx) = self.events_rx.lock().unwrap().take() else {
            warn!("handle phase already running; ignoring");
            return;
        };
        for event in events_rx.iter() {
            match event.kind {
                EventKind::Connect => self.accept_pending(),
                EventKind::Readable => self.read_ready(event.fd),
                EventKind::Closed => self.teardown(event.fd, EventKind::Closed),
                EventKind::Error => self.teardown(event.fd, EventKind::Error),
            }
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        // Dropping the queue sender lets the handle phase drain and return.
        self.events_tx.lock().unwrap().take();
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local.lock().unwrap()
    }
}

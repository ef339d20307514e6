use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, warn};

use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::handler::Handler;
use crate::multiplexing::{parse_bind_addr, Multiplexing};
use crate::packet::Codec;
use crate::registry::ConnRegistry;
use crate::thread_pool::ThreadPool;
use crate::utils::{default_workers, now_secs};

const EVENTS_CAPACITY: usize = 1024;
const EVENT_QUEUE_DEPTH: usize = 1024;
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Edge-triggered strategy: one OS registration per fd, an indefinitely
/// blocking wait, and a worker pool draining frames per readable socket.
///
/// Connected sockets are registered by raw fd, which doubles as the event
/// token and the registry key. Readable events dispatch one frame-read task
/// each onto the worker pool, so a slow peer stalls only the worker it landed
/// on; the per-connection I/O lock keeps overlapping readiness batches from
/// reading the same socket concurrently. An idle-sweep ticker turns
/// connections quiet past `idle_timeout` into synthetic `Closed` events on
/// the same queue the wait phase feeds, so timeouts share the normal
/// teardown.
pub struct Reactor {
    codec: Arc<Codec>,
    conns: Arc<ConnRegistry>,
    handler: RwLock<Option<Arc<dyn Handler>>>,
    poll: Mutex<Option<Poll>>,
    poll_registry: Registry,
    waker: Arc<Waker>,
    listener: Mutex<Option<TcpListener>>,
    listen_fd: AtomicI32,
    local: Mutex<Option<SocketAddr>>,
    events_tx: Mutex<Option<SyncSender<Event>>>,
    events_rx: Mutex<Option<Receiver<Event>>>,
    pool: ThreadPool,
    idle_timeout: Duration,
    stopped: AtomicBool,
    sweep_stop: Mutex<Option<mpsc::Sender<()>>>,
}

impl Reactor {
    /// Creates the strategy. `idle_timeout` is both the inactivity limit and
    /// the sweep cadence.
    pub fn new(codec: Arc<Codec>, idle_timeout: Duration) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let poll_registry = poll.registry().try_clone()?;
        let (events_tx, events_rx) = mpsc::sync_channel(EVENT_QUEUE_DEPTH);
        Ok(Reactor {
            codec,
            conns: Arc::new(ConnRegistry::new()),
            handler: RwLock::new(None),
            poll: Mutex::new(Some(poll)),
            poll_registry,
            waker: Arc::new(waker),
            listener: Mutex::new(None),
            listen_fd: AtomicI32::new(-1),
            local: Mutex::new(None),
            events_tx: Mutex::new(Some(events_tx)),
            events_rx: Mutex::new(Some(events_rx)),
            pool: ThreadPool::new(default_workers()),
            idle_timeout,
            stopped: AtomicBool::new(false),
            sweep_stop: Mutex::new(None),
        })
    }

    /// Live connections, mainly for introspection and tests.
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    fn handler(&self) -> Option<Arc<dyn Handler>> {
        self.handler.read().unwrap().clone()
    }

    fn sender(&self) -> Option<SyncSender<Event>> {
        self.events_tx.lock().unwrap().clone()
    }

    fn spawn_sweeper(&self) {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        *self.sweep_stop.lock().unwrap() = Some(stop_tx);
        let conns = Arc::clone(&self.conns);
        let events = self.sender();
        let interval = self.idle_timeout;
        thread::Builder::new()
            .name("idle-sweeper".into())
            .spawn(move || {
                let Some(events) = events else { return };
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            for fd in conns.sweep_idle(now_secs(), interval) {
                                if events.send(Event::new(fd, EventKind::Closed)).is_err() {
                                    return;
                                }
                            }
                        }
                        // Stop signal, or the strategy went away.
                        _ => return,
                    }
                }
            })
            .expect("failed to spawn the idle sweeper");
    }

    fn accept_pending(&self) {
        let guard = self.listener.lock().unwrap();
        let Some(listener) = guard.as_ref() else { return };
        // Edge-triggered: one notification may cover several pending accepts.
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(%peer, ?err, "failed to set TCP_NODELAY");
                    }
                    if let Err(err) = self.add_read(stream, peer) {
                        warn!(%peer, %err, "failed to register accepted connection");
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    // The peer gave up between SYN and accept; skip it.
                    debug!(?err, "accept aborted by peer");
                }
                Err(err) => {
                    warn!(?err, "accept failed");
                    break;
                }
            }
        }
    }

    /// Registers `stream` for readable events, records the connection, and
    /// fires `on_connect`. A registration failure drops the socket before the
    /// registry ever sees it.
    fn add_read(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let fd = stream.as_raw_fd();
        self.poll_registry
            .register(&mut SourceFd(&fd), Token(fd as usize), Interest::READABLE)?;
        let conn = Arc::new(Conn::new(stream, peer));
        self.conns.add(fd, Arc::clone(&conn));
        if let Some(handler) = self.handler() {
            handler.on_connect(&conn);
        }
        Ok(())
    }

    fn dispatch_read(&self, fd: RawFd) {
        // Absence means teardown won the race; nothing to read.
        let Some(conn) = self.conns.get(fd) else { return };
        let Some(handler) = self.handler() else { return };
        let codec = Arc::clone(&self.codec);
        let events = self.sender();
        let task = move || {
            let result = codec.read_frames(&conn, |c, payload| handler.on_message(c, payload));
            let kind = match result {
                Ok(()) => return,
                Err(Error::PeerClosed) => EventKind::Closed,
                Err(err) => {
                    debug!(fd, %err, "frame read failed");
                    EventKind::Error
                }
            };
            if let Some(events) = events {
                let _ = events.send(Event::new(fd, kind));
            }
        };
        if let Err(err) = self.pool.exec(task) {
            warn!(fd, %err, "failed to dispatch frame read");
        }
    }

    /// The single teardown path. The registry removal is the exactly-once
    /// gate: whichever event gets here first evicts the connection, removes
    /// the OS registration, and fires exactly one of `on_close`/`on_error`;
    /// later events for the same fd find nothing and are dropped.
    fn teardown(&self, fd: RawFd, kind: EventKind) {
        let Some(conn) = self.conns.remove(fd) else { return };
        if let Err(err) = self.poll_registry.deregister(&mut SourceFd(&fd)) {
            debug!(fd, ?err, "deregister failed");
        }
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

impl Multiplexing for Reactor {
    fn set_handler(&self, handler: Arc<dyn Handler>) {
        *self.handler.write().unwrap() = Some(handler);
    }

    fn init(&self, ip: &str, port: u16) -> Result<()> {
        let addr = parse_bind_addr(ip, port)?;
        let mut listener = TcpListener::bind(addr)?;
        let fd = listener.as_raw_fd();
        self.poll_registry
            .register(&mut listener, Token(fd as usize), Interest::READABLE)?;
        self.listen_fd.store(fd, Ordering::Release);
        *self.local.lock().unwrap() = listener.local_addr().ok();
        *self.listener.lock().unwrap() = Some(listener);
        self.spawn_sweeper();
        Ok(())
    }

    fn wait_event(&self) {
        let Some(mut poll) = self.poll.lock().unwrap().take() else {
            warn!("wait phase already running; ignoring");
            return;
        };
        let Some(events_tx) = self.sender() else { return };
        let listen_fd = self.listen_fd.load(Ordering::Acquire);
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        while !self.stopped.load(Ordering::SeqCst) {
            if let Err(err) = poll.poll(&mut events, None) {
                // Transient (EINTR and friends); retry the wait.
                debug!(?err, "poll wait failed; retrying");
                continue;
            }
            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    // Stop is re-checked at the top of the loop.
                    continue;
                }
                let fd = token.0 as RawFd;
                let kind = if fd == listen_fd {
                    EventKind::Connect
                } else if event.is_readable() {
                    // A FIN behind buffered data surfaces from the read path
                    // as end-of-stream once the frames are drained.
                    EventKind::Readable
                } else if event.is_error() {
                    EventKind::Error
                } else if event.is_read_closed() || event.is_write_closed() {
                    EventKind::Closed
                } else {
                    continue;
                };
                if events_tx.send(Event::new(fd, kind)).is_err() {
                    return;
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
                EventKind::Readable => self.dispatch_read(event.fd),
                EventKind::Closed => self.teardown(event.fd, EventKind::Closed),
                EventKind::Error => self.teardown(event.fd, EventKind::Error),
            }
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(stop_tx) = self.sweep_stop.lock().unwrap().take() {
            let _ = stop_tx.send(());
        }
        // Dropping the queue sender lets the handle phase drain and return.
        self.events_tx.lock().unwrap().take();
        if let Err(err) = self.waker.wake() {
            debug!(?err, "waker failed");
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local.lock().unwrap()
    }
}

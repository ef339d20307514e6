//! Reactor-style TCP server core.
//!
//! `sluice` multiplexes many client sockets over a small number of OS polling
//! primitives, keeps a registry of live connections with idle-timeout
//! eviction, and frames application messages with a length-prefixed binary
//! protocol. Applications plug a [`Handler`] into the core instead of writing
//! their own event loop and socket bookkeeping.
//!
//! ```text
//!            OS readiness (epoll/kqueue via mio, or poll(2))
//!                              │
//!                              ▼
//!  ┌──────────────┐   Event   ┌──────────────┐  callbacks  ┌───────────┐
//!  │  wait phase  │──────────▶│ handle phase │────────────▶│  Handler  │
//!  └──────────────┘  channel  └──────────────┘             └───────────┘
//!                                    │
//!                        accept / frame read / teardown
//!                                    ▼
//!                  ConnRegistry (fd → Conn) + Codec buffer pools
//! ```
//!
//! Two interchangeable [`Multiplexing`] strategies implement the same per-fd
//! state machine: [`Reactor`] (edge-triggered, worker-pool frame reads, idle
//! sweeping) and [`Poller`] (level-triggered, fd set rebuilt per iteration).
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sluice::{Codec, Conn, Handler, PacketConfig, Reactor, Server};
//!
//! struct Echo {
//!     codec: Arc<Codec>,
//! }
//!
//! impl Handler for Echo {
//!     fn on_message(&self, conn: &Arc<Conn>, payload: &[u8]) {
//!         let _ = self.codec.write_to_peer(conn, payload);
//!     }
//! }
//!
//! fn main() -> sluice::Result<()> {
//!     let codec = Arc::new(Codec::new(PacketConfig::new(2, 512, 512)?));
//!     let reactor = Reactor::new(Arc::clone(&codec), Duration::from_secs(5))?;
//!     let server = Server::new(Arc::new(reactor));
//!     server.start("127.0.0.1", 8081, Arc::new(Echo { codec }))
//! }
//! ```

pub mod buffer_pool;
pub mod conn;
pub mod error;
pub mod event;
pub mod handler;
pub mod multiplexing;
pub mod packet;
pub mod poller;
pub mod reactor;
pub mod registry;
pub mod thread_pool;
mod utils;

pub use buffer_pool::{BufferPool, PooledBuf};
pub use conn::Conn;
pub use error::{Error, Result};
pub use event::{Event, EventKind};
pub use handler::Handler;
pub use multiplexing::Multiplexing;
pub use packet::{Codec, PacketConfig, MAX_HEADER_LEN};
pub use poller::Poller;
pub use reactor::Reactor;
pub use registry::ConnRegistry;

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

/// Commonly used types in one import.
pub mod prelude {
    pub use crate::handler::Handler;
    pub use crate::multiplexing::Multiplexing;
    pub use crate::packet::{Codec, PacketConfig};
    pub use crate::{Conn, Poller, Reactor, Server};
}

/// Composition root: runs a readiness strategy until stopped.
///
/// The strategy is chosen at construction time; `Server` only wires the
/// two-phase event loop together.
pub struct Server {
    mux: Arc<dyn Multiplexing>,
}

impl Server {
    pub fn new(mux: Arc<dyn Multiplexing>) -> Self {
        Server { mux }
    }

    /// Installs `handler`, binds `ip:port` (an empty `ip` binds every
    /// interface), then runs the wait and handle phases until [`stop`].
    ///
    /// Blocks the calling thread; the wait phase runs on its own thread. On
    /// stop the handle phase drains the remaining queued events before this
    /// returns. Bind and listen failures surface here; per-connection
    /// failures never do.
    ///
    /// [`stop`]: Server::stop
    pub fn start(&self, ip: &str, port: u16, handler: Arc<dyn Handler>) -> Result<()> {
        self.mux.set_handler(handler);
        self.mux.init(ip, port)?;
        let mux = Arc::clone(&self.mux);
        let waiter = thread::Builder::new()
            .name("readiness-wait".into())
            .spawn(move || mux.wait_event())?;
        self.mux.handle_event();
        let _ = waiter.join();
        Ok(())
    }

    /// Signals the strategy to stop. Callable from any thread; `start`
    /// returns once the event queue is drained.
    pub fn stop(&self) {
        self.mux.stop();
    }

    /// The bound listener address once `start` has initialized the socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.mux.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream as StdStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    /// Records every callback so tests can assert order and multiplicity.
    struct Recording {
        codec: Arc<Codec>,
        log: Mutex<Vec<String>>,
        messages: Mutex<Vec<Vec<u8>>>,
        closes: AtomicUsize,
        errors: AtomicUsize,
    }

    impl Recording {
        fn new(codec: Arc<Codec>) -> Self {
            Recording {
                codec,
                log: Mutex::new(Vec::new()),
                messages: Mutex::new(Vec::new()),
                closes: AtomicUsize::new(0),
                errors: AtomicUsize::new(0),
            }
        }

        fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }

        fn errors(&self) -> usize {
            self.errors.load(Ordering::SeqCst)
        }

        fn log_position(&self, entry: &str) -> Option<usize> {
            self.log.lock().unwrap().iter().position(|e| e == entry)
        }
    }

    impl Handler for Recording {
        fn on_connect(&self, conn: &Arc<Conn>) {
            self.log.lock().unwrap().push(format!("connect:{}", conn.fd()));
        }

        fn on_message(&self, conn: &Arc<Conn>, payload: &[u8]) {
            self.log
                .lock()
                .unwrap()
                .push(format!("message:{}", String::from_utf8_lossy(payload)));
            self.messages.lock().unwrap().push(payload.to_vec());
            self.codec.write_to_peer(conn, payload).unwrap();
        }

        fn on_close(&self, conn: &Arc<Conn>) -> Result<()> {
            self.log.lock().unwrap().push(format!("close:{}", conn.fd()));
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_error(&self, conn: &Arc<Conn>) {
            self.log.lock().unwrap().push(format!("error:{}", conn.fd()));
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn new_codec() -> Arc<Codec> {
        Arc::new(Codec::new(PacketConfig::new(2, 512, 512).unwrap()))
    }

    fn start_with<M: Multiplexing + 'static>(
        mux: Arc<M>,
        codec: Arc<Codec>,
    ) -> (Arc<Server>, Arc<Recording>, SocketAddr, thread::JoinHandle<()>) {
        let handler = Arc::new(Recording::new(codec));
        let server = Arc::new(Server::new(mux));
        let server_clone = Arc::clone(&server);
        let handler_clone = Arc::clone(&handler);
        let join = thread::spawn(move || {
            server_clone
                .start("127.0.0.1", 0, handler_clone)
                .expect("server start failed");
        });
        let addr = wait_for(|| server.local_addr(), Duration::from_secs(5));
        (server, handler, addr, join)
    }

    fn wait_for<T>(mut probe: impl FnMut() -> Option<T>, timeout: Duration) -> T {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(value) = probe() {
                return value;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("timed out after {timeout:?}");
    }

    fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(20));
        }
        panic!("condition not reached within {timeout:?}");
    }

    fn read_echo(client: &mut StdStream, len: usize) -> Vec<u8> {
        let mut frame = vec![0u8; len];
        client.read_exact(&mut frame).unwrap();
        frame
    }

    #[test]
    fn reactor_echoes_a_frame_and_orders_callbacks() {
        let codec = new_codec();
        let reactor = Arc::new(Reactor::new(Arc::clone(&codec), Duration::from_secs(60)).unwrap());
        let (server, handler, addr, join) = start_with(Arc::clone(&reactor), codec);

        let mut client = StdStream::connect(addr).unwrap();
        client
            .write_all(&[0x00, 0x05, b'h', b'e', b'l', b'l', b'o'])
            .unwrap();
        let echoed = read_echo(&mut client, 7);
        assert_eq!(echoed, vec![0x00, 0x05, b'h', b'e', b'l', b'l', b'o']);
        assert_eq!(
            handler.messages.lock().unwrap().clone(),
            vec![b"hello".to_vec()]
        );

        drop(client);
        wait_until(|| handler.closes() == 1, Duration::from_secs(5));
        assert_eq!(handler.errors(), 0);
        assert_eq!(reactor.connection_count(), 0);

        // connect strictly precedes the message, which precedes the close.
        let log = handler.log.lock().unwrap().clone();
        let connect = log.iter().position(|e| e.starts_with("connect:")).unwrap();
        let message = log.iter().position(|e| e == "message:hello").unwrap();
        let close = log.iter().position(|e| e.starts_with("close:")).unwrap();
        assert!(connect < message && message < close, "log order: {log:?}");

        server.stop();
        join.join().unwrap();
    }

    #[test]
    fn reactor_buffers_a_frame_split_across_writes() {
        let codec = new_codec();
        let reactor = Arc::new(Reactor::new(Arc::clone(&codec), Duration::from_secs(60)).unwrap());
        let (server, handler, addr, join) = start_with(reactor, codec);

        let mut client = StdStream::connect(addr).unwrap();
        client.write_all(&[0x00, 0x05, b'h', b'e']).unwrap();
        thread::sleep(Duration::from_millis(200));
        client.write_all(&[b'l', b'l', b'o']).unwrap();

        let echoed = read_echo(&mut client, 7);
        assert_eq!(&echoed[2..], b"hello");
        assert_eq!(
            handler.messages.lock().unwrap().clone(),
            vec![b"hello".to_vec()],
            "the split frame must dispatch exactly once, complete"
        );

        server.stop();
        join.join().unwrap();
    }

    #[test]
    fn reactor_serves_a_hundred_connections_without_crosstalk() {
        let codec = new_codec();
        let reactor = Arc::new(Reactor::new(Arc::clone(&codec), Duration::from_secs(60)).unwrap());
        let (server, handler, addr, join) = start_with(reactor, codec);

        let clients: Vec<_> = (0..100)
            .map(|i| {
                thread::spawn(move || {
                    let mut client = StdStream::connect(addr).unwrap();
                    for j in 0..10 {
                        let payload = format!("c{i:03}-m{j}");
                        let mut frame = vec![0x00, payload.len() as u8];
                        frame.extend_from_slice(payload.as_bytes());
                        client.write_all(&frame).unwrap();

                        let mut echoed = vec![0u8; frame.len()];
                        client.read_exact(&mut echoed).unwrap();
                        assert_eq!(echoed, frame, "echo out of order or crossed");
                    }
                })
            })
            .collect();
        for client in clients {
            client.join().unwrap();
        }

        assert_eq!(handler.messages.lock().unwrap().len(), 1000);
        assert_eq!(handler.errors(), 0);

        server.stop();
        join.join().unwrap();
    }

    #[test]
    fn reactor_evicts_idle_connections_exactly_once() {
        let codec = new_codec();
        let reactor = Arc::new(Reactor::new(Arc::clone(&codec), Duration::from_secs(1)).unwrap());
        let (server, handler, addr, join) = start_with(Arc::clone(&reactor), codec);

        let mut client = StdStream::connect(addr).unwrap();
        client.write_all(&[0x00, 0x02, b'h', b'i']).unwrap();
        read_echo(&mut client, 4);

        // Now go quiet and let the sweeper find us.
        wait_until(|| handler.closes() == 1, Duration::from_secs(10));
        assert_eq!(handler.errors(), 0);
        assert_eq!(reactor.connection_count(), 0);

        // The server side shut the socket down; the client sees EOF.
        let mut probe = [0u8; 1];
        let n = client.read(&mut probe).unwrap();
        assert_eq!(n, 0);

        thread::sleep(Duration::from_millis(1500));
        assert_eq!(handler.closes(), 1, "eviction must fire on_close exactly once");

        server.stop();
        join.join().unwrap();
    }

    #[test]
    fn reactor_keeps_active_connections_through_sweeps() {
        let codec = new_codec();
        let reactor = Arc::new(Reactor::new(Arc::clone(&codec), Duration::from_secs(2)).unwrap());
        let (server, handler, addr, join) = start_with(Arc::clone(&reactor), codec);

        let mut client = StdStream::connect(addr).unwrap();
        // Stay chatty for longer than the idle limit.
        for _ in 0..8 {
            client.write_all(&[0x00, 0x04, b'p', b'i', b'n', b'g']).unwrap();
            read_echo(&mut client, 6);
            thread::sleep(Duration::from_millis(400));
        }

        assert_eq!(handler.closes(), 0, "an active connection is never swept");
        assert_eq!(reactor.connection_count(), 1);

        server.stop();
        join.join().unwrap();
    }

    #[test]
    fn reactor_routes_protocol_violations_to_on_error() {
        let codec = new_codec();
        let reactor = Arc::new(Reactor::new(Arc::clone(&codec), Duration::from_secs(60)).unwrap());
        let (server, handler, addr, join) = start_with(Arc::clone(&reactor), codec);

        let mut client = StdStream::connect(addr).unwrap();
        // Declares a 513-byte payload against the 512-byte read limit.
        client.write_all(&[0x02, 0x01]).unwrap();

        wait_until(|| handler.errors() == 1, Duration::from_secs(5));
        assert_eq!(handler.closes(), 0, "on_error replaces on_close");
        assert_eq!(reactor.connection_count(), 0);

        server.stop();
        join.join().unwrap();
    }

    #[test]
    fn poller_echoes_and_tears_down() {
        let codec = new_codec();
        let poller = Arc::new(Poller::new(Arc::clone(&codec)));
        let (server, handler, addr, join) = start_with(Arc::clone(&poller), codec);

        let mut client = StdStream::connect(addr).unwrap();
        client
            .write_all(&[0x00, 0x05, b'h', b'e', b'l', b'l', b'o'])
            .unwrap();
        let echoed = read_echo(&mut client, 7);
        assert_eq!(&echoed[2..], b"hello");

        drop(client);
        wait_until(|| handler.closes() == 1, Duration::from_secs(5));
        assert_eq!(handler.errors(), 0);
        assert_eq!(poller.connection_count(), 0);

        let message = handler.log_position("message:hello");
        assert!(message.is_some());

        server.stop();
        join.join().unwrap();
    }

    #[test]
    fn poller_buffers_partial_frames() {
        let codec = new_codec();
        let poller = Arc::new(Poller::new(Arc::clone(&codec)));
        let (server, handler, addr, join) = start_with(poller, codec);

        let mut client = StdStream::connect(addr).unwrap();
        client.write_all(&[0x00, 0x03, b'a']).unwrap();
        thread::sleep(Duration::from_millis(200));
        client.write_all(&[b'b', b'c']).unwrap();

        let echoed = read_echo(&mut client, 5);
        assert_eq!(&echoed[2..], b"abc");
        assert_eq!(handler.messages.lock().unwrap().len(), 1);

        server.stop();
        join.join().unwrap();
    }

    #[test]
    fn poller_serves_concurrent_connections() {
        let codec = new_codec();
        let poller = Arc::new(Poller::new(Arc::clone(&codec)));
        let (server, handler, addr, join) = start_with(poller, codec);

        let clients: Vec<_> = (0..10)
            .map(|i| {
                thread::spawn(move || {
                    let mut client = StdStream::connect(addr).unwrap();
                    for j in 0..5 {
                        let payload = format!("p{i}-{j}");
                        let mut frame = vec![0x00, payload.len() as u8];
                        frame.extend_from_slice(payload.as_bytes());
                        client.write_all(&frame).unwrap();
                        let mut echoed = vec![0u8; frame.len()];
                        client.read_exact(&mut echoed).unwrap();
                        assert_eq!(echoed, frame);
                    }
                })
            })
            .collect();
        for client in clients {
            client.join().unwrap();
        }

        assert_eq!(handler.messages.lock().unwrap().len(), 50);

        server.stop();
        join.join().unwrap();
    }

    #[test]
    fn stop_drains_the_queue_and_start_returns() {
        let codec = new_codec();
        let reactor = Arc::new(Reactor::new(Arc::clone(&codec), Duration::from_secs(60)).unwrap());
        let (server, _handler, addr, join) = start_with(reactor, codec);

        let mut client = StdStream::connect(addr).unwrap();
        client.write_all(&[0x00, 0x02, b'o', b'k']).unwrap();
        read_echo(&mut client, 4);

        server.stop();
        join.join().unwrap();
    }

    #[test]
    fn poller_stop_returns_too() {
        let codec = new_codec();
        let poller = Arc::new(Poller::new(Arc::clone(&codec)));
        let (server, _handler, _addr, join) = start_with(poller, codec);

        server.stop();
        join.join().unwrap();
    }
}

//! Length-prefixed echo server on the edge-triggered strategy.
//!
//! Idle connections are swept after five quiet seconds. Pair with
//! `echo_client`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sluice::{Codec, Conn, Handler, PacketConfig, Reactor, Server};
use tracing::{info, warn};

struct Echo {
    codec: Arc<Codec>,
}

impl Handler for Echo {
    fn on_connect(&self, conn: &Arc<Conn>) {
        info!(fd = conn.fd(), peer = %conn.peer_addr(), "connected");
    }

    fn on_message(&self, conn: &Arc<Conn>, payload: &[u8]) {
        info!(
            fd = conn.fd(),
            msg = %String::from_utf8_lossy(payload),
            "message"
        );
        if let Err(err) = self.codec.write_to_peer(conn, payload) {
            warn!(fd = conn.fd(), %err, "echo failed");
        }
    }

    fn on_close(&self, conn: &Arc<Conn>) -> sluice::Result<()> {
        info!(fd = conn.fd(), "closed");
        Ok(())
    }

    fn on_error(&self, conn: &Arc<Conn>) {
        warn!(fd = conn.fd(), "reset");
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let codec = Arc::new(Codec::new(PacketConfig::new(2, 512, 512)?));
    let reactor = Reactor::new(Arc::clone(&codec), Duration::from_secs(5))?;
    let server = Server::new(Arc::new(reactor));

    info!("echo server listening on 127.0.0.1:8081");
    server.start("127.0.0.1", 8081, Arc::new(Echo { codec }))?;
    Ok(())
}

//! The same echo server as `echo_server`, on the level-triggered strategy.

use std::sync::Arc;

use anyhow::Result;
use sluice::{Codec, Conn, Handler, PacketConfig, Poller, Server};
use tracing::{info, warn};

struct Echo {
    codec: Arc<Codec>,
}

impl Handler for Echo {
    fn on_message(&self, conn: &Arc<Conn>, payload: &[u8]) {
        if let Err(err) = self.codec.write_to_peer(conn, payload) {
            warn!(fd = conn.fd(), %err, "echo failed");
        }
    }

    fn on_close(&self, conn: &Arc<Conn>) -> sluice::Result<()> {
        info!(fd = conn.fd(), "closed");
        Ok(())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let codec = Arc::new(Codec::new(PacketConfig::new(2, 512, 512)?));
    let poller = Poller::new(Arc::clone(&codec));
    let server = Server::new(Arc::new(poller));

    info!("poll echo server listening on 127.0.0.1:8081");
    server.start("127.0.0.1", 8081, Arc::new(Echo { codec }))?;
    Ok(())
}

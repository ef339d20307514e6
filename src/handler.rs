use std::sync::Arc;

use crate::conn::Conn;
use crate::error::Result;

/// Application callbacks invoked by the multiplexing strategies.
///
/// Methods run on the strategy's handle thread or its worker pool, so
/// implementations must be thread-safe. For any one connection the sequence
/// is strict: `on_connect` first, then `on_message` once per decoded frame in
/// arrival order, then exactly one of `on_close` or `on_error`.
pub trait Handler: Send + Sync + 'static {
    /// Called once after a new connection is registered, before any message.
    fn on_connect(&self, conn: &Arc<Conn>) {
        let _ = conn;
    }

    /// Called once per fully decoded frame.
    fn on_message(&self, conn: &Arc<Conn>, payload: &[u8]);

    /// Called exactly once on graceful or idle-timeout teardown. A returned
    /// error is logged; it does not keep the connection alive.
    fn on_close(&self, conn: &Arc<Conn>) -> Result<()> {
        let _ = conn;
        Ok(())
    }

    /// Called in place of `on_close` when the socket reported a reset-type
    /// error condition.
    fn on_error(&self, conn: &Arc<Conn>) {
        let _ = conn;
    }
}

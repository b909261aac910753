use std::sync::Arc;

use crate::conn::Conn;
use crate::error::Error;

/// The application-facing handler trio.
///
/// One instance is shared by every connection of a server or client; keep
/// per-connection state in the connection's session slot.
pub trait Callback: Send + Sync + 'static {
    /// A connection was accepted (or registered) and is about to be armed
    /// for reading. Runs before any `on_data` for the connection.
    fn on_open(&self, conn: &Arc<Conn>);

    /// Bytes arrived. In `TaskType::InEventLoop` mode `data` aliases the
    /// reactor's scratch buffer and must not be retained past the call.
    fn on_data(&self, conn: &Arc<Conn>, data: &[u8]);

    /// The connection is gone. `err` is `None` for a clean peer close,
    /// user-initiated close, or deadline expiry; otherwise the I/O error
    /// that took the connection down. Invoked exactly once per connection.
    fn on_close(&self, conn: &Arc<Conn>, err: Option<&Error>);
}

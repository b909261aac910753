//! riptide — multi-reactor non-blocking TCP framework for Unix.
//!
//! riptide runs one event loop per CPU directly on the OS readiness
//! facility (epoll on Linux, kqueue on the BSDs and macOS). Applications
//! register three callbacks — connection opened, data received, connection
//! closed — and the framework accepts connections, reads bytes, drives the
//! callbacks, and absorbs partial writes into a per-connection buffer chain
//! so slow consumers never block a reactor.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use riptide::{Callback, Config, Conn, Error, Server};
//!
//! struct Echo;
//!
//! impl Callback for Echo {
//!     fn on_open(&self, _conn: &Arc<Conn>) {}
//!     fn on_data(&self, conn: &Arc<Conn>, data: &[u8]) {
//!         let _ = conn.write(data);
//!     }
//!     fn on_close(&self, _conn: &Arc<Conn>, _err: Option<&Error>) {}
//! }
//!
//! fn main() -> Result<(), Error> {
//!     let server = Server::new(Config::default(), Echo)?;
//!     server.listen_and_serve("127.0.0.1:7878")
//! }
//! ```
//!
//! # Dispatch modes
//!
//! `on_data` runs in one of three contexts, chosen by
//! [`Config::task_type`]: inline on the reactor thread, on a shared worker
//! pool, or through a per-connection queue that serializes deliveries
//! end-to-end. See [`TaskType`] for the ordering guarantees of each.
//!
//! # Backpressure
//!
//! When the outbound chain is non-empty, [`Config::flow_backpressure`]
//! pauses reading and [`Config::flow_backpressure_remove_read`] drops read
//! interest entirely until the chain drains. The two are mutually
//! exclusive.
//!
//! # Platform
//!
//! Linux (epoll) and BSD/macOS (kqueue). Both level- and edge-triggered
//! notification are supported; see [`TriggerType`].

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod acceptor;
pub(crate) mod buffer;
pub(crate) mod conn_table;
pub(crate) mod dispatch;
pub(crate) mod event_loop;
pub(crate) mod poller;
pub(crate) mod task_pool;
pub(crate) mod timer;

// ── Public modules ──────────────────────────────────────────────────────
pub mod callback;
pub mod client;
pub mod config;
pub mod conn;
pub mod error;
pub mod server;

// ── Re-exports ──────────────────────────────────────────────────────────

/// The application-facing handler trio.
pub use callback::Callback;
/// Reactor pool for outbound connections.
pub use client::Client;
/// Runtime configuration.
pub use config::Config;
/// Builder for [`Config`] with discoverable methods and `build()` validation.
pub use config::ConfigBuilder;
/// Worker pool sizing.
pub use config::TaskConfig;
/// Dispatch mode for `on_data`.
pub use config::TaskType;
/// A live connection.
pub use conn::Conn;
/// Runtime errors.
pub use error::Error;
/// Readiness trigger mode.
pub use poller::TriggerType;
/// The multi-reactor TCP server.
pub use server::Server;
/// Handle for triggering graceful shutdown.
pub use server::ShutdownHandle;

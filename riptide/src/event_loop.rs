//! The per-reactor poll loop.
//!
//! Each reactor owns one readiness handle and one scratch read buffer and
//! shares the fd table with the acceptor and its sibling reactors. The hot
//! loop blocks in `poll` and walks a fixed branch ladder per event: poll
//! error, write-readiness flush, backpressure pause, deferred-read replay,
//! read drain.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::callback::Callback;
use crate::config::{Config, TaskType};
use crate::conn::Conn;
use crate::conn_table::ConnTable;
use crate::dispatch;
use crate::error::Error;
use crate::poller::{Poller, State, TriggerType};
use crate::task_pool::TaskPool;

/// Engine state shared by the acceptor, the reactors, and every
/// connection.
pub(crate) struct Shared {
    pub(crate) table: ConnTable,
    pub(crate) callback: Arc<dyn Callback>,
    pub(crate) pool: TaskPool,
    pub(crate) task_type: TaskType,
    pub(crate) trigger: TriggerType,
    pub(crate) read_buffer_size: usize,
    pub(crate) max_socket_read_times: usize,
    pub(crate) flow_backpressure: bool,
    pub(crate) remove_read: bool,
}

impl Shared {
    pub(crate) fn new(config: &Config, callback: Arc<dyn Callback>, max_fd: usize) -> Arc<Shared> {
        Arc::new(Shared {
            table: ConnTable::new(max_fd),
            callback,
            pool: TaskPool::new(config.task.init_count, config.task.min, config.task.max),
            task_type: config.task_type,
            trigger: config.trigger_type,
            read_buffer_size: config.read_buffer_size,
            max_socket_read_times: config.max_socket_read_times,
            flow_backpressure: config.flow_backpressure,
            remove_read: config.flow_backpressure_remove_read,
        })
    }
}

/// Run one reactor until the shutdown flag flips. Poll errors are logged
/// and the loop continues; only process exit stops a reactor.
pub(crate) fn run_reactor(shared: Arc<Shared>, poller: Arc<Poller>, shutdown: Arc<AtomicBool>) {
    let mut scratch = vec![0u8; shared.read_buffer_size];
    while !shutdown.load(Ordering::Acquire) {
        let polled = poller.poll(None, |fd, state, err| {
            handle_event(&shared, &mut scratch, fd, state, err);
        });
        if let Err(e) = polled {
            tracing::error!(backend = poller.name(), error = %e, "poll failed");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

fn handle_event(shared: &Arc<Shared>, scratch: &mut [u8], fd: i32, state: State, err: Option<Error>) {
    if let Some(e) = err {
        if e.is_would_block() {
            return;
        }
        if let Some(conn) = shared.table.get(fd) {
            // A hang-up folds into the clean-close signal; anything else is
            // surfaced to on_close.
            let err = match e {
                Error::Eof => None,
                other => Some(other),
            };
            conn.shutdown(err);
        }
        return;
    }

    let conn = match shared.table.get_unchecked(fd) {
        Some(conn) => conn,
        None => panic!("poll delivered fd {fd} with no table entry"),
    };

    if state.is_write() && conn.buffered() > 0 {
        conn.flush();
    }

    // Pause-read backpressure: while the chain is non-empty, suppress the
    // read. Level triggering will re-signal; edge triggering will not, so
    // the suppressed readiness is remembered and replayed after the drain.
    if shared.flow_backpressure && conn.buffered() > 0 {
        match shared.trigger {
            TriggerType::Level => return,
            TriggerType::Edge => {
                conn.set_deferred_read();
                return;
            }
        }
    }

    if conn.take_deferred_read() {
        read_drain(shared, &conn, scratch);
        return;
    }

    if state.is_read() {
        read_drain(shared, &conn, scratch);
    }
}

/// Drain readable bytes into the scratch buffer and dispatch each chunk.
///
/// Level-triggered mode caps the number of reads per signal; edge-triggered
/// mode must keep reading until `EAGAIN`. A short read means the socket's
/// read space is exhausted and ends the drain in both modes.
fn read_drain(shared: &Arc<Shared>, conn: &Arc<Conn>, scratch: &mut [u8]) {
    let level = shared.trigger == TriggerType::Level;
    let mut reads = 0usize;
    loop {
        if level && shared.max_socket_read_times > 0 && reads >= shared.max_socket_read_times {
            return;
        }
        reads += 1;

        match conn.read_into(scratch) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                conn.shutdown(Some(Error::Io(e)));
                return;
            }
            Ok(0) => {
                // Peer closed cleanly.
                conn.shutdown(None);
                return;
            }
            Ok(n) => {
                dispatch::handle_data(conn, &scratch[..n]);
                if n < scratch.len() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn test_shared() -> Arc<Shared> {
    struct Noop;
    impl Callback for Noop {
        fn on_open(&self, _conn: &Arc<Conn>) {}
        fn on_data(&self, _conn: &Arc<Conn>, _data: &[u8]) {}
        fn on_close(&self, _conn: &Arc<Conn>, _err: Option<&Error>) {}
    }

    let mut config = Config::default();
    config.task.init_count = 1;
    config.task.min = 1;
    config.task.max = 4;
    Shared::new(&config, Arc::new(Noop), 256)
}

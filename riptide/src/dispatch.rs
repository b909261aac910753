//! Routing of user callbacks to their execution context.
//!
//! Three modes: synchronous on the reactor thread, one job per delivery on
//! the shared pool, or a single-consumer queue bound to the connection.
//! The deferred modes copy the payload out of the reactor's scratch buffer
//! into a pool buffer and release it after delivery. `on_close` travels
//! through the same domain as the connection's data deliveries so it cannot
//! overtake them.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer;
use crate::config::TaskType;
use crate::conn::Conn;
use crate::error::Error;

pub(crate) enum Delivery {
    Data(Vec<u8>),
    Close(Option<Error>),
}

/// Single-consumer mailbox for `TaskType::InConnectionQueue`. At most one
/// drainer job is in flight per connection, which gives strict end-to-end
/// ordering and one-at-a-time handler invocation.
#[derive(Default)]
pub(crate) struct ConnQueue {
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Delivery>,
    draining: bool,
}

impl ConnQueue {
    /// Append an item. Returns true when the caller must start a drainer.
    fn push(&self, item: Delivery) -> bool {
        let mut state = self.state.lock();
        state.items.push_back(item);
        if state.draining {
            false
        } else {
            state.draining = true;
            true
        }
    }

    /// Pop the next item, or mark the queue idle and return `None`.
    fn pop_or_park(&self) -> Option<Delivery> {
        let mut state = self.state.lock();
        match state.items.pop_front() {
            Some(item) => Some(item),
            None => {
                state.draining = false;
                None
            }
        }
    }
}

/// Route one `on_data` delivery according to the configured mode.
pub(crate) fn handle_data(conn: &Arc<Conn>, data: &[u8]) {
    let shared = conn.shared();
    match shared.task_type {
        TaskType::InEventLoop => {
            shared.callback.on_data(conn, data);
        }
        TaskType::InBusinessPool => {
            let buf = copy_payload(data, shared.read_buffer_size);
            let conn = conn.clone();
            shared.pool.spawn(move || {
                {
                    let _entry = conn.cb_lock.lock();
                    if !conn.close_was_fired() {
                        conn.shared().callback.on_data(&conn, &buf);
                    }
                }
                buffer::release(buf);
            });
        }
        TaskType::InConnectionQueue => {
            let buf = copy_payload(data, shared.read_buffer_size);
            enqueue(conn, Delivery::Data(buf));
        }
    }
}

/// Deliver `on_close` through the connection's dispatch domain.
pub(crate) fn deliver_close(conn: &Arc<Conn>, err: Option<Error>) {
    let shared = conn.shared();
    match shared.task_type {
        TaskType::InEventLoop => {
            if conn.mark_close_fired() {
                shared.callback.on_close(conn, err.as_ref());
            }
        }
        TaskType::InBusinessPool => {
            let conn = conn.clone();
            shared.pool.spawn(move || {
                let _entry = conn.cb_lock.lock();
                if conn.mark_close_fired() {
                    conn.shared().callback.on_close(&conn, err.as_ref());
                }
            });
        }
        TaskType::InConnectionQueue => {
            enqueue(conn, Delivery::Close(err));
        }
    }
}

fn enqueue(conn: &Arc<Conn>, item: Delivery) {
    if conn.queue.push(item) {
        let drainer = conn.clone();
        conn.shared().pool.spawn(move || drain(drainer));
    }
}

fn drain(conn: Arc<Conn>) {
    while let Some(item) = conn.queue.pop_or_park() {
        match item {
            Delivery::Data(buf) => {
                if !conn.close_was_fired() {
                    conn.shared().callback.on_data(&conn, &buf);
                }
                buffer::release(buf);
            }
            Delivery::Close(err) => {
                if conn.mark_close_fired() {
                    conn.shared().callback.on_close(&conn, err.as_ref());
                }
            }
        }
    }
}

fn copy_payload(data: &[u8], read_buffer_size: usize) -> Vec<u8> {
    let mut buf = buffer::acquire_with_size(data.len().max(1), read_buffer_size);
    buf.extend_from_slice(data);
    buf
}

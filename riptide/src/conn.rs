//! Per-connection state: fd lifecycle, the chained write buffer, deadline
//! timers, and the opaque session slot.
//!
//! The connection's logical identity is the fd it owns; `fd == -1` is the
//! terminal closed state. All mutable state and read syscalls on the fd are
//! guarded by the per-connection lock. Writes from user threads attempt an
//! immediate non-blocking send and queue any residue on the write chain,
//! arming writability so the owning reactor finishes the job.

use std::any::Any;
use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};

use crate::buffer;
use crate::dispatch::{self, ConnQueue};
use crate::error::Error;
use crate::event_loop::Shared;
use crate::poller::Poller;
use crate::timer::{self, TimerHandle};

pub struct Conn {
    fd: AtomicI32,
    inner: Mutex<ConnInner>,
    /// Bytes pending in the write chain, mirrored for lock-free reactor
    /// checks. Updated only under the connection lock.
    pending: AtomicUsize,
    /// A read-ready signal was suppressed by backpressure and must be
    /// replayed on the next write drain. Edge-triggered mode only.
    deferred_read: AtomicBool,
    /// `on_close` has entered the connection's dispatch domain.
    close_fired: AtomicBool,
    /// Serializes handler entry for pool-dispatched deliveries.
    pub(crate) cb_lock: Mutex<()>,
    /// Mailbox for `TaskType::InConnectionQueue`.
    pub(crate) queue: ConnQueue,
    read_buffer_size: usize,
    remove_read: bool,
    shared: Arc<Shared>,
    poller: Arc<Poller>,
    weak: Weak<Conn>,
}

struct ConnInner {
    chain: VecDeque<Vec<u8>>,
    session: Option<Arc<dyn Any + Send + Sync>>,
    read_timer: Option<TimerHandle>,
    write_timer: Option<TimerHandle>,
    /// Sequence of the scheduled deadline per slot. A fired timer job must
    /// find its own sequence still stored here before it may close: a
    /// clear or reschedule that races the fire invalidates the job even
    /// when `cancel` was too late to pull it from the heap.
    read_timer_seq: Option<u64>,
    write_timer_seq: Option<u64>,
    timer_gen: u64,
}

impl Conn {
    pub(crate) fn new(fd: RawFd, shared: Arc<Shared>, poller: Arc<Poller>) -> Arc<Conn> {
        Arc::new_cyclic(|weak| Conn {
            fd: AtomicI32::new(fd),
            inner: Mutex::new(ConnInner {
                chain: VecDeque::new(),
                session: None,
                read_timer: None,
                write_timer: None,
                read_timer_seq: None,
                write_timer_seq: None,
                timer_gen: 0,
            }),
            pending: AtomicUsize::new(0),
            deferred_read: AtomicBool::new(false),
            close_fired: AtomicBool::new(false),
            cb_lock: Mutex::new(()),
            queue: ConnQueue::default(),
            read_buffer_size: shared.read_buffer_size,
            remove_read: shared.remove_read,
            shared,
            poller,
            weak: weak.clone(),
        })
    }

    /// The owned fd, or -1 once closed.
    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.fd() < 0
    }

    /// Bytes accepted by `write` but not yet handed to the kernel.
    pub fn buffered(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    // ── Write path ───────────────────────────────────────────────────

    /// Queue `data` for the peer.
    ///
    /// Returns `Ok(data.len())` whenever the bytes were accepted, whether
    /// they reached the kernel or the write chain. A terminal I/O failure
    /// closes the connection and returns the error; a closed connection
    /// returns [`Error::Closed`].
    pub fn write(&self, data: &[u8]) -> Result<usize, Error> {
        let mut inner = self.inner.lock();
        let fd = self.fd();
        if fd < 0 {
            return Err(Error::Closed);
        }
        if data.is_empty() && inner.chain.is_empty() {
            return Ok(0);
        }

        if inner.chain.is_empty() {
            return match write_to_socket(fd, data) {
                Ok(n) if n == data.len() => Ok(n),
                Ok(n) => {
                    self.queue_residue(&mut inner, &data[n..]);
                    self.sync_pending(&inner);
                    self.arm_write(fd);
                    Ok(data.len())
                }
                Err(e) if is_transient(&e) => {
                    self.queue_residue(&mut inner, data);
                    self.sync_pending(&inner);
                    self.arm_write(fd);
                    Ok(data.len())
                }
                Err(e) => self.fail(inner, e),
            };
        }

        if !data.is_empty() {
            self.queue_residue(&mut inner, data);
        }

        // Drain from the head; fully sent segments go back to the pool, a
        // partial send leaves the head compacted to offset zero.
        loop {
            let drained_head = {
                let head = match inner.chain.front_mut() {
                    Some(head) => head,
                    None => break,
                };
                match write_to_socket(fd, head) {
                    Ok(n) if n == head.len() => true,
                    Ok(n) => {
                        head.drain(..n);
                        self.sync_pending(&inner);
                        self.arm_write(fd);
                        return Ok(data.len());
                    }
                    Err(e) if is_transient(&e) => {
                        self.sync_pending(&inner);
                        self.arm_write(fd);
                        return Ok(data.len());
                    }
                    Err(e) => return self.fail(inner, e),
                }
            };
            if drained_head {
                if let Some(buf) = inner.chain.pop_front() {
                    buffer::release(buf);
                }
            }
        }

        self.pending.store(0, Ordering::Release);
        if let Err(e) = self.poller.reset_read(fd) {
            tracing::debug!(fd, error = %e, "reset_read after drain failed");
        }
        Ok(data.len())
    }

    /// Drain the write chain without appending: `write(&[])`.
    pub(crate) fn flush(&self) {
        let _ = self.write(&[]);
    }

    /// Append to the chain tail, preferring the tail's free capacity and
    /// cutting fresh segments at the read-buffer granularity.
    fn queue_residue(&self, inner: &mut ConnInner, data: &[u8]) {
        let mut rest = data;
        if let Some(tail) = inner.chain.back_mut() {
            let spare = tail.capacity() - tail.len();
            if spare > 0 {
                let take = spare.min(rest.len());
                tail.extend_from_slice(&rest[..take]);
                rest = &rest[take..];
            }
        }
        while !rest.is_empty() {
            let take = rest.len().min(self.read_buffer_size);
            let mut seg = buffer::acquire_with_size(take, self.read_buffer_size);
            seg.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            inner.chain.push_back(seg);
        }
    }

    fn sync_pending(&self, inner: &ConnInner) {
        let total = inner.chain.iter().map(|b| b.len()).sum();
        self.pending.store(total, Ordering::Release);
    }

    /// Arm writability for the pending chain: write interest by default,
    /// or dropping read interest in remove-read backpressure mode.
    fn arm_write(&self, fd: RawFd) {
        let armed = if self.remove_read {
            self.poller.del_read(fd)
        } else {
            self.poller.add_write(fd)
        };
        if let Err(e) = armed {
            tracing::debug!(fd, error = %e, "arming write interest failed");
        }
    }

    /// Terminal write error: tear the connection down, surface the error to
    /// the caller, and deliver `on_close` with a copy of it.
    fn fail(&self, mut inner: MutexGuard<'_, ConnInner>, err: io::Error) -> Result<usize, Error> {
        let for_close = clone_io_error(&err);
        let torn = self.teardown_locked(&mut inner);
        drop(inner);
        if torn {
            self.deliver_close(Some(Error::Io(for_close)));
        }
        Err(Error::Io(err))
    }

    // ── Close path ───────────────────────────────────────────────────

    /// Close the connection. Idempotent; `on_close(None)` is delivered for
    /// the first call.
    pub fn close(&self) {
        self.shutdown(None);
    }

    /// Close and deliver `on_close(err)` exactly once. Every termination
    /// path funnels through here; the fd swap picks the single winner.
    pub(crate) fn shutdown(&self, err: Option<Error>) {
        let mut inner = self.inner.lock();
        let torn = self.teardown_locked(&mut inner);
        drop(inner);
        if torn {
            self.deliver_close(err);
        }
    }

    fn teardown_locked(&self, inner: &mut ConnInner) -> bool {
        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd < 0 {
            return false;
        }
        if let Some(t) = inner.read_timer.take() {
            t.cancel();
        }
        if let Some(t) = inner.write_timer.take() {
            t.cancel();
        }
        inner.read_timer_seq = None;
        inner.write_timer_seq = None;
        while let Some(buf) = inner.chain.pop_front() {
            buffer::release(buf);
        }
        self.pending.store(0, Ordering::Release);
        let _ = self.poller.del(fd);
        self.shared.table.del(fd);
        unsafe {
            libc::close(fd);
        }
        true
    }

    fn deliver_close(&self, err: Option<Error>) {
        if let Some(conn) = self.weak.upgrade() {
            dispatch::deliver_close(&conn, err);
        }
    }

    /// Whether `on_close` has already entered the dispatch domain. Flips
    /// the flag on first call.
    pub(crate) fn mark_close_fired(&self) -> bool {
        !self.close_fired.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn close_was_fired(&self) -> bool {
        self.close_fired.load(Ordering::Acquire)
    }

    // ── Deadlines ────────────────────────────────────────────────────

    /// Set both read and write deadlines. `None` clears them; a deadline in
    /// the past closes the connection immediately; otherwise a one-shot
    /// timer closes the connection when it fires.
    pub fn set_deadline(&self, deadline: Option<Instant>) -> Result<(), Error> {
        self.set_deadline_impl(deadline, true, true)
    }

    /// Set only the read deadline.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<(), Error> {
        self.set_deadline_impl(deadline, true, false)
    }

    /// Set only the write deadline.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<(), Error> {
        self.set_deadline_impl(deadline, false, true)
    }

    fn set_deadline_impl(
        &self,
        deadline: Option<Instant>,
        read: bool,
        write: bool,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if self.fd() < 0 {
            return Err(Error::Closed);
        }
        if read {
            if let Some(t) = inner.read_timer.take() {
                t.cancel();
            }
            inner.read_timer_seq = None;
        }
        if write {
            if let Some(t) = inner.write_timer.take() {
                t.cancel();
            }
            inner.write_timer_seq = None;
        }

        let when = match deadline {
            Some(when) => when,
            None => return Ok(()),
        };

        if when <= Instant::now() {
            let torn = self.teardown_locked(&mut inner);
            drop(inner);
            if torn {
                self.deliver_close(None);
            }
            return Ok(());
        }

        if read {
            inner.timer_gen += 1;
            let seq = inner.timer_gen;
            inner.read_timer_seq = Some(seq);
            let weak = self.weak.clone();
            inner.read_timer = Some(timer::after(when, move || {
                if let Some(conn) = weak.upgrade() {
                    conn.deadline_fired(seq, true);
                }
            }));
        }
        if write {
            inner.timer_gen += 1;
            let seq = inner.timer_gen;
            inner.write_timer_seq = Some(seq);
            let weak = self.weak.clone();
            inner.write_timer = Some(timer::after(when, move || {
                if let Some(conn) = weak.upgrade() {
                    conn.deadline_fired(seq, false);
                }
            }));
        }
        Ok(())
    }

    /// Timer-thread entry for a fired deadline. Closes the connection only
    /// if `seq` is still the scheduled deadline for its slot under the
    /// connection lock; a stale fire that lost a race against a clear or a
    /// reschedule is dropped.
    fn deadline_fired(&self, seq: u64, read: bool) {
        let mut inner = self.inner.lock();
        let active = if read {
            inner.read_timer_seq == Some(seq)
        } else {
            inner.write_timer_seq == Some(seq)
        };
        if !active {
            return;
        }
        let torn = self.teardown_locked(&mut inner);
        drop(inner);
        if torn {
            self.deliver_close(None);
        }
    }

    // ── Session slot ─────────────────────────────────────────────────

    /// Attach an opaque user value. The framework never interprets it and
    /// does not drop it on close.
    pub fn set_session(&self, session: Arc<dyn Any + Send + Sync>) {
        self.inner.lock().session = Some(session);
    }

    /// The value set by [`set_session`](Self::set_session), if any.
    pub fn session(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.lock().session.clone()
    }

    // ── Socket options ───────────────────────────────────────────────

    /// Toggle `TCP_NODELAY`.
    pub fn set_no_delay(&self, nodelay: bool) -> Result<(), Error> {
        let fd = self.fd();
        if fd < 0 {
            return Err(Error::Closed);
        }
        let optval: libc::c_int = if nodelay { 1 } else { 0 };
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    // ── Reactor-side helpers ─────────────────────────────────────────

    /// One non-blocking read under the connection lock.
    pub(crate) fn read_into(&self, buf: &mut [u8]) -> io::Result<usize> {
        let _guard = self.inner.lock();
        let fd = self.fd();
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub(crate) fn set_deferred_read(&self) {
        self.deferred_read.store(true, Ordering::Release);
    }

    /// Clears and returns the deferred-read bit.
    pub(crate) fn take_deferred_read(&self) -> bool {
        self.deferred_read.swap(false, Ordering::AcqRel)
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn clone_io_error(err: &io::Error) -> io::Error {
    match err.raw_os_error() {
        Some(code) => io::Error::from_raw_os_error(code),
        None => io::Error::new(err.kind(), err.to_string()),
    }
}

/// Non-blocking send with a bounded `EINTR` retry before surfacing it.
fn write_to_socket(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let mut last_err = io::Error::from_raw_os_error(libc::EINTR);
    for _ in 0..3 {
        let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            last_err = err;
            continue;
        }
        return Err(err);
    }
    Err(last_err)
}

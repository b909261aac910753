//! kqueue backend for the BSDs and macOS.
//!
//! Read and write interest are separate `EVFILT_READ` / `EVFILT_WRITE`
//! filters. Edge triggering maps to `EV_CLEAR`; in that mode both filters
//! are registered up front (mirroring the single-registration epoll trick)
//! and interest changes only enable or delete filters.

use std::io;
use std::os::fd::RawFd;
use std::ptr;
use std::time::Duration;

use parking_lot::Mutex;

use super::{State, TriggerType};
use crate::error::Error;

const EVENT_BATCH: usize = 1024;

pub(crate) struct Poller {
    kq: RawFd,
    wake_r: RawFd,
    wake_w: RawFd,
    edge: bool,
    events: Mutex<Vec<libc::kevent>>,
}

// Safety: the udata pointers in the event buffer are kernel-filled storage
// and never dereferenced.
unsafe impl Send for Poller {}
unsafe impl Sync for Poller {}

impl Poller {
    pub fn new(trigger: TriggerType) -> Result<Poller, Error> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(Error::PollerSetup(format!(
                "kqueue: {}",
                io::Error::last_os_error()
            )));
        }

        let mut pipe_fds = [0; 2];
        if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(kq);
            }
            return Err(Error::PollerSetup(format!("pipe: {err}")));
        }
        for fd in pipe_fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }

        let poller = Poller {
            kq,
            wake_r: pipe_fds[0],
            wake_w: pipe_fds[1],
            edge: trigger == TriggerType::Edge,
            events: Mutex::new(vec![unsafe { std::mem::zeroed() }; EVENT_BATCH]),
        };
        poller.change(poller.wake_r, libc::EVFILT_READ, libc::EV_ADD | libc::EV_ENABLE)?;
        Ok(poller)
    }

    fn change(&self, fd: RawFd, filter: i16, flags: u16) -> Result<(), Error> {
        let change = libc::kevent {
            ident: fd as _,
            filter: filter as _,
            flags: flags as _,
            fflags: 0,
            data: 0,
            udata: ptr::null_mut(),
        };
        let ret = unsafe {
            libc::kevent(self.kq, &change, 1, ptr::null_mut(), 0, ptr::null())
        };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn add_flags(&self) -> u16 {
        if self.edge {
            libc::EV_ADD | libc::EV_ENABLE | libc::EV_CLEAR
        } else {
            libc::EV_ADD | libc::EV_ENABLE
        }
    }

    /// Declare read interest for a freshly registered fd. In edge mode the
    /// write filter is registered at the same time.
    pub fn add_read(&self, fd: RawFd) -> Result<(), Error> {
        if fd < 0 {
            return Ok(());
        }
        self.change(fd, libc::EVFILT_READ, self.add_flags())?;
        if self.edge {
            self.change(fd, libc::EVFILT_WRITE, self.add_flags())?;
        }
        Ok(())
    }

    /// Add write interest. No-op in edge mode, where the write filter is
    /// registered up front.
    pub fn add_write(&self, fd: RawFd) -> Result<(), Error> {
        if fd < 0 || self.edge {
            return Ok(());
        }
        self.change(fd, libc::EVFILT_WRITE, self.add_flags())
    }

    /// Drop read interest, leaving write armed.
    pub fn del_read(&self, fd: RawFd) -> Result<(), Error> {
        if fd < 0 {
            return Ok(());
        }
        let _ = self.change(fd, libc::EVFILT_READ, libc::EV_DELETE);
        if !self.edge {
            self.change(fd, libc::EVFILT_WRITE, self.add_flags())?;
        }
        Ok(())
    }

    /// Restore read-only interest after the write chain drains.
    pub fn reset_read(&self, fd: RawFd) -> Result<(), Error> {
        if fd < 0 {
            return Ok(());
        }
        self.change(fd, libc::EVFILT_READ, self.add_flags())?;
        if !self.edge {
            // Write interest is dropped; the registration may not exist.
            let _ = self.change(fd, libc::EVFILT_WRITE, libc::EV_DELETE);
        }
        Ok(())
    }

    /// Deregister the fd completely.
    pub fn del(&self, fd: RawFd) -> Result<(), Error> {
        if fd < 0 {
            return Ok(());
        }
        let _ = self.change(fd, libc::EVFILT_READ, libc::EV_DELETE);
        let _ = self.change(fd, libc::EVFILT_WRITE, libc::EV_DELETE);
        Ok(())
    }

    /// Wake a blocked `poll` call from another thread.
    pub fn wake(&self) {
        let b = [1u8];
        unsafe {
            libc::write(self.wake_w, b.as_ptr() as *const libc::c_void, 1);
        }
    }

    /// Block up to `timeout` (forever when `None`), invoking `cb` once per
    /// ready filter. `EINTR` yields zero events without error. A drained
    /// peer close delivers `(READ | WRITE, Some(Error::Eof))`.
    pub fn poll<F>(&self, timeout: Option<Duration>, mut cb: F) -> Result<usize, Error>
    where
        F: FnMut(RawFd, State, Option<Error>),
    {
        let ts;
        let ts_ptr = match timeout {
            Some(d) => {
                ts = libc::timespec {
                    tv_sec: d.as_secs() as _,
                    tv_nsec: d.subsec_nanos() as _,
                };
                &ts as *const libc::timespec
            }
            None => ptr::null(),
        };

        let mut events = self.events.lock();
        let n = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                events.as_mut_ptr(),
                events.len() as _,
                ts_ptr,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(Error::Io(err));
        }

        let mut delivered = 0;
        for ev in events.iter().take(n as usize) {
            let fd = ev.ident as RawFd;
            if fd == self.wake_r {
                let mut scratch = [0u8; 64];
                unsafe {
                    libc::read(
                        self.wake_r,
                        scratch.as_mut_ptr() as *mut libc::c_void,
                        scratch.len(),
                    );
                }
                continue;
            }

            if ev.flags & libc::EV_ERROR != 0 {
                let err = io::Error::from_raw_os_error(ev.data as i32);
                cb(fd, State::READ | State::WRITE, Some(Error::Io(err)));
                delivered += 1;
                continue;
            }

            // EV_EOF with no pending data folds into the EOF signal; with
            // data still buffered the read is delivered first and the EOF
            // re-surfaces on the next poll.
            if ev.flags & libc::EV_EOF != 0 && ev.data == 0 {
                cb(fd, State::READ | State::WRITE, Some(Error::Eof));
                delivered += 1;
                continue;
            }

            let state = match ev.filter {
                libc::EVFILT_READ => State::READ,
                libc::EVFILT_WRITE => State::WRITE,
                _ => continue,
            };
            cb(fd, state, None);
            delivered += 1;
        }
        Ok(delivered)
    }

    pub fn name(&self) -> &'static str {
        "kqueue"
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_r);
            libc::close(self.wake_w);
            libc::close(self.kq);
        }
    }
}

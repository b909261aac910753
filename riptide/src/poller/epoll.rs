//! Linux epoll backend.
//!
//! Level-triggered mode adds and removes `EPOLLIN`/`EPOLLOUT` interest per
//! operation. Edge-triggered mode registers the fd once with
//! `EPOLLIN | EPOLLOUT | EPOLLET` (the man-page trick that avoids
//! continuously switching masks with `EPOLL_CTL_MOD`); subsequent
//! operations only adjust the mask.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use parking_lot::Mutex;

use super::{State, TriggerType};
use crate::error::Error;

const EVENT_BATCH: usize = 1024;

const HANGUP: u32 =
    (libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32;
const BASE: u32 =
    (libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP | libc::EPOLLPRI) as u32;
const ET: u32 = libc::EPOLLET as u32;
const IN: u32 = libc::EPOLLIN as u32;
const OUT: u32 = libc::EPOLLOUT as u32;

pub(crate) struct Poller {
    epfd: RawFd,
    wake_fd: RawFd,
    edge: bool,
    events: Mutex<Vec<libc::epoll_event>>,
}

impl Poller {
    pub fn new(trigger: TriggerType) -> Result<Poller, Error> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::PollerSetup(format!(
                "epoll_create1: {}",
                io::Error::last_os_error()
            )));
        }

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(epfd);
            }
            return Err(Error::PollerSetup(format!("eventfd: {err}")));
        }

        let poller = Poller {
            epfd,
            wake_fd,
            edge: trigger == TriggerType::Edge,
            events: Mutex::new(vec![
                libc::epoll_event { events: 0, u64: 0 };
                EVENT_BATCH
            ]),
        };
        // The wake fd stays level-triggered read-only in both modes.
        poller.ctl(libc::EPOLL_CTL_ADD, wake_fd, IN)?;
        Ok(poller)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, mask: u32) -> Result<(), Error> {
        let mut ev = libc::epoll_event {
            events: mask,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Declare read interest for a freshly registered fd.
    pub fn add_read(&self, fd: RawFd) -> Result<(), Error> {
        if fd < 0 {
            return Ok(());
        }
        if self.edge {
            self.ctl(libc::EPOLL_CTL_ADD, fd, IN | OUT | BASE | ET)
        } else {
            self.ctl(libc::EPOLL_CTL_ADD, fd, IN | BASE)
        }
    }

    /// Add write interest to an existing registration. No-op under edge
    /// triggering, where the fd was registered with `IN | OUT | ET`.
    pub fn add_write(&self, fd: RawFd) -> Result<(), Error> {
        if fd < 0 || self.edge {
            return Ok(());
        }
        self.ctl(libc::EPOLL_CTL_MOD, fd, IN | OUT | BASE)
    }

    /// Drop read interest, leaving write. Used by the remove-read
    /// backpressure mode.
    pub fn del_read(&self, fd: RawFd) -> Result<(), Error> {
        if fd < 0 {
            return Ok(());
        }
        if self.edge {
            self.ctl(libc::EPOLL_CTL_MOD, fd, OUT | BASE | ET)
        } else {
            self.ctl(libc::EPOLL_CTL_MOD, fd, OUT)
        }
    }

    /// Restore read-only interest after the write chain drains.
    pub fn reset_read(&self, fd: RawFd) -> Result<(), Error> {
        if fd < 0 {
            return Ok(());
        }
        if self.edge {
            self.ctl(libc::EPOLL_CTL_MOD, fd, IN | OUT | BASE | ET)
        } else {
            self.ctl(libc::EPOLL_CTL_MOD, fd, IN | BASE)
        }
    }

    /// Deregister the fd completely.
    pub fn del(&self, fd: RawFd) -> Result<(), Error> {
        if fd < 0 {
            return Ok(());
        }
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
    }

    /// Wake a blocked `poll` call from another thread.
    pub fn wake(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(self.wake_fd, &val as *const u64 as *const libc::c_void, 8);
        }
    }

    /// Block up to `timeout` (forever when `None`), invoking `cb` once per
    /// ready fd. `EINTR` yields zero events without error. Hang-up and
    /// error conditions deliver `(READ | WRITE, Some(Error::Eof))`.
    pub fn poll<F>(&self, timeout: Option<Duration>, mut cb: F) -> Result<usize, Error>
    where
        F: FnMut(RawFd, State, Option<Error>),
    {
        let msec = match timeout {
            Some(d) => d.as_millis().min(i32::MAX as u128) as libc::c_int,
            None => -1,
        };

        let mut events = self.events.lock();
        let n = unsafe {
            libc::epoll_wait(self.epfd, events.as_mut_ptr(), events.len() as libc::c_int, msec)
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
            let fd = ev.u64 as RawFd;
            if fd == self.wake_fd {
                let mut scratch = 0u64;
                unsafe {
                    libc::read(
                        self.wake_fd,
                        &mut scratch as *mut u64 as *mut libc::c_void,
                        8,
                    );
                }
                continue;
            }

            if ev.events & HANGUP != 0 {
                cb(fd, State::READ | State::WRITE, Some(Error::Eof));
                delivered += 1;
                continue;
            }

            let mut state = State::empty();
            if ev.events & (IN | libc::EPOLLPRI as u32) != 0 {
                state = state | State::READ;
            }
            if ev.events & OUT != 0 {
                state = state | State::WRITE;
            }
            cb(fd, state, None);
            delivered += 1;
        }
        Ok(delivered)
    }

    pub fn name(&self) -> &'static str {
        "epoll"
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let ret = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn close_pair(a: RawFd, b: RawFd) {
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn read_readiness_level() {
        let poller = Poller::new(TriggerType::Level).unwrap();
        let (a, b) = socketpair();
        poller.add_read(a).unwrap();

        let msg = b"ping";
        unsafe {
            libc::write(b, msg.as_ptr() as *const libc::c_void, msg.len());
        }

        let mut saw = None;
        poller
            .poll(Some(Duration::from_secs(1)), |fd, state, err| {
                assert!(err.is_none());
                saw = Some((fd, state));
            })
            .unwrap();
        let (fd, state) = saw.expect("no event");
        assert_eq!(fd, a);
        assert!(state.is_read());

        close_pair(a, b);
    }

    #[test]
    fn hangup_delivers_eof() {
        let poller = Poller::new(TriggerType::Level).unwrap();
        let (a, b) = socketpair();
        poller.add_read(a).unwrap();
        unsafe {
            libc::close(b);
        }

        let mut eof = false;
        poller
            .poll(Some(Duration::from_secs(1)), |fd, _state, err| {
                assert_eq!(fd, a);
                eof = matches!(err, Some(Error::Eof));
            })
            .unwrap();
        assert!(eof);

        unsafe {
            libc::close(a);
        }
    }

    #[test]
    fn wake_unblocks_poll() {
        let poller = std::sync::Arc::new(Poller::new(TriggerType::Level).unwrap());
        let p = poller.clone();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            p.wake();
        });

        let n = poller
            .poll(Some(Duration::from_secs(5)), |_, _, _| {
                panic!("wake must not reach the callback");
            })
            .unwrap();
        assert_eq!(n, 0);
        waker.join().unwrap();
    }

    #[test]
    fn del_read_leaves_write_interest() {
        let poller = Poller::new(TriggerType::Level).unwrap();
        let (a, b) = socketpair();
        poller.add_read(a).unwrap();
        poller.del_read(a).unwrap();

        // Data is pending but read interest is gone; only writability may
        // surface.
        unsafe {
            libc::write(b, b"x".as_ptr() as *const libc::c_void, 1);
        }
        let mut states = Vec::new();
        poller
            .poll(Some(Duration::from_millis(200)), |fd, state, err| {
                assert_eq!(fd, a);
                assert!(err.is_none());
                states.push(state);
            })
            .unwrap();
        assert!(states.iter().all(|s| !s.is_read()));
        assert!(states.iter().any(|s| s.is_write()));

        close_pair(a, b);
    }

    #[test]
    fn reset_read_restores_read_interest() {
        let poller = Poller::new(TriggerType::Level).unwrap();
        let (a, b) = socketpair();
        poller.add_read(a).unwrap();
        poller.del_read(a).unwrap();
        poller.reset_read(a).unwrap();

        unsafe {
            libc::write(b, b"x".as_ptr() as *const libc::c_void, 1);
        }
        let mut read_seen = false;
        poller
            .poll(Some(Duration::from_secs(1)), |fd, state, _| {
                if fd == a && state.is_read() {
                    read_seen = true;
                }
            })
            .unwrap();
        assert!(read_seen);

        close_pair(a, b);
    }

    #[test]
    fn del_deregisters_completely() {
        let poller = Poller::new(TriggerType::Level).unwrap();
        let (a, b) = socketpair();
        poller.add_read(a).unwrap();
        poller.del(a).unwrap();

        unsafe {
            libc::write(b, b"x".as_ptr() as *const libc::c_void, 1);
        }
        let n = poller
            .poll(Some(Duration::from_millis(100)), |_, _, _| {
                panic!("deregistered fd must not surface");
            })
            .unwrap();
        assert_eq!(n, 0);

        close_pair(a, b);
    }

    #[test]
    fn edge_single_registration() {
        let poller = Poller::new(TriggerType::Edge).unwrap();
        let (a, b) = socketpair();
        poller.add_read(a).unwrap();
        // add_write is a no-op on an edge-triggered registration.
        poller.add_write(a).unwrap();

        let msg = b"x";
        unsafe {
            libc::write(b, msg.as_ptr() as *const libc::c_void, 1);
        }

        let mut read_seen = false;
        poller
            .poll(Some(Duration::from_secs(1)), |fd, state, _| {
                if fd == a && state.is_read() {
                    read_seen = true;
                }
            })
            .unwrap();
        assert!(read_seen);

        close_pair(a, b);
    }
}

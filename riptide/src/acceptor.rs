//! The accept loop: one blocking thread feeding connections to the
//! reactors round-robin.
//!
//! Accept failures never take the server down. Transient errors back off
//! for a second and retry; the loop exits only when the listener fd is
//! closed by shutdown.

use std::io;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::conn::Conn;
use crate::event_loop::Shared;
use crate::poller::Poller;

pub(crate) struct Acceptor {
    pub listen_fd: RawFd,
    pub shared: Arc<Shared>,
    pub pollers: Vec<Arc<Poller>>,
    pub shutdown: Arc<AtomicBool>,
    pub tcp_nodelay: bool,
}

/// Run the accept loop until shutdown closes the listener.
pub(crate) fn run_acceptor(acceptor: Acceptor) {
    if acceptor.pollers.is_empty() {
        return;
    }

    let mut accepted = 0usize;
    loop {
        if acceptor.shutdown.load(Ordering::Acquire) {
            return;
        }

        let fd = accept_conn(acceptor.listen_fd);
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            if acceptor.shutdown.load(Ordering::Acquire) {
                return;
            }
            if err.raw_os_error() == Some(libc::EBADF) {
                // Listener gone without the flag: nothing left to accept.
                tracing::warn!(error = %err, "listener closed, acceptor exiting");
                return;
            }
            tracing::warn!(error = %err, "accept failed, retrying");
            std::thread::sleep(Duration::from_secs(1));
            continue;
        }

        if acceptor.tcp_nodelay {
            set_nodelay(fd);
        }

        // Round-robin over a monotonic accept counter.
        let index = accepted % acceptor.pollers.len();
        accepted = accepted.wrapping_add(1);
        let poller = acceptor.pollers[index].clone();

        let conn = Conn::new(fd, acceptor.shared.clone(), poller.clone());
        acceptor.shared.table.add(fd, conn.clone());
        acceptor.shared.callback.on_open(&conn);

        if let Err(e) = poller.add_read(fd) {
            tracing::error!(fd, error = %e, "arming read interest failed");
            conn.shutdown(Some(e));
        }
    }
}

#[cfg(target_os = "linux")]
fn accept_conn(listen_fd: RawFd) -> RawFd {
    unsafe {
        libc::accept4(
            listen_fd,
            ptr::null_mut(),
            ptr::null_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    }
}

#[cfg(not(target_os = "linux"))]
fn accept_conn(listen_fd: RawFd) -> RawFd {
    let fd = unsafe { libc::accept(listen_fd, ptr::null_mut(), ptr::null_mut()) };
    if fd >= 0 {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
    }
    fd
}

fn set_nodelay(fd: RawFd) {
    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

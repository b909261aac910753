//! Server construction and the listen/serve lifecycle.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;

use crate::acceptor::{run_acceptor, Acceptor};
use crate::callback::Callback;
use crate::config::Config;
use crate::error::Error;
use crate::event_loop::{run_reactor, Shared};
use crate::poller::Poller;

/// Handle for triggering graceful shutdown of a running server.
///
/// Cloneable across threads; `shutdown` closes the listener to unblock the
/// accept loop and wakes every reactor so they observe the flag.
#[derive(Clone)]
pub struct ShutdownHandle {
    shutdown: Arc<AtomicBool>,
    listen_fd: Arc<AtomicI32>,
    pollers: Vec<Arc<Poller>>,
}

impl ShutdownHandle {
    /// Signal the server to stop. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let fd = self.listen_fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        }
        for poller in &self.pollers {
            poller.wake();
        }
    }
}

/// A multi-reactor TCP server.
///
/// One reactor thread per CPU polls readiness and drives the registered
/// [`Callback`]; a single acceptor thread distributes new connections
/// round-robin.
pub struct Server {
    shared: Arc<Shared>,
    pollers: Vec<Arc<Poller>>,
    config: Config,
    shutdown: Arc<AtomicBool>,
    listen_fd: Arc<AtomicI32>,
}

impl Server {
    /// Validate the configuration and build the engine: one readiness
    /// handle per reactor, the fd table sized from `RLIMIT_NOFILE`, and the
    /// worker pool for deferred dispatch.
    pub fn new<C: Callback>(config: Config, callback: C) -> Result<Server, Error> {
        config.validate()?;
        init_default_subscriber(config.log_level);

        let max_fd = rlimit_nofile()?;
        let reactors = if config.reactors == 0 {
            num_cpus()
        } else {
            config.reactors
        };

        let mut pollers = Vec::with_capacity(reactors);
        for _ in 0..reactors {
            pollers.push(Arc::new(Poller::new(config.trigger_type)?));
        }

        let shared = Shared::new(&config, Arc::new(callback), max_fd);
        tracing::debug!(
            reactors,
            max_fd,
            backend = pollers[0].name(),
            "server constructed"
        );

        Ok(Server {
            shared,
            pollers,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            listen_fd: Arc::new(AtomicI32::new(-1)),
        })
    }

    /// A handle that stops this server from any thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown: self.shutdown.clone(),
            listen_fd: self.listen_fd.clone(),
            pollers: self.pollers.clone(),
        }
    }

    /// Number of live connections in the fd table.
    pub fn active_connections(&self) -> usize {
        self.shared.table.active_count()
    }

    /// Bind `addr`, spawn the reactor threads, and run the accept loop on
    /// the calling thread. Blocks until [`ShutdownHandle::shutdown`] is
    /// called.
    pub fn listen_and_serve(&self, addr: &str) -> Result<(), Error> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("invalid listen address: {addr}")))?;

        let listen_fd = create_listener(addr, self.config.backlog)?;
        self.listen_fd.store(listen_fd, Ordering::Release);
        if self.shutdown.load(Ordering::Acquire) {
            // Shutdown raced construction; release the fd unless the
            // handle already did.
            let fd = self.listen_fd.swap(-1, Ordering::AcqRel);
            if fd >= 0 {
                unsafe {
                    libc::close(fd);
                }
            }
            return Ok(());
        }

        let mut handles = Vec::with_capacity(self.pollers.len());
        for (i, poller) in self.pollers.iter().enumerate() {
            let shared = self.shared.clone();
            let poller = poller.clone();
            let shutdown = self.shutdown.clone();
            let handle = thread::Builder::new()
                .name(format!("riptide-reactor-{i}"))
                .spawn(move || run_reactor(shared, poller, shutdown))
                .map_err(Error::Io)?;
            handles.push(handle);
        }

        run_acceptor(Acceptor {
            listen_fd,
            shared: self.shared.clone(),
            pollers: self.pollers.clone(),
            shutdown: self.shutdown.clone(),
            tcp_nodelay: self.config.tcp_nodelay,
        });

        // Acceptor is done: make sure the reactors wind down too.
        self.shutdown.store(true, Ordering::Release);
        for poller in &self.pollers {
            poller.wake();
        }
        for handle in handles {
            let _ = handle.join();
        }
        Ok(())
    }
}

/// Install a default fmt subscriber at the configured level if the process
/// has none. A subscriber the application installed earlier wins.
pub(crate) fn init_default_subscriber(level: tracing::Level) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init();
}

/// Soft RLIMIT_NOFILE, clamped to a sane table size; the table still grows
/// on demand past this.
pub(crate) fn rlimit_nofile() -> Result<usize, Error> {
    let mut rlim: libc::rlimit = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) };
    if ret != 0 {
        return Err(Error::ResourceLimit(format!(
            "getrlimit(RLIMIT_NOFILE): {}",
            io::Error::last_os_error()
        )));
    }
    const TABLE_CAP: u64 = 1 << 20;
    let soft = (rlim.rlim_cur as u64).min(TABLE_CAP).max(1024);
    Ok(soft as usize)
}

/// Number of online CPU cores.
pub(crate) fn num_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 {
        1
    } else {
        ret as usize
    }
}

/// Create a blocking TCP listener with SO_REUSEADDR.
pub(crate) fn create_listener(addr: SocketAddr, backlog: i32) -> Result<RawFd, Error> {
    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };

    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    unsafe {
        libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
    }

    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let addr_len = socket_addr_to_sockaddr(addr, &mut storage);

    let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, addr_len) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(Error::Io(err));
    }

    let ret = unsafe { libc::listen(fd, backlog) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(Error::Io(err));
    }

    Ok(fd)
}

/// Fill a `sockaddr_storage` from a Rust `SocketAddr`.
fn socket_addr_to_sockaddr(
    addr: SocketAddr,
    storage: &mut libc::sockaddr_storage,
) -> libc::socklen_t {
    match addr {
        SocketAddr::V4(v4) => {
            let sin = storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                (*sin).sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                };
            }
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sin6 = storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_flowinfo = v6.flowinfo();
                (*sin6).sin6_addr = libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                };
                (*sin6).sin6_scope_id = v6.scope_id();
            }
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rlimit_is_sane() {
        let max_fd = rlimit_nofile().unwrap();
        assert!(max_fd >= 1024);
        assert!(max_fd <= 1 << 20);
    }

    #[test]
    fn listener_binds_and_accepts() {
        let fd = create_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        assert!(fd >= 0);

        // The kernel assigned a port; a plain TCP connect must succeed.
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        };
        assert_eq!(ret, 0);
        let sin = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
        let port = u16::from_be(sin.sin_port);
        assert!(port > 0);

        let stream = std::net::TcpStream::connect(("127.0.0.1", port));
        assert!(stream.is_ok());

        unsafe {
            libc::close(fd);
        }
    }

    #[test]
    fn num_cpus_positive() {
        assert!(num_cpus() >= 1);
    }
}

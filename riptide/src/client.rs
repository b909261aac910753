//! Client-side reactor pool: the same engine as the server, fed with
//! already-connected sockets instead of an accept loop.

use std::net::TcpStream;
use std::os::fd::IntoRawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use crate::callback::Callback;
use crate::config::Config;
use crate::conn::Conn;
use crate::error::Error;
use crate::event_loop::{run_reactor, Shared};
use crate::poller::Poller;
use crate::server::num_cpus;

/// A reactor pool for outbound connections.
///
/// [`register`](Client::register) transfers ownership of a connected
/// socket into the engine; [`serve`](Client::serve) runs the reactors until
/// [`shutdown`](Client::shutdown).
pub struct Client {
    shared: Arc<Shared>,
    pollers: Vec<Arc<Poller>>,
    next: AtomicU32,
    shutdown: Arc<AtomicBool>,
}

impl Client {
    /// Build the client engine; same construction as the server minus the
    /// listener.
    pub fn new<C: Callback>(config: Config, callback: C) -> Result<Client, Error> {
        config.validate()?;
        crate::server::init_default_subscriber(config.log_level);

        let max_fd = crate::server::rlimit_nofile()?;
        let reactors = if config.reactors == 0 {
            num_cpus()
        } else {
            config.reactors
        };

        let mut pollers = Vec::with_capacity(reactors);
        for _ in 0..reactors {
            pollers.push(Arc::new(Poller::new(config.trigger_type)?));
        }

        Ok(Client {
            shared: Shared::new(&config, Arc::new(callback), max_fd),
            pollers,
            next: AtomicU32::new(0),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Hand an already-connected socket to the engine.
    ///
    /// The stream's fd is extracted and owned by the framework from here
    /// on; the connection is assigned a reactor round-robin, inserted into
    /// the fd table, `on_open` fires, and read interest is armed.
    pub fn register(&self, stream: TcpStream) -> Result<(), Error> {
        stream.set_nonblocking(true).map_err(Error::Io)?;
        let fd = stream.into_raw_fd();

        let index = self.next.fetch_add(1, Ordering::Relaxed) as usize % self.pollers.len();
        let poller = self.pollers[index].clone();

        let conn = Conn::new(fd, self.shared.clone(), poller.clone());
        self.shared.table.add(fd, conn.clone());
        self.shared.callback.on_open(&conn);

        if let Err(e) = poller.add_read(fd) {
            conn.shutdown(None);
            return Err(e);
        }
        Ok(())
    }

    /// Run the reactor loops on dedicated threads and block until
    /// [`shutdown`](Client::shutdown).
    pub fn serve(&self) {
        let mut handles = Vec::with_capacity(self.pollers.len());
        for (i, poller) in self.pollers.iter().enumerate() {
            let shared = self.shared.clone();
            let poller = poller.clone();
            let shutdown = self.shutdown.clone();
            let spawned = thread::Builder::new()
                .name(format!("riptide-client-reactor-{i}"))
                .spawn(move || run_reactor(shared, poller, shutdown));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => tracing::error!(error = %e, "client reactor spawn failed"),
            }
        }
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Stop the reactor loops. Registered connections are not closed;
    /// close them explicitly if the process keeps running.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        for poller in &self.pollers {
            poller.wake();
        }
    }

    /// Number of live connections in the fd table.
    pub fn active_connections(&self) -> usize {
        self.shared.table.active_count()
    }
}

//! Dynamic bounded thread pool backing the deferred dispatch modes.
//!
//! Jobs go through an unbounded channel. When a job arrives and no worker
//! is idle, a new worker is spawned up to `max`. Workers idle past the
//! timeout exit until only `min` remain. `init_count` workers start
//! eagerly so the first deliveries do not pay spawn latency.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

type Job = Box<dyn FnOnce() + Send>;

const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

struct PoolInner {
    rx: Receiver<Job>,
    live: AtomicUsize,
    idle: AtomicUsize,
    min: usize,
    max: usize,
}

pub(crate) struct TaskPool {
    tx: Sender<Job>,
    inner: Arc<PoolInner>,
}

impl TaskPool {
    pub fn new(init_count: usize, min: usize, max: usize) -> TaskPool {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let inner = Arc::new(PoolInner {
            rx,
            live: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            min,
            max,
        });

        let pool = TaskPool { tx, inner };
        for _ in 0..init_count.min(max) {
            pool.spawn_worker();
        }
        pool
    }

    /// Enqueue a job, growing the pool if every worker is busy.
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        // A send can only fail after the receiver side is gone, which
        // cannot happen while `inner` is alive.
        let _ = self.tx.send(Box::new(job));

        if self.inner.idle.load(Ordering::Acquire) == 0 {
            self.spawn_worker();
        }
    }

    /// Live worker count, for tests and introspection.
    #[allow(dead_code)]
    pub fn workers(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Reserve a worker slot below `max` and spawn into it. Concurrent
    /// submitters race on the compare-exchange, so the live count can
    /// never overshoot `max`. No-op when the pool is already full.
    fn spawn_worker(&self) {
        let mut live = self.inner.live.load(Ordering::Acquire);
        loop {
            if live >= self.inner.max {
                return;
            }
            match self.inner.live.compare_exchange(
                live,
                live + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => live = current,
            }
        }

        let id = live;
        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name(format!("riptide-task-{id}"))
            .spawn(move || worker_loop(inner));
        if let Err(e) = spawned {
            // Release the reserved slot.
            self.inner.live.fetch_sub(1, Ordering::AcqRel);
            tracing::error!(error = %e, "task pool worker spawn failed");
        }
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        inner.idle.fetch_add(1, Ordering::AcqRel);
        let received = inner.rx.recv_timeout(IDLE_TIMEOUT);
        inner.idle.fetch_sub(1, Ordering::AcqRel);

        match received {
            Ok(job) => job(),
            Err(RecvTimeoutError::Timeout) => {
                // Shrink back toward `min` when idle.
                let live = inner.live.load(Ordering::Acquire);
                if live > inner.min
                    && inner
                        .live
                        .compare_exchange(live, live - 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                inner.live.fetch_sub(1, Ordering::AcqRel);
                return;
            }
        }
    }
}

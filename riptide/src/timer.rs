//! Shared one-shot deadline timers.
//!
//! A single lazily-started thread owns a min-heap of pending deadlines and
//! sleeps until the earliest one. Cancellation is lazy: a cancelled
//! sequence number is skipped when it reaches the top of the heap, which
//! keeps cancel O(1) instead of O(n) heap surgery.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send>;

struct Entry {
    when: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap: earliest deadline first, sequence as the
        // deterministic tie-break.
        match other.when.cmp(&self.when) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Entry>,
    cancelled: HashSet<u64>,
    next_seq: u64,
}

#[derive(Default)]
struct Wheel {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Wheel {
    fn run(self: Arc<Self>) {
        let mut inner = self.inner.lock();
        loop {
            let now = Instant::now();
            let mut due: Vec<Job> = Vec::new();
            while let Some(top) = inner.heap.peek() {
                if top.when > now {
                    break;
                }
                let entry = match inner.heap.pop() {
                    Some(e) => e,
                    None => break,
                };
                if !inner.cancelled.remove(&entry.seq) {
                    due.push(entry.job);
                }
            }
            if inner.heap.is_empty() {
                inner.cancelled.clear();
            }

            if !due.is_empty() {
                // Fire outside the lock: jobs take connection locks and may
                // re-enter schedule/cancel.
                drop(inner);
                for job in due {
                    job();
                }
                inner = self.inner.lock();
                continue;
            }

            match inner.heap.peek().map(|e| e.when) {
                Some(next) => {
                    self.cond.wait_until(&mut inner, next);
                }
                None => {
                    self.cond.wait(&mut inner);
                }
            }
        }
    }
}

fn wheel() -> &'static Arc<Wheel> {
    static WHEEL: OnceLock<Arc<Wheel>> = OnceLock::new();
    WHEEL.get_or_init(|| {
        let wheel = Arc::new(Wheel::default());
        let runner = wheel.clone();
        thread::Builder::new()
            .name("riptide-timer".to_string())
            .spawn(move || runner.run())
            .expect("spawn timer thread");
        wheel
    })
}

/// Handle for a scheduled one-shot timer.
pub(crate) struct TimerHandle {
    seq: u64,
}

impl TimerHandle {
    /// Cancel the timer. If the job is already firing, cancellation has no
    /// effect; fired jobs must tolerate racing with cancel.
    pub fn cancel(self) {
        let w = wheel();
        let mut inner = w.inner.lock();
        inner.cancelled.insert(self.seq);
    }
}

/// Run `job` once at `when`. A `when` in the past fires on the timer
/// thread's next pass, not synchronously.
pub(crate) fn after(when: Instant, job: impl FnOnce() + Send + 'static) -> TimerHandle {
    let w = wheel();
    let mut inner = w.inner.lock();
    let seq = inner.next_seq;
    inner.next_seq += 1;
    inner.heap.push(Entry {
        when,
        seq,
        job: Box::new(job),
    });
    drop(inner);
    w.cond.notify_one();
    TimerHandle { seq }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    #[test]
    fn fires_once_at_deadline() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        after(Instant::now() + Duration::from_millis(20), move || {
            f.fetch_add(1, AtomicOrdering::SeqCst);
        });

        thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn cancel_prevents_fire() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let handle = after(Instant::now() + Duration::from_millis(50), move || {
            f.fetch_add(1, AtomicOrdering::SeqCst);
        });
        handle.cancel();

        thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn fires_in_deadline_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let base = Instant::now() + Duration::from_millis(30);
        for (label, offset) in [(2u8, 20u64), (1, 10), (0, 0)] {
            let order = order.clone();
            after(base + Duration::from_millis(offset), move || {
                order.lock().push(label);
            });
        }

        thread::sleep(Duration::from_millis(300));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}

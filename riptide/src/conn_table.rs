//! Fd-indexed connection table shared by the acceptor and all reactors.
//!
//! Kernel fds are dense small integers, so a direct-indexed array of atomic
//! handle slots gives O(1) concurrent lookup without per-connection
//! reference counting. Lookups are lock-free snapshot loads; inserts that
//! require growth take the table lock and republish the base pointer
//! atomically. Reclamation of a replaced backing array is deferred until
//! the last reader snapshot drops.

use std::os::fd::RawFd;
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;

use crate::conn::Conn;

pub(crate) struct ConnTable {
    slots: ArcSwap<Vec<ArcSwapOption<Conn>>>,
    grow_lock: Mutex<()>,
}

fn make_slots(len: usize) -> Vec<ArcSwapOption<Conn>> {
    let mut v = Vec::with_capacity(len);
    v.resize_with(len, ArcSwapOption::empty);
    v
}

impl ConnTable {
    /// Create a table with `max_fd` null slots (sized from RLIMIT_NOFILE).
    pub fn new(max_fd: usize) -> Self {
        ConnTable {
            slots: ArcSwap::from_pointee(make_slots(max_fd.max(1))),
            grow_lock: Mutex::new(()),
        }
    }

    /// Insert a connection at its fd, growing the table if needed.
    pub fn add(&self, fd: RawFd, conn: Arc<Conn>) {
        if fd < 0 {
            return;
        }
        let fd = fd as usize;

        let _guard = self.grow_lock.lock();
        let current = self.slots.load();
        if fd >= current.len() {
            let new_len = (current.len() + current.len() / 4).max(fd + 1);
            let fresh = make_slots(new_len);
            for (i, slot) in current.iter().enumerate() {
                fresh[i].store(slot.load_full());
            }
            self.slots.store(Arc::new(fresh));
        }
        self.slots.load()[fd].store(Some(conn));
    }

    /// Lock-free lookup. Returns `None` for out-of-range or empty slots.
    pub fn get(&self, fd: RawFd) -> Option<Arc<Conn>> {
        if fd < 0 {
            return None;
        }
        let slots = self.slots.load();
        slots.get(fd as usize)?.load_full()
    }

    /// Lookup without the bounds check, for fds the caller just observed
    /// via `poll` (which only reports registered fds, all below the
    /// published length).
    pub fn get_unchecked(&self, fd: RawFd) -> Option<Arc<Conn>> {
        let slots = self.slots.load();
        debug_assert!((fd as usize) < slots.len(), "fd {fd} beyond table");
        unsafe { slots.get_unchecked(fd as usize) }.load_full()
    }

    /// Clear the slot for a closed fd. Lock-free null store.
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let slots = self.slots.load();
        if let Some(slot) = slots.get(fd as usize) {
            slot.store(None);
        }
    }

    /// Published table length.
    pub fn len(&self) -> usize {
        self.slots.load().len()
    }

    /// Number of live connections. Walks the table; not for hot paths.
    pub fn active_count(&self) -> usize {
        self.slots
            .load()
            .iter()
            .filter(|slot| slot.load().is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::tests::dummy_conn;

    #[test]
    fn add_get_del() {
        let table = ConnTable::new(64);
        let conn = dummy_conn();
        table.add(5, conn.clone());

        let got = table.get(5).expect("missing entry");
        assert!(Arc::ptr_eq(&got, &conn));
        assert_eq!(table.active_count(), 1);

        table.del(5);
        assert!(table.get(5).is_none());
        assert_eq!(table.active_count(), 0);
    }

    #[test]
    fn out_of_range_get_is_none() {
        let table = ConnTable::new(8);
        assert!(table.get(100).is_none());
        assert!(table.get(-1).is_none());
    }

    #[test]
    fn growth_preserves_entries() {
        let table = ConnTable::new(4);
        let a = dummy_conn();
        table.add(2, a.clone());

        // Forces a grow beyond both len and the 1.25 factor.
        let b = dummy_conn();
        table.add(1000, b.clone());

        assert!(table.len() >= 1001);
        assert!(Arc::ptr_eq(&table.get(2).unwrap(), &a));
        assert!(Arc::ptr_eq(&table.get(1000).unwrap(), &b));
    }

    #[test]
    fn concurrent_lookups_during_growth() {
        let table = Arc::new(ConnTable::new(4));
        let conn = dummy_conn();
        table.add(1, conn.clone());

        let reader = {
            let table = table.clone();
            std::thread::spawn(move || {
                for _ in 0..10_000 {
                    if let Some(c) = table.get(1) {
                        assert!(Arc::ptr_eq(&c, &c));
                    }
                }
            })
        };

        for fd in 4..200 {
            table.add(fd, dummy_conn());
        }
        reader.join().unwrap();
        assert!(table.get(1).is_some());
    }
}

//! Size-classed byte-buffer pool backing read copies and write chains.
//!
//! Small classes are page-granular: class `i` holds buffers of capacity
//! `(i + 1) * PAGE`. Requests above the largest small class escalate to the
//! big classes; requests above the largest big class allocate unpooled and
//! are dropped on release.

use parking_lot::Mutex;

/// Size-class granule.
pub(crate) const PAGE: usize = 1024;
/// Number of small classes (1 KiB .. 256 KiB).
const MAX_INDEX: usize = 256;
/// Smallest capacity served by the big classes.
const MIN_BIG_SIZE: usize = PAGE * MAX_INDEX;
/// Big class capacities.
const BIG_SIZES: [usize; 2] = [512 * 1024, 1024 * 1024];

/// Idle buffers kept per small class.
const SMALL_CLASS_CAP: usize = 64;
/// Idle buffers kept per big class.
const BIG_CLASS_CAP: usize = 8;

static SMALL_POOLS: [Mutex<Vec<Vec<u8>>>; MAX_INDEX] =
    [const { Mutex::new(Vec::new()) }; MAX_INDEX];
static BIG_POOLS: [Mutex<Vec<Vec<u8>>>; BIG_SIZES.len()] =
    [const { Mutex::new(Vec::new()) }; BIG_SIZES.len()];

#[inline]
fn class_of(n: usize) -> usize {
    n / PAGE
}

/// Get a buffer with `capacity >= n` and length 0.
///
/// The returned capacity may exceed `n`; callers must track their own
/// length. `n` must be non-zero.
pub(crate) fn acquire(n: usize) -> Vec<u8> {
    debug_assert!(n > 0, "acquire of zero bytes");
    let index = class_of(n - 1);
    if index >= MAX_INDEX {
        return acquire_big(n);
    }

    let mut pool = SMALL_POOLS[index].lock();
    match pool.pop() {
        Some(buf) => buf,
        None => Vec::with_capacity((index + 1) * PAGE),
    }
}

/// Get a buffer for `n` bytes at the `preferred` size class when `n` fits.
///
/// Used for write-chain segments: allocating at the reactor's read buffer
/// size keeps the chain composed of uniformly sized segments.
pub(crate) fn acquire_with_size(n: usize, preferred: usize) -> Vec<u8> {
    if n <= preferred {
        if preferred < MIN_BIG_SIZE {
            return acquire(preferred);
        }
        return Vec::with_capacity(preferred);
    }
    acquire(n)
}

/// Return a buffer to the pool.
///
/// The class is recomputed from capacity. A capacity that is not a page
/// multiple means the buffer grew through a reallocating append; the class
/// steps down one so the pooled buffer still satisfies its class.
pub(crate) fn release(buf: Vec<u8>) {
    let cap = buf.capacity();
    if cap < PAGE {
        return;
    }

    let mut index = class_of(cap - 1);
    if index >= MAX_INDEX {
        release_big(buf);
        return;
    }
    if cap % PAGE != 0 {
        if index == 0 {
            return;
        }
        index -= 1;
    }

    let mut buf = buf;
    buf.clear();
    let mut pool = SMALL_POOLS[index].lock();
    if pool.len() < SMALL_CLASS_CAP {
        pool.push(buf);
    }
}

fn acquire_big(n: usize) -> Vec<u8> {
    for (i, &size) in BIG_SIZES.iter().enumerate() {
        if n <= size {
            let mut pool = BIG_POOLS[i].lock();
            return match pool.pop() {
                Some(buf) => buf,
                None => Vec::with_capacity(size),
            };
        }
    }
    // Above the largest big class: unpooled.
    tracing::debug!(bytes = n, "unpooled buffer allocation");
    Vec::with_capacity(n)
}

fn release_big(buf: Vec<u8>) {
    let cap = buf.capacity();
    if cap < MIN_BIG_SIZE {
        return;
    }
    // Largest big class that the capacity still satisfies.
    for (i, &size) in BIG_SIZES.iter().enumerate().rev() {
        if cap >= size {
            let mut buf = buf;
            buf.clear();
            let mut pool = BIG_POOLS[i].lock();
            if pool.len() < BIG_CLASS_CAP {
                pool.push(buf);
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_at_least_requested() {
        for n in [1, 1023, 1024, 1025, 4096, 70_000, 256 * 1024] {
            let buf = acquire(n);
            assert!(buf.capacity() >= n, "n={n} cap={}", buf.capacity());
            assert_eq!(buf.len(), 0);
            release(buf);
        }
    }

    #[test]
    fn class_boundaries() {
        // 1..=1024 all land in the first class.
        assert_eq!(acquire(1).capacity(), PAGE);
        assert_eq!(acquire(1024).capacity(), PAGE);
        // 1025 rolls over to the second class.
        assert_eq!(acquire(1025).capacity(), 2 * PAGE);
    }

    #[test]
    fn release_then_acquire_reuses() {
        let buf = acquire(8 * PAGE);
        let cap = buf.capacity();
        release(buf);
        let again = acquire(8 * PAGE);
        assert!(again.capacity() >= cap);
    }

    #[test]
    fn grown_buffer_steps_class_down() {
        // Simulate append-driven growth to a non-page-multiple capacity.
        let mut buf = Vec::with_capacity(3 * PAGE + 100);
        buf.extend_from_slice(&[0u8; 16]);
        release(buf);
        // A request for the stepped-down class must still be satisfied.
        let got = acquire(3 * PAGE);
        assert!(got.capacity() >= 3 * PAGE);
    }

    #[test]
    fn big_requests_escalate() {
        let buf = acquire(300 * 1024);
        assert!(buf.capacity() >= 300 * 1024);
        release(buf);

        let huge = acquire(10 * 1024 * 1024);
        assert!(huge.capacity() >= 10 * 1024 * 1024);
        release(huge); // dropped, not pooled
    }

    #[test]
    fn preferred_size_class() {
        let buf = acquire_with_size(100, 4096);
        assert!(buf.capacity() >= 4096);
        release(buf);

        // Larger than preferred falls back to exact-class sizing.
        let buf = acquire_with_size(10_000, 4096);
        assert!(buf.capacity() >= 10_000);
        release(buf);
    }

    #[test]
    fn tiny_capacity_not_pooled() {
        // Below one page the buffer is dropped silently.
        release(Vec::with_capacity(100));
    }
}

//! A bounded-in-name, thread-safe FIFO with a blocking `wait()`.
//!
//! Every operation locks the same mutex, so operations are atomic with
//! respect to each other; `wait()` parks the caller on a condition
//! variable until the queue holds at least one element, re-checking after
//! every wake-up to tolerate spurious wakeups.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

struct Inner<T> {
    items: VecDeque<T>,
}

/// A FIFO/deque hybrid shared between an I/O reactor and a dispatcher.
///
/// Values are moved through the queue, never copied. `wait()` is the
/// single synchronization point between producer and consumer threads;
/// see the module docs for its contract.
pub struct Fifo<T> {
    inner: Mutex<Inner<T>>,
    cond: Condvar,
}

impl<T> Default for Fifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Fifo<T> {
    pub fn new() -> Self {
        Fifo { inner: Mutex::new(Inner { items: VecDeque::new() }), cond: Condvar::new() }
    }

    pub fn push_back(&self, value: T) {
        let mut inner = self.inner.lock();
        inner.items.push_back(value);
        self.cond.notify_one();
    }

    pub fn push_front(&self, value: T) {
        let mut inner = self.inner.lock();
        inner.items.push_front(value);
        self.cond.notify_one();
    }

    pub fn pop_front(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    pub fn pop_back(&self) -> Option<T> {
        self.inner.lock().items.pop_back()
    }

    pub fn empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn clear(&self) {
        self.inner.lock().items.clear();
    }

    /// Blocks the calling thread until the queue is non-empty, then pops
    /// and returns the front element.
    ///
    /// `None` is returned only if woken spuriously and racing with
    /// another consumer that drained the queue first; callers loop on
    /// `wait()` rather than assuming a single wake yields an element.
    pub fn wait(&self) -> T {
        let mut inner = self.inner.lock();
        loop {
            if let Some(value) = inner.items.pop_front() {
                return value;
            }
            self.cond.wait(&mut inner);
        }
    }

    /// As `wait()`, but gives up and returns `None` after `timeout` of
    /// no new element arriving. Used by dispatcher loops that need to
    /// periodically check a shutdown flag rather than block forever.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let mut inner = self.inner.lock();
        if let Some(value) = inner.items.pop_front() {
            return Some(value);
        }
        let result = self.cond.wait_for(&mut inner, timeout);
        if result.timed_out() {
            return None;
        }
        inner.items.pop_front()
    }
}

impl<T: Clone> Fifo<T> {
    pub fn front(&self) -> Option<T> {
        self.inner.lock().items.front().cloned()
    }

    pub fn back(&self) -> Option<T> {
        self.inner.lock().items.back().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_is_first_in_first_out() {
        let q: Fifo<i32> = Fifo::new();
        q.push_back(1);
        q.push_back(2);
        q.push_back(3);
        assert_eq!(q.pop_front(), Some(1));
        assert_eq!(q.pop_front(), Some(2));
        assert_eq!(q.pop_front(), Some(3));
        assert_eq!(q.pop_front(), None);
    }

    #[test]
    fn push_front_is_lifo_at_the_head() {
        let q: Fifo<i32> = Fifo::new();
        q.push_back(1);
        q.push_front(0);
        assert_eq!(q.pop_front(), Some(0));
        assert_eq!(q.pop_front(), Some(1));
    }

    #[test]
    fn clear_empties_the_queue() {
        let q: Fifo<i32> = Fifo::new();
        q.push_back(1);
        q.push_back(2);
        q.clear();
        assert!(q.empty());
        assert_eq!(q.size(), 0);
    }

    #[test]
    fn wait_blocks_until_an_item_is_pushed() {
        let q: Arc<Fifo<i32>> = Arc::new(Fifo::new());
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.wait());
        thread::sleep(Duration::from_millis(50));
        q.push_back(42);
        assert_eq!(handle.join().unwrap(), 42);
    }

    #[test]
    fn wait_timeout_returns_none_when_nothing_arrives() {
        let q: Fifo<i32> = Fifo::new();
        assert_eq!(q.wait_timeout(Duration::from_millis(20)), None);
    }
}

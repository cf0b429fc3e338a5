//! Request queue of a device model shared across threads.
//!
//! A bridge thread delivers requests while the owning core drains them on a
//! kick exit. The enqueue and the interrupt raise happen in one critical
//! section, so the core never sees the interrupt without the request.
use alloc::{collections::VecDeque, vec::Vec};
use spin::Mutex;

/// The interrupt line of a device.
pub trait IrqLine
where
    Self: Send + Sync,
{
    /// Assert the line.
    fn raise(&self);
}

/// A locked queue that raises its device's interrupt on every delivery.
pub struct IrqQueue<T, L: IrqLine> {
    inner: Mutex<VecDeque<T>>,
    line: L,
}

impl<T, L: IrqLine> IrqQueue<T, L> {
    /// Create an empty queue wired to `line`.
    pub fn new(line: L) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            line,
        }
    }

    /// Enqueue `item` and raise the interrupt.
    pub fn deliver(&self, item: T) {
        let mut guard = self.inner.lock();
        guard.push_back(item);
        self.line.raise();
    }

    /// Take every queued item, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.inner.lock().drain(..).collect()
    }

    /// Take the oldest item.
    pub fn pop(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The interrupt line.
    pub fn line(&self) -> &L {
        &self.line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl IrqLine for Counter {
        fn raise(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn fifo() {
        let q = IrqQueue::new(Counter::default());
        q.deliver(1);
        q.deliver(2);
        assert_eq!(q.pop(), Some(1));
        q.deliver(3);
        assert_eq!(q.drain(), vec![2, 3]);
        assert!(q.is_empty());
        assert_eq!(q.line().0.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn concurrent_delivery() {
        let q = IrqQueue::new(Counter::default());
        let mut drained = Vec::new();
        std::thread::scope(|s| {
            for t in 0..4 {
                let q = &q;
                s.spawn(move || {
                    for i in 0..100 {
                        q.deliver(t * 100 + i);
                    }
                });
            }
            for _ in 0..50 {
                drained.extend(q.drain());
            }
        });
        drained.extend(q.drain());
        drained.sort_unstable();
        assert_eq!(drained, (0..400).collect::<Vec<_>>());
        assert_eq!(q.line().0.load(Ordering::SeqCst), 400);
    }
}

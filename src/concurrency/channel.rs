use crossbeam_queue::SegQueue;
use std::fmt;
use std::sync::Arc;

/// Lock-free multi-producer multi-consumer queue built on top of `SegQueue`.
///
/// Push order is preserved, which makes the queue usable as the linearization
/// point for instruction submission.
pub struct MpmcQueue<T> {
    inner: Arc<SegQueue<T>>,
}

impl<T> MpmcQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SegQueue::new()),
        }
    }

    pub fn push(&self, value: T) {
        self.inner.push(value);
    }

    pub fn pop(&self) -> Option<T> {
        self.inner.pop()
    }

    /// Pops at most `limit` values in push order.
    pub fn pop_batch(&self, limit: usize) -> Vec<T> {
        let mut batch = Vec::new();
        while batch.len() < limit {
            match self.inner.pop() {
                Some(value) => batch.push(value),
                None => break,
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<T> Clone for MpmcQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for MpmcQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for MpmcQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpmcQueue")
            .field("len", &self.inner.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn queue_supports_multiple_threads() {
        let queue = MpmcQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    queue.push(1usize);
                }
                while let Some(value) = queue.pop() {
                    counter.fetch_add(value, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().expect("thread");
        }
        while let Some(value) = queue.pop() {
            counter.fetch_add(value, Ordering::SeqCst);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 400);
    }

    #[test]
    fn pop_batch_respects_limit_and_order() {
        let queue = MpmcQueue::new();
        for value in 0..5 {
            queue.push(value);
        }
        assert_eq!(queue.pop_batch(3), vec![0, 1, 2]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_batch(10), vec![3, 4]);
        assert!(queue.is_empty());
    }
}

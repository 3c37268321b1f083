use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

/// Bounded multi-producer/multi-consumer FIFO shared by the worker pool.
pub struct Queue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T: Send> Queue<T> {
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx }
    }

    /// Blocks while the queue is full.
    pub fn push(&self, value: T) {
        // cannot disconnect: the receiver lives in self
        self.tx.send(value).unwrap();
    }

    pub fn try_push(&self, value: T) -> Result<(), T> {
        self.tx.try_send(value).map_err(|err| err.into_inner())
    }

    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order() {
        let queue = Queue::bounded(8);
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn capacity_is_bounded() {
        let queue = Queue::bounded(2);
        assert!(queue.try_push(1).is_ok());
        assert!(queue.try_push(2).is_ok());
        assert_eq!(queue.try_push(3), Err(3));
        assert_eq!(queue.try_pop(), Some(1));
        assert!(queue.try_push(3).is_ok());
    }

    #[test]
    fn multiple_consumers_drain_everything() {
        let queue = Arc::new(Queue::bounded(64));
        for i in 0..64 {
            queue.push(i);
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            handles.push(thread::spawn(move || {
                let mut count = 0;
                while queue.try_pop().is_some() {
                    count += 1;
                }
                count
            }));
        }

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 64);
        assert!(queue.is_empty());
    }
}

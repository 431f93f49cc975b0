//! A first-in, first-out queue shared between threads.
//!
//! The queue itself never blocks. Consumers that want to wait for an item
//! pair it with a [`Semaphore`][crate::semaphore::Semaphore], see
//! [`Dispatch`][crate::request::Dispatch].

use std::collections::VecDeque;
use parking_lot::Mutex;
use crate::error::AllocationError;


//------------ Queue ---------------------------------------------------------

#[derive(Debug)]
pub struct Queue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Queue { items: Mutex::new(VecDeque::new()) }
    }

    /// Appends an item to the end of the queue.
    ///
    /// Fails if the queue needs to grow and can’t. The item is dropped in
    /// this case.
    pub fn enqueue(&self, item: T) -> Result<(), AllocationError> {
        let mut items = self.items.lock();
        items.try_reserve(1)?;
        items.push_back(item);
        Ok(())
    }

    /// Removes and returns the oldest item.
    pub fn dequeue(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order() {
        let queue = Queue::new();
        for i in 0..100 {
            queue.enqueue(i).unwrap();
        }
        assert_eq!(queue.len(), 100);
        let out: Vec<_> = std::iter::from_fn(|| queue.dequeue()).collect();
        assert_eq!(out, (0..100).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }

    #[test]
    fn producers_and_consumers() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 2500;
        let queue = Arc::new(Queue::new());
        let producers: Vec<_> = (0..PRODUCERS).map(|id| {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    queue.enqueue((id, i)).unwrap();
                }
            })
        }).collect();
        let consumers: Vec<_> = (0..3).map(|_| {
            let queue = queue.clone();
            thread::spawn(move || {
                let mut got = Vec::new();
                let mut idle = 0;
                while idle < 1000 {
                    match queue.dequeue() {
                        Some(item) => {
                            got.push(item);
                            idle = 0;
                        }
                        None => {
                            idle += 1;
                            thread::yield_now();
                        }
                    }
                }
                got
            })
        }).collect();
        for producer in producers {
            producer.join().unwrap();
        }
        let mut all = Vec::new();
        for consumer in consumers {
            let got = consumer.join().unwrap();
            // Each consumer sees every producer’s items in order.
            for id in 0..PRODUCERS {
                let mine: Vec<_> = got.iter().filter(|item| item.0 == id)
                    .map(|item| item.1).collect();
                assert!(mine.windows(2).all(|w| w[0] < w[1]));
            }
            all.extend(got);
        }
        // Whatever the consumers gave up on is still in the queue.
        all.extend(std::iter::from_fn(|| queue.dequeue()));
        assert_eq!(all.len(), PRODUCERS * PER_PRODUCER);
        assert_eq!(
            all.into_iter().collect::<HashSet<_>>().len(),
            PRODUCERS * PER_PRODUCER
        );
    }
}

//! A counting semaphore.
//!
//! The semaphore counts how many items are waiting in the request queue.
//! Producers post once for each item they enqueue, consumers wait for a
//! permit before dequeuing. Permits accumulate when nobody is waiting, so
//! no wake-up is ever lost, and waiting consumers sleep rather than poll.
//!
//! For teardown, the semaphore can be closed. This wakes up all waiting
//! threads and makes every following wait fail.

use std::{error, fmt};
use parking_lot::{Condvar, Mutex};


//------------ Semaphore -----------------------------------------------------

#[derive(Debug, Default)]
pub struct Semaphore {
    state: Mutex<Permits>,
    available: Condvar,
}

#[derive(Debug, Default)]
struct Permits {
    count: usize,
    closed: bool,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Semaphore {
            state: Mutex::new(Permits { count: permits, closed: false }),
            available: Condvar::new(),
        }
    }

    /// Adds a permit and wakes up one waiting thread.
    pub fn post(&self) -> Result<(), Closed> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Closed)
        }
        state.count += 1;
        self.available.notify_one();
        Ok(())
    }

    /// Waits until a permit is available and takes it.
    ///
    /// Returns an error if the semaphore is or gets closed.
    pub fn wait(&self) -> Result<(), Closed> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(Closed)
            }
            if state.count > 0 {
                state.count -= 1;
                return Ok(())
            }
            self.available.wait(&mut state);
        }
    }

    /// Takes a permit if one is available right now.
    pub fn try_wait(&self) -> Result<bool, Closed> {
        let mut state = self.state.lock();
        if state.closed {
            Err(Closed)
        }
        else if state.count > 0 {
            state.count -= 1;
            Ok(true)
        }
        else {
            Ok(false)
        }
    }

    /// Closes the semaphore and wakes up all waiting threads.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Returns the number of currently available permits.
    pub fn permits(&self) -> usize {
        self.state.lock().count
    }
}


//------------ Closed --------------------------------------------------------

/// The semaphore has been closed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Closed;

impl fmt::Display for Closed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("semaphore closed")
    }
}

impl error::Error for Closed { }


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn permits_accumulate() {
        let sem = Semaphore::new(0);
        sem.post().unwrap();
        sem.post().unwrap();
        assert_eq!(sem.permits(), 2);
        assert_eq!(sem.wait(), Ok(()));
        assert_eq!(sem.try_wait(), Ok(true));
        assert_eq!(sem.try_wait(), Ok(false));
    }

    #[test]
    fn wakes_waiters() {
        let sem = Arc::new(Semaphore::new(0));
        let woken = Arc::new(AtomicUsize::new(0));
        let waiters: Vec<_> = (0..4).map(|_| {
            let sem = sem.clone();
            let woken = woken.clone();
            thread::spawn(move || {
                sem.wait().unwrap();
                woken.fetch_add(1, Ordering::SeqCst);
            })
        }).collect();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(woken.load(Ordering::SeqCst), 0);
        for _ in 0..4 {
            sem.post().unwrap();
        }
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), 4);
        assert_eq!(sem.permits(), 0);
    }

    #[test]
    fn close_releases_waiters() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = sem.clone();
            thread::spawn(move || sem.wait())
        };
        thread::sleep(Duration::from_millis(20));
        sem.close();
        assert_eq!(waiter.join().unwrap(), Err(Closed));
        assert_eq!(sem.post(), Err(Closed));
        assert!(sem.is_closed());
    }
}

//! A database living entirely in memory.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use log::debug;
use parking_lot::Mutex;
use crate::payload::{Dataset, Delta, Payload};
use crate::serial::Serial;
use crate::state::State;
use super::{Connect, Database, DbError, DeltaLog};


//------------ MemoryDb ------------------------------------------------------

/// An in-memory database.
///
/// All connections opened from clones of a value share the same data. In
/// addition to holding data, the database can simulate an outage, add
/// latency to every operation, and refuse connections, which makes it
/// useful for exercising the server’s error handling.
#[derive(Clone, Debug)]
pub struct MemoryDb {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    vrps: Mutex<Dataset>,
    deltas: Mutex<DeltaLog>,
    latency: Mutex<Duration>,
    outage: AtomicBool,

    /// Refuse all connections after this many have been opened.
    connect_limit: Mutex<Option<usize>>,

    connects: AtomicUsize,
    open: AtomicUsize,
    disconnects: AtomicUsize,
    delta_loads: AtomicUsize,
}

impl MemoryDb {
    /// Creates an empty database keeping `history` deltas.
    pub fn new(history: usize) -> Self {
        MemoryDb {
            inner: Arc::new(Inner {
                vrps: Mutex::new(Dataset::new()),
                deltas: Mutex::new(DeltaLog::new(history)),
                latency: Mutex::new(Duration::from_secs(0)),
                outage: AtomicBool::new(false),
                connect_limit: Mutex::new(None),
                connects: AtomicUsize::new(0),
                open: AtomicUsize::new(0),
                disconnects: AtomicUsize::new(0),
                delta_loads: AtomicUsize::new(0),
            })
        }
    }

    /// Replaces the current set of VRPs.
    pub fn set_vrps<I: IntoIterator<Item = Payload>>(&self, vrps: I) {
        *self.inner.vrps.lock() = vrps.into_iter().collect();
    }

    /// Starts or ends a simulated outage.
    ///
    /// During an outage, all operations fail.
    pub fn set_outage(&self, outage: bool) {
        self.inner.outage.store(outage, Ordering::SeqCst)
    }

    /// Sets the time every operation takes.
    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.lock() = latency
    }

    /// Refuses all connections after `count` more have been opened.
    pub fn limit_connects(&self, count: usize) {
        *self.inner.connect_limit.lock() = Some(
            self.inner.connects.load(Ordering::SeqCst) + count
        );
    }

    /// Returns the number of currently open connections.
    pub fn open_connections(&self) -> usize {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Returns how many connections were closed through `disconnect`.
    pub fn disconnects(&self) -> usize {
        self.inner.disconnects.load(Ordering::SeqCst)
    }

    /// Returns how many times a delta has been loaded.
    pub fn delta_loads(&self) -> usize {
        self.inner.delta_loads.load(Ordering::SeqCst)
    }
}

impl Default for MemoryDb {
    fn default() -> Self {
        Self::new(10)
    }
}

impl Connect for MemoryDb {
    type Conn = MemoryConnection;

    fn connect(&self) -> Result<Self::Conn, DbError> {
        if self.inner.outage.load(Ordering::SeqCst) {
            return Err(DbError::new("database unavailable"))
        }
        if let Some(limit) = *self.inner.connect_limit.lock() {
            if self.inner.connects.load(Ordering::SeqCst) >= limit {
                return Err(DbError::new("too many connections"))
            }
        }
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        self.inner.open.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryConnection { inner: self.inner.clone() })
    }
}


//------------ MemoryConnection ----------------------------------------------

#[derive(Debug)]
pub struct MemoryConnection {
    inner: Arc<Inner>,
}

impl MemoryConnection {
    /// Waits for the latency and fails during an outage.
    fn operate(&self) -> Result<(), DbError> {
        let latency = *self.inner.latency.lock();
        if latency > Duration::from_secs(0) {
            thread::sleep(latency);
        }
        if self.inner.outage.load(Ordering::SeqCst) {
            Err(DbError::new("database unavailable"))
        }
        else {
            Ok(())
        }
    }
}

impl Database for MemoryConnection {
    fn load_vrps(&mut self) -> Result<Dataset, DbError> {
        self.operate()?;
        Ok(self.inner.vrps.lock().clone())
    }

    fn store_delta(
        &mut self, state: State, delta: &Delta
    ) -> Result<(), DbError> {
        self.operate()?;
        self.inner.deltas.lock().push(state, delta);
        Ok(())
    }

    fn load_delta(
        &mut self, session: u16, from: Serial, to: Serial
    ) -> Result<Option<Delta>, DbError> {
        self.inner.delta_loads.fetch_add(1, Ordering::SeqCst);
        self.operate()?;
        Ok(self.inner.deltas.lock().collect(session, from, to))
    }

    fn disconnect(self) {
        self.inner.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        debug!("Closing in-memory database connection.");
        self.inner.open.fetch_sub(1, Ordering::SeqCst);
    }
}

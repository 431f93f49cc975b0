//! The pool of database workers.
//!
//! Each worker is a thread with its own database connection. It waits on
//! the request semaphore, takes the oldest request off the queue, registers
//! it as in flight, runs it, and delivers the result to everyone waiting
//! for it:
//!
//! ```text
//! Idle -> Dequeuing -> Processing -> Delivering -> Idle
//! ```
//!
//! Shutting down the pool closes the dispatch, which moves every worker to
//! the `Cancelled` state at its next opportunity, and then joins all
//! worker threads. A worker busy with the database finishes that request
//! first.
//!
//! The pool has a fixed size. Adjusting the number of workers to the load
//! would be done through `spawn_worker` but isn’t implemented.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use log::{debug, error, info, warn};
use crate::bag::Bag;
use crate::db::{Connect, Database, DbError};
use crate::error::Error;
use crate::request::{Claim, Dispatch, InFlightRegistry};


//------------ WorkerState ---------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerState {
    /// Waiting for a request.
    Idle,

    /// Taking a request off the queue and registering it.
    Dequeuing,

    /// Running a request against the database.
    Processing,

    /// Delivering the result.
    Delivering,

    /// The worker has stopped.
    Cancelled,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Idle,
            1 => WorkerState::Dequeuing,
            2 => WorkerState::Processing,
            3 => WorkerState::Delivering,
            _ => WorkerState::Cancelled,
        }
    }

    fn into_u8(self) -> u8 {
        match self {
            WorkerState::Idle => 0,
            WorkerState::Dequeuing => 1,
            WorkerState::Processing => 2,
            WorkerState::Delivering => 3,
            WorkerState::Cancelled => 4,
        }
    }
}


//------------ WorkerPool ----------------------------------------------------

/// The body of a worker thread as handed to a spawn function.
pub type WorkerBody = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
pub struct WorkerPool {
    workers: Bag<Worker>,
    dispatch: Dispatch,
}

#[derive(Debug)]
struct Worker {
    id: usize,
    handle: JoinHandle<()>,
    state: Arc<AtomicU8>,
}

impl WorkerPool {
    /// Starts a pool of `count` workers.
    ///
    /// Each worker opens its own connection through `connector`. If any
    /// worker fails to start, all workers started so far are stopped and
    /// the error is returned.
    pub fn start<C: Connect>(
        count: usize,
        connector: &C,
        dispatch: Dispatch,
        in_flight: Arc<InFlightRegistry>,
    ) -> Result<Self, Error> {
        Self::start_with(
            count, connector, dispatch, in_flight,
            |name, body| thread::Builder::new().name(name).spawn(body)
        )
    }

    /// Starts a pool using the given function to spawn threads.
    pub fn start_with<C, S>(
        count: usize,
        connector: &C,
        dispatch: Dispatch,
        in_flight: Arc<InFlightRegistry>,
        mut spawn: S,
    ) -> Result<Self, Error>
    where
        C: Connect,
        S: FnMut(String, WorkerBody) -> io::Result<JoinHandle<()>>
    {
        let mut workers = Bag::try_new()?;
        workers.reserve(count)?;
        let mut pool = WorkerPool { workers, dispatch };
        for id in 0..count {
            if let Err(err) = pool.spawn_worker(
                id, connector, &in_flight, &mut spawn
            ) {
                error!("Failed to start database worker {}: {}", id, err);
                pool.shutdown();
                return Err(err)
            }
        }
        info!("Started {} database workers.", count);
        Ok(pool)
    }

    fn spawn_worker<C, S>(
        &mut self,
        id: usize,
        connector: &C,
        in_flight: &Arc<InFlightRegistry>,
        spawn: &mut S,
    ) -> Result<(), Error>
    where
        C: Connect,
        S: FnMut(String, WorkerBody) -> io::Result<JoinHandle<()>>
    {
        let conn = connector.connect()?;
        let state = Arc::new(AtomicU8::new(WorkerState::Idle.into_u8()));
        let worker = WorkerLoop {
            id,
            conn: Some(conn),
            dispatch: self.dispatch.clone(),
            in_flight: in_flight.clone(),
            state: state.clone(),
        };
        let handle = spawn(
            format!("db-worker-{}", id), Box::new(move || worker.run())
        ).map_err(Error::ThreadCreation)?;
        self.workers.add(Worker { id, handle, state })?;
        Ok(())
    }

    /// Returns the number of running workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Returns the current state of each worker.
    pub fn states(&self) -> Vec<WorkerState> {
        self.workers.iter().map(|(_, worker)| {
            WorkerState::from_u8(worker.state.load(Ordering::SeqCst))
        }).collect()
    }

    /// Stops all workers and waits for them to finish.
    ///
    /// Requests still waiting in the queue are dropped and their
    /// requesters receive an error.
    pub fn shutdown(&mut self) {
        self.dispatch.close();
        if !self.workers.is_empty() {
            self.workers.start_iteration();
            let mut cursor = self.workers.first();
            while let Some(slot) = cursor {
                cursor = self.workers.next_slot(slot);
                let worker = self.workers.remove(slot);
                if worker.handle.join().is_err() {
                    error!("Database worker {} panicked.", worker.id);
                }
            }
            self.workers.stop_iteration();
            info!("Database workers stopped.");
        }
        let dropped = self.dispatch.drain();
        if dropped > 0 {
            warn!("Dropped {} pending database requests.", dropped);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown()
    }
}


//------------ WorkerLoop ----------------------------------------------------

/// What runs inside a worker thread.
///
/// The connection is disconnected when the loop is dropped, whether or not
/// it ever ran.
struct WorkerLoop<D: Database> {
    id: usize,
    conn: Option<D>,
    dispatch: Dispatch,
    in_flight: Arc<InFlightRegistry>,
    state: Arc<AtomicU8>,
}

impl<D: Database> WorkerLoop<D> {
    fn run(mut self) {
        debug!("Database worker {} started.", self.id);
        loop {
            self.set_state(WorkerState::Idle);
            let request = match self.dispatch.next() {
                Ok(request) => request,
                Err(_) => break,
            };
            self.set_state(WorkerState::Dequeuing);
            let running = match self.in_flight.claim(request) {
                Claim::Run(running) => running,
                Claim::Joined => continue,
                Claim::Failed(request, err) => {
                    warn!(
                        "Database worker {}: cannot register request: {}",
                        self.id, err
                    );
                    request.deliver(Err(DbError::new(err.to_string())));
                    continue
                }
            };
            self.set_state(WorkerState::Processing);
            let result = match self.conn.as_mut() {
                Some(conn) => running.query().execute(conn),
                None => Err(DbError::new("no database connection")),
            };
            if let Err(ref err) = result {
                warn!("Database worker {}: {}", self.id, err);
            }
            self.set_state(WorkerState::Delivering);
            self.in_flight.complete(running, result);
        }
        self.set_state(WorkerState::Cancelled);
        debug!("Database worker {} stopped.", self.id);
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state.into_u8(), Ordering::SeqCst)
    }
}

impl<D: Database> Drop for WorkerLoop<D> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.disconnect();
        }
    }
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};
    use crate::db::MemoryDb;
    use crate::payload::{Action, Delta, Payload};
    use crate::queue::Queue;
    use crate::request::{DeltaQuery, Request};
    use crate::semaphore::Semaphore;
    use crate::serial::Serial;
    use crate::state::State;

    fn dispatch() -> Dispatch {
        Dispatch::new(Arc::new(Queue::new()), Arc::new(Semaphore::new(0)))
    }

    /// Creates a database with deltas for serials 1 to 10 in session 1.
    fn database() -> MemoryDb {
        let db = MemoryDb::new(20);
        let mut conn = db.connect().unwrap();
        for serial in 1..=10 {
            let mut delta = Delta::new();
            delta.push(Action::Announce, Payload::new(
                Ipv4Addr::new(10, serial as u8, 0, 0).into(), 16, 16, serial
            ));
            conn.store_delta(State::from_parts(1, Serial(serial)), &delta)
                .unwrap();
        }
        db
    }

    #[test]
    fn ten_requests_on_four_workers() {
        let db = database();
        let dispatch = dispatch();
        let in_flight = Arc::new(InFlightRegistry::new());
        let pool = WorkerPool::start(
            4, &db, dispatch.clone(), in_flight.clone()
        ).unwrap();
        assert_eq!(pool.len(), 4);

        let responses: Vec<_> = (0..10).map(|from| {
            let (request, response) = Request::new(
                DeltaQuery::new(1, Serial(from), Serial(10))
            );
            dispatch.submit(request).unwrap();
            (from, response)
        }).collect();
        for (from, response) in responses {
            let delta = response.wait().unwrap().unwrap();
            assert_eq!(delta.len(), (10 - from) as usize);
        }
        assert_eq!(db.delta_loads(), 10);
        assert!(in_flight.is_empty());
    }

    #[test]
    fn same_key_is_in_flight_once() {
        let db = database();
        db.set_latency(Duration::from_millis(300));
        let dispatch = dispatch();
        let in_flight = Arc::new(InFlightRegistry::new());
        let _pool = WorkerPool::start(
            2, &db, dispatch.clone(), in_flight.clone()
        ).unwrap();

        let query = DeltaQuery::new(1, Serial(5), Serial(10));
        let (first, first_response) = Request::new(query);
        let (second, second_response) = Request::new(query);
        dispatch.submit(first).unwrap();
        dispatch.submit(second).unwrap();

        let start = Instant::now();
        let mut seen = false;
        while start.elapsed() < Duration::from_millis(200) {
            let count = in_flight.count(query);
            assert!(count <= 1);
            seen |= count == 1;
            thread::sleep(Duration::from_millis(5));
        }
        assert!(seen);

        let first = first_response.wait().unwrap();
        let second = second_response.wait().unwrap();
        assert_eq!(first, second);
        assert_eq!(db.delta_loads(), 1);
    }

    #[test]
    fn database_errors_are_delivered() {
        let db = database();
        let dispatch = dispatch();
        let pool = WorkerPool::start(
            1, &db, dispatch.clone(), Arc::new(InFlightRegistry::new())
        ).unwrap();
        db.set_outage(true);
        let (request, response) = Request::new(
            DeltaQuery::new(1, Serial(1), Serial(2))
        );
        dispatch.submit(request).unwrap();
        assert!(response.wait().is_err());

        db.set_outage(false);
        let (request, response) = Request::new(
            DeltaQuery::new(1, Serial(1), Serial(2))
        );
        dispatch.submit(request).unwrap();
        assert!(response.wait().unwrap().is_some());
        drop(pool);
    }

    #[test]
    fn spawn_failure_joins_started_workers() {
        let db = database();
        let exited = Arc::new(AtomicUsize::new(0));
        let mut attempts = 0;
        let res = WorkerPool::start_with(
            5, &db, dispatch(), Arc::new(InFlightRegistry::new()),
            |name, body| {
                attempts += 1;
                if attempts == 3 {
                    return Err(io::Error::new(
                        io::ErrorKind::Other, "injected failure"
                    ))
                }
                let exited = exited.clone();
                thread::Builder::new().name(name).spawn(move || {
                    body();
                    exited.fetch_add(1, Ordering::SeqCst);
                })
            }
        );
        assert!(matches!(res, Err(Error::ThreadCreation(_))));
        assert_eq!(attempts, 3);
        assert_eq!(exited.load(Ordering::SeqCst), 2);
        assert_eq!(db.open_connections(), 0);

        // Including the connection of the worker that never started.
        assert_eq!(db.disconnects(), 3);
    }

    #[test]
    fn connect_failure_joins_started_workers() {
        let db = database();
        db.limit_connects(2);
        let res = WorkerPool::start(
            4, &db, dispatch(), Arc::new(InFlightRegistry::new())
        );
        assert!(matches!(res, Err(Error::Database(_))));
        assert_eq!(db.open_connections(), 0);
        assert_eq!(db.disconnects(), 2);
    }

    #[test]
    fn shutdown_cancels_workers_and_requests() {
        let db = database();
        let dispatch = dispatch();
        let mut pool = WorkerPool::start(
            3, &db, dispatch.clone(), Arc::new(InFlightRegistry::new())
        ).unwrap();
        let start = Instant::now();
        while pool.states().iter().any(|s| *s != WorkerState::Idle) {
            assert!(start.elapsed() < Duration::from_secs(5));
            thread::yield_now();
        }
        pool.shutdown();
        assert!(pool.is_empty());
        assert_eq!(db.open_connections(), 0);
        assert_eq!(db.disconnects(), 3);

        let (request, response) = Request::new(
            DeltaQuery::new(1, Serial(1), Serial(2))
        );
        assert!(dispatch.submit(request).is_err());
        assert!(response.wait().is_err());
    }
}

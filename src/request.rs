//! Database requests.
//!
//! Connection handlers that need the database wrap the query into a
//! [`Request`] and hand it to the [`Dispatch`], which puts it into the
//! request queue and signals the request semaphore. A worker of the pool
//! picks it up, runs the query, and sends the result back through the
//! oneshot channel created together with the request. The handler waits
//! for it via the corresponding [`Response`].
//!
//! Requests for the same data are coalesced through the
//! [`InFlightRegistry`]: while a request is processed, its key is in the
//! registry and every further request with the same key just waits for
//! the result of the first one.

use std::{error, fmt};
use std::sync::Arc;
use log::debug;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use crate::bag::SharedBag;
use crate::db::{Database, DbError};
use crate::error::AllocationError;
use crate::payload::Delta;
use crate::queue::Queue;
use crate::semaphore::{Closed, Semaphore};
use crate::serial::Serial;


//------------ DeltaQuery ----------------------------------------------------

/// A query for the delta between two serial numbers.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct DeltaQuery {
    pub session: u16,
    pub from: Serial,
    pub to: Serial,
}

impl DeltaQuery {
    pub fn new(session: u16, from: Serial, to: Serial) -> Self {
        DeltaQuery { session, from, to }
    }

    /// Runs the query against the database.
    pub fn execute<D: Database>(&self, db: &mut D) -> DeltaResult {
        db.load_delta(self.session, self.from, self.to).map(|delta| {
            delta.map(Arc::new)
        })
    }
}

/// The result of a delta query.
///
/// `Ok(None)` means the database doesn’t have the delta.
pub type DeltaResult = Result<Option<Arc<Delta>>, DbError>;

type Reply = oneshot::Sender<DeltaResult>;


//------------ Request -------------------------------------------------------

/// A request waiting to be processed by a worker.
#[derive(Debug)]
pub struct Request {
    query: DeltaQuery,
    key: Option<DeltaQuery>,
    reply: Reply,
}

impl Request {
    /// Creates a request that may be coalesced with others for the same
    /// query.
    pub fn new(query: DeltaQuery) -> (Self, Response) {
        Self::create(query, Some(query))
    }

    /// Creates a request that is always processed on its own.
    pub fn unkeyed(query: DeltaQuery) -> (Self, Response) {
        Self::create(query, None)
    }

    fn create(
        query: DeltaQuery, key: Option<DeltaQuery>
    ) -> (Self, Response) {
        let (reply, rx) = oneshot::channel();
        (Request { query, key, reply }, Response { rx })
    }

    pub fn query(&self) -> DeltaQuery {
        self.query
    }

    pub fn key(&self) -> Option<DeltaQuery> {
        self.key
    }

    /// Delivers the result to the requester.
    pub fn deliver(self, result: DeltaResult) {
        // If the requester has gone away, nobody cares about the result.
        let _ = self.reply.send(result);
    }
}


//------------ Response ------------------------------------------------------

/// The receiving end for the result of a request.
#[derive(Debug)]
pub struct Response {
    rx: oneshot::Receiver<DeltaResult>,
}

impl Response {
    /// Blocks until the result has been delivered.
    ///
    /// If the request is dropped without a result – because the pool shut
    /// down – this returns an error.
    pub fn wait(self) -> DeltaResult {
        match self.rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(DbError::new("request was cancelled")),
        }
    }
}


//------------ Dispatch ------------------------------------------------------

/// The request queue together with its semaphore.
#[derive(Clone, Debug)]
pub struct Dispatch {
    queue: Arc<Queue<Request>>,
    semaphore: Arc<Semaphore>,
}

impl Dispatch {
    pub fn new(queue: Arc<Queue<Request>>, semaphore: Arc<Semaphore>) -> Self {
        Dispatch { queue, semaphore }
    }

    /// Enqueues a request and signals the semaphore once.
    pub fn submit(&self, request: Request) -> Result<(), SubmitError> {
        if self.semaphore.is_closed() {
            return Err(SubmitError::Closed)
        }
        self.queue.enqueue(request).map_err(SubmitError::Allocation)?;
        self.semaphore.post().map_err(|_| SubmitError::Closed)
    }

    /// Waits for the next request.
    ///
    /// Returns an error once the dispatch has been closed.
    ///
    /// # Panics
    ///
    /// Panics if the semaphore hands out a permit but the queue is empty.
    /// This happens only if someone bypassed `submit`.
    pub fn next(&self) -> Result<Request, Closed> {
        self.semaphore.wait()?;
        match self.queue.dequeue() {
            Some(request) => Ok(request),
            None => panic!("request semaphore signalled an empty queue"),
        }
    }

    /// Stops handing out requests and wakes up all waiting workers.
    pub fn close(&self) {
        self.semaphore.close()
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Drops all pending requests, returning how many there were.
    ///
    /// Their requesters will receive an error.
    pub fn drain(&self) -> usize {
        let mut count = 0;
        while self.queue.dequeue().is_some() {
            count += 1;
        }
        count
    }

    /// Returns the number of requests waiting in the queue.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}


//------------ SubmitError ---------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubmitError {
    /// The request queue couldn’t grow.
    Allocation(AllocationError),

    /// The pool has been shut down.
    Closed,
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SubmitError::Allocation(ref err) => err.fmt(f),
            SubmitError::Closed => f.write_str("request queue closed"),
        }
    }
}

impl error::Error for SubmitError { }


//------------ InFlight ------------------------------------------------------

/// A request currently being processed.
#[derive(Debug)]
pub struct InFlight {
    key: DeltaQuery,
    waiters: Mutex<Waiters>,
}

#[derive(Debug, Default)]
struct Waiters {
    /// The result is being delivered, no more waiters can be attached.
    done: bool,
    replies: Vec<Reply>,
}

impl InFlight {
    fn new(key: DeltaQuery) -> Self {
        InFlight { key, waiters: Mutex::new(Waiters::default()) }
    }

    pub fn key(&self) -> DeltaQuery {
        self.key
    }

    fn attach(&self, reply: Reply) -> Result<(), Reply> {
        let mut waiters = self.waiters.lock();
        if waiters.done {
            Err(reply)
        }
        else {
            waiters.replies.push(reply);
            Ok(())
        }
    }

    fn finish(&self) -> Vec<Reply> {
        let mut waiters = self.waiters.lock();
        waiters.done = true;
        std::mem::take(&mut waiters.replies)
    }
}


//------------ InFlightRegistry ----------------------------------------------

/// The keys of all requests currently processed by a worker.
///
/// Each key is present at most once.
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    entries: SharedBag<Arc<InFlight>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_new() -> Result<Self, AllocationError> {
        SharedBag::try_new().map(|entries| InFlightRegistry { entries })
    }

    /// Returns the number of requests in flight.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns how often `key` is currently registered.
    pub fn count(&self, key: DeltaQuery) -> usize {
        self.entries.count(|entry| entry.key == key)
    }

    /// Attaches a request to an in-flight request with the same key.
    ///
    /// If there is no such request, or it is just being finished, the
    /// request is handed back and needs to be submitted.
    pub fn attach(&self, request: Request) -> Result<(), Request> {
        let key = match request.key {
            Some(key) => key,
            None => return Err(request),
        };
        let entry = match self.entries.find(|entry| entry.key == key) {
            Some(entry) => entry,
            None => return Err(request),
        };
        let Request { query, key, reply } = request;
        entry.attach(reply).map_err(|reply| Request { query, key, reply })
    }

    /// Registers a request a worker is about to process.
    pub fn claim(&self, request: Request) -> Claim {
        let Request { query, key, mut reply } = request;
        let key = match key {
            Some(key) => key,
            None => return Claim::Run(Running { query, reply, entry: None }),
        };
        loop {
            let entry = Arc::new(InFlight::new(key));
            match self.entries.add_unique(entry.clone(), |item| {
                item.key == key
            }) {
                Ok(None) => {
                    return Claim::Run(Running {
                        query, reply, entry: Some(entry)
                    })
                }
                Ok(Some(present)) => {
                    match present.attach(reply) {
                        Ok(()) => {
                            debug!("Coalesced request for {:?}.", key);
                            return Claim::Joined
                        }
                        Err(back) => reply = back,
                    }
                }
                Err(err) => {
                    return Claim::Failed(
                        Request { query, key: Some(key), reply }, err
                    )
                }
            }
        }
    }

    /// Unregisters a request and delivers its result to all requesters.
    ///
    /// Returns the number of requesters the result was delivered to.
    pub fn complete(&self, running: Running, result: DeltaResult) -> usize {
        let Running { reply, entry, .. } = running;
        let mut delivered = 1;
        if let Some(entry) = entry {
            // The entry leaves the registry before it is finished.
            self.entries.remove_first(|item| Arc::ptr_eq(item, &entry));
            for waiter in entry.finish() {
                let _ = waiter.send(result.clone());
                delivered += 1;
            }
        }
        let _ = reply.send(result);
        delivered
    }
}


//------------ Claim ---------------------------------------------------------

/// The outcome of claiming a request.
#[derive(Debug)]
pub enum Claim {
    /// The request needs to be processed.
    Run(Running),

    /// The request has been attached to one with the same key.
    Joined,

    /// The registry couldn’t grow.
    Failed(Request, AllocationError),
}


//------------ Running -------------------------------------------------------

/// A request registered as being in flight.
#[derive(Debug)]
pub struct Running {
    query: DeltaQuery,
    reply: Reply,
    entry: Option<Arc<InFlight>>,
}

impl Running {
    pub fn query(&self) -> DeltaQuery {
        self.query
    }
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    fn query(from: u32) -> DeltaQuery {
        DeltaQuery::new(1, Serial(from), Serial(100))
    }

    fn dispatch() -> Dispatch {
        Dispatch::new(Arc::new(Queue::new()), Arc::new(Semaphore::new(0)))
    }

    #[test]
    fn dispatch_is_fifo() {
        let dispatch = dispatch();
        let mut responses = Vec::new();
        for from in 0..10 {
            let (request, response) = Request::new(query(from));
            dispatch.submit(request).unwrap();
            responses.push(response);
        }
        assert_eq!(dispatch.pending(), 10);
        for from in 0..10 {
            assert_eq!(dispatch.next().unwrap().query(), query(from));
        }
    }

    #[test]
    fn producers_and_consumers() {
        const PRODUCERS: u32 = 4;
        const PER_PRODUCER: u32 = 500;
        let dispatch = dispatch();
        let consumers: Vec<_> = (0..3).map(|_| {
            let dispatch = dispatch.clone();
            thread::spawn(move || {
                let mut got = Vec::new();
                while let Ok(request) = dispatch.next() {
                    got.push(request.query().from.0);
                }
                got
            })
        }).collect();
        let producers: Vec<_> = (0..PRODUCERS).map(|id| {
            let dispatch = dispatch.clone();
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let (request, _) = Request::new(
                        query(id * PER_PRODUCER + i)
                    );
                    dispatch.submit(request).unwrap();
                }
            })
        }).collect();
        for producer in producers {
            producer.join().unwrap();
        }
        while dispatch.pending() > 0 {
            thread::yield_now();
        }
        dispatch.close();
        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.join().unwrap());
        }
        assert_eq!(all.len(), (PRODUCERS * PER_PRODUCER) as usize);
        assert_eq!(
            all.into_iter().collect::<HashSet<_>>().len(),
            (PRODUCERS * PER_PRODUCER) as usize
        );
    }

    #[test]
    fn submit_after_close() {
        let dispatch = dispatch();
        dispatch.close();
        let (request, response) = Request::new(query(1));
        assert_eq!(dispatch.submit(request), Err(SubmitError::Closed));
        assert!(response.wait().is_err());
    }

    #[test]
    fn coalesce_same_key() {
        let registry = InFlightRegistry::new();
        let (first, first_response) = Request::new(query(1));
        let (second, second_response) = Request::new(query(1));
        let (third, third_response) = Request::new(query(1));

        let running = match registry.claim(first) {
            Claim::Run(running) => running,
            _ => panic!("first request not run"),
        };
        assert_eq!(registry.count(query(1)), 1);
        assert!(matches!(registry.claim(second), Claim::Joined));
        assert!(registry.attach(third).is_ok());
        assert_eq!(registry.count(query(1)), 1);

        assert_eq!(registry.complete(running, Ok(None)), 3);
        assert!(registry.is_empty());
        assert_eq!(first_response.wait(), Ok(None));
        assert_eq!(second_response.wait(), Ok(None));
        assert_eq!(third_response.wait(), Ok(None));
    }

    #[test]
    fn unkeyed_requests_are_not_registered() {
        let registry = InFlightRegistry::new();
        let (request, response) = Request::unkeyed(query(1));
        let request = registry.attach(request).unwrap_err();
        let running = match registry.claim(request) {
            Claim::Run(running) => running,
            _ => panic!("request not run"),
        };
        assert!(registry.is_empty());
        assert_eq!(registry.complete(running, Ok(None)), 1);
        assert_eq!(response.wait(), Ok(None));
    }

    #[test]
    fn attach_without_entry() {
        let registry = InFlightRegistry::new();
        let (request, _) = Request::new(query(1));
        assert!(registry.attach(request).is_err());
    }
}

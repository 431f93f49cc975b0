//! Putting it all together.
//!
//! [`Server::start`] brings up the components in a fixed order:
//!
//! 1. the listening socket,
//! 2. the request queue,
//! 3. the in-flight registry,
//! 4. the request semaphore,
//! 5. the database connection used for refreshing,
//! 6. the cache state, initialized from that connection,
//! 7. the database worker pool,
//! 8. the connection control.
//!
//! If any step fails, everything acquired so far is released in reverse
//! order and the error is returned. Shutting down a running server
//! releases the components in the same reverse order.
//!
//! The refresh loop itself runs on whichever thread calls [`Server::run`].

use std::{fmt, thread};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use log::{debug, info, warn};
use crate::cache::{CacheState, Refresh};
use crate::config::Config;
use crate::db::{Connect, Database, DbError};
use crate::error::Error;
use crate::pool::{WorkerPool, WorkerState};
use crate::queue::Queue;
use crate::request::{Dispatch, InFlightRegistry, Request};
use crate::semaphore::Semaphore;
use crate::server::{ConnectionControl, Context};


/// How often the refresh loop checks the stop flag.
const STOP_POLL: Duration = Duration::from_millis(100);


//------------ Acquired ------------------------------------------------------

/// A component acquired during startup.
///
/// Dropping the value releases the component and logs that fact.
struct Acquired<T> {
    name: &'static str,
    value: Option<T>,

    /// Consumes the component when it is released.
    release: fn(T),
}

impl<T> Acquired<T> {
    fn new(name: &'static str, value: T) -> Self {
        Self::with_release(name, value, drop)
    }

    fn with_release(name: &'static str, value: T, release: fn(T)) -> Self {
        debug!("Acquired {}.", name);
        Acquired { name, value: Some(value), release }
    }

    fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    fn get_mut(&mut self) -> Option<&mut T> {
        self.value.as_mut()
    }

    /// Releases the component now.
    fn release(&mut self) {
        if let Some(value) = self.value.take() {
            (self.release)(value);
            debug!("Released {}.", self.name);
        }
    }

    /// Takes the component out, leaving nothing to release.
    fn take(&mut self) -> Option<T> {
        self.value.take()
    }
}

impl<T> Drop for Acquired<T> {
    fn drop(&mut self) {
        self.release()
    }
}

impl<T> fmt::Debug for Acquired<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Acquired")
            .field("name", &self.name)
            .field("present", &self.value.is_some())
            .finish()
    }
}


//------------ Server --------------------------------------------------------

/// A running RTR server.
///
/// The fields are dropped in declaration order, which is the reverse of the
/// order they were acquired in.
pub struct Server<C: Connect> {
    control: Acquired<ConnectionControl>,
    pool: Acquired<WorkerPool>,
    cache: Acquired<Arc<CacheState>>,
    db: Acquired<C::Conn>,
    semaphore: Acquired<Arc<Semaphore>>,
    in_flight: Acquired<Arc<InFlightRegistry>>,
    queue: Acquired<Arc<Queue<Request>>>,
    connector: C,
    config: Config,
    local_addr: SocketAddr,
}

impl<C: Connect> Server<C> {
    /// Starts the server.
    pub fn start(config: Config, connector: C) -> Result<Self, Error> {
        config.check()?;
        info!("Starting RTR server.");

        let listener = TcpListener::bind(config.listen).map_err(|err| {
            warn!("Failed to listen on {}: {}", config.listen, err);
            Error::Io(err)
        })?;
        let local_addr = listener.local_addr()?;
        let mut listener = Acquired::new("listen socket", listener);

        let queue = Arc::new(Queue::new());
        let queue_held = Acquired::new("request queue", queue.clone());
        let in_flight = Arc::new(InFlightRegistry::try_new()?);
        let in_flight_held = Acquired::new(
            "in-flight registry", in_flight.clone()
        );
        let semaphore = Arc::new(Semaphore::new(0));
        let semaphore_held = Acquired::new(
            "request semaphore", semaphore.clone()
        );
        let mut db = Self::connect_db(&connector)?;
        let cache = match db.get_mut() {
            Some(conn) => Arc::new(CacheState::initialize(conn)?),
            None => return Err(Error::Config("no database connection".into()))
        };
        let cache_held = Acquired::new("cache state", cache.clone());

        let dispatch = Dispatch::new(queue, semaphore);
        let pool = Acquired::new("worker pool", WorkerPool::start(
            config.db_threads, &connector, dispatch.clone(), in_flight.clone()
        )?);

        let context = Context::new(cache, dispatch, in_flight, config.timing)?;
        let listener = listener.take().ok_or_else(|| {
            Error::Config("listen socket went missing".into())
        })?;
        let control = Acquired::new(
            "connection control", ConnectionControl::start(listener, context)?
        );

        info!("RTR server started on {}.", local_addr);
        Ok(Server {
            control,
            pool,
            cache: cache_held,
            db,
            semaphore: semaphore_held,
            in_flight: in_flight_held,
            queue: queue_held,
            connector,
            config,
            local_addr
        })
    }

    /// Returns the address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the cache state.
    pub fn cache(&self) -> Option<Arc<CacheState>> {
        self.cache.get().cloned()
    }

    /// Returns the number of open connections.
    pub fn connections(&self) -> usize {
        self.control.get().map(ConnectionControl::connections).unwrap_or(0)
    }

    /// Returns the states of the database workers.
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.pool.get().map(WorkerPool::states).unwrap_or_default()
    }

    /// Runs the refresh loop until `stop` is set.
    pub fn run(&mut self, stop: &AtomicBool) {
        info!(
            "Refreshing the cache every {} seconds.",
            self.config.refresh.as_secs()
        );
        let mut next = Instant::now() + self.config.refresh;
        while !stop.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now < next {
                thread::sleep(STOP_POLL.min(next - now));
                continue
            }
            let _ = self.refresh_now();
            next = next_refresh(next, self.config.refresh, Instant::now());
        }
        info!("Refresh loop stopped.");
    }

    /// Refreshes the cache once.
    ///
    /// If the data has changed, all connections are notified. If the
    /// refresh fails, the previous data stays in place and the database
    /// connection is reopened for the next attempt.
    pub fn refresh_now(&mut self) -> Result<Refresh, DbError> {
        let cache = match self.cache.get() {
            Some(cache) => cache.clone(),
            None => return Err(DbError::new("server is shut down")),
        };
        let res = match self.db.get_mut() {
            Some(conn) => cache.refresh(conn),
            None => Err(DbError::new("no database connection")),
        };
        match res {
            Ok(Refresh::Updated(state)) => {
                if let Some(control) = self.control.get() {
                    let sent = control.notify(state);
                    debug!("Sent {} serial notifications.", sent);
                }
            }
            Ok(Refresh::Unchanged) => { }
            Err(ref err) => {
                warn!(
                    "Cache refresh failed, keeping serial {}: {}",
                    cache.load().serial(), err
                );
                self.reconnect();
            }
        }
        res
    }

    /// Opens the connection used for refreshing.
    fn connect_db(connector: &C) -> Result<Acquired<C::Conn>, DbError> {
        connector.connect().map(|conn| {
            Acquired::with_release(
                "database connection", conn, <C::Conn as Database>::disconnect
            )
        })
    }

    /// Replaces the refresh connection with a new one if possible.
    fn reconnect(&mut self) {
        match Self::connect_db(&self.connector) {
            Ok(conn) => {
                self.db.release();
                self.db = conn;
            }
            Err(err) => {
                debug!("Failed to reconnect to the database: {}", err);
            }
        }
    }

    /// Stops the server, releasing everything in reverse order.
    pub fn shutdown(&mut self) {
        if self.control.get().is_none() && self.queue.get().is_none() {
            return
        }
        info!("Shutting down RTR server.");
        if let Some(control) = self.control.get_mut() {
            control.shutdown();
        }
        self.control.release();
        if let Some(pool) = self.pool.get_mut() {
            pool.shutdown();
        }
        self.pool.release();
        self.cache.release();
        self.db.release();
        self.semaphore.release();
        self.in_flight.release();
        self.queue.release();
        info!("RTR server stopped.");
    }
}

impl<C: Connect> Drop for Server<C> {
    fn drop(&mut self) {
        self.shutdown()
    }
}

impl<C: Connect> fmt::Debug for Server<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("control", &self.control)
            .field("pool", &self.pool)
            .finish()
    }
}


/// Returns the first refresh time after `now` on the cadence of `previous`.
///
/// Refreshes that took longer than `interval` skip the missed slots.
fn next_refresh(
    previous: Instant, interval: Duration, now: Instant
) -> Instant {
    let mut next = previous + interval;
    while next <= now {
        next += interval;
    }
    next
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;
    use crate::db::MemoryDb;
    use crate::payload::{Dataset, Delta, Payload};
    use crate::serial::Serial;
    use crate::state::State;

    /// A database whose loads can be made to fail while connecting works.
    #[derive(Clone, Default)]
    struct Unloadable {
        failing: Arc<AtomicBool>,
        disconnects: Arc<AtomicUsize>,
    }

    impl Unloadable {
        fn failing() -> Self {
            let res = Self::default();
            res.failing.store(true, Ordering::SeqCst);
            res
        }

        fn check(&self) -> Result<(), DbError> {
            if self.failing.load(Ordering::SeqCst) {
                Err(DbError::new("no data"))
            }
            else {
                Ok(())
            }
        }
    }

    impl Connect for Unloadable {
        type Conn = Unloadable;

        fn connect(&self) -> Result<Unloadable, DbError> {
            Ok(self.clone())
        }
    }

    impl Database for Unloadable {
        fn load_vrps(&mut self) -> Result<Dataset, DbError> {
            self.check().map(|_| Dataset::new())
        }

        fn store_delta(
            &mut self, _: State, _: &Delta
        ) -> Result<(), DbError> {
            self.check()
        }

        fn load_delta(
            &mut self, _: u16, _: Serial, _: Serial
        ) -> Result<Option<Delta>, DbError> {
            self.check().map(|_| None)
        }

        fn disconnect(self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> Config {
        Config {
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            db_threads: 2,
            refresh: Duration::from_secs(1),
            .. Config::default()
        }
    }

    fn vrp(asn: u32) -> Payload {
        Payload::new(Ipv4Addr::new(192, 0, 2, 0).into(), 24, 24, asn)
    }

    #[test]
    fn start_refresh_shutdown() {
        let db = MemoryDb::default();
        db.set_vrps(vec![vrp(1)]);
        let mut server = Server::start(config(), db.clone()).unwrap();
        assert_eq!(db.open_connections(), 3);
        assert_eq!(server.worker_states().len(), 2);
        let cache = server.cache().unwrap();
        assert_eq!(cache.load().serial(), Serial(0));

        assert_eq!(server.refresh_now(), Ok(Refresh::Unchanged));
        db.set_vrps(vec![vrp(1), vrp(2)]);
        assert!(matches!(server.refresh_now(), Ok(Refresh::Updated(_))));
        assert_eq!(cache.load().serial(), Serial(1));

        server.shutdown();
        assert_eq!(db.open_connections(), 0);
        assert_eq!(db.disconnects(), 3);
        assert!(server.cache().is_none());
        assert!(server.refresh_now().is_err());
    }

    #[test]
    fn outage_keeps_serving_last_snapshot() {
        let db = MemoryDb::default();
        db.set_vrps(vec![vrp(1)]);
        let mut server = Server::start(config(), db.clone()).unwrap();
        let cache = server.cache().unwrap();

        db.set_vrps(vec![vrp(2)]);
        db.set_outage(true);
        assert!(server.refresh_now().is_err());
        assert_eq!(cache.load().serial(), Serial(0));
        assert!(cache.load().dataset().contains(&vrp(1)));

        db.set_outage(false);
        assert!(matches!(server.refresh_now(), Ok(Refresh::Updated(_))));
        assert!(cache.load().dataset().contains(&vrp(2)));
    }

    #[test]
    fn failed_start_releases_everything() {
        let db = MemoryDb::default();

        // Room for the refresh connection and one worker only.
        db.limit_connects(2);
        let res = Server::start(config(), db.clone());
        assert!(matches!(res, Err(Error::Database(_))));
        assert_eq!(db.open_connections(), 0);
        assert_eq!(db.disconnects(), 2);

        // The listen socket has been released, too.
        let db = MemoryDb::default();
        db.limit_connects(0);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let res = Server::start(Config { listen: addr, .. config() }, db);
        assert!(res.is_err());
        assert!(TcpListener::bind(addr).is_ok());
    }

    #[test]
    fn failed_initialize_disconnects() {
        let db = Unloadable::failing();
        let res = Server::start(config(), db.clone());
        assert!(matches!(res, Err(Error::Database(_))));
        assert_eq!(db.disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reconnect_disconnects_old_connection() {
        let db = Unloadable::default();
        let mut server = Server::start(config(), db.clone()).unwrap();
        assert_eq!(server.refresh_now(), Ok(Refresh::Unchanged));

        db.failing.store(true, Ordering::SeqCst);
        assert!(server.refresh_now().is_err());
        assert_eq!(db.disconnects.load(Ordering::SeqCst), 1);

        db.failing.store(false, Ordering::SeqCst);
        assert_eq!(server.refresh_now(), Ok(Refresh::Unchanged));
        server.shutdown();
        assert_eq!(db.disconnects.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn failed_reconnect_keeps_connection() {
        let db = MemoryDb::default();
        let mut server = Server::start(config(), db.clone()).unwrap();
        db.set_outage(true);
        assert!(server.refresh_now().is_err());
        assert_eq!(db.disconnects(), 0);
        assert_eq!(db.open_connections(), 3);

        db.set_outage(false);
        db.set_vrps(vec![vrp(3)]);
        assert!(matches!(server.refresh_now(), Ok(Refresh::Updated(_))));
        server.shutdown();
        assert_eq!(db.disconnects(), 3);
    }

    #[test]
    fn refresh_keeps_cadence() {
        let start = Instant::now();
        let interval = Duration::from_secs(10);

        // A slow refresh doesn't shift later ones.
        assert_eq!(
            next_refresh(start, interval, start + Duration::from_secs(3)),
            start + interval
        );
        assert_eq!(
            next_refresh(start, interval, start + interval),
            start + Duration::from_secs(20)
        );
        assert_eq!(
            next_refresh(start, interval, start + Duration::from_secs(35)),
            start + Duration::from_secs(40)
        );
    }

    #[test]
    fn run_stops_on_flag() {
        let db = MemoryDb::default();
        let mut server = Server::start(config(), db).unwrap();
        let stop = AtomicBool::new(true);
        let start = Instant::now();
        server.run(&stop);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(server.worker_states().len(), 2);
    }
}

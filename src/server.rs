//! The RTR server.
//!
//! [`ConnectionControl`] runs an acceptor thread on a listening TCP socket.
//! Each accepted connection gets its own handler thread that reads queries
//! and answers them from the current cache snapshot. Answering a serial
//! query requires the delta since the router’s serial number, which is
//! requested from the database through the worker pool.
//!
//! Everything a handler needs is collected in a [`Context`].

pub use self::notify::{ConnectionHandle, NotifyRegistry};

use std::{io, thread};
use std::io::{BufWriter, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use log::{debug, error, info, warn};
use crate::cache::CacheState;
use crate::db::DbError;
use crate::error::{AllocationError, Error};
use crate::payload::Action;
use crate::pdu;
use crate::pdu::error_code;
use crate::request::{
    DeltaQuery, DeltaResult, Dispatch, InFlightRegistry, Request
};
use crate::state::State;
use self::query::{Query, QueryStream};

pub mod notify;
pub mod query;


//------------ Context -------------------------------------------------------

/// The shared state of all connections.
#[derive(Clone, Debug)]
pub struct Context {
    cache: Arc<CacheState>,
    dispatch: Dispatch,
    in_flight: Arc<InFlightRegistry>,
    notify: Arc<NotifyRegistry>,
    timing: pdu::Timing,
}

impl Context {
    pub fn new(
        cache: Arc<CacheState>,
        dispatch: Dispatch,
        in_flight: Arc<InFlightRegistry>,
        timing: pdu::Timing,
    ) -> Result<Self, AllocationError> {
        Ok(Context {
            cache, dispatch, in_flight, timing,
            notify: Arc::new(NotifyRegistry::try_new()?),
        })
    }

    pub fn cache(&self) -> &Arc<CacheState> {
        &self.cache
    }

    pub fn notify(&self) -> &Arc<NotifyRegistry> {
        &self.notify
    }

    pub fn timing(&self) -> pdu::Timing {
        self.timing
    }

    /// Requests a delta from the database and waits for the result.
    ///
    /// If the same delta is already being requested, waits for that
    /// request instead.
    pub fn delta(&self, query: DeltaQuery) -> DeltaResult {
        let (request, response) = Request::new(query);
        let request = match self.in_flight.attach(request) {
            Ok(()) => return response.wait(),
            Err(request) => request,
        };
        match self.dispatch.submit(request) {
            Ok(()) => response.wait(),
            Err(err) => Err(DbError::new(err.to_string())),
        }
    }
}


//------------ ConnectionControl ---------------------------------------------

/// The acceptor thread and all connections it started.
#[derive(Debug)]
pub struct ConnectionControl {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,

    /// The acceptor thread returns the handler threads still running.
    acceptor: Option<JoinHandle<Vec<JoinHandle<()>>>>,

    notify: Arc<NotifyRegistry>,
}

impl ConnectionControl {
    /// Starts accepting connections on `listener`.
    pub fn start(
        listener: TcpListener, context: Context
    ) -> Result<Self, Error> {
        let local_addr = listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));
        let notify = context.notify.clone();
        let acceptor = Acceptor {
            listener,
            stop: stop.clone(),
            context,
            next_id: AtomicUsize::new(0),
        };
        let acceptor = thread::Builder::new()
            .name("rtr-acceptor".into())
            .spawn(move || acceptor.run())
            .map_err(Error::ThreadCreation)?;
        info!("Listening for RTR connections on {}.", local_addr);
        Ok(ConnectionControl {
            local_addr,
            stop,
            acceptor: Some(acceptor),
            notify,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the number of open connections.
    pub fn connections(&self) -> usize {
        self.notify.len()
    }

    /// Sends a Serial Notify for `state` to all connections.
    pub fn notify(&self, state: State) -> usize {
        self.notify.notify(state)
    }

    /// Stops accepting connections and closes all open ones.
    ///
    /// Waits for all handler threads to finish.
    pub fn shutdown(&mut self) {
        let acceptor = match self.acceptor.take() {
            Some(acceptor) => acceptor,
            None => return,
        };
        self.stop.store(true, Ordering::SeqCst);

        // The acceptor only looks at the stop flag after accepting.
        let handlers = match TcpStream::connect(wake_addr(self.local_addr)) {
            Ok(_) => match acceptor.join() {
                Ok(handlers) => handlers,
                Err(_) => {
                    error!("RTR acceptor thread panicked.");
                    Vec::new()
                }
            }
            Err(err) => {
                warn!(
                    "Failed to wake up RTR acceptor: {}. Leaving it behind, \
                     {} stays open until the next connection arrives.",
                    err, self.local_addr
                );
                Vec::new()
            }
        };
        self.notify.close_all();
        for handler in handlers {
            if handler.join().is_err() {
                error!("RTR connection thread panicked.");
            }
        }
        info!("Stopped listening on {}.", self.local_addr);
    }
}

impl Drop for ConnectionControl {
    fn drop(&mut self) {
        self.shutdown()
    }
}

/// Returns an address to connect to for reaching `addr`.
fn wake_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(Ipv6Addr::LOCALHOST.into(), addr.port())
        }
        _ => addr
    }
}


//------------ Acceptor ------------------------------------------------------

struct Acceptor {
    listener: TcpListener,
    stop: Arc<AtomicBool>,
    context: Context,
    next_id: AtomicUsize,
}

impl Acceptor {
    /// Accepts connections until stopped.
    ///
    /// Returns the handler threads that haven’t finished yet.
    fn run(self) -> Vec<JoinHandle<()>> {
        let mut handlers = Vec::new();
        for sock in self.listener.incoming() {
            if self.stop.load(Ordering::SeqCst) {
                break
            }
            handlers.retain(|handler: &JoinHandle<()>| !handler.is_finished());
            match sock {
                Ok(sock) => {
                    if let Some(handler) = self.spawn_connection(sock) {
                        handlers.push(handler)
                    }
                }
                Err(err) => {
                    warn!("Failed to accept RTR connection: {}", err);
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
        debug!("RTR acceptor stopped.");
        handlers
    }

    /// Starts a handler thread for a new connection.
    ///
    /// Any failure only affects this one connection.
    fn spawn_connection(&self, sock: TcpStream) -> Option<JoinHandle<()>> {
        let handle = match ConnectionHandle::new(&sock) {
            Ok(handle) => Arc::new(handle),
            Err(err) => {
                warn!("Failed to set up RTR connection: {}", err);
                return None
            }
        };
        let peer = handle.peer();
        if let Err(err) = self.context.notify.register(handle.clone()) {
            warn!("Rejecting RTR connection from {:?}: {}", peer, err);
            return None
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection {
            queries: QueryStream::new(sock),
            handle: handle.clone(),
            context: self.context.clone(),
        };
        match thread::Builder::new()
            .name(format!("rtr-conn-{}", id))
            .spawn(move || connection.run())
        {
            Ok(handler) => {
                debug!("New RTR connection from {:?}.", peer);
                Some(handler)
            }
            Err(err) => {
                warn!("Rejecting RTR connection from {:?}: {}", peer, err);
                self.context.notify.unregister(&handle);
                handle.close();
                None
            }
        }
    }
}


//------------ Connection ----------------------------------------------------

/// A single server connection.
struct Connection {
    /// The reading side of the socket.
    queries: QueryStream<TcpStream>,

    /// The writing side of the socket.
    handle: Arc<ConnectionHandle>,

    context: Context,
}

/// # High-level operation
///
impl Connection {
    /// Runs the connection until it is done.
    fn run(mut self) {
        match self.serve() {
            Ok(()) => {
                debug!("RTR connection from {:?} closed.", self.handle.peer())
            }
            Err(err) => {
                debug!(
                    "RTR connection from {:?} failed: {}",
                    self.handle.peer(), err
                )
            }
        }
        self.context.notify.unregister(&self.handle);
        self.handle.close();
    }

    /// Answers queries until the connection should be closed.
    fn serve(&mut self) -> Result<(), io::Error> {
        while let Some(query) = self.queries.recv()? {
            if let Some(version) = self.queries.negotiated() {
                self.handle.set_version(version);
            }
            match query {
                Query::Serial(state) => {
                    if !self.serial(state)? {
                        return Ok(())
                    }
                }
                Query::Reset => self.reset()?,
                Query::Error(err) => {
                    return err.write(&mut self.handle.writer())
                }
                Query::Report(report) => {
                    info!(
                        "RTR client {:?} reported error {}: {}",
                        self.handle.peer(), report.code, report.text
                    );
                    return Ok(())
                }
            }
            self.pending_notify()?;
        }
        Ok(())
    }

    fn version(&self) -> u8 {
        self.queries.version()
    }
}

/// # Sending
///
impl Connection {
    /// Sends out a response to a serial query.
    ///
    /// Returns whether the connection should continue.
    fn serial(&mut self, state: State) -> Result<bool, io::Error> {
        debug!("RTR server: request for serial {}", state.serial());
        let snapshot = self.context.cache.load();
        let version = self.version();
        if state.session() != snapshot.session() {
            debug!("RTR server: session mismatch, resetting.");
            pdu::CacheReset::new(version).write(&mut self.handle.writer())?;
            return Ok(true)
        }
        if state.serial() == snapshot.serial() {
            let mut sock = BufWriter::new(self.handle.writer());
            pdu::CacheResponse::new(version, snapshot.session()).write(
                &mut sock
            )?;
            pdu::EndOfData::new(
                version, snapshot.state(), self.context.timing
            ).write(&mut sock)?;
            sock.flush()?;
            return Ok(true)
        }
        let query = DeltaQuery::new(
            snapshot.session(), state.serial(), snapshot.serial()
        );
        match self.context.delta(query) {
            Ok(Some(delta)) => {
                debug!("RTR server: sending {} changes", delta.len());
                let mut sock = BufWriter::new(self.handle.writer());
                pdu::CacheResponse::new(version, snapshot.session()).write(
                    &mut sock
                )?;
                for (action, payload) in delta.iter() {
                    pdu::Payload::new(
                        version, action.into_flags(), payload
                    ).write(&mut sock)?;
                }
                pdu::EndOfData::new(
                    version, snapshot.state(), self.context.timing
                ).write(&mut sock)?;
                sock.flush()?;
                Ok(true)
            }
            Ok(None) => {
                debug!("RTR server: no delta for that serial.");
                pdu::CacheReset::new(version).write(
                    &mut self.handle.writer()
                )?;
                Ok(true)
            }
            Err(err) => {
                warn!("RTR server: failed to load delta: {}", err);
                pdu::Error::new(
                    version, error_code::INTERNAL_ERROR, (),
                    *b"database error"
                ).write(&mut self.handle.writer())?;
                Ok(false)
            }
        }
    }

    /// Sends a notification that came in while we were busy.
    fn pending_notify(&mut self) -> Result<(), io::Error> {
        if self.handle.take_pending() {
            let state = self.context.cache.load().state();
            pdu::SerialNotify::new(self.version(), state).write(
                &mut self.handle.writer()
            )?;
        }
        Ok(())
    }

    /// Sends out a response to a reset query.
    fn reset(&mut self) -> Result<(), io::Error> {
        let snapshot = self.context.cache.load();
        let version = self.version();
        let mut sock = BufWriter::new(self.handle.writer());
        pdu::CacheResponse::new(version, snapshot.session()).write(
            &mut sock
        )?;
        let flags = Action::Announce.into_flags();
        for payload in snapshot.dataset().iter() {
            pdu::Payload::new(version, flags, *payload).write(&mut sock)?;
        }
        pdu::EndOfData::new(
            version, snapshot.state(), self.context.timing
        ).write(&mut sock)?;
        sock.flush()
    }
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::{Connect, MemoryDb};
    use crate::queue::Queue;
    use crate::semaphore::Semaphore;

    fn context() -> Context {
        let db = MemoryDb::default();
        let mut conn = db.connect().unwrap();
        Context::new(
            Arc::new(CacheState::initialize(&mut conn).unwrap()),
            Dispatch::new(Arc::new(Queue::new()), Arc::new(Semaphore::new(0))),
            Arc::new(InFlightRegistry::new()),
            pdu::Timing::default(),
        ).unwrap()
    }

    #[test]
    fn wake_addr_for_unspecified() {
        assert_eq!(
            wake_addr("0.0.0.0:3323".parse().unwrap()),
            "127.0.0.1:3323".parse().unwrap()
        );
        assert_eq!(
            wake_addr("[::]:3323".parse().unwrap()),
            "[::1]:3323".parse().unwrap()
        );
        assert_eq!(
            wake_addr("192.0.2.1:3323".parse().unwrap()),
            "192.0.2.1:3323".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn shutdown_joins_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut control = ConnectionControl::start(
            listener, context()
        ).unwrap();
        let mut clients = Vec::new();
        for _ in 0..3 {
            let mut sock = TcpStream::connect(control.local_addr()).unwrap();
            sock.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
            pdu::ResetQuery::new(1).write(&mut sock).unwrap();
            let _ = pdu::CacheResponse::read(&mut sock).unwrap();
            clients.push(sock);
        }
        assert_eq!(control.connections(), 3);

        control.shutdown();

        // Handlers unregister themselves before they finish.
        assert_eq!(control.connections(), 0);
        control.shutdown();
    }
}

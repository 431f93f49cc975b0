//! Sending of cache update notifications.
//!
//! Every connection registers a [`ConnectionHandle`] with the
//! [`NotifyRegistry`]. When the cache has been updated, the registry sends a
//! Serial Notify to every connection that has agreed on a protocol version.
//! Writes to a connection are serialized through the handle, so a
//! notification never ends up in the middle of a response.

use std::{fmt, io};
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;
use log::debug;
use parking_lot::{Mutex, MutexGuard};
use crate::bag::SharedBag;
use crate::error::AllocationError;
use crate::pdu;
use crate::state::State;


/// The value of `ConnectionHandle::version` before negotiation.
const NO_VERSION: u8 = u8::MAX;

/// How long a write to a router may block before the connection is dropped.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);


//------------ ConnectionHandle ----------------------------------------------

/// The shared, writing side of a connection.
pub struct ConnectionHandle {
    sock: TcpStream,
    write_lock: Mutex<()>,
    version: AtomicU8,

    /// A notification couldn’t be sent because the connection was busy.
    pending: AtomicBool,

    peer: Option<SocketAddr>,
}

impl ConnectionHandle {
    pub fn new(sock: &TcpStream) -> Result<Self, io::Error> {
        Self::with_write_timeout(sock, WRITE_TIMEOUT)
    }

    /// Creates a handle for a socket whose writes give up after `timeout`.
    ///
    /// The timeout applies to the socket itself and thus to everyone
    /// writing to it.
    pub fn with_write_timeout(
        sock: &TcpStream, timeout: Duration
    ) -> Result<Self, io::Error> {
        let sock = sock.try_clone()?;
        sock.set_write_timeout(Some(timeout))?;
        let peer = sock.peer_addr().ok();
        Ok(ConnectionHandle {
            sock,
            write_lock: Mutex::new(()),
            version: AtomicU8::new(NO_VERSION),
            pending: AtomicBool::new(false),
            peer,
        })
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Returns the protocol version agreed upon, if any.
    pub fn version(&self) -> Option<u8> {
        match self.version.load(Ordering::SeqCst) {
            NO_VERSION => None,
            version => Some(version),
        }
    }

    pub fn set_version(&self, version: u8) {
        self.version.store(version, Ordering::SeqCst)
    }

    /// Returns whether a notification is pending and clears the flag.
    ///
    /// The handler needs to check this every time it has released the
    /// writer.
    pub fn take_pending(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }

    /// Returns exclusive write access to the connection.
    pub fn writer(&self) -> Writer {
        Writer { _guard: self.write_lock.lock(), sock: &self.sock }
    }

    /// Returns write access if nobody else is writing right now.
    pub fn try_writer(&self) -> Option<Writer> {
        self.write_lock.try_lock().map(|guard| {
            Writer { _guard: guard, sock: &self.sock }
        })
    }

    /// Shuts down both directions of the connection.
    ///
    /// This makes a handler blocked reading from the connection return.
    pub fn close(&self) {
        let _ = self.sock.shutdown(Shutdown::Both);
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("peer", &self.peer)
            .field("version", &self.version())
            .finish()
    }
}


//------------ Writer --------------------------------------------------------

/// Exclusive write access to a connection.
pub struct Writer<'a> {
    _guard: MutexGuard<'a, ()>,
    sock: &'a TcpStream,
}

impl<'a> Write for Writer<'a> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        let mut sock = self.sock;
        sock.write(buf)
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        let mut sock = self.sock;
        sock.flush()
    }
}


//------------ NotifyRegistry ------------------------------------------------

/// All connections that want to be notified of updates.
#[derive(Debug, Default)]
pub struct NotifyRegistry {
    connections: SharedBag<Arc<ConnectionHandle>>,
}

impl NotifyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_new() -> Result<Self, AllocationError> {
        SharedBag::try_new().map(|connections| {
            NotifyRegistry { connections }
        })
    }

    /// Returns the number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn register(
        &self, handle: Arc<ConnectionHandle>
    ) -> Result<(), AllocationError> {
        self.connections.add(handle).map(|_| ())
    }

    /// Removes a connection. Returns whether it was still registered.
    pub fn unregister(&self, handle: &Arc<ConnectionHandle>) -> bool {
        self.connections.remove_first(|item| {
            Arc::ptr_eq(item, handle)
        }).is_some()
    }

    /// Sends a Serial Notify for `state` to all connections.
    ///
    /// Connections that haven’t agreed on a version yet are skipped.
    /// Connections busy sending a response are marked as having a pending
    /// notification which their handler sends later. Connections that fail
    /// are closed and removed. Returns the number of notifications sent
    /// right away.
    pub fn notify(&self, state: State) -> usize {
        let mut sent = 0;
        for (_, handle) in self.connections.start_iteration() {
            let version = match handle.version() {
                Some(version) => version,
                None => continue,
            };
            // Mark first so a busy handler sees the flag once it is done.
            handle.pending.store(true, Ordering::SeqCst);
            let mut writer = match handle.try_writer() {
                Some(writer) => writer,
                None => continue,
            };
            handle.pending.store(false, Ordering::SeqCst);
            let res = pdu::SerialNotify::new(version, state).write(
                &mut writer
            );
            drop(writer);
            match res {
                Ok(()) => sent += 1,
                Err(err) => {
                    debug!(
                        "Failed to notify {:?}: {}. Dropping connection.",
                        handle.peer(), err
                    );
                    handle.close();
                    self.unregister(&handle);
                }
            }
        }
        sent
    }

    /// Closes all registered connections.
    pub fn close_all(&self) {
        for handle in self.connections.snapshot() {
            handle.close()
        }
    }
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::time::Instant;
    use crate::serial::Serial;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn notify_negotiated_connections() {
        let registry = NotifyRegistry::new();
        let (mut client1, server1) = pair();
        let (_client2, server2) = pair();
        let handle1 = Arc::new(ConnectionHandle::new(&server1).unwrap());
        let handle2 = Arc::new(ConnectionHandle::new(&server2).unwrap());
        registry.register(handle1.clone()).unwrap();
        registry.register(handle2.clone()).unwrap();
        handle1.set_version(1);

        let state = State::from_parts(5, Serial(9));
        assert_eq!(registry.notify(state), 1);
        let notify = pdu::SerialNotify::read(&mut client1).unwrap();
        assert_eq!(notify.version(), 1);
        assert_eq!(notify.session(), 5);
        assert_eq!(notify.serial(), Serial(9));

        // A busy connection gets a pending notification.
        assert!(!handle1.take_pending());
        let writer = handle1.writer();
        assert_eq!(registry.notify(state), 0);
        drop(writer);
        assert!(handle1.take_pending());
        assert!(!handle1.take_pending());

        assert!(registry.unregister(&handle2));
        assert!(!registry.unregister(&handle2));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stalled_connection_is_dropped() {
        let registry = NotifyRegistry::new();
        let (_client, server) = pair();
        let handle = Arc::new(ConnectionHandle::with_write_timeout(
            &server, Duration::from_millis(100)
        ).unwrap());
        handle.set_version(1);
        registry.register(handle.clone()).unwrap();

        // The client never reads, so eventually the socket buffers are full.
        let chunk = vec![0u8; 64 * 1024];
        let start = Instant::now();
        let mut writer = handle.writer();
        loop {
            assert!(start.elapsed() < Duration::from_secs(30));
            if writer.write(&chunk).is_err() {
                break
            }
        }
        drop(writer);

        let start = Instant::now();
        assert_eq!(registry.notify(State::from_parts(5, Serial(1))), 0);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(registry.is_empty());
    }

    #[test]
    fn close_all_ends_reads() {
        let registry = NotifyRegistry::new();
        let (_client, server) = pair();
        let handle = Arc::new(ConnectionHandle::new(&server).unwrap());
        registry.register(handle).unwrap();
        registry.close_all();
        let mut buf = [0u8; 1];
        let mut server = server;
        assert_eq!(server.read(&mut buf).unwrap(), 0);
    }
}

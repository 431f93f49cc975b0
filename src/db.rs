//! Access to the database.
//!
//! The server doesn’t care what the database actually is. It needs a way to
//! open connections – the [`Connect`] trait – and three operations on such
//! a connection – the [`Database`] trait: load the complete current set of
//! VRPs, store the delta that leads to a new serial number, and load the
//! accumulated delta between two serial numbers.
//!
//! Connections are used by one thread at a time. Every worker of the pool
//! and the refresh loop each open their own connection.
//!
//! Two implementations are provided: [`MemoryDb`] keeps everything in
//! memory and can simulate slow or failing databases, and [`JsonDb`] reads
//! the VRPs from a JSON file.

pub use self::json::{JsonConnection, JsonDb};
pub use self::memory::{MemoryConnection, MemoryDb};

use std::{error, fmt, io};
use std::collections::VecDeque;
use std::sync::Arc;
use crate::payload::{Dataset, Delta};
use crate::serial::Serial;
use crate::state::State;

mod json;
mod memory;


//------------ Connect -------------------------------------------------------

/// A type that can open database connections.
pub trait Connect: Send + Sync + 'static {
    /// The type of a connection.
    type Conn: Database + 'static;

    /// Opens a new connection.
    fn connect(&self) -> Result<Self::Conn, DbError>;
}


//------------ Database ------------------------------------------------------

/// An open database connection.
pub trait Database: Send {
    /// Loads the complete current set of VRPs.
    fn load_vrps(&mut self) -> Result<Dataset, DbError>;

    /// Stores the delta that leads to `state`.
    ///
    /// The delta is relative to the state with the previous serial number
    /// in the same session.
    fn store_delta(
        &mut self, state: State, delta: &Delta
    ) -> Result<(), DbError>;

    /// Loads the accumulated delta from serial `from` to serial `to`.
    ///
    /// Returns `Ok(None)` if the database doesn’t have the deltas necessary,
    /// e.g., because they are too old or belong to a different session.
    fn load_delta(
        &mut self, session: u16, from: Serial, to: Serial
    ) -> Result<Option<Delta>, DbError>;

    /// Closes the connection.
    fn disconnect(self) where Self: Sized { }
}


//------------ DeltaLog ------------------------------------------------------

/// A bounded history of deltas.
///
/// This is the delta table of the databases provided here.
#[derive(Clone, Debug)]
pub struct DeltaLog {
    session: Option<u16>,
    deltas: VecDeque<(Serial, Arc<Delta>)>,
    limit: usize,
}

impl DeltaLog {
    /// Creates a new log keeping at most `limit` deltas.
    pub fn new(limit: usize) -> Self {
        DeltaLog {
            session: None,
            deltas: VecDeque::new(),
            limit,
        }
    }

    /// Appends the delta leading to `state`.
    ///
    /// A new session or a gap in the serial numbers clears the log.
    pub fn push(&mut self, state: State, delta: &Delta) {
        let contiguous = self.session == Some(state.session())
            && self.deltas.back().map(|(serial, _)| {
                serial.next() == state.serial()
            }).unwrap_or(true);
        if !contiguous {
            self.deltas.clear();
            self.session = Some(state.session());
        }
        self.deltas.push_back((state.serial(), Arc::new(delta.clone())));
        while self.deltas.len() > self.limit {
            self.deltas.pop_front();
        }
    }

    /// Returns the accumulated delta from `from` to `to`.
    pub fn collect(
        &self, session: u16, from: Serial, to: Serial
    ) -> Option<Delta> {
        if self.session != Some(session) {
            return None
        }
        if from == to {
            return Some(Delta::new())
        }
        let start = from.next();
        let pos = self.deltas.iter().position(|(serial, _)| *serial == start)?;
        let mut res = Delta::new();
        for (serial, delta) in self.deltas.iter().skip(pos) {
            res.merge(delta);
            if *serial == to {
                return Some(res)
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }
}


//------------ DbError -------------------------------------------------------

/// A database operation failed.
///
/// The error can be cloned so the outcome of a request can be handed to
/// every requester waiting for it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DbError {
    message: Arc<str>,
}

impl DbError {
    pub fn new(message: impl Into<String>) -> Self {
        DbError { message: message.into().into() }
    }
}

impl From<io::Error> for DbError {
    fn from(err: io::Error) -> Self {
        DbError::new(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::new(err.to_string())
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl error::Error for DbError { }


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;
    use crate::payload::{Action, Payload};

    fn delta(asn: u32) -> Delta {
        let mut res = Delta::new();
        res.push(
            Action::Announce,
            Payload::new(Ipv4Addr::new(10, 0, 0, 0).into(), 8, 8, asn)
        );
        res
    }

    #[test]
    fn log_collects_ranges() {
        let mut log = DeltaLog::new(3);
        for serial in 1..=4 {
            log.push(State::from_parts(7, Serial(serial)), &delta(serial));
        }
        assert_eq!(log.len(), 3);

        // Deltas for serials 2, 3, 4 are kept.
        assert_eq!(log.collect(7, Serial(1), Serial(4)).unwrap().len(), 3);
        assert_eq!(log.collect(7, Serial(3), Serial(4)).unwrap(), delta(4));
        assert_eq!(log.collect(7, Serial(4), Serial(4)), Some(Delta::new()));
        assert_eq!(log.collect(7, Serial(0), Serial(4)), None);
        assert_eq!(log.collect(7, Serial(2), Serial(9)), None);
        assert_eq!(log.collect(8, Serial(3), Serial(4)), None);
    }

    #[test]
    fn log_resets_on_gap() {
        let mut log = DeltaLog::new(10);
        log.push(State::from_parts(1, Serial(1)), &delta(1));
        log.push(State::from_parts(1, Serial(3)), &delta(3));
        assert_eq!(log.len(), 1);
        assert_eq!(log.collect(1, Serial(0), Serial(1)), None);
        assert!(log.collect(1, Serial(2), Serial(3)).is_some());
    }
}

//! The state of an RTR data set.

use chrono::Utc;
use crate::serial::Serial;


//------------ State ---------------------------------------------------------

/// The session and serial number identifying a version of the data set.
///
/// The session ID identifies one incarnation of the server. It is fixed for
/// the lifetime of the process so a reconnecting router can detect a
/// restart. The serial number identifies a version of the data within that
/// session.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct State {
    session: u16,
    serial: Serial,
}

impl State {
    /// Creates the state for a new session starting at serial 0.
    ///
    /// The session ID is derived from the current time, so two
    /// incarnations of the server started more than a second apart will
    /// use different sessions.
    pub fn new() -> Self {
        Self::from_parts(Utc::now().timestamp() as u16, Serial(0))
    }

    pub fn from_parts(session: u16, serial: Serial) -> Self {
        State { session, serial }
    }

    pub fn session(self) -> u16 {
        self.session
    }

    pub fn serial(self) -> Serial {
        self.serial
    }

    /// Returns the state with the serial number advanced by one.
    pub fn next(self) -> Self {
        State {
            session: self.session,
            serial: self.serial.next(),
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

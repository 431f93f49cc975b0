//! Error types.
//!
//! Errors are recovered at the smallest scope that can deal with them: a
//! failed database request fails only that request, a misbehaving router
//! loses only its own connection, and a failed refresh keeps the previous
//! snapshot. Only failures during startup end up as an [`Error`] that
//! terminates the process.

use std::{error, fmt, io};
use std::collections::TryReserveError;
use crate::db::DbError;


//------------ AllocationError -----------------------------------------------

/// A container could not grow its storage.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AllocationError;

impl From<TryReserveError> for AllocationError {
    fn from(_: TryReserveError) -> Self {
        AllocationError
    }
}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("failed to allocate memory")
    }
}

impl error::Error for AllocationError { }


//------------ Error ---------------------------------------------------------

/// An error that prevents the server from starting or running.
#[derive(Debug)]
pub enum Error {
    /// A container failed to grow.
    Allocation(AllocationError),

    /// A thread could not be created.
    ThreadCreation(io::Error),

    /// The database failed.
    Database(DbError),

    /// The listen socket failed.
    Io(io::Error),

    /// The configuration is unusable.
    Config(String),
}

impl From<AllocationError> for Error {
    fn from(err: AllocationError) -> Self {
        Error::Allocation(err)
    }
}

impl From<DbError> for Error {
    fn from(err: DbError) -> Self {
        Error::Database(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Allocation(ref err) => err.fmt(f),
            Error::ThreadCreation(ref err) => {
                write!(f, "failed to create thread: {}", err)
            }
            Error::Database(ref err) => write!(f, "database error: {}", err),
            Error::Io(ref err) => err.fmt(f),
            Error::Config(ref msg) => {
                write!(f, "invalid configuration: {}", msg)
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::Allocation(ref err) => Some(err),
            Error::ThreadCreation(ref err) => Some(err),
            Error::Database(ref err) => Some(err),
            Error::Io(ref err) => Some(err),
            Error::Config(_) => None,
        }
    }
}

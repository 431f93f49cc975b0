//! The global cache state.
//!
//! The current data set is published as an immutable [`Snapshot`] carrying
//! the session ID, the serial number, the VRPs themselves, and the time of
//! the refresh that produced it. A [`CacheState`] holds the current snapshot
//! behind an atomically swapped pointer: any number of connections can load
//! it without locking while the refresh loop replaces it wholesale. A reader
//! therefore always sees either the old or the new snapshot, never a mix of
//! both.

use std::sync::Arc;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::Mutex;
use crate::db::{Database, DbError};
use crate::payload::Dataset;
use crate::serial::Serial;
use crate::state::State;


//------------ Snapshot ------------------------------------------------------

/// One published version of the cache.
#[derive(Clone, Debug)]
pub struct Snapshot {
    state: State,
    dataset: Arc<Dataset>,
    refreshed: DateTime<Utc>,
}

impl Snapshot {
    pub fn state(&self) -> State {
        self.state
    }

    pub fn session(&self) -> u16 {
        self.state.session()
    }

    pub fn serial(&self) -> Serial {
        self.state.serial()
    }

    pub fn dataset(&self) -> &Arc<Dataset> {
        &self.dataset
    }

    /// Returns when the snapshot was last confirmed by a refresh.
    pub fn refreshed(&self) -> DateTime<Utc> {
        self.refreshed
    }
}


//------------ Refresh -------------------------------------------------------

/// The outcome of a successful refresh.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Refresh {
    /// The data hasn’t changed and the serial number stays the same.
    Unchanged,

    /// The data has changed and was published with the given state.
    Updated(State),
}


//------------ CacheState ----------------------------------------------------

#[derive(Debug)]
pub struct CacheState {
    current: ArcSwap<Snapshot>,

    /// Held while refreshing so there is only ever one writer.
    writer: Mutex<()>,
}

impl CacheState {
    /// Creates the cache state with a new session from the database.
    pub fn initialize<D: Database>(db: &mut D) -> Result<Self, DbError> {
        Self::initialize_with(db, State::new())
    }

    /// Creates the cache state with the given initial state.
    pub fn initialize_with<D: Database>(
        db: &mut D, state: State
    ) -> Result<Self, DbError> {
        let dataset = db.load_vrps()?;
        info!(
            "Cache initialized with {} VRPs, session {}, serial {}.",
            dataset.len(), state.session(), state.serial()
        );
        Ok(CacheState {
            current: ArcSwap::from_pointee(Snapshot {
                state,
                dataset: Arc::new(dataset),
                refreshed: Utc::now(),
            }),
            writer: Mutex::new(()),
        })
    }

    /// Returns the current snapshot.
    pub fn load(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Replaces the snapshot with the current data from the database.
    ///
    /// If the data has changed, the delta to the previous data is stored in
    /// the database under the next serial number before the new snapshot is
    /// published. If anything fails, the previous snapshot stays in place.
    pub fn refresh<D: Database>(
        &self, db: &mut D
    ) -> Result<Refresh, DbError> {
        let _writer = self.writer.lock();
        let current = self.current.load_full();
        let dataset = db.load_vrps()?;
        if dataset == *current.dataset {
            debug!(
                "Refresh found no changes, serial stays {}.", current.serial()
            );
            self.current.store(Arc::new(Snapshot {
                state: current.state,
                dataset: current.dataset.clone(),
                refreshed: Utc::now(),
            }));
            return Ok(Refresh::Unchanged)
        }
        let delta = current.dataset.delta_to(&dataset);
        let state = current.state.next();
        db.store_delta(state, &delta)?;
        self.current.store(Arc::new(Snapshot {
            state,
            dataset: Arc::new(dataset),
            refreshed: Utc::now(),
        }));
        info!(
            "Cache updated to serial {} with {} changes.",
            state.serial(), delta.len()
        );
        Ok(Refresh::Updated(state))
    }
}


//============ Testing =======================================================

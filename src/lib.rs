//! An RTR cache server.
//!
//! RPKI, the Resource Public Key Infrastructure, is a distributed database of
//! signed statements by entities that participate in Internet routing. A
//! typical setup to facilitate this information when making routing decisions
//! first collects and validates all statements into something called a
//! _local cache_ and distributes validated and normalized information from
//! the cache to the actual routers or route servers. The standardized
//! protocol for this distribution is the RPKI to Router Protocol or RTR for
//! short.
//!
//! This crate implements the cache side of RTR on top of plain operating
//! system threads. The validated data lives in a database accessed through
//! the traits in the [db] module. The current data set is kept in memory as
//! an atomically replaced snapshot, see the [cache] module, which is
//! refreshed periodically. Routers connecting to the server are answered
//! from that snapshot. Differences between versions of the data are
//! requested from the database by a pool of worker threads, see the [pool]
//! and [request] modules. The [orchestrator] module ties everything
//! together.
//!
//! The crate implements both versions 0 and 1 of the protocol. It does not,
//! currently, support router keys, though.
//!
//! You can read more about RPKI in [RFC 6480]. RTR is currently specified in
//! [RFC 8210].
//!
//! [cache]: cache/index.html
//! [db]: db/index.html
//! [orchestrator]: orchestrator/index.html
//! [pool]: pool/index.html
//! [request]: request/index.html
//! [RFC 6480]: https://tools.ietf.org/html/rfc6480
//! [RFC 8210]: https://tools.ietf.org/html/rfc8210

pub mod bag;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod orchestrator;
pub mod payload;
pub mod pdu;
pub mod pool;
pub mod queue;
pub mod request;
pub mod semaphore;
pub mod serial;
pub mod server;
pub mod state;

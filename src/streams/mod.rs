//! Stream transport.
//!
//! The planner only depends on the traits of this module: an ordered log which can be read from
//! a cursor, an ordered log which can be appended to, and a writer lease guarding who may append
//! corrective work. Appends made as a lease holder are fenced: the lease is checked atomically with
//! the write, so a writer which lost its lease mid-cycle can not append. The `SledStream` and `SledWriterLease` types implement these contracts on
//! top of the embedded database, and are what the planner runs against in production and tests.
//!
//! ## Cursors
//! Every record of a stream is assigned a `u64` offset on append, starting at `0` and strictly
//! increasing by `1`. A cursor is the offset of the next record to be read, so reading from
//! cursor `0` yields the entire stream, and a consumer which has processed the record at offset
//! `n` advances its cursor to `n + 1`.

mod lease;
mod log;
#[cfg(test)]
mod log_test;

use anyhow::Result;
use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::models::ExecutorId;

pub use lease::SledWriterLease;
pub use log::SledStream;

/// A record read from a stream along with its assigned offset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEntry<T> {
    /// The offset at which the record was written.
    pub offset: u64,
    /// The record itself.
    pub record: T,
}

/// The consumer side of an ordered stream.
pub trait StreamConsumer<T>: Send + Sync {
    /// Read up to `max` entries starting at the given cursor, in offset order.
    ///
    /// An empty vec is returned when no records exist at or beyond the cursor.
    fn read(&self, cursor: u64, max: usize) -> BoxFuture<'_, Result<Vec<StreamEntry<T>>>>;

    /// A signal of the stream's next offset, which changes whenever new records are appended.
    fn offset_signal(&self) -> watch::Receiver<u64>;
}

/// The producer side of an ordered stream.
pub trait StreamProducer<T>: Send + Sync {
    /// Append the given batch of records atomically, returning the offset of the last record
    /// written.
    ///
    /// Either all records of the batch are written or none are. An empty batch is rejected.
    fn append(&self, batch: Vec<T>) -> BoxFuture<'_, Result<u64>>;
}

/// The producer side of a stream guarded by a writer lease.
pub trait FencedProducer<T>: Send + Sync {
    /// Append the given batch atomically as `holder`, returning the offset of the last record
    /// written.
    ///
    /// The batch is only written if `holder` holds the stream's writer lease at `now`, as checked
    /// atomically with the write. Otherwise `AppError::LeaseNotHeld` is returned and nothing is
    /// written.
    fn append_fenced<'a>(&'a self, holder: &'a ExecutorId, now: u64, batch: Vec<T>) -> BoxFuture<'a, Result<u64>>;
}

/// Different states which a writer may be in with respect to a writer lease.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaderState {
    /// This writer holds the lease.
    Leading,
    /// A different writer currently holds the lease, identified by the encapsulated ID.
    Following(ExecutorId),
    /// The lease state is unknown, as no attempt to acquire the lease has succeeded yet.
    Standby,
}

/// A time-bounded, single-writer lease over a stream.
///
/// Durations and expirations are expressed in ticks of the caller's logical clock. Before
/// taking leadership actions, writers call `acquire_or_renew` to ensure the lease is still held.
pub trait WriterLease: Send + Sync {
    /// Acquire the lease if it is free or expired, or renew it if already held by `identity`.
    ///
    /// Returns `LeaderState::Leading` if the lease is held by `identity` until `now + duration`,
    /// else `LeaderState::Following` with the identity of the current holder.
    fn acquire_or_renew<'a>(&'a self, identity: &'a ExecutorId, now: u64, duration: u64) -> BoxFuture<'a, Result<LeaderState>>;
}

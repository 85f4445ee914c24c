use anyhow::{bail, Context, Result};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use sled::Tree;

use crate::database::Database;
use crate::error::AppError;
use crate::models::ExecutorId;
use crate::streams::{LeaderState, WriterLease};
use crate::utils;

/// The key under which a stream's writer lease is stored, in the same tree as its records.
pub(super) const KEY_WRITER_LEASE: &[u8; 1] = b"l";
/// The number of times a lease update is retried when it races with another writer.
const MAX_CAS_ATTEMPTS: usize = 8;

/// The stored form of a writer lease.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// The identity of the lease holder.
    pub holder: ExecutorId,
    /// The logical time at which the lease expires, if not renewed.
    pub expires_at: u64,
}

/// A writer lease stored in a stream's DB tree, updated via compare-and-swap.
///
/// Fenced appends to the stream check this same record in the transaction which writes them.
#[derive(Clone)]
pub struct SledWriterLease {
    tree: Tree,
}

impl SledWriterLease {
    pub(super) fn new(tree: Tree) -> Self {
        Self { tree }
    }

    #[tracing::instrument(level = "trace", skip(self, identity))]
    async fn try_acquire(&self, identity: ExecutorId, now: u64, duration: u64) -> Result<LeaderState> {
        let tree = self.tree.clone();
        let state = Database::spawn_blocking(move || -> Result<LeaderState> {
            for _ in 0..MAX_CAS_ATTEMPTS {
                let current = tree
                    .get(KEY_WRITER_LEASE)
                    .map_err(|err| AppError::StreamUnavailable(format!("error fetching writer lease: {}", err)))?;
                let record: Option<LeaseRecord> = current
                    .as_ref()
                    .map(|val| utils::decode_model(val).context("error decoding writer lease"))
                    .transpose()?;

                // If a different holder's lease is still live, then we follow.
                if let Some(record) = &record {
                    if record.holder != identity && record.expires_at > now {
                        return Ok(LeaderState::Following(record.holder.clone()));
                    }
                }

                let next = LeaseRecord {
                    holder: identity.clone(),
                    expires_at: now.saturating_add(duration),
                };
                let next_bytes = utils::encode_model(&next)?;
                let cas_res = tree
                    .compare_and_swap(KEY_WRITER_LEASE, current.as_ref(), Some(next_bytes))
                    .map_err(|err| AppError::StreamUnavailable(format!("error updating writer lease: {}", err)))?;
                if cas_res.is_ok() {
                    tree.flush()
                        .map_err(|err| AppError::StreamUnavailable(format!("error flushing writer lease: {}", err)))?;
                    return Ok(LeaderState::Leading);
                }
                tracing::debug!("writer lease changed concurrently, retrying");
            }
            bail!(AppError::StreamUnavailable("writer lease contention, could not acquire lease".into()))
        })
        .await??;
        Ok(state)
    }
}

/// Check that `holder` holds the given stored lease at time `now`.
pub(super) fn check_fence(current: Option<&[u8]>, holder: &ExecutorId, now: u64) -> std::result::Result<(), AppError> {
    let record: LeaseRecord = match current.map(utils::decode_model::<LeaseRecord>) {
        Some(Ok(record)) => record,
        Some(Err(err)) => return Err(AppError::StreamUnavailable(format!("error decoding writer lease: {:#}", err))),
        None => return Err(AppError::LeaseNotHeld(format!("{} can not append, no writer lease is recorded", holder))),
    };
    if &record.holder != holder {
        return Err(AppError::LeaseNotHeld(format!("{} can not append, writer lease is held by {}", holder, record.holder)));
    }
    if record.expires_at <= now {
        return Err(AppError::LeaseNotHeld(format!("{} can not append, writer lease expired at {}", holder, record.expires_at)));
    }
    Ok(())
}

impl WriterLease for SledWriterLease {
    fn acquire_or_renew<'a>(&'a self, identity: &'a ExecutorId, now: u64, duration: u64) -> BoxFuture<'a, Result<LeaderState>> {
        self.try_acquire(identity.clone(), now, duration).boxed()
    }
}

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Tree;
use tokio::sync::watch;

use crate::database::Database;
use crate::error::{AppError, ShutdownError, ERR_DB_FLUSH, ERR_ITER_FAILURE};
use crate::models::ExecutorId;
use crate::streams::lease::{check_fence, SledWriterLease, KEY_WRITER_LEASE};
use crate::streams::{FencedProducer, StreamConsumer, StreamEntry, StreamProducer};
use crate::utils;

/// The key prefix used for storing stream records.
///
/// NOTE: in order to preserve lexicographical ordering of keys, it is important to always use
/// the `utils::encode_byte_prefix*` methods.
pub const PREFIX_STREAM_RECORD: &[u8; 1] = b"r";
/// The key used to store the next offset to be assigned by the stream.
pub const KEY_STREAM_NEXT_OFFSET: &[u8; 1] = b"n";

/// An ordered, append-only stream of records stored in a DB tree.
///
/// Records are keyed as `r{offset}` with the offset encoded big-endian, so a range scan over the
/// record prefix yields records in offset order.
pub struct SledStream<T> {
    /// The DB tree holding this stream's records.
    tree: Tree,
    /// The next offset to be assigned, guarded for the duration of an append.
    next_offset: Arc<Mutex<u64>>,
    /// A channel used for communicating the stream's next offset value.
    offset_signal: watch::Sender<u64>,
    /// Held so that sending on `offset_signal` always succeeds.
    offset_signal_rx: watch::Receiver<u64>,
    _record: PhantomData<fn() -> T>,
}

impl<T> SledStream<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    /// Create a new instance, recovering the stream's next offset from disk.
    pub async fn new(tree: Tree) -> Result<Self> {
        let next_offset = recover_next_offset(tree.clone()).await?;
        let (offset_signal, offset_signal_rx) = watch::channel(next_offset);
        Ok(Self {
            tree,
            next_offset: Arc::new(Mutex::new(next_offset)),
            offset_signal,
            offset_signal_rx,
            _record: PhantomData,
        })
    }

    /// A writer lease over this stream, stored alongside its records.
    pub fn writer_lease(&self) -> SledWriterLease {
        SledWriterLease::new(self.tree.clone())
    }

    /// Write a batch of records to the stream, returning the offset of the last record written.
    ///
    /// When a fence is given, the batch is only written if the fence's holder holds this stream's
    /// writer lease at the fence's time, checked atomically with the write itself.
    #[tracing::instrument(level = "trace", skip(self, batch))]
    async fn write_batch(&self, batch: Vec<T>, fence: Option<(ExecutorId, u64)>) -> Result<u64> {
        if batch.is_empty() {
            bail!(AppError::InvalidInput("entries batch was empty, no-op".into()));
        }
        let (tree, next_offset) = (self.tree.clone(), self.next_offset.clone());
        let (last_offset, next) = Database::spawn_blocking(move || -> Result<(u64, u64)> {
            let mut next_offset = next_offset.lock().map_err(|_| anyhow!("stream offset lock poisoned"))?;

            // Assign an offset to each entry in the payload.
            let mut offset = *next_offset;
            let mut records = Vec::with_capacity(batch.len());
            for record in batch.iter() {
                let entry = utils::encode_model(record).context("error encoding stream record for storage")?;
                records.push((utils::encode_byte_prefix(PREFIX_STREAM_RECORD, offset), entry));
                offset += 1;
            }
            let next_offset_bytes = utils::encode_u64(offset);

            match &fence {
                None => {
                    let mut write_batch = sled::Batch::default();
                    for (key, entry) in records.iter() {
                        write_batch.insert(&key[..], entry.as_slice());
                    }
                    write_batch.insert(KEY_STREAM_NEXT_OFFSET, &next_offset_bytes);
                    tree.apply_batch(write_batch)
                        .map_err(|err| AppError::StreamUnavailable(format!("error applying write batch: {}", err)))?;
                }
                Some((holder, now)) => {
                    tree.transaction(|tx| {
                        let lease = tx.get(KEY_WRITER_LEASE)?;
                        if let Err(err) = check_fence(lease.as_deref(), holder, *now) {
                            return Err(ConflictableTransactionError::Abort(err));
                        }
                        for (key, entry) in records.iter() {
                            tx.insert(&key[..], entry.as_slice())?;
                        }
                        tx.insert(&KEY_STREAM_NEXT_OFFSET[..], &next_offset_bytes[..])?;
                        Ok::<_, ConflictableTransactionError<AppError>>(())
                    })
                    .map_err(|err| match err {
                        TransactionError::Abort(err) => err,
                        TransactionError::Storage(err) => AppError::StreamUnavailable(format!("error applying fenced write batch: {}", err)),
                    })?;
                }
            }
            tree.flush()
                .map_err(|err| AppError::StreamUnavailable(format!("{}: {}", ERR_DB_FLUSH, err)))?;

            *next_offset = offset;
            Ok((offset - 1, offset))
        })
        .await??;

        tracing::debug!(last_offset, "finished writing data to stream");
        let _ = self.offset_signal.send(next);
        Ok(last_offset)
    }

    /// Fetch up to `max` records starting at the given cursor.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn fetch(&self, cursor: u64, max: usize) -> Result<Vec<StreamEntry<T>>> {
        let tree = self.tree.clone();
        Database::spawn_blocking(move || -> Result<Vec<StreamEntry<T>>> {
            let (start, stop) = (
                &utils::encode_byte_prefix(PREFIX_STREAM_RECORD, cursor),
                &utils::encode_byte_prefix(PREFIX_STREAM_RECORD, u64::MAX),
            );
            let mut entries = Vec::with_capacity(max.min(1024));
            for kv_res in tree.range::<_, std::ops::RangeInclusive<&[u8]>>(start..=stop).take(max) {
                let (key, val) = kv_res
                    .map_err(|err| AppError::StreamUnavailable(format!("{}: {}", ERR_ITER_FAILURE, err)))?;
                let offset = utils::decode_u64(&key[1..])
                    .context("error decoding stream record offset, data corrupted")
                    .map_err(ShutdownError::from)?;
                let record: T = utils::decode_model(&val)
                    .context("error decoding stream record, data corrupted")
                    .map_err(ShutdownError::from)?;
                entries.push(StreamEntry { offset, record });
            }
            Ok(entries)
        })
        .await?
    }
}

impl<T> StreamConsumer<T> for SledStream<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn read(&self, cursor: u64, max: usize) -> BoxFuture<'_, Result<Vec<StreamEntry<T>>>> {
        self.fetch(cursor, max).boxed()
    }

    fn offset_signal(&self) -> watch::Receiver<u64> {
        self.offset_signal_rx.clone()
    }
}

impl<T> StreamProducer<T> for SledStream<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn append(&self, batch: Vec<T>) -> BoxFuture<'_, Result<u64>> {
        self.write_batch(batch, None).boxed()
    }
}

impl<T> FencedProducer<T> for SledStream<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn append_fenced<'a>(&'a self, holder: &'a ExecutorId, now: u64, batch: Vec<T>) -> BoxFuture<'a, Result<u64>> {
        self.write_batch(batch, Some((holder.clone(), now))).boxed()
    }
}

/// Recover the next offset of the stream stored in the given tree.
async fn recover_next_offset(tree: Tree) -> Result<u64> {
    let val = Database::spawn_blocking(move || -> Result<u64> {
        let next_offset = tree
            .get(KEY_STREAM_NEXT_OFFSET)
            .context("error fetching next offset key during recovery")?
            .map(|val| utils::decode_u64(&val).context("error decoding next offset value from storage"))
            .transpose()?
            .unwrap_or(0);
        Ok(next_offset)
    })
    .await??;
    Ok(val)
}

use anyhow::{Context, Result};
use rand::prelude::*;

use crate::config::Config;
use crate::database::Database;
use crate::error::AppError;
use crate::streams::{SledStream, StreamConsumer, StreamProducer};

async fn setup_stream() -> Result<(SledStream<String>, Database, tempfile::TempDir)> {
    let (config, tmpdir) = Config::new_test()?;
    let db = Database::new(config).await?;
    let tree = db.get_tasks_tree().await?;
    let stream = SledStream::new(tree).await?;
    Ok((stream, db, tmpdir))
}

fn records(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|idx| format!("{}-{}", prefix, idx)).collect()
}

#[tokio::test]
async fn append_assigns_sequential_offsets() -> Result<()> {
    let (stream, _db, _tmpdir) = setup_stream().await?;

    let last_offset = stream.append(records("a", 3)).await?;
    assert_eq!(last_offset, 2, "expected last offset of first batch to be 2, got {}", last_offset);
    let last_offset = stream.append(records("b", 2)).await?;
    assert_eq!(last_offset, 4, "expected last offset of second batch to be 4, got {}", last_offset);

    let entries = stream.read(0, 100).await?;
    assert_eq!(entries.len(), 5, "expected 5 entries, got {}", entries.len());
    for (idx, entry) in entries.iter().enumerate() {
        assert_eq!(entry.offset, idx as u64, "expected entry offset {}, got {}", idx, entry.offset);
    }
    assert_eq!(entries[3].record, "b-0", "unexpected record at offset 3, got {}", entries[3].record);

    Ok(())
}

#[tokio::test]
async fn read_honors_cursor_and_max() -> Result<()> {
    let (stream, _db, _tmpdir) = setup_stream().await?;
    stream.append(records("a", 10)).await?;

    let entries = stream.read(4, 3).await?;
    let offsets: Vec<_> = entries.iter().map(|entry| entry.offset).collect();
    assert_eq!(offsets, vec![4, 5, 6], "unexpected offsets read from cursor 4 with max 3, got {:?}", offsets);

    let entries = stream.read(10, 3).await?;
    assert!(entries.is_empty(), "expected no entries at cursor beyond the end of the stream, got {:?}", entries);

    Ok(())
}

#[tokio::test]
async fn append_rejects_empty_batch() -> Result<()> {
    let (stream, _db, _tmpdir) = setup_stream().await?;

    let err = stream.append(vec![]).await.err().context("expected empty batch to be rejected")?;

    assert!(
        matches!(err.downcast_ref::<AppError>(), Some(AppError::InvalidInput(_))),
        "expected an invalid input error, got {:?}",
        err
    );
    let entries = stream.read(0, 10).await?;
    assert!(entries.is_empty(), "expected empty batch to write nothing, got {:?}", entries);
    Ok(())
}

#[tokio::test]
async fn offset_signal_reflects_appends() -> Result<()> {
    let (stream, _db, _tmpdir) = setup_stream().await?;
    let mut signal = stream.offset_signal();
    assert_eq!(*signal.borrow(), 0, "expected initial offset signal of 0");

    stream.append(records("a", 4)).await?;

    signal.changed().await.context("offset signal closed")?;
    let next_offset = *signal.borrow();
    assert_eq!(next_offset, 4, "expected offset signal of 4 after appending 4 records, got {}", next_offset);
    Ok(())
}

#[tokio::test]
async fn next_offset_is_recovered_from_disk() -> Result<()> {
    let (stream, db, _tmpdir) = setup_stream().await?;
    stream.append(records("a", 3)).await?;
    drop(stream);

    let stream: SledStream<String> = SledStream::new(db.get_tasks_tree().await?).await?;
    let next_offset = *stream.offset_signal().borrow();
    assert_eq!(next_offset, 3, "expected recovered next offset of 3, got {}", next_offset);
    let last_offset = stream.append(records("b", 1)).await?;
    assert_eq!(last_offset, 3, "expected append after recovery to be written at offset 3, got {}", last_offset);

    Ok(())
}

#[tokio::test]
async fn bounded_reads_visit_every_record_in_order() -> Result<()> {
    let (stream, _db, _tmpdir) = setup_stream().await?;
    let total = rand::thread_rng().gen_range(50..100);
    for chunk in records("a", total).chunks(7) {
        stream.append(chunk.to_vec()).await?;
    }

    let (mut cursor, mut seen) = (0u64, vec![]);
    loop {
        let entries = stream.read(cursor, 10).await?;
        let last = match entries.last() {
            Some(last) => last.offset,
            None => break,
        };
        assert!(entries.len() <= 10, "expected at most 10 entries per read, got {}", entries.len());
        seen.extend(entries.into_iter().map(|entry| entry.record));
        cursor = last + 1;
    }

    assert_eq!(seen, records("a", total), "expected bounded reads to yield every record in order");
    assert_eq!(cursor, total as u64, "expected final cursor of {}, got {}", total, cursor);
    Ok(())
}

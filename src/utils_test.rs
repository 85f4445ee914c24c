use anyhow::{Context, Result};

use crate::config::Config;
use crate::database::Database;
use crate::models::{ExecutorId, TaskExecutorState, UnitName, UnitVersion};
use crate::utils;

const ERR_MSG_ITER: &str = "error iterating scanned data";
const NUM_ENTRIES: u64 = 1_001;
const PREFIX_A: &[u8; 1] = b"a";
/// We use this in tests as it is middle in lexicographical sort order.
const PREFIX_B: &[u8; 1] = b"b";
const PREFIX_C: &[u8; 1] = b"c";

#[tokio::test]
async fn test_exhaustive_scan_prefix_and_range_behavior() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let tree = db.get_tasks_tree().await?;

    // Load data distributed across three key prefixes which are used to assert correctness of
    // range scans and prefix scans, which depend upon the correctness of key encoding.
    load_data(&tree)?;

    // Assert that prefix scan finds the correct amount of data.
    let mut count = 0;
    for kv_res in tree.scan_prefix(PREFIX_B) {
        let (key, val) = kv_res.context(ERR_MSG_ITER)?;
        assert_eq!(key[0], PREFIX_B[0], "bad key prefix: got {}; expected: {};", key[0], PREFIX_B[0]);
        count += 1;
        let _key = utils::decode_u64(&key[1..])?;
        let _val = utils::decode_u64(&val)?;
    }
    assert_eq!(count, NUM_ENTRIES, "expected scan_prefix to find {} entries, got {}", NUM_ENTRIES, count);

    // Assert that range scans preserve sort order based on our key prefix strategy.
    let (start, stop, mut count, mut current_offset) = (PREFIX_B, PREFIX_C, 0, 0u64);
    for kv_res in tree.range::<_, std::ops::Range<&[u8]>>(start..stop) {
        let (key, val) = kv_res.context(ERR_MSG_ITER)?;
        assert_eq!(key[0], PREFIX_B[0], "bad key prefix: got {}; expected: {};", key[0], PREFIX_B[0]);
        count += 1;
        let key = utils::decode_u64(&key[1..])?;
        let val = utils::decode_u64(&val)?;
        assert_eq!(key, current_offset, "db.range with prefix iterated out of order, expected key {} got {}", current_offset, key);
        assert_eq!(val, current_offset, "db.range with prefix iterated out of order, expected val {} got {}", current_offset, val);
        current_offset += 1;
    }
    assert_eq!(count, NUM_ENTRIES, "expected range to find {} entries, got {}", NUM_ENTRIES, count);

    Ok(())
}

#[test]
fn decode_u64_rejects_invalid_len() {
    let res = utils::decode_u64(&[0u8; 7]);
    assert!(res.is_err(), "expected decode_u64 to reject a 7 byte buffer");
}

#[test]
fn model_encoding_is_stable_for_identical_inputs() -> Result<()> {
    let mut snapshot = TaskExecutorState {
        executor_id: ExecutorId::new("grid://hosts/e1")?,
        units: Default::default(),
        last_task_id: None,
        timestamp: 42,
    };
    snapshot.units.insert(UnitName::from("unitB"), UnitVersion::from("v1"));
    snapshot.units.insert(UnitName::from("unitA"), UnitVersion::from("v2"));

    let first = utils::encode_model(&snapshot)?;
    let second = utils::encode_model(&snapshot.clone())?;
    let decoded: TaskExecutorState = utils::decode_model(&first)?;

    assert_eq!(first, second, "expected identical models to encode to identical bytes");
    assert_eq!(decoded, snapshot, "expected decoded model to match the original");
    Ok(())
}

fn load_data(db: &sled::Tree) -> Result<()> {
    for prefix in [PREFIX_A, PREFIX_B, PREFIX_C] {
        let mut batch = sled::Batch::default();
        for offset in 0..NUM_ENTRIES {
            let key = utils::encode_byte_prefix(prefix, offset);
            batch.insert(&key, &utils::encode_u64(offset));
        }
        db.apply_batch(batch).context("error inserting data")?;
    }
    db.flush().context("error flusing data")?;
    Ok(())
}

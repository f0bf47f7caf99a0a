//! End-to-end aggregation scenarios and batch boundaries.
//!
//! Every test drives the full path: construct, start, queue one or more
//! batches, drain, collect.

use std::sync::Arc;

use stragg_core::{
    AggregateResult, Aggregator, AggregatorConfig, AggregatorState, BatchBuilder, Error, ErrorKind,
};

fn count_config() -> AggregatorConfig {
    AggregatorConfig::new("COUNT")
        .with_table_capacity(256)
        .with_arena_capacity(16 * 1024)
        .with_batch_limits(1024, 64 * 1024)
}

fn uniq_config() -> AggregatorConfig {
    AggregatorConfig::new("uniqHLL12")
        .with_table_capacity(16)
        .with_arena_capacity(1024)
        .with_batch_limits(2048, 64 * 1024)
}

fn run(config: AggregatorConfig, batches: &[BatchBuilder]) -> Result<Arc<AggregateResult>, Error> {
    let agg = Aggregator::new(config)?;
    agg.start_processing()?;
    for batch in batches {
        agg.queue_data(&batch.as_batch(), 2)?;
    }
    agg.wait_processed()?;
    agg.get_result()
}

fn keys_batch(keys: &[&str]) -> BatchBuilder {
    keys.iter().map(|k| (*k, "")).collect()
}

#[test]
fn test_count_small_batch() {
    let batch: BatchBuilder = ["a", "b", "a", "a", "c"].iter().map(|k| (*k, "x")).collect();
    let result = run(count_config(), &[batch]).unwrap();
    assert_eq!(result.len(), 3);
    assert_eq!(result.get(b"a"), Some(3));
    assert_eq!(result.get(b"b"), Some(1));
    assert_eq!(result.get(b"c"), Some(1));
}

#[test]
fn test_count_same_key_across_batches() {
    let half: BatchBuilder = std::iter::repeat(("k", "v")).take(500).collect();
    let result = run(count_config(), &[half.clone(), half]).unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result.get(b"k"), Some(1000));
}

#[test]
fn test_uniq_distinct_values() {
    let batch: BatchBuilder = (1..=1000).map(|i| ("g", format!("v{i}"))).collect();
    let result = run(uniq_config(), &[batch]).unwrap();
    assert_eq!(result.len(), 1);
    let estimate = result.get(b"g").unwrap();
    assert!((950..=1050).contains(&estimate), "estimate {estimate}");
}

#[test]
fn test_uniq_repeated_value() {
    let batch: BatchBuilder = std::iter::repeat(("g", "v")).take(1000).collect();
    let result = run(uniq_config(), &[batch]).unwrap();
    assert_eq!(result.get(b"g"), Some(1));
}

#[test]
fn test_table_capacity_exceeded() {
    let config = count_config().with_table_capacity(2);
    let agg = Aggregator::new(config).unwrap();
    agg.start_processing().unwrap();
    agg.queue_data(&keys_batch(&["x", "y", "z"]).as_batch(), 1).unwrap();

    let err = agg.wait_processed().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TableCapacityExceeded);
    assert!(err.to_string().starts_with("[SAG-3001]"));
    assert_eq!(agg.state(), AggregatorState::Faulted);
    assert_eq!(agg.get_result().unwrap_err().kind(), ErrorKind::StateMisuse);
}

#[test]
fn test_batch_order_does_not_matter() {
    let b1 = keys_batch(&["a", "b", "a"]);
    let b2 = keys_batch(&["c", "a", "", "b"]);
    let forward = run(count_config(), &[b1.clone(), b2.clone()]).unwrap();
    let backward = run(count_config(), &[b2, b1]).unwrap();
    assert_eq!(*forward, *backward);
    assert_eq!(forward.get(b""), Some(1));
}

#[test]
fn test_empty_input() {
    let result = run(count_config(), &[]).unwrap();
    assert!(result.is_empty());
    let result = run(count_config(), &[BatchBuilder::new()]).unwrap();
    assert!(result.is_empty());
}

#[test]
fn test_single_record() {
    let result = run(count_config(), &[keys_batch(&["only"])]).unwrap();
    let pairs: Vec<_> = result.iter_finalized().collect();
    assert_eq!(pairs, vec![(&b"only"[..], 1)]);
}

#[test]
fn test_one_byte_and_maximum_length_keys() {
    let max_bytes = 4096;
    let long = "L".repeat(max_bytes - 1);
    let config = count_config()
        .with_batch_limits(16, max_bytes)
        .with_arena_capacity(2 * max_bytes);

    let mut one_byte = BatchBuilder::new();
    for b in b'a'..=b'p' {
        one_byte.push(&[b], b"");
    }
    let mut longest = BatchBuilder::new();
    longest.push(long.as_bytes(), b"");

    let result = run(config, &[one_byte, longest.clone(), longest]).unwrap();
    assert_eq!(result.len(), 17);
    assert_eq!(result.get(b"a"), Some(1));
    assert_eq!(result.get(long.as_bytes()), Some(2));
}

#[test]
fn test_batch_limits_are_inclusive() {
    let config = count_config().with_batch_limits(4, 16);
    let agg = Aggregator::new(config).unwrap();
    agg.start_processing().unwrap();

    // Exactly 4 records and 16 key bytes.
    let exact = keys_batch(&["aaa", "bbb", "ccc", "ddd"]);
    assert_eq!(exact.keys_bytes(), 16);
    agg.queue_data(&exact.as_batch(), 1).unwrap();

    let too_many = keys_batch(&["a", "b", "c", "d", "e"]);
    let err = agg.queue_data(&too_many.as_batch(), 1).unwrap_err();
    assert!(matches!(err, Error::BatchTooLarge { limit: "batch_max_records", actual: 5, max: 4 }));

    let too_wide = keys_batch(&["aaa", "bbb", "ccc", "dddd"]);
    let err = agg.queue_data(&too_wide.as_batch(), 1).unwrap_err();
    assert!(matches!(err, Error::BatchTooLarge { limit: "batch_max_bytes", actual: 17, max: 16 }));

    // Rejected batches have no side effects.
    assert_eq!(agg.state(), AggregatorState::Open);
    assert_eq!(agg.stats().batches, 1);
    agg.wait_processed().unwrap();
    let result = agg.get_result().unwrap();
    assert_eq!(result.len(), 4);
    assert_eq!(result.get(b"dddd"), None);
}

#[test]
fn test_full_table_then_one_more_key() {
    let keys: Vec<String> = (0..9).map(|i| format!("key-{i}")).collect();
    let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
    let config = count_config().with_table_capacity(8);

    let full = run(config.clone(), &[keys_batch(&refs[..8]), keys_batch(&refs[..8])]).unwrap();
    assert_eq!(full.len(), 8);
    assert!(full.iter_finalized().all(|(_, n)| n == 2));

    let err = run(config, &[keys_batch(&refs)]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TableCapacityExceeded);
}

#[test]
fn test_serial_single_stream() {
    let config = count_config().with_chunks(1);
    let batches: Vec<BatchBuilder> = (0..10).map(|_| keys_batch(&["s", "t"])).collect();
    let result = run(config, &batches).unwrap();
    assert_eq!(result.get(b"s"), Some(10));
    assert_eq!(result.get(b"t"), Some(10));
}

//! Property tests: device results against the host reference aggregator.
//!
//! The device result must not depend on record order, batch boundaries or
//! stream interleaving, and must equal the host reference state for state
//! (both functions are deterministic given the multiset of inputs).

use std::sync::Arc;

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use stragg_core::{
    AggregateFunction, AggregateResult, Aggregator, AggregatorConfig, BatchBuilder, HostAggregator,
};

type Record = (String, String);

fn config(function: AggregateFunction) -> AggregatorConfig {
    AggregatorConfig::new(function.name())
        .with_chunks(3)
        .with_table_capacity(512)
        .with_arena_capacity(64 * 1024)
        .with_batch_limits(8192, 256 * 1024)
        .with_memcpy_threads(4)
}

fn device(function: AggregateFunction, records: &[Record], batch_len: usize) -> Arc<AggregateResult> {
    let agg = Aggregator::new(config(function)).unwrap();
    agg.start_processing().unwrap();
    for chunk in records.chunks(batch_len.max(1)) {
        let batch: BatchBuilder = chunk.iter().map(|(k, v)| (k, v)).collect();
        agg.queue_data(&batch.as_batch(), 4).unwrap();
    }
    agg.wait_processed().unwrap();
    agg.get_result().unwrap()
}

fn host(function: AggregateFunction, records: &[Record]) -> AggregateResult {
    let mut agg = HostAggregator::new(function);
    for (k, v) in records {
        agg.update(k.as_bytes(), v.as_bytes());
    }
    agg.finish()
}

fn records_strategy() -> impl Strategy<Value = Vec<Record>> {
    prop::collection::vec(("[a-h]{0,4}", "[a-z0-9]{0,6}"), 0..400)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_count_matches_host(records in records_strategy(), batch_len in 1usize..64) {
        let result = device(AggregateFunction::Count, &records, batch_len);
        prop_assert_eq!(&*result, &host(AggregateFunction::Count, &records));

        let total: u64 = result.iter_finalized().map(|(_, n)| n).sum();
        prop_assert_eq!(total, records.len() as u64);
    }

    #[test]
    fn prop_uniq_matches_host(records in records_strategy(), batch_len in 1usize..64) {
        let result = device(AggregateFunction::UniqHll12, &records, batch_len);
        prop_assert_eq!(&*result, &host(AggregateFunction::UniqHll12, &records));
    }

    #[test]
    fn prop_batching_invariance(records in records_strategy(), a in 1usize..32, b in 32usize..512) {
        let small = device(AggregateFunction::Count, &records, a);
        let large = device(AggregateFunction::Count, &records, b);
        prop_assert_eq!(&*small, &*large);
    }

    #[test]
    fn prop_merge_of_split_input(records in records_strategy(), split in 0usize..400) {
        let split = split.min(records.len());
        let (left, right) = records.split_at(split);
        let merged = device(AggregateFunction::UniqHll12, left, 16)
            .merge(&device(AggregateFunction::UniqHll12, right, 16))
            .unwrap();
        let whole = device(AggregateFunction::UniqHll12, &records, 16);
        prop_assert_eq!(&merged, &*whole);
    }
}

fn random_workload(rng: &mut StdRng, records: usize, keys: usize) -> Vec<Record> {
    (0..records)
        .map(|_| {
            let k = rng.random_range(0..keys);
            let v = rng.random_range(0..1_000u32);
            (format!("key-{k:05}"), format!("{v}"))
        })
        .collect()
}

#[test]
fn test_shuffled_large_batches() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut records = random_workload(&mut rng, 40_000, 300);

    // 8192-record batches exceed the inline packing threshold.
    let forward = device(AggregateFunction::Count, &records, 8192);
    records.shuffle(&mut rng);
    let shuffled = device(AggregateFunction::Count, &records, 8192);
    records.reverse();
    let reversed = device(AggregateFunction::Count, &records, 1000);

    assert_eq!(*forward, *shuffled);
    assert_eq!(*forward, *reversed);
    assert_eq!(*forward, host(AggregateFunction::Count, &records));
    assert_eq!(forward.len(), 300);
}

#[test]
fn test_unique_key_count() {
    let mut rng = StdRng::seed_from_u64(7);
    let records = random_workload(&mut rng, 5_000, 450);
    let distinct: std::collections::HashSet<&str> = records.iter().map(|(k, _)| k.as_str()).collect();

    let result = device(AggregateFunction::UniqHll12, &records, 777);
    assert_eq!(result.len(), distinct.len());
    assert_eq!(result.to_hash_map().len(), distinct.len());
}

#[test]
fn test_get_result_is_stable() {
    let mut rng = StdRng::seed_from_u64(11);
    let records = random_workload(&mut rng, 2_000, 50);
    let agg = Aggregator::new(config(AggregateFunction::Count)).unwrap();
    agg.start_processing().unwrap();
    let batch: BatchBuilder = records.iter().map(|(k, v)| (k, v)).collect();
    agg.queue_data(&batch.as_batch(), 2).unwrap();
    agg.wait_processed().unwrap();

    let first = agg.get_result().unwrap();
    let second = agg.get_result().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.to_hash_map(), second.to_hash_map());
}

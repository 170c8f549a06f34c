//! Weight cache behaviour through the public API

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{pools, weights, CPU, GPU, KIB};
use memforge::cache::MigrationControl;
use memforge::{CacheConfig, ForgeResult, MemForgeError, ModelWeightCache, WeightCodec};
use proptest::prelude::*;

fn cache(capacity: usize) -> ModelWeightCache {
    ModelWeightCache::new(CacheConfig::new(capacity), pools(64 * KIB, 64 * KIB)).unwrap()
}

#[test]
fn test_lru_order_across_models() {
    let cache = cache(3 * KIB);
    cache.put("llama", "l0", &weights(KIB, 0)).unwrap();
    cache.put("mistral", "l0", &weights(KIB, 1)).unwrap();
    cache.put("llama", "l1", &weights(KIB, 2)).unwrap();

    // llama/l0 becomes most recent, mistral/l0 is now the oldest
    assert!(cache.get("llama", "l0").unwrap().is_some());
    cache.put("phi", "l0", &weights(KIB, 3)).unwrap();

    assert!(!cache.contains("mistral", "l0"));
    assert!(cache.contains("llama", "l0"));
    assert!(cache.contains("llama", "l1"));
    assert!(cache.contains("phi", "l0"));
    assert_eq!(cache.model_layers("llama"), vec!["l1", "l0"]);
}

#[test]
fn test_model_pin_protects_every_layer() {
    let cache = cache(2 * KIB);
    cache.put("hot", "l0", &weights(KIB, 0)).unwrap();
    cache.put("hot", "l1", &weights(KIB, 1)).unwrap();
    cache.pin_model("hot").unwrap();

    match cache.put("cold", "l0", &weights(KIB, 2)) {
        Err(MemForgeError::CacheExhausted { needed, evictable }) => {
            assert_eq!(needed, KIB);
            assert_eq!(evictable, 0);
        }
        other => panic!("expected CacheExhausted, got {:?}", other),
    }

    assert!(cache.unpin_model("hot").unwrap());
    cache.put("cold", "l0", &weights(KIB, 2)).unwrap();
    assert!(!cache.contains("hot", "l0"));
    assert!(cache.contains("hot", "l1"));
}

#[test]
fn test_entry_budget_evicts_by_count() {
    let cache = ModelWeightCache::new(
        CacheConfig::new(64 * KIB).with_max_entries(2),
        pools(64 * KIB, 64 * KIB),
    )
    .unwrap();

    for i in 0..4 {
        cache.put("m", &format!("l{}", i), &weights(64, i)).unwrap();
    }
    let stats = cache.stats().unwrap();
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.evictions, 2);
    assert_eq!(cache.model_layers("m"), vec!["l2", "l3"]);
}

#[test]
fn test_stats_track_hits_and_misses() {
    let cache = cache(8 * KIB);
    cache.put("m", "l0", &weights(100, 0)).unwrap();
    cache.get("m", "l0").unwrap();
    cache.get("m", "l0").unwrap();
    cache.get("m", "missing").unwrap();

    let stats = cache.stats().unwrap();
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.insertions, 1);
    assert_eq!(stats.used_bytes, 100);
    assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
}

#[test]
fn test_invalidate_returns_memory_to_pool() {
    let cache = cache(8 * KIB);
    for i in 0..4 {
        cache.put("m", &format!("l{}", i), &weights(KIB, i)).unwrap();
    }
    assert!(cache.pools().get_pool_stats(GPU).unwrap().used_bytes >= 4 * KIB);

    assert_eq!(cache.invalidate_model("m").unwrap(), 4);
    assert_eq!(cache.used_bytes(), 0);
    assert_eq!(cache.pools().get_pool_stats(GPU).unwrap().used_bytes, 0);
    assert!(cache.model_device("m").is_none());
}

/// Stores runs as (count, byte) pairs
#[derive(Debug)]
struct RunLengthCodec;

impl WeightCodec for RunLengthCodec {
    fn name(&self) -> &str {
        "rle"
    }

    fn encode(&self, data: &[u8]) -> ForgeResult<Vec<u8>> {
        let mut out = Vec::new();
        for chunk in data.chunk_by(|a, b| a == b) {
            for run in chunk.chunks(255) {
                out.push(run.len() as u8);
                out.push(run[0]);
            }
        }
        Ok(out)
    }

    fn decode(&self, data: &[u8]) -> ForgeResult<Vec<u8>> {
        if data.len() % 2 != 0 {
            return Err(MemForgeError::Internal("truncated run".to_string()));
        }
        Ok(data
            .chunks(2)
            .flat_map(|pair| std::iter::repeat(pair[1]).take(pair[0] as usize))
            .collect())
    }
}

#[test]
fn test_codec_budget_counts_stored_bytes() {
    let cache = cache(KIB).with_codec(Arc::new(RunLengthCodec));
    let zeros = vec![0u8; 4 * KIB];

    // 4 KiB of zeros encodes to 17 runs, well inside a 1 KiB budget
    cache.put("m", "sparse", &zeros).unwrap();
    assert_eq!(cache.used_bytes(), 34);
    assert_eq!(cache.get("m", "sparse").unwrap().unwrap(), zeros);
}

#[test]
fn test_migration_moves_bytes_between_pools() {
    let cache = cache(16 * KIB);
    for i in 0..3 {
        cache.put("m", &format!("l{}", i), &weights(2 * KIB, i)).unwrap();
    }

    let report = cache.migrate_model("m", CPU, &MigrationControl::new()).unwrap();
    assert_eq!(report.entries, 3);
    assert_eq!(report.bytes, 6 * KIB);
    assert_eq!(cache.model_device("m"), Some(CPU));
    assert_eq!(cache.pools().get_pool_stats(GPU).unwrap().used_bytes, 0);
    assert!(cache.pools().get_pool_stats(CPU).unwrap().used_bytes >= 6 * KIB);

    for i in 0..3 {
        assert_eq!(
            cache.get("m", &format!("l{}", i)).unwrap().unwrap(),
            weights(2 * KIB, i)
        );
    }

    // New layers follow the model to its new device
    cache.put("m", "l3", &weights(KIB, 3)).unwrap();
    assert_eq!(cache.pools().get_pool_stats(GPU).unwrap().used_bytes, 0);
}

#[test]
fn test_layer_added_mid_migration_aborts_commit() {
    let cache = cache(16 * KIB);
    cache.put("m", "l0", &weights(KIB, 0)).unwrap();

    // A request caches another layer while the copy is under way
    let added = AtomicBool::new(false);
    let late_put = || {
        if !added.swap(true, Ordering::SeqCst) {
            cache.put("m", "late", &weights(KIB, 1)).unwrap();
        }
        false
    };
    let control = MigrationControl::new().with_cancel(&late_put);

    match cache.migrate_model("m", CPU, &control) {
        Err(MemForgeError::OffloadFailure { reason, .. }) => {
            assert!(reason.contains("changed during migration"), "{}", reason);
        }
        other => panic!("expected OffloadFailure, got {:?}", other),
    }
    assert!(added.load(Ordering::SeqCst));

    // Nothing split: both layers stay on the source device
    assert_eq!(cache.model_device("m"), Some(GPU));
    assert_eq!(cache.pools().get_pool_stats(CPU).unwrap().used_bytes, 0);
    assert_eq!(cache.pools().get_pool_stats(GPU).unwrap().used_bytes, 2 * KIB);
    assert_eq!(cache.get("m", "late").unwrap().unwrap(), weights(KIB, 1));

    // A clean retry moves the whole model
    let report = cache.migrate_model("m", CPU, &MigrationControl::new()).unwrap();
    assert_eq!(report.entries, 2);
    assert_eq!(cache.pools().get_pool_stats(GPU).unwrap().used_bytes, 0);
}

#[test]
fn test_eviction_target_is_free_space() {
    let cache = cache(4 * KIB);
    cache.put("m", "a", &weights(KIB, 0)).unwrap();
    cache.put("m", "b", &weights(KIB, 1)).unwrap();

    // 2 KiB already free
    let outcome = cache.evict_least_recently_used(2 * KIB).unwrap();
    assert!(outcome.satisfied);
    assert!(outcome.evicted.is_empty());

    let outcome = cache.evict_least_recently_used(3 * KIB).unwrap();
    assert!(outcome.satisfied);
    assert_eq!(outcome.freed_bytes, KIB);
    assert!(!cache.contains("m", "a"));
    assert!(cache.contains("m", "b"));

    // More than the whole budget can never be met
    cache.pin("m", "b").unwrap();
    let outcome = cache.evict_least_recently_used(5 * KIB).unwrap();
    assert!(!outcome.satisfied);
    assert!(cache.contains("m", "b"));
}

#[test]
fn test_hits_match_payloads_returned_while_migrating() {
    let cache = Arc::new(cache(16 * KIB));
    for i in 0..4u8 {
        cache.put("m", &format!("l{}", i), &weights(KIB, i)).unwrap();
    }
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut served = 0u64;
                while !done.load(Ordering::SeqCst) || served < 200 {
                    let i = (served % 4) as u8;
                    let found = cache.get("m", &format!("l{}", i)).unwrap();
                    assert_eq!(found, Some(weights(KIB, i)));
                    served += 1;
                }
                served
            })
        })
        .collect();

    let mut target = CPU;
    for _ in 0..50 {
        cache.migrate_model("m", target, &MigrationControl::new()).unwrap();
        target = if target == CPU { GPU } else { CPU };
    }
    done.store(true, Ordering::SeqCst);

    let served: u64 = readers.into_iter().map(|r| r.join().unwrap()).sum();
    let stats = cache.stats().unwrap();
    assert_eq!(stats.hits, served);
    assert_eq!(stats.misses, 0);
}

#[test]
fn test_concurrent_readers_and_writers() {
    let cache = Arc::new(cache(16 * KIB));
    let handles: Vec<_> = (0..4u8)
        .map(|t| {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                let model = format!("model-{}", t);
                for i in 0..40u8 {
                    let layer = format!("l{}", i % 8);
                    let payload = weights(512, i);
                    cache.put(&model, &layer, &payload).unwrap();
                    if let Some(found) = cache.get(&model, &layer).unwrap() {
                        assert_eq!(found.len(), 512);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let stats = cache.stats().unwrap();
    assert!(stats.used_bytes <= stats.capacity_bytes);
    assert_eq!(stats.used_bytes, stats.entries * 512);
}

#[derive(Debug, Clone)]
enum CacheOp {
    Put(usize, usize),
    Get(usize),
    Pin(usize),
    Unpin(usize),
    Evict(usize),
}

fn cache_op() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        3 => (0usize..8, 1usize..1500).prop_map(|(l, size)| CacheOp::Put(l, size)),
        2 => (0usize..8).prop_map(CacheOp::Get),
        1 => (0usize..8).prop_map(CacheOp::Pin),
        1 => (0usize..8).prop_map(CacheOp::Unpin),
        1 => (0usize..6000).prop_map(CacheOp::Evict),
    ]
}

proptest! {
    #[test]
    fn prop_budget_holds_and_pins_survive(ops in prop::collection::vec(cache_op(), 1..150)) {
        let capacity = 4 * KIB;
        let cache = cache(capacity);
        let mut pins: HashMap<String, usize> = HashMap::new();

        for (step, op) in ops.into_iter().enumerate() {
            match op {
                CacheOp::Put(l, size) => {
                    match cache.put("m", &format!("l{}", l), &vec![step as u8; size]) {
                        Ok(()) | Err(MemForgeError::CacheExhausted { .. }) => {}
                        Err(e) => prop_assert!(false, "unexpected put error: {}", e),
                    }
                }
                CacheOp::Get(l) => {
                    cache.get("m", &format!("l{}", l)).unwrap();
                }
                CacheOp::Pin(l) => {
                    let layer = format!("l{}", l);
                    if cache.pin("m", &layer).unwrap() {
                        *pins.entry(layer).or_insert(0) += 1;
                    }
                }
                CacheOp::Unpin(l) => {
                    let layer = format!("l{}", l);
                    if let Some(count) = pins.get_mut(&layer) {
                        prop_assert!(cache.unpin("m", &layer).unwrap());
                        *count -= 1;
                        if *count == 0 {
                            pins.remove(&layer);
                        }
                    }
                }
                CacheOp::Evict(target) => {
                    let outcome = cache.evict_least_recently_used(target).unwrap();
                    for key in &outcome.evicted {
                        prop_assert!(!pins.contains_key(&key.layer));
                    }
                    if outcome.satisfied {
                        prop_assert!(capacity - cache.used_bytes() >= target);
                    }
                }
            }

            let stats = cache.stats().unwrap();
            prop_assert!(stats.used_bytes <= capacity);
            for layer in pins.keys() {
                prop_assert!(cache.contains("m", layer), "pinned {} was evicted", layer);
            }
        }
    }
}

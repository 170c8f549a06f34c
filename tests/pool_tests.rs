//! Pool manager behaviour across devices and allocation sequences

mod common;

use common::{pools, weights, CPU, GPU, KIB};
use memforge::{Device, MemForgeError, MemoryBlock, MemoryPoolManager, MemoryPressure};
use std::collections::BTreeMap;

fn single_pool(device: Device, bytes: u64) -> MemoryPoolManager {
    let mut sizes = BTreeMap::new();
    sizes.insert(device, bytes);
    MemoryPoolManager::new(&sizes, 256).unwrap()
}

#[test]
fn test_third_400_byte_block_does_not_fit_in_1000() {
    let pools = single_pool(GPU, 1000);

    let a = pools.allocate(400, GPU).unwrap();
    let b = pools.allocate(400, GPU).unwrap();
    assert_eq!(a.offset(), 0);
    assert_eq!(b.offset(), 512);

    match pools.allocate(400, GPU) {
        Err(MemForgeError::OutOfMemory {
            device, requested, ..
        }) => {
            assert_eq!(device, GPU);
            assert_eq!(requested, 400);
        }
        other => panic!("expected OutOfMemory, got {:?}", other),
    }

    pools.deallocate(a).unwrap();
    let c = pools.allocate(400, GPU).unwrap();
    assert_eq!(c.offset(), 0);

    let stats = pools.get_pool_stats(GPU).unwrap();
    assert_eq!(stats.failed_allocations, 1);
    assert_eq!(stats.live_allocations, 2);
}

#[test]
fn test_devices_are_independent() {
    let pools = pools(4 * KIB, 4 * KIB);
    let gpu = pools.allocate(4 * KIB, GPU).unwrap();

    assert!(pools.allocate(1, GPU).is_err());
    let cpu = pools.allocate(4 * KIB, CPU).unwrap();

    pools.deallocate(gpu).unwrap();
    pools.deallocate(cpu).unwrap();
    for stats in pools.all_stats() {
        assert_eq!(stats.used_bytes, 0);
        assert_eq!(stats.free_bytes, stats.capacity);
    }
}

#[test]
fn test_double_free_and_foreign_blocks() {
    let first = pools(4 * KIB, 4 * KIB);
    let second = pools(4 * KIB, 4 * KIB);

    let block = first.allocate(128, GPU).unwrap();
    assert!(matches!(
        second.deallocate(block.clone()),
        Err(MemForgeError::InvalidBlock(_))
    ));
    assert!(!second.is_live(&block));

    first.deallocate(block.clone()).unwrap();
    let err = first.deallocate(block).unwrap_err();
    assert!(matches!(err, MemForgeError::InvalidBlock(_)));
    assert!(err.is_internal_error());
}

#[test]
fn test_stale_descriptor_cannot_read_new_owner() {
    let pools = single_pool(CPU, 2 * KIB as u64);
    let old = pools.allocate(256, CPU).unwrap();
    pools.write(&old, &weights(256, 1)).unwrap();
    pools.deallocate(old.clone()).unwrap();

    let new = pools.allocate(256, CPU).unwrap();
    assert_eq!(new.offset(), old.offset());
    pools.write(&new, &weights(256, 2)).unwrap();

    assert!(matches!(pools.read(&old), Err(MemForgeError::InvalidBlock(_))));
    assert_eq!(pools.read(&new).unwrap(), weights(256, 2));
}

#[test]
fn test_cleanup_only_under_pressure() {
    let pools = pools(8 * KIB, 8 * KIB);
    assert_eq!(pools.cleanup(MemoryPressure::Normal).unwrap(), 0);
    // Release merges eagerly, so an explicit pass finds nothing to do
    let block = pools.allocate(KIB, GPU).unwrap();
    pools.deallocate(block).unwrap();
    assert_eq!(pools.cleanup(MemoryPressure::Critical).unwrap(), 0);
    assert_eq!(pools.get_pool_stats(GPU).unwrap().fragment_count, 1);
}

#[test]
fn test_concurrent_allocations_across_threads() {
    let pools = std::sync::Arc::new(pools(256 * KIB, 256 * KIB));
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let pools = std::sync::Arc::clone(&pools);
            std::thread::spawn(move || {
                let device = if t % 2 == 0 { GPU } else { CPU };
                for _ in 0..50 {
                    let block = pools.allocate(512, device).unwrap();
                    pools.write(&block, &[t as u8; 512]).unwrap();
                    assert_eq!(pools.read(&block).unwrap(), vec![t as u8; 512]);
                    pools.deallocate(block).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    for stats in pools.all_stats() {
        assert_eq!(stats.used_bytes, 0);
        assert_eq!(stats.total_allocations, 200);
    }
}

use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    Free(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..3000).prop_map(Op::Alloc),
        (0usize..32).prop_map(Op::Free),
    ]
}

proptest! {
    #[test]
    fn prop_capacity_is_conserved(ops in prop::collection::vec(op(), 1..120)) {
        let capacity = 32 * KIB;
        let pools = single_pool(GPU, capacity as u64);
        let mut live: Vec<(MemoryBlock, u8)> = Vec::new();

        for (step, op) in ops.into_iter().enumerate() {
            match op {
                Op::Alloc(size) => {
                    if let Ok(block) = pools.allocate(size, GPU) {
                        let tag = step as u8;
                        pools.write(&block, &vec![tag; size]).unwrap();
                        live.push((block, tag));
                    }
                }
                Op::Free(i) if !live.is_empty() => {
                    let (block, _) = live.swap_remove(i % live.len());
                    pools.deallocate(block).unwrap();
                }
                Op::Free(_) => {}
            }

            let stats = pools.get_pool_stats(GPU).unwrap();
            prop_assert_eq!(stats.used_bytes + stats.free_bytes, capacity);
            prop_assert!(stats.used_bytes <= capacity);
            prop_assert!(stats.largest_free <= stats.free_bytes);
            prop_assert_eq!(stats.live_allocations, live.len());
            prop_assert!((0.0..=1.0).contains(&stats.fragmentation));
        }

        // Live blocks never overlap and keep their contents
        let mut spans: Vec<(usize, usize)> =
            live.iter().map(|(b, _)| (b.offset(), b.offset() + b.size())).collect();
        spans.sort();
        for pair in spans.windows(2) {
            prop_assert!(pair[0].1 <= pair[1].0);
        }
        for (block, tag) in &live {
            prop_assert_eq!(pools.read(block).unwrap(), vec![*tag; block.size()]);
        }
    }
}

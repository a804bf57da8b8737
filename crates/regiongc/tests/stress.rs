//! Multi-threaded mutator stress
//!
//! Several mutators allocate linked structures concurrently while pauses are
//! triggered by allocation failures and explicit requests, and the service
//! thread samples and uncommits in the background.

use std::sync::Arc;
use std::thread;

use regiongc::address::Address;
use regiongc::{GcConfig, Heap, Mutator};

const REGION_BYTES: usize = 64 * 1024;
const THREADS: usize = 4;
const ROUNDS: u64 = 3_000;

fn stress_config() -> GcConfig {
    GcConfig {
        region_size_bytes: REGION_BYTES,
        initial_heap_bytes: 16 * REGION_BYTES,
        max_heap_bytes: 128 * REGION_BYTES,
        parallel_gc_threads: 4,
        numa_nodes: 2,
        service_interval_ms: 2,
        verify_after_gc: true,
        ..Default::default()
    }
}

/// xorshift64, deterministic per thread
fn next_random(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

/// Keep a bounded list of tagged nodes alive while churning garbage
fn churn(m: &Mutator, thread_id: u64) -> u64 {
    let mut seed = 0x9e37_79b9_7f4a_7c15 ^ (thread_id + 1);
    let head = m.root(Address::NULL);
    let mut kept = 0u64;
    for round in 0..ROUNDS {
        let node = m.allocate_instance(1, 2).unwrap();
        m.write_word(node, 0, thread_id);
        m.write_word(node, 1, round);
        m.write_ref(node, 0, head.get());
        head.set(node);
        kept += 1;

        let garbage_words = (next_random(&mut seed) % 200) as usize;
        m.allocate_type_array(garbage_words).unwrap();
        if round % 500 == 0 {
            m.allocate_type_array(5_000).unwrap();
        }
        if round % 997 == 0 {
            m.collect();
        }
        if kept > 400 {
            // Drop the tail beyond 200 nodes.
            let mut cur = head.get();
            for _ in 0..199 {
                cur = m.read_ref(cur, 0);
            }
            m.write_ref(cur, 0, Address::NULL);
            kept = 200;
        }
        m.poll();
    }

    let mut count = 0;
    let mut expected = ROUNDS;
    let mut cur = head.get();
    while !cur.is_null() {
        expected -= 1;
        assert_eq!(m.read_word(cur, 0), thread_id);
        assert_eq!(m.read_word(cur, 1), expected);
        count += 1;
        cur = m.read_ref(cur, 0);
    }
    count
}

#[test]
fn test_concurrent_mutators_keep_their_data() {
    let heap = Heap::builder(stress_config()).build().unwrap();
    let handles: Vec<_> = (0..THREADS as u64)
        .map(|id| {
            let heap = Arc::clone(&heap);
            thread::spawn(move || {
                let m = heap.attach_mutator();
                churn(&m, id)
            })
        })
        .collect();
    for handle in handles {
        let count = handle.join().unwrap();
        assert!((200..=400).contains(&count));
    }

    let snapshot = heap.stats().snapshot();
    assert!(snapshot.collections > 0);
    assert!(snapshot.humongous_allocated >= (THREADS * 6) as u64);
    heap.collect().unwrap();
    heap.verify_at_safepoint().unwrap();
    heap.shutdown();
}

#[test]
fn test_parked_mutator_does_not_block_pauses() {
    let heap = Heap::builder(stress_config())
        .service_thread(false)
        .build()
        .unwrap();
    let parked = heap.attach_mutator();
    let obj = parked.allocate_instance(0, 1).unwrap();
    parked.write_word(obj, 0, 77);
    let root = parked.root(obj);

    let worker = {
        let heap = Arc::clone(&heap);
        thread::spawn(move || {
            let m = heap.attach_mutator();
            for _ in 0..3 {
                m.collect().unwrap();
            }
        })
    };
    parked.blocking(|| worker.join().unwrap());
    assert_eq!(parked.read_word(root.get(), 0), 77);
    assert_eq!(heap.total_collections(), 3);
}

//! End-to-end scenarios driving the full engine: dispatcher, buffer, fill
//! and evict pools, and region manager together, through the simulated
//! fault channel. All scenarios share one process-wide engine, so they're
//! scaled down from a real workload's sizes but keep its shape: sequential
//! sort, read-only graph traversal, flush-to-disk persistence, pinning
//! against eviction, concurrent thrash, and heterogeneous page sizes.

use std::sync::{Arc, Once};
use vmap::store::{FileStore, MemoryStore};
use vmap::{MapFlags, VmEngine};

fn setup() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
        // Small enough that the pin and thrash scenarios force real
        // eviction traffic; read once by the engine on first region.
        std::env::set_var("VMAP_BUFFER_CAPACITY", "256");
        std::env::set_var("VMAP_FILLER_COUNT", "4");
        std::env::set_var("VMAP_EVICTOR_COUNT", "4");
        std::env::set_var("VMAP_LOW_WATERMARK", "70");
        std::env::set_var("VMAP_HIGH_WATERMARK", "90");
        std::env::set_var("VMAP_MAX_FAULT_EVENTS", "64");
        // Keep the pin scenario's memory check happy on hosts with little
        // free RAM: a 1 MiB margin is plenty for a buffer this small.
        std::env::set_var("VMAP_PIN_MARGIN_KB", "1024");
    });
}

fn private_flags() -> MapFlags {
    MapFlags { private: true, fixed: false }
}

fn read_u64(engine: &VmEngine, addr: usize) -> u64 {
    let mut bytes = [0u8; 8];
    engine.access(addr, 8, false, |buf| bytes.copy_from_slice(buf));
    u64::from_le_bytes(bytes)
}

fn write_u64(engine: &VmEngine, addr: usize, value: u64) {
    engine.access(addr, 8, true, |buf| buf.copy_from_slice(&value.to_le_bytes()));
}

#[test]
fn sequential_sort() {
    setup();
    let engine = VmEngine::new();
    let page_size = engine.config().page_size;
    let num_pages = 16;
    let length = num_pages * page_size;
    let count = length / 8;

    let store = Arc::new(MemoryStore::new(length, page_size));
    let base = engine.map(None, length, private_flags(), store, Some(page_size)).unwrap();

    for i in 0..count {
        write_u64(&engine, base + i * 8, (count - i) as u64);
    }

    let mut values: Vec<u64> = (0..count).map(|i| read_u64(&engine, base + i * 8)).collect();
    values.sort_unstable();
    let expected: Vec<u64> = (1..=count as u64).collect();
    assert_eq!(values, expected);

    for (i, &v) in values.iter().enumerate() {
        write_u64(&engine, base + i * 8, v);
    }
    for (i, &expected_v) in expected.iter().enumerate() {
        assert_eq!(read_u64(&engine, base + i * 8), expected_v);
    }

    engine.unmap(base).unwrap();
}

#[test]
fn read_only_bfs() {
    setup();
    let engine = VmEngine::new();
    let page_size = engine.config().page_size;

    // A tiny CSR graph: 6 vertices, edges forming two chains off vertex 0.
    // offsets[v]..offsets[v+1] indexes into edges for v's neighbors.
    let adjacency: Vec<Vec<u64>> = vec![
        vec![1, 2],
        vec![0, 3],
        vec![0, 3],
        vec![1, 2, 4],
        vec![3, 5],
        vec![4],
    ];
    let num_vertices = adjacency.len();
    let mut offsets = vec![0u64; num_vertices + 1];
    let mut edges = Vec::new();
    for (v, neighbors) in adjacency.iter().enumerate() {
        offsets[v] = edges.len() as u64;
        edges.extend_from_slice(neighbors);
    }
    offsets[num_vertices] = edges.len() as u64;

    let mut longs = offsets.clone();
    longs.extend_from_slice(&edges);
    let total_bytes = longs.len() * 8;
    let num_pages = total_bytes.div_ceil(page_size);
    let store = Arc::new(MemoryStore::generated(num_pages, page_size, |page_idx, buf| {
        let start = page_idx * page_size / 8;
        for (i, slot) in buf.chunks_mut(8).enumerate() {
            let idx = start + i;
            let v = longs.get(idx).copied().unwrap_or(0);
            slot.copy_from_slice(&v.to_le_bytes());
        }
    }));

    let base = engine
        .map(None, num_pages * page_size, private_flags(), store, Some(page_size))
        .unwrap();

    let read_offset = |i: usize| read_u64(&engine, base + i * 8);
    let mut levels = vec![u64::MAX; num_vertices];
    levels[0] = 0;
    let mut queue = std::collections::VecDeque::new();
    queue.push_back(0usize);
    while let Some(v) = queue.pop_front() {
        let start = read_offset(v) as usize;
        let end = read_offset(v + 1) as usize;
        for i in start..end {
            let neighbor = read_offset(num_vertices + 1 + i) as usize;
            if levels[neighbor] == u64::MAX {
                levels[neighbor] = levels[v] + 1;
                queue.push_back(neighbor);
            }
        }
    }

    let mut expected = vec![u64::MAX; num_vertices];
    expected[0] = 0;
    let mut ref_queue = std::collections::VecDeque::new();
    ref_queue.push_back(0usize);
    while let Some(v) = ref_queue.pop_front() {
        for &n in &adjacency[v] {
            let n = n as usize;
            if expected[n] == u64::MAX {
                expected[n] = expected[v] + 1;
                ref_queue.push_back(n);
            }
        }
    }
    assert_eq!(levels, expected);

    engine.unmap(base).unwrap();
}

#[test]
fn flush_persistence() {
    setup();
    let engine = VmEngine::new();
    let page_size = engine.config().page_size;

    let tmp = tempfile::NamedTempFile::new().unwrap();
    let file_len = 32 * page_size; // scaled down from a literal 1 MiB
    tmp.as_file().set_len(file_len as u64).unwrap();
    let store = Arc::new(FileStore::from_path(tmp.path(), false).unwrap());
    let base = engine.map(None, file_len, private_flags(), store, Some(page_size)).unwrap();

    let count = file_len / 8;
    for i in 0..count {
        write_u64(&engine, base + i * 8, i as u64);
    }
    engine.flush();

    let on_disk = std::fs::read(tmp.path()).unwrap();
    for i in 0..count {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&on_disk[i * 8..i * 8 + 8]);
        assert_eq!(u64::from_le_bytes(bytes), i as u64, "byte mismatch at element {i}");
    }

    engine.unmap(base).unwrap();
}

#[test]
fn pin_a_sub_range_survives_tail_eviction() {
    setup();
    let engine = VmEngine::new();
    let page_size = engine.config().page_size;
    let pinned_pages = 32;
    let tail_pages = 400; // exceeds the 256-page global buffer capacity
    let total_pages = pinned_pages + 64 + tail_pages;

    let store = Arc::new(MemoryStore::new(total_pages * page_size, page_size));
    let base = engine
        .map(None, total_pages * page_size, private_flags(), store.clone(), Some(page_size))
        .unwrap();

    engine.fetch_and_pin(base, pinned_pages * page_size).unwrap();
    let reads_after_pin = store.read_count();

    let tail_base = base + (pinned_pages + 64) * page_size;
    for i in 0..tail_pages {
        let _ = read_u64(&engine, tail_base + i * page_size);
    }

    assert_eq!(
        store.read_count(),
        reads_after_pin + tail_pages as u64,
        "pinned pages must never be re-fetched while the tail is evicted"
    );

    for i in 0..pinned_pages {
        // Still resident: reading it must not trigger another store read.
        let _ = read_u64(&engine, base + i * page_size);
    }
    assert_eq!(store.read_count(), reads_after_pin + tail_pages as u64);

    engine.unmap(base).unwrap();
}

#[test]
fn write_then_read_thrash_loses_no_data() {
    setup();
    let engine = VmEngine::new();
    let page_size = engine.config().page_size;
    let region_pages = 400; // exceeds the 256-page global buffer capacity

    let store = Arc::new(MemoryStore::new(region_pages * page_size, page_size));
    let base = engine.map(None, region_pages * page_size, private_flags(), store, Some(page_size)).unwrap();

    let rounds = 3u64;
    std::thread::scope(|scope| {
        let writer_engine = engine;
        scope.spawn(move || {
            for round in 0..rounds {
                for page in 0..region_pages {
                    write_u64(&writer_engine, base + page * page_size, round * 10_000 + page as u64);
                }
            }
        });

        let reader_engine = engine;
        scope.spawn(move || {
            let mut state = 0x9e3779b97f4a7c15u64;
            for _ in 0..region_pages * 2 {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                let page = (state as usize) % region_pages;
                let _ = read_u64(&reader_engine, base + page * page_size);
            }
        });
    });

    for page in 0..region_pages {
        let expected = (rounds - 1) * 10_000 + page as u64;
        assert_eq!(read_u64(&engine, base + page * page_size), expected);
    }

    engine.unmap(base).unwrap();
}

#[test]
fn heterogeneous_page_sizes_route_independently() {
    setup();
    let engine = VmEngine::new();
    let small_page = engine.config().page_size;
    let large_page = small_page * 16;

    let small_pages = 8;
    let large_pages = 4;
    let small_store = Arc::new(MemoryStore::new(small_pages * small_page, small_page));
    let large_store = Arc::new(MemoryStore::new(large_pages * large_page, large_page));

    let small_base = engine
        .map(None, small_pages * small_page, private_flags(), small_store, Some(small_page))
        .unwrap();
    let large_base = engine
        .map(None, large_pages * large_page, private_flags(), large_store, Some(large_page))
        .unwrap();

    for i in 0..small_pages {
        write_u64(&engine, small_base + i * small_page, 0xAAAA_0000 + i as u64);
    }
    for i in 0..large_pages {
        write_u64(&engine, large_base + i * large_page, 0xBBBB_0000 + i as u64);
    }

    for i in 0..small_pages {
        assert_eq!(read_u64(&engine, small_base + i * small_page), 0xAAAA_0000 + i as u64);
    }
    for i in 0..large_pages {
        assert_eq!(read_u64(&engine, large_base + i * large_page), 0xBBBB_0000 + i as u64);
    }

    assert!(engine.containing_region(small_base).unwrap().page_size == small_page);
    assert!(engine.containing_region(large_base).unwrap().page_size == large_page);

    engine.unmap(small_base).unwrap();
    engine.unmap(large_base).unwrap();
}

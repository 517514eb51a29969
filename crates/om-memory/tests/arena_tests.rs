//! Arena behaviour under concurrent admission and eviction

use om_memory::{MemoryArena, GUARD_PAGES, PAGE_SIZE};

#[test]
fn test_concurrent_allocation_is_disjoint() {
    let arena = MemoryArena::new(0x40_0000).unwrap();

    let regions = crossbeam::thread::scope(|s| {
        let workers: Vec<_> = (0..8u8)
            .map(|i| {
                let arena = &arena;
                s.spawn(move |_| {
                    let mut region = arena.allocate(0x4000).unwrap();
                    let base = region.base();
                    region.fill(base, 0x4000, i + 1).unwrap();
                    (i + 1, region)
                })
            })
            .collect();

        workers
            .into_iter()
            .map(|w| w.join().unwrap())
            .collect::<Vec<_>>()
    })
    .unwrap();

    // Every region still holds exactly the pattern its owner wrote
    for (pattern, region) in &regions {
        assert!(region.as_slice().iter().all(|b| b == pattern));
    }

    let mut spans: Vec<_> = regions.iter().map(|(_, r)| (r.base(), r.end())).collect();
    spans.sort();
    for pair in spans.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "regions overlap: {:?}", pair);
    }

    drop(regions);
    assert_eq!(arena.region_count(), 0);
    assert_eq!(arena.used(), GUARD_PAGES * PAGE_SIZE);
}

#[test]
fn test_fragmentation_first_fit() {
    let arena = MemoryArena::new(0x10_0000).unwrap();

    let mut regions: Vec<_> = (0..6).map(|_| Some(arena.allocate(0x1000).unwrap())).collect();
    let hole = regions[2].as_ref().unwrap().base();

    // Free one page in the middle; the next single-page request reuses it
    regions[2] = None;
    let reused = arena.allocate(0x800).unwrap();
    assert_eq!(reused.base(), hole);

    // A two-page request cannot fit in the one-page hole
    regions[4] = None;
    let larger = arena.allocate(0x2000).unwrap();
    assert!(larger.base() > regions[5].as_ref().unwrap().base());
}

#[test]
fn test_repeated_admission_does_not_leak() {
    let arena = MemoryArena::new(0x10_0000).unwrap();
    let baseline = arena.available();

    for _ in 0..1000 {
        let region = arena.allocate(0x8000).unwrap();
        assert!(region.as_slice().iter().all(|&b| b == 0));
    }

    assert_eq!(arena.available(), baseline);
}

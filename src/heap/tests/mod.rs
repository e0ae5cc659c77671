use super::*;
use crate::arena::ArenaDescriptor;

use std::sync::atomic::AtomicU32;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};


/// Checks that the allocated and free blocks of every arena tile it exactly
/// and that no two free blocks are adjacent.
fn assert_partition(heap: &Heap) {
    let state = heap.state.lock().unwrap();
    let mut seen = 0;
    for arena in &state.arenas {
        let allocated = state
            .allocated
            .iter()
            .filter(|b| b.arena().id() == arena.id())
            .map(|b| (b.start(), b.stop(), false));
        let free = state
            .free
            .iter()
            .filter(|b| b.arena().id() == arena.id())
            .map(|b| (b.start(), b.stop(), true));
        let mut blocks: Vec<_> = allocated.chain(free).collect();
        blocks.sort_unstable();
        seen += blocks.len();

        let mut cursor = 0;
        let mut prev_free = false;
        for (start, stop, is_free) in blocks {
            assert_eq!(start, cursor, "gap or overlap at {} in {}", cursor, arena.id());
            assert!(!(is_free && prev_free), "adjacent free blocks at {start} in {}", arena.id());
            cursor = stop;
            prev_free = is_free;
        }
        assert_eq!(cursor, arena.size(), "{} is not fully covered", arena.id());
    }
    assert_eq!(
        seen,
        state.allocated.len() + state.free.len(),
        "blocks reference unknown arenas"
    );
}

fn free_ranges(heap: &Heap) -> Vec<(usize, usize)> {
    let state = heap.state.lock().unwrap();
    let mut ranges: Vec<_> = state.free.iter().map(|b| (b.start(), b.stop())).collect();
    ranges.sort_unstable();
    ranges
}

fn arena_sizes(heap: &Heap) -> Vec<usize> {
    let state = heap.state.lock().unwrap();
    state.arenas.iter().map(|a| a.size()).collect()
}

fn fill(block: &Block, tag: u8) {
    unsafe { core::ptr::write_bytes(block.address().as_ptr(), tag, block.len()) };
}

fn check(block: &Block, tag: u8) {
    let bytes = unsafe { core::slice::from_raw_parts(block.address().as_ptr(), block.len()) };
    assert!(bytes.iter().all(|&b| b == tag), "{block:?} was overwritten");
}

#[test]
fn test_allocate_1() {
    format::init();
    let heap = Heap::new();

    let sizes: Vec<usize> = (0..300).chain([4095, 4096, 4097, 10_000]).collect();
    let mut blocks = vec![];
    for &n in &sizes {
        let block = heap.allocate(n).unwrap();
        assert_eq!(block.len(), roundup(n.max(1), ALIGNMENT));
        assert_eq!(block.start() % ALIGNMENT, 0);

        let p = block.address().as_ptr();
        for i in 0..n {
            unsafe {
                p.add(i).write((i % 251) as u8);
                assert_eq!(p.add(i).read(), (i % 251) as u8);
            }
        }
        blocks.push(block);
    }
    assert_partition(&heap);

    for block in &blocks {
        heap.free(block).unwrap();
    }
    assert_partition(&heap);
    let stats = heap.stats();
    assert_eq!(stats.allocated_blocks, 0);
    assert_eq!(stats.free_blocks, stats.arenas);
    assert_eq!(stats.free_bytes, stats.arena_bytes);
}

#[test]
fn test_allocate_2() {
    let heap = Heap::new();
    for size in [MAX_SIZE, MAX_SIZE + 1, usize::MAX] {
        assert!(matches!(
            heap.allocate(size),
            Err(Error::InvalidSize { size: s, max }) if s == size && max == MAX_SIZE
        ));
    }
    assert_eq!(heap.stats().arenas, 0);
}

#[test]
fn test_allocate_3() {
    // Best fit: the 32-byte hole wins over the 64-byte hole and the arena tail.
    let heap = Heap::with_config(HeapConfig::default().initial_arena_size(64 * 1024));
    let a = heap.allocate(64).unwrap();
    let _s1 = heap.allocate(8).unwrap();
    let b = heap.allocate(32).unwrap();
    let _s2 = heap.allocate(8).unwrap();
    heap.free(&a).unwrap();
    heap.free(&b).unwrap();

    let c = heap.allocate(24).unwrap();
    assert_eq!((c.start(), c.stop()), (72, 96));
    assert_eq!(free_ranges(&heap)[..2], [(0, 64), (96, 104)]);
    assert_partition(&heap);
}

#[test]
fn test_scenario_1() {
    format::init();
    let heap = Heap::new();
    let arena_size = page_size();

    let a = heap.allocate(10).unwrap();
    let b = heap.allocate(100).unwrap();
    let c = heap.allocate(10).unwrap();
    assert_eq!(heap.stats().arenas, 1);
    assert_eq!(a.arena().id(), b.arena().id());
    assert_eq!(b.arena().id(), c.arena().id());
    assert_eq!((a.start(), a.stop()), (0, 16));
    assert_eq!((b.start(), b.stop()), (16, 120));
    assert_eq!((c.start(), c.stop()), (120, 136));

    heap.free(&a).unwrap();
    heap.free(&c).unwrap();
    // The middle block keeps the two freed ranges apart; `c` joins the arena tail.
    assert_eq!(free_ranges(&heap), [(0, 16), (120, arena_size)]);

    heap.free(&b).unwrap();
    assert_eq!(free_ranges(&heap), [(0, arena_size)]);
    assert_partition(&heap);
}

#[test]
fn test_free_1() {
    let heap = Heap::new();
    let block = heap.allocate(40).unwrap();
    heap.free(&block).unwrap();
    assert!(matches!(
        heap.free(&block),
        Err(Error::InvalidBlock { start: 0, stop: 40, .. })
    ));
    assert_partition(&heap);
}

#[test]
fn test_free_2() {
    let heap = Heap::new();
    let other = Heap::new();
    let block = other.allocate(40).unwrap();
    assert!(matches!(heap.free(&block), Err(Error::InvalidBlock { .. })));
    other.free(&block).unwrap();
}

#[test]
fn test_free_3() {
    // Tiling blocks coalesce into one free block whatever the release order.
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..20 {
        let heap = Heap::with_config(HeapConfig::default().initial_arena_size(64 * 1024));
        let mut blocks: Vec<Block> = (1..=32)
            .map(|i| heap.allocate(i * 8).unwrap())
            .collect();
        assert_eq!(heap.stats().arenas, 1);

        blocks.shuffle(&mut rng);
        for block in &blocks {
            heap.free(block).unwrap();
            assert_partition(&heap);
        }
        assert_eq!(free_ranges(&heap), [(0, 64 * 1024)]);
    }
}

#[test]
fn test_free_4() {
    // Blocks in different arenas stay apart even when their offsets line up.
    let p = page_size();
    let heap = Heap::new();
    let a = heap.allocate(p).unwrap();
    let b = heap.allocate(p).unwrap();
    assert_ne!(a.arena().id(), b.arena().id());
    heap.free(&a).unwrap();
    heap.free(&b).unwrap();
    assert_eq!(heap.stats().free_blocks, 2);
    assert_partition(&heap);
}

#[test]
fn test_growth_1() {
    let p = page_size();
    let heap = Heap::new();
    assert_eq!(heap.stats().next_arena_size, p);

    let _a = heap.allocate(p).unwrap();
    assert_eq!(heap.stats().next_arena_size, 2 * p);
    let _b = heap.allocate(p).unwrap();
    assert_eq!(heap.stats().next_arena_size, 4 * p);
    // Larger than the target: the arena fits the request.
    let _c = heap.allocate(10 * p).unwrap();
    assert_eq!(heap.stats().next_arena_size, 8 * p);
    // Fits in the tail of the second arena.
    let _d = heap.allocate(8).unwrap();

    assert_eq!(arena_sizes(&heap), [p, 2 * p, 10 * p]);
    assert_partition(&heap);
}

#[test]
fn test_growth_2() {
    let p = page_size();
    let heap = Heap::with_config(HeapConfig::default().max_arena_size(2 * p));

    let _a = heap.allocate(p).unwrap();
    assert_eq!(heap.stats().next_arena_size, 2 * p);
    let _b = heap.allocate(2 * p).unwrap();
    assert_eq!(heap.stats().next_arena_size, 2 * p);
    let _c = heap.allocate(5 * p + 1).unwrap();
    assert_eq!(heap.stats().next_arena_size, 2 * p);
    let _d = heap.allocate(p).unwrap();

    assert_eq!(arena_sizes(&heap), [p, 2 * p, 6 * p, 2 * p]);
    assert_partition(&heap);
}

#[test]
fn test_random_1() {
    format::init();
    let mut rng = StdRng::seed_from_u64(0xC0FFEE);
    let heap = Heap::new();
    let mut live: Vec<(Block, u8)> = vec![];

    for step in 0..3000 {
        if live.is_empty() || rng.gen_bool(0.55) {
            let block = heap.allocate(rng.gen_range(0..3000)).unwrap();
            let tag = rng.gen();
            fill(&block, tag);
            live.push((block, tag));
        } else {
            let (block, tag) = live.swap_remove(rng.gen_range(0..live.len()));
            check(&block, tag);
            heap.free(&block).unwrap();
        }
        if step % 100 == 0 {
            assert_partition(&heap);
        }
    }

    for (block, tag) in &live {
        check(block, *tag);
    }
    let stats = heap.stats();
    assert_eq!(stats.allocated_blocks, live.len());
    assert_eq!(stats.allocated_bytes + stats.free_bytes, stats.arena_bytes);
    assert_partition(&heap);
}

static FAKE_PID: AtomicU32 = AtomicU32::new(1);

fn fake_pid() -> u32 {
    FAKE_PID.load(Ordering::SeqCst)
}

#[test]
fn test_fork_1() {
    format::init();
    let heap = Heap::with_pid_source(HeapConfig::default(), fake_pid);
    let kept = heap.allocate(64).unwrap();
    let released = heap.allocate(64).unwrap();
    heap.free(&released).unwrap();
    assert_eq!(heap.stats().arenas, 1);

    FAKE_PID.store(2, Ordering::SeqCst);

    let fresh = heap.allocate(64).unwrap();
    assert_ne!(fresh.arena().id(), kept.arena().id());
    assert_eq!(fresh.start(), 0);
    let stats = heap.stats();
    assert_eq!(stats.arenas, 1);
    assert_eq!(stats.allocated_blocks, 1);
    assert_eq!(stats.next_arena_size, 2 * page_size());

    // The parent's bookkeeping is gone, yet its memory is still mapped.
    assert!(matches!(heap.free(&kept), Err(Error::InvalidBlock { .. })));
    fill(&kept, 0x5A);
    check(&kept, 0x5A);
    assert_partition(&heap);
}

#[test]
fn test_named_1() {
    let heap = Heap::with_config(HeapConfig::default().sharing(ArenaSharing::Named {
        prefix: "mmap_heap-test".into(),
    }));
    let block = heap.allocate(100).unwrap();
    assert!(block.arena().is_named());

    let descriptor: ArenaDescriptor = block.arena().descriptor();
    let reopened = Arena::from_descriptor(&descriptor).unwrap();
    fill(&block, 0x42);
    let mirrored = reopened.address_of(block.start()).as_ptr();
    assert_eq!(unsafe { mirrored.read() }, 0x42);

    heap.free(&block).unwrap();
}

#[test]
fn test_threads_1() {
    let heap = Arc::new(Heap::new());
    let handles: Vec<_> = (0..8u8)
        .map(|tag| {
            let heap = heap.clone();
            std::thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(tag as u64);
                let mut live = vec![];
                for _ in 0..500 {
                    if live.len() < 16 && rng.gen_bool(0.6) {
                        let block = heap.allocate(rng.gen_range(1..512)).unwrap();
                        fill(&block, tag);
                        live.push(block);
                    } else if let Some(block) = live.pop() {
                        check(&block, tag);
                        heap.free(&block).unwrap();
                    }
                }
                for block in live {
                    check(&block, tag);
                    heap.free(&block).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked.");
    }

    let stats = heap.stats();
    assert_eq!(stats.allocated_blocks, 0);
    assert_eq!(stats.free_blocks, stats.arenas);
    assert_partition(&heap);
}

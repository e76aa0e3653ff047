//! Coherence scenarios driven directly against caches on a shared bus:
//! MESI state transitions, snoop-forced write-backs, eviction and the
//! single-writer/multiple-reader invariant.

use std::sync::Arc;

use mesi_smp_sim::smp::bus::Interconnect;
use mesi_smp_sim::smp::cache::{CacheGeometry, CacheStats, L1Cache, MesiState};
use mesi_smp_sim::smp::memory::{Address, SharedMemory};

fn setup(num_caches: usize) -> (Arc<SharedMemory>, Vec<Arc<L1Cache>>) {
    let geometry = CacheGeometry::reference();
    let mem = Arc::new(SharedMemory::new(512, geometry.block_bytes));
    let bus = Arc::new(Interconnect::new());
    let caches = (0..num_caches)
        .map(|id| L1Cache::attach(id, geometry, Arc::clone(&mem), Arc::clone(&bus)))
        .collect();
    mem.store_f64(0, 1.5).unwrap();
    mem.store_f64(8, 2.0).unwrap();
    (mem, caches)
}

/// State of the line holding `addr`'s block, or Invalid if absent.
fn block_state(cache: &L1Cache, addr: Address) -> MesiState {
    let g = cache.geometry();
    let fields = g.split(addr);
    for way in 0..g.ways {
        if cache.state_of(fields.index, way) != MesiState::Invalid
            && cache.tag_of(fields.index, way) == fields.tag
        {
            return cache.state_of(fields.index, way);
        }
    }
    MesiState::Invalid
}

/// Single-Writer / Multiple-Reader: at most one Modified copy and then no
/// other valid copy; an Exclusive copy is the only valid copy.
fn assert_swmr(caches: &[Arc<L1Cache>], addr: Address) {
    let states: Vec<MesiState> = caches.iter().map(|c| block_state(c, addr)).collect();
    let modified = states.iter().filter(|s| **s == MesiState::Modified).count();
    let exclusive = states.iter().filter(|s| **s == MesiState::Exclusive).count();
    let valid = states.iter().filter(|s| **s != MesiState::Invalid).count();
    assert!(modified <= 1, "more than one Modified copy: {states:?}");
    if modified == 1 {
        assert_eq!(valid, 1, "Modified alongside other valid copies: {states:?}");
    }
    if exclusive >= 1 {
        assert_eq!(exclusive, 1, "more than one Exclusive copy: {states:?}");
        assert_eq!(valid, 1, "Exclusive alongside other valid copies: {states:?}");
    }
}

#[test]
fn e1_cold_read_fills_exclusive() {
    let (_mem, caches) = setup(2);
    assert_eq!(caches[0].read_double(0).unwrap(), 1.5);
    assert_eq!(caches[0].state_of(0, 0), MesiState::Exclusive);
    assert_eq!(caches[0].tag_of(0, 0), 0);
    assert!(caches[0].recent_of(0, 0));
    let stats = caches[0].stats();
    assert_eq!(stats.reads, 1);
    assert_eq!(stats.misses, 1);
}

#[test]
fn e2_remote_write_invalidates_reader() {
    let (mem, caches) = setup(2);
    caches[0].read_double(0).unwrap();

    caches[1].write_double(8, 3.14159).unwrap();
    assert_eq!(block_state(&caches[1], 8), MesiState::Modified);
    assert_eq!(block_state(&caches[0], 0), MesiState::Invalid);
    // Write-back has not happened yet: memory still holds the old value.
    assert_eq!(mem.load_f64(8).unwrap(), 2.0);
    assert_eq!(caches[0].stats().invalidations, 1);
    assert_swmr(&caches, 8);
}

#[test]
fn e3_read_from_modified_owner_forces_writeback() {
    let (mem, caches) = setup(2);
    caches[0].read_double(0).unwrap();
    caches[1].write_double(8, 3.14159).unwrap();

    assert_eq!(caches[0].read_double(8).unwrap(), 3.14159);
    assert_eq!(mem.load_f64(8).unwrap(), 3.14159);
    assert_eq!(block_state(&caches[0], 8), MesiState::Shared);
    assert_eq!(block_state(&caches[1], 8), MesiState::Shared);
    assert_eq!(caches[1].stats().writebacks, 1);
    assert_swmr(&caches, 8);
}

#[test]
fn e5_capacity_evicts_the_lru_line() {
    let (_mem, caches) = setup(1);
    let c = &caches[0];
    // Three block addresses all mapping to set 0 of the 2-way cache.
    c.read_double(0).unwrap();
    c.read_double(256).unwrap();
    assert_eq!(c.state_of(0, 0), MesiState::Exclusive);
    assert_eq!(c.state_of(0, 1), MesiState::Exclusive);

    // Way 0 is the least recently used line and must be the victim.
    c.read_double(512).unwrap();
    assert_eq!(c.tag_of(0, 0), 2);
    assert_eq!(c.tag_of(0, 1), 1);
    assert_eq!(c.state_of(0, 0), MesiState::Exclusive);
    // Clean victim: no write-back.
    assert_eq!(c.stats().writebacks, 0);
    assert_eq!(c.stats().misses, 3);
}

#[test]
fn e5_dirty_victim_is_written_back() {
    let (mem, caches) = setup(1);
    let c = &caches[0];
    c.write_double(0, 42.0).unwrap();
    assert_eq!(c.state_of(0, 0), MesiState::Modified);
    c.read_double(256).unwrap();

    // Evicting the Modified line updates memory with exactly its bytes.
    c.read_double(512).unwrap();
    assert_eq!(c.stats().writebacks, 1);
    assert_eq!(mem.load_f64(0).unwrap(), 42.0);
    assert_eq!(mem.load_f64(8).unwrap(), 2.0);
    assert_eq!(block_state(c, 0), MesiState::Invalid);
}

#[test]
fn e6_racing_writers_leave_exactly_one_modified() {
    let (mem, caches) = setup(2);
    let addr: Address = 64;
    let c0 = Arc::clone(&caches[0]);
    let c1 = Arc::clone(&caches[1]);
    std::thread::scope(|s| {
        s.spawn(move || c0.write_double(addr, 1.0).unwrap());
        s.spawn(move || c1.write_double(addr, 2.0).unwrap());
    });

    let states: Vec<MesiState> = caches.iter().map(|c| block_state(c, addr)).collect();
    assert!(states.contains(&MesiState::Modified), "{states:?}");
    assert!(states.contains(&MesiState::Invalid), "{states:?}");
    assert_swmr(&caches, addr);

    // The loser's transaction forced the winner to write back, so memory
    // holds the value written by the now-invalid cache, while the Modified
    // owner still caches its own value.
    let (winner, loser) = if states[0] == MesiState::Modified {
        (0, 1)
    } else {
        (1, 0)
    };
    let values = [1.0, 2.0];
    assert_eq!(mem.load_f64(addr).unwrap(), values[loser]);
    assert_eq!(caches[winner].read_double(addr).unwrap(), values[winner]);
}

#[test]
fn read_your_writes() {
    let (_mem, caches) = setup(2);
    caches[0].write_double(16, 9.25).unwrap();
    assert_eq!(caches[0].read_double(16).unwrap(), 9.25);
}

#[test]
fn cross_pe_visibility() {
    let (_mem, caches) = setup(2);
    caches[0].write_double(24, 5.5).unwrap();
    assert_eq!(caches[1].read_double(24).unwrap(), 5.5);
    assert_swmr(&caches, 24);
}

#[test]
fn upgrade_from_shared_invalidates_peers() {
    let (_mem, caches) = setup(2);
    caches[0].read_double(0).unwrap();
    caches[1].read_double(0).unwrap();
    assert_eq!(block_state(&caches[0], 0), MesiState::Shared);
    assert_eq!(block_state(&caches[1], 0), MesiState::Shared);

    caches[1].write_double(0, 6.5).unwrap();
    assert_eq!(block_state(&caches[1], 0), MesiState::Modified);
    assert_eq!(block_state(&caches[0], 0), MesiState::Invalid);
    assert_eq!(caches[1].stats().upgrades, 1);
    assert_eq!(caches[0].stats().invalidations, 1);
    assert_swmr(&caches, 0);
}

#[test]
fn swmr_holds_across_a_mixed_sequence() {
    let (_mem, caches) = setup(3);
    let addr: Address = 32;

    let script: Vec<(usize, bool)> = vec![
        (0, false), // read
        (1, false),
        (0, true), // write
        (2, false),
        (1, true),
        (1, false),
        (2, true),
        (0, false),
    ];
    for (step, (pe, is_write)) in script.into_iter().enumerate() {
        if is_write {
            caches[pe].write_double(addr, step as f64).unwrap();
        } else {
            caches[pe].read_double(addr).unwrap();
        }
        assert_swmr(&caches, addr);
    }
}

#[test]
fn flush_is_idempotent() {
    let (mem, caches) = setup(2);
    let c = &caches[0];
    c.write_double(0, 11.0).unwrap();
    c.write_double(40, 12.0).unwrap();

    c.flush_all().unwrap();
    assert_eq!(mem.load_f64(0).unwrap(), 11.0);
    assert_eq!(mem.load_f64(40).unwrap(), 12.0);
    assert_eq!(block_state(c, 0), MesiState::Exclusive);
    assert_eq!(block_state(c, 40), MesiState::Exclusive);
    let after_first = c.stats();

    c.flush_all().unwrap();
    let after_second = c.stats();
    assert_eq!(after_first.writebacks, after_second.writebacks);
    assert_eq!(block_state(c, 0), MesiState::Exclusive);
    assert_eq!(block_state(c, 40), MesiState::Exclusive);
    assert_eq!(mem.load_f64(0).unwrap(), 11.0);
    assert_eq!(mem.load_f64(40).unwrap(), 12.0);
}

#[test]
fn counters_only_increase() {
    fn assert_monotonic(a: &CacheStats, b: &CacheStats) {
        assert!(b.reads >= a.reads);
        assert!(b.writes >= a.writes);
        assert!(b.misses >= a.misses);
        assert!(b.invalidations >= a.invalidations);
        assert!(b.bus_msgs >= a.bus_msgs);
        assert!(b.writebacks >= a.writebacks);
        assert!(b.upgrades >= a.upgrades);
    }

    let (_mem, caches) = setup(2);
    let mut previous: Vec<CacheStats> = caches.iter().map(|c| c.stats()).collect();
    let ops: Vec<(usize, Address, bool)> = vec![
        (0, 0, false),
        (1, 0, true),
        (0, 0, false),
        (1, 8, false),
        (0, 256, true),
        (0, 512, false),
        (1, 512, true),
    ];
    for (pe, addr, is_write) in ops {
        if is_write {
            caches[pe].write_double(addr, 1.0).unwrap();
        } else {
            caches[pe].read_double(addr).unwrap();
        }
        for (cache, prev) in caches.iter().zip(previous.iter()) {
            let now = cache.stats();
            assert_monotonic(prev, &now);
        }
        previous = caches.iter().map(|c| c.stats()).collect();
    }
}

#[test]
fn shared_fill_when_a_peer_has_the_block() {
    let (_mem, caches) = setup(2);
    caches[0].read_double(0).unwrap();
    assert_eq!(block_state(&caches[0], 0), MesiState::Exclusive);

    // The second reader sees the first one's copy and both end Shared.
    caches[1].read_double(0).unwrap();
    assert_eq!(block_state(&caches[0], 0), MesiState::Shared);
    assert_eq!(block_state(&caches[1], 0), MesiState::Shared);
    assert_swmr(&caches, 0);
}

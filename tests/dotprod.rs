//! End-to-end dot-product runs through the full system: assembled program,
//! threaded PEs, coherent caches, flush and reduction through main memory.

use mesi_smp_sim::smp::asm::parse_asm;
use mesi_smp_sim::smp::cache::CacheGeometry;
use mesi_smp_sim::smp::system::{DOTPROD_ASM, System, SystemConfig};

fn dot_system(num_pes: usize, n: usize) -> System {
    let config = SystemConfig {
        num_pes,
        n,
        geometry: CacheGeometry::reference(),
        mem_words: 512,
    };
    let system = System::new(config).unwrap();
    system.load_program(&parse_asm(DOTPROD_ASM));
    system
}

/// Reference value: sum of 2 (i+1)^2 for i in 0..n.
fn reference_dot(n: usize) -> f64 {
    (0..n).map(|i| 2.0 * ((i + 1) as f64).powi(2)).sum()
}

#[test]
fn e4_four_pes_compute_408() {
    let system = dot_system(4, 8);
    system.run().unwrap();
    let total = system.reduce().unwrap();
    assert_eq!(total, 408.0);
    // The scalar lands in the word after the partial sums.
    assert_eq!(system.mem.load_f64(system.layout.final_addr()).unwrap(), 408.0);
    assert_eq!(system.expected().unwrap(), 408.0);
}

#[test]
fn partial_sums_land_in_their_slots() {
    let system = dot_system(4, 8);
    system.run().unwrap();
    system.reduce().unwrap();

    // Each PE covers two elements: S[p] = 2 (2p+1)^2 + 2 (2p+2)^2.
    for pe in 0..4 {
        let expected: f64 = (2 * pe..2 * pe + 2)
            .map(|i| 2.0 * ((i + 1) as f64).powi(2))
            .sum();
        let got = system.mem.load_f64(system.layout.s_addr(pe)).unwrap();
        assert_eq!(got, expected, "partial sum of PE{pe}");
    }
}

#[test]
fn uneven_split_still_adds_up() {
    let system = dot_system(4, 10);
    system.run().unwrap();
    assert_eq!(system.reduce().unwrap(), reference_dot(10));
}

#[test]
fn single_pe_runs_the_whole_vector() {
    let system = dot_system(1, 8);
    system.run().unwrap();
    assert_eq!(system.reduce().unwrap(), 408.0);
}

#[test]
fn more_pes_than_elements() {
    // Two elements over four PEs: two empty slices store zero partials.
    let system = dot_system(4, 2);
    system.run().unwrap();
    assert_eq!(system.reduce().unwrap(), reference_dot(2));
    assert_eq!(system.mem.load_f64(system.layout.s_addr(2)).unwrap(), 0.0);
    assert_eq!(system.mem.load_f64(system.layout.s_addr(3)).unwrap(), 0.0);
}

#[test]
fn cooperative_round_robin_matches_threaded_run() {
    let system = dot_system(4, 8);
    let mut guard = 0;
    while system.any_running() {
        for pe in &system.pes {
            let mut pe = pe.lock().unwrap();
            if !pe.is_halted() {
                pe.step();
            }
        }
        guard += 1;
        assert!(guard < 10_000, "dot product did not converge");
    }
    system.flush_caches().unwrap();
    assert_eq!(system.reduce().unwrap(), 408.0);
}

#[test]
fn caches_actually_carried_the_traffic() {
    let system = dot_system(4, 8);
    system.run().unwrap();
    for cache in &system.caches {
        let stats = cache.stats();
        // Two elements per PE: two loads of A, two of B, one store of S.
        assert!(stats.reads >= 4, "PE{} reads={}", cache.pe_id(), stats.reads);
        assert!(stats.writes >= 1);
        assert!(stats.bus_msgs >= 1);
    }
    let pe_stats = system.pes[0].lock().unwrap().stats;
    assert_eq!(pe_stats.loads, 4);
    assert_eq!(pe_stats.stores, 1);
}

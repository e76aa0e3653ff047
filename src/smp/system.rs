use std::sync::{Arc, Mutex};

use crate::smp::asm::Program;
use crate::smp::bus::Interconnect;
use crate::smp::cache::{CacheGeometry, DataPort, L1Cache};
use crate::smp::memory::{Address, MemError, SharedMemory, WORD_BYTES};
use crate::smp::pe::ProcessingElement;

/// Built-in dot-product kernel. Each PE runs the same text over its own
/// slice: `R0 = &A[start]`, `R1 = &B[start]`, `R2 = &S[pe]`, `R3 = slice
/// length, `R4 = accumulator`.
pub const DOTPROD_ASM: &str = "\
// dot product over one slice of A and B
START:
    JNZ R3, BODY        // empty slice stores a zero partial sum
    STORE R4, [R2]
    HALT
BODY:
    LOAD R5, [R0]
    LOAD R6, [R1]
    FMUL R7, R5, R6
    FADD R4, R4, R7
    INC R0
    INC R1
    DEC R3
    JNZ R3, BODY
    STORE R4, [R2]
    HALT
";

#[derive(Debug, Clone, Copy)]
pub struct SystemConfig {
    pub num_pes: usize,
    /// Vector length of the dot-product workload.
    pub n: usize,
    pub geometry: CacheGeometry,
    pub mem_words: u32,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            num_pes: 4,
            n: 8,
            geometry: CacheGeometry::reference(),
            mem_words: 512,
        }
    }
}

/// Word layout of the dot-product workload: `A[0..N)`, `B[0..N)`, partial
/// sums `S[0..P)`, then the final scalar.
#[derive(Debug, Clone, Copy)]
pub struct DotLayout {
    pub n: usize,
    pub p: usize,
}

impl DotLayout {
    pub fn a_addr(&self, i: usize) -> Address {
        (i * WORD_BYTES) as Address
    }

    pub fn b_addr(&self, i: usize) -> Address {
        ((self.n + i) * WORD_BYTES) as Address
    }

    pub fn s_addr(&self, pe: usize) -> Address {
        ((2 * self.n + pe) * WORD_BYTES) as Address
    }

    pub fn final_addr(&self) -> Address {
        ((2 * self.n + self.p) * WORD_BYTES) as Address
    }

    pub fn words_needed(&self) -> u32 {
        (2 * self.n + self.p + 1) as u32
    }
}

/// The assembled multiprocessor: shared memory, snoopy bus, one private
/// cache and one PE per processing element. Owns every component; the bus
/// only keeps non-owning references to the caches.
pub struct System {
    pub config: SystemConfig,
    pub layout: DotLayout,
    pub mem: Arc<SharedMemory>,
    pub bus: Arc<Interconnect>,
    pub caches: Vec<Arc<L1Cache>>,
    pub pes: Vec<Arc<Mutex<ProcessingElement>>>,
}

impl System {
    pub fn new(config: SystemConfig) -> Result<Self, MemError> {
        assert!(config.num_pes > 0);
        let layout = DotLayout {
            n: config.n,
            p: config.num_pes,
        };
        let mem_words = config.mem_words.max(layout.words_needed());
        let mem = Arc::new(SharedMemory::new(mem_words, config.geometry.block_bytes));
        let bus = Arc::new(Interconnect::new());

        let mut caches = Vec::with_capacity(config.num_pes);
        let mut pes = Vec::with_capacity(config.num_pes);
        for id in 0..config.num_pes {
            let cache = L1Cache::attach(id, config.geometry, Arc::clone(&mem), Arc::clone(&bus));
            let port: Arc<dyn DataPort> = Arc::clone(&cache) as Arc<dyn DataPort>;
            caches.push(cache);
            pes.push(Arc::new(Mutex::new(ProcessingElement::new(id, port))));
        }

        // Informational ownership segments, one equal share per PE.
        let seg_words = mem_words / config.num_pes as u32;
        for id in 0..config.num_pes {
            mem.add_segment(id, id as u32 * seg_words, seg_words);
        }

        let system = Self {
            config,
            layout,
            mem,
            bus,
            caches,
            pes,
        };
        system.initialize_memory()?;
        Ok(system)
    }

    /// Seed the workload vectors: `A[i] = i+1`, `B[i] = 2(i+1)`, partial
    /// sums and the final scalar zeroed.
    fn initialize_memory(&self) -> Result<(), MemError> {
        for i in 0..self.layout.n {
            self.mem.store_f64(self.layout.a_addr(i), (i + 1) as f64)?;
            self.mem
                .store_f64(self.layout.b_addr(i), 2.0 * (i + 1) as f64)?;
        }
        for pe in 0..self.layout.p {
            self.mem.store_f64(self.layout.s_addr(pe), 0.0)?;
        }
        self.mem.store_f64(self.layout.final_addr(), 0.0)?;
        Ok(())
    }

    /// First vector index of `pe`'s slice under the balanced split.
    fn slice_start(&self, pe: usize) -> usize {
        let base_len = self.layout.n / self.config.num_pes;
        let rest = self.layout.n % self.config.num_pes;
        pe * base_len + pe.min(rest)
    }

    /// Slice length of `pe`; the first `N % P` PEs take one extra element.
    fn slice_len(&self, pe: usize) -> usize {
        let base_len = self.layout.n / self.config.num_pes;
        let rest = self.layout.n % self.config.num_pes;
        base_len + usize::from(pe < rest)
    }

    /// Load `program` into every PE and plant the slice registers.
    pub fn load_program(&self, program: &Program) {
        for (id, pe) in self.pes.iter().enumerate() {
            let start = self.slice_start(id);
            let len = self.slice_len(id);
            let mut pe = pe.lock().unwrap();
            pe.load_program(program.clone());
            pe.set_reg_i64(0, self.layout.a_addr(start) as i64);
            pe.set_reg_i64(1, self.layout.b_addr(start) as i64);
            pe.set_reg_i64(2, self.layout.s_addr(id) as i64);
            pe.set_reg_i64(3, len as i64);
            pe.set_reg_f64(4, 0.0);
            tracing::debug!(pe = id, start, len, "slice assigned");
        }
    }

    /// Run every PE to completion on its own OS thread, then flush all
    /// caches so main memory holds the results.
    pub fn run(&self) -> Result<(), MemError> {
        std::thread::scope(|s| {
            for pe in &self.pes {
                let pe = Arc::clone(pe);
                s.spawn(move || pe.lock().unwrap().run());
            }
        });
        self.flush_caches()
    }

    /// Write every Modified line in the system back to memory.
    pub fn flush_caches(&self) -> Result<(), MemError> {
        for cache in &self.caches {
            cache.flush_all()?;
        }
        self.bus.flush_all()
    }

    /// Sum the partial sums through memory and store the scalar at word
    /// `2N+P`.
    pub fn reduce(&self) -> Result<f64, MemError> {
        let mut total = 0.0;
        for pe in 0..self.layout.p {
            total += self.mem.load_f64(self.layout.s_addr(pe))?;
        }
        self.mem.store_f64(self.layout.final_addr(), total)?;
        Ok(total)
    }

    /// Sequential reference result computed straight from memory.
    pub fn expected(&self) -> Result<f64, MemError> {
        let mut expected = 0.0;
        for i in 0..self.layout.n {
            expected +=
                self.mem.load_f64(self.layout.a_addr(i))? * self.mem.load_f64(self.layout.b_addr(i))?;
        }
        Ok(expected)
    }

    pub fn any_running(&self) -> bool {
        self.pes.iter().any(|pe| !pe.lock().unwrap().is_halted())
    }
}

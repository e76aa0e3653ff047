use std::fmt;
use std::sync::{Arc, Mutex};

use crate::smp::bus::{BusCmd, BusMessage, Interconnect, SnoopResponse};
use crate::smp::memory::{Address, MemError, SharedMemory, WORD_BYTES};

/// MESI coherence state of one cache line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MesiState {
    Invalid,
    Shared,
    Exclusive,
    Modified,
}

impl fmt::Display for MesiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MesiState::Invalid => "I",
            MesiState::Shared => "S",
            MesiState::Exclusive => "E",
            MesiState::Modified => "M",
        };
        f.write_str(s)
    }
}

/// Address split as seen by the cache: low `offset` bits inside the block,
/// middle `index` bits selecting the set, remaining high bits as tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrFields {
    pub tag: u64,
    pub index: usize,
    pub offset: usize,
}

/// Construction-time cache geometry. All fields must be powers of two; the
/// invariants of the coherence protocol are independent of the exact values.
#[derive(Debug, Clone, Copy)]
pub struct CacheGeometry {
    pub block_bytes: usize,
    pub ways: usize,
    pub num_sets: usize,
}

impl CacheGeometry {
    pub fn new(block_bytes: usize, ways: usize, num_sets: usize) -> Self {
        assert!(block_bytes.is_power_of_two() && block_bytes >= WORD_BYTES);
        assert!(num_sets.is_power_of_two());
        assert!(ways > 0);
        Self {
            block_bytes,
            ways,
            num_sets,
        }
    }

    /// Reference profile: 32-byte blocks, 2 ways, 8 sets (16 lines).
    pub fn reference() -> Self {
        Self::new(32, 2, 8)
    }

    fn offset_bits(&self) -> u32 {
        self.block_bytes.trailing_zeros()
    }

    fn index_bits(&self) -> u32 {
        self.num_sets.trailing_zeros()
    }

    pub fn split(&self, addr: Address) -> AddrFields {
        let offset = (addr & (self.block_bytes as u64 - 1)) as usize;
        let index = ((addr >> self.offset_bits()) & (self.num_sets as u64 - 1)) as usize;
        let tag = addr >> (self.offset_bits() + self.index_bits());
        AddrFields { tag, index, offset }
    }

    /// Address with the offset bits cleared.
    pub fn block_base(&self, addr: Address) -> Address {
        addr & !(self.block_bytes as u64 - 1)
    }

    /// Rebuild the block base address of a resident line from its tag and
    /// set index. Used when writing a victim back.
    pub fn block_addr(&self, tag: u64, index: usize) -> Address {
        ((tag << self.index_bits()) | index as u64) << self.offset_bits()
    }
}

#[derive(Clone)]
struct CacheLine {
    state: MesiState,
    tag: u64,
    data: Vec<u8>,
    recent: bool,
}

impl CacheLine {
    fn new(block_bytes: usize) -> Self {
        Self {
            state: MesiState::Invalid,
            tag: 0,
            data: vec![0; block_bytes],
            recent: false,
        }
    }
}

/// Per-cache counters. All counters are monotonic.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub reads: u64,
    pub writes: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub bus_msgs: u64,
    pub writebacks: u64,
    pub upgrades: u64,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reads={} writes={} misses={} invalidations={} bus_msgs={} writebacks={} upgrades={}",
            self.reads,
            self.writes,
            self.misses,
            self.invalidations,
            self.bus_msgs,
            self.writebacks,
            self.upgrades
        )
    }
}

struct CacheInner {
    sets: Vec<Vec<CacheLine>>,
    stats: CacheStats,
}

impl CacheInner {
    fn new(geometry: &CacheGeometry) -> Self {
        let sets = (0..geometry.num_sets)
            .map(|_| {
                (0..geometry.ways)
                    .map(|_| CacheLine::new(geometry.block_bytes))
                    .collect()
            })
            .collect();
        Self {
            sets,
            stats: CacheStats::default(),
        }
    }

    /// Way holding `tag` in `index` with a valid state, if any. At most one
    /// way per set can match.
    fn probe(&self, tag: u64, index: usize) -> Option<usize> {
        self.sets[index]
            .iter()
            .position(|l| l.state != MesiState::Invalid && l.tag == tag)
    }

    /// Mark `way` as the recently used line of its set.
    fn touch(&mut self, index: usize, way: usize) {
        for (w, line) in self.sets[index].iter_mut().enumerate() {
            line.recent = w == way;
        }
    }

    /// Victim choice: any invalid way, else the first way whose recent bit
    /// is clear, else way 0.
    fn victim_way(&self, index: usize) -> usize {
        let set = &self.sets[index];
        if let Some(w) = set.iter().position(|l| l.state == MesiState::Invalid) {
            return w;
        }
        set.iter().position(|l| !l.recent).unwrap_or(0)
    }

    fn writeback(
        &mut self,
        geometry: &CacheGeometry,
        mem: &SharedMemory,
        index: usize,
        way: usize,
    ) -> Result<(), MemError> {
        let addr = geometry.block_addr(self.sets[index][way].tag, index);
        mem.write_block(addr, &self.sets[index][way].data)?;
        self.stats.writebacks += 1;
        Ok(())
    }

    fn fill(
        &mut self,
        geometry: &CacheGeometry,
        mem: &SharedMemory,
        addr: Address,
        index: usize,
        way: usize,
        tag: u64,
    ) -> Result<(), MemError> {
        let block = mem.read_block(geometry.block_base(addr))?;
        let line = &mut self.sets[index][way];
        line.data = block;
        line.tag = tag;
        Ok(())
    }

    fn word_at(&self, index: usize, way: usize, offset: usize) -> f64 {
        // The offset is aligned down to a word slot; the PE has already
        // warned about unaligned accesses.
        let off = offset & !(WORD_BYTES - 1);
        let raw: [u8; WORD_BYTES] = self.sets[index][way].data[off..off + WORD_BYTES]
            .try_into()
            .unwrap();
        f64::from_bits(u64::from_le_bytes(raw))
    }

    fn set_word(&mut self, index: usize, way: usize, offset: usize, value: f64) {
        let off = offset & !(WORD_BYTES - 1);
        self.sets[index][way].data[off..off + WORD_BYTES]
            .copy_from_slice(&value.to_bits().to_le_bytes());
    }
}

/// Private L1 cache of one PE: n-way set-associative, write-allocate,
/// write-back, kept coherent over the snoopy bus with the MESI protocol.
///
/// Locking: `inner` guards lines, recent bits and counters. The lock is
/// never held while a bus transaction is initiated; inside a transaction
/// the order is always bus mutex first, cache mutex second.
pub struct L1Cache {
    pe_id: usize,
    geometry: CacheGeometry,
    mem: Arc<SharedMemory>,
    bus: Arc<Interconnect>,
    inner: Mutex<CacheInner>,
}

impl L1Cache {
    /// Build a cache bound to one PE and register it with the bus.
    pub fn attach(
        pe_id: usize,
        geometry: CacheGeometry,
        mem: Arc<SharedMemory>,
        bus: Arc<Interconnect>,
    ) -> Arc<Self> {
        let inner = Mutex::new(CacheInner::new(&geometry));
        let cache = Arc::new(Self {
            pe_id,
            geometry,
            mem,
            bus,
            inner,
        });
        cache.bus.register(&cache);
        cache
    }

    pub fn pe_id(&self) -> usize {
        self.pe_id
    }

    pub fn geometry(&self) -> CacheGeometry {
        self.geometry
    }

    /// Load the word at `addr`.
    pub fn read_double(&self, addr: Address) -> Result<f64, MemError> {
        let fields = self.geometry.split(addr);
        {
            let mut inner = self.inner.lock().unwrap();
            inner.stats.reads += 1;
            if let Some(way) = inner.probe(fields.tag, fields.index) {
                inner.touch(fields.index, way);
                return Ok(inner.word_at(fields.index, way, fields.offset));
            }
            inner.stats.misses += 1;
        }

        // Miss: fetch the block under a BusRd transaction. The refill is
        // part of the transaction, so peers observe a consistent line.
        let msg = self.message(BusCmd::BusRd, addr);
        self.bus.broadcast(msg, |summary| {
            let mut inner = self.inner.lock().unwrap();
            let way = self.evict_and_fill(&mut inner, addr, &fields)?;
            let state = if summary.shared_seen {
                MesiState::Shared
            } else {
                MesiState::Exclusive
            };
            self.transition(fields.index, way, MesiState::Invalid, state, addr);
            inner.sets[fields.index][way].state = state;
            inner.touch(fields.index, way);
            Ok(inner.word_at(fields.index, way, fields.offset))
        })
    }

    /// Store a word at `addr`.
    pub fn write_double(&self, addr: Address, value: f64) -> Result<(), MemError> {
        let fields = self.geometry.split(addr);
        self.inner.lock().unwrap().stats.writes += 1;

        loop {
            let cmd = {
                let mut inner = self.inner.lock().unwrap();
                match inner.probe(fields.tag, fields.index) {
                    Some(way) => match inner.sets[fields.index][way].state {
                        MesiState::Modified => {
                            inner.set_word(fields.index, way, fields.offset, value);
                            inner.touch(fields.index, way);
                            return Ok(());
                        }
                        MesiState::Exclusive => {
                            self.transition(
                                fields.index,
                                way,
                                MesiState::Exclusive,
                                MesiState::Modified,
                                addr,
                            );
                            inner.sets[fields.index][way].state = MesiState::Modified;
                            inner.set_word(fields.index, way, fields.offset, value);
                            inner.touch(fields.index, way);
                            return Ok(());
                        }
                        // Others must drop their copies first.
                        MesiState::Shared => BusCmd::BusUpgr,
                        MesiState::Invalid => unreachable!("probe never returns invalid lines"),
                    },
                    None => {
                        inner.stats.misses += 1;
                        BusCmd::BusRdX
                    }
                }
            };

            let msg = self.message(cmd, addr);
            let done = self.bus.broadcast(msg, |_summary| {
                let mut inner = self.inner.lock().unwrap();
                match cmd {
                    BusCmd::BusUpgr => {
                        // The line may have been invalidated by a racing
                        // BusRdX between our probe and this transaction; if
                        // so, retry as a write miss.
                        match inner.probe(fields.tag, fields.index) {
                            Some(way)
                                if inner.sets[fields.index][way].state == MesiState::Shared =>
                            {
                                self.transition(
                                    fields.index,
                                    way,
                                    MesiState::Shared,
                                    MesiState::Modified,
                                    addr,
                                );
                                inner.sets[fields.index][way].state = MesiState::Modified;
                                inner.stats.upgrades += 1;
                                inner.set_word(fields.index, way, fields.offset, value);
                                inner.touch(fields.index, way);
                                Ok(true)
                            }
                            _ => Ok(false),
                        }
                    }
                    BusCmd::BusRdX => {
                        let way = self.evict_and_fill(&mut inner, addr, &fields)?;
                        self.transition(
                            fields.index,
                            way,
                            MesiState::Invalid,
                            MesiState::Modified,
                            addr,
                        );
                        inner.sets[fields.index][way].state = MesiState::Modified;
                        inner.set_word(fields.index, way, fields.offset, value);
                        inner.touch(fields.index, way);
                        Ok(true)
                    }
                    BusCmd::BusRd | BusCmd::Flush => unreachable!("not issued by the store path"),
                }
            })?;
            if done {
                return Ok(());
            }
        }
    }

    /// React to a message another cache placed on the bus. Called by the
    /// interconnect with the bus mutex held; takes the cache lock itself and
    /// never initiates a transaction of its own.
    pub fn snoop(&self, msg: &BusMessage) -> SnoopResponse {
        let fields = self.geometry.split(msg.addr);
        let mut inner = self.inner.lock().unwrap();
        let Some(way) = inner.probe(fields.tag, fields.index) else {
            return SnoopResponse::default();
        };

        let mut resp = SnoopResponse {
            had_copy: true,
            wrote_back: false,
        };
        let state = inner.sets[fields.index][way].state;
        match (msg.cmd, state) {
            (BusCmd::BusRd, MesiState::Modified) => {
                if self.snoop_writeback(&mut inner, fields.index, way) {
                    resp.wrote_back = true;
                    self.transition(fields.index, way, state, MesiState::Shared, msg.addr);
                    inner.sets[fields.index][way].state = MesiState::Shared;
                }
            }
            (BusCmd::BusRd, MesiState::Exclusive) => {
                self.transition(fields.index, way, state, MesiState::Shared, msg.addr);
                inner.sets[fields.index][way].state = MesiState::Shared;
            }
            (BusCmd::BusRd, MesiState::Shared) => {}
            (BusCmd::BusRdX, MesiState::Modified) => {
                if self.snoop_writeback(&mut inner, fields.index, way) {
                    resp.wrote_back = true;
                    self.invalidate(&mut inner, fields.index, way, msg.addr);
                }
            }
            (BusCmd::BusRdX, MesiState::Exclusive | MesiState::Shared) => {
                self.invalidate(&mut inner, fields.index, way, msg.addr);
            }
            (BusCmd::BusUpgr, MesiState::Shared | MesiState::Exclusive) => {
                self.invalidate(&mut inner, fields.index, way, msg.addr);
            }
            (BusCmd::BusUpgr, MesiState::Modified) => {
                // SWMR forbids an upgrade racing a modified copy.
                debug_assert!(false, "BusUpgr snooped on a Modified line");
                tracing::warn!(
                    pe = self.pe_id,
                    addr = msg.addr,
                    "BusUpgr snooped on a Modified line, dropping to Invalid"
                );
                self.invalidate(&mut inner, fields.index, way, msg.addr);
            }
            (BusCmd::Flush, _) => {}
            (_, MesiState::Invalid) => unreachable!("probe never returns invalid lines"),
        }
        resp
    }

    /// Write every Modified line back to memory. Lines stay resident and
    /// move to Exclusive: no other cache can hold a copy of a line we held
    /// in Modified.
    pub fn flush_all(&self) -> Result<(), MemError> {
        let mut inner = self.inner.lock().unwrap();
        for index in 0..self.geometry.num_sets {
            for way in 0..self.geometry.ways {
                if inner.sets[index][way].state == MesiState::Modified {
                    inner.writeback(&self.geometry, &self.mem, index, way)?;
                    let addr = self
                        .geometry
                        .block_addr(inner.sets[index][way].tag, index);
                    self.transition(index, way, MesiState::Modified, MesiState::Exclusive, addr);
                    inner.sets[index][way].state = MesiState::Exclusive;
                }
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().unwrap().stats
    }

    pub fn state_of(&self, set: usize, way: usize) -> MesiState {
        self.inner.lock().unwrap().sets[set][way].state
    }

    pub fn tag_of(&self, set: usize, way: usize) -> u64 {
        self.inner.lock().unwrap().sets[set][way].tag
    }

    pub fn recent_of(&self, set: usize, way: usize) -> bool {
        self.inner.lock().unwrap().sets[set][way].recent
    }

    /// Human-readable rendering of every line, for the stepper.
    pub fn dump(&self) -> String {
        use std::fmt::Write as _;
        let inner = self.inner.lock().unwrap();
        let mut out = String::new();
        let _ = writeln!(out, "[PE{}] cache", self.pe_id);
        for (index, set) in inner.sets.iter().enumerate() {
            let _ = write!(out, "  set {index}:");
            for (way, line) in set.iter().enumerate() {
                if line.state == MesiState::Invalid {
                    let _ = write!(out, " [way{way}: I]");
                } else {
                    let _ = write!(
                        out,
                        " [way{way}: {} tag={:#x} recent={}]",
                        line.state, line.tag, line.recent as u8
                    );
                }
            }
            let _ = writeln!(out);
        }
        let _ = writeln!(out, "  {}", inner.stats);
        out
    }

    fn message(&self, cmd: BusCmd, addr: Address) -> BusMessage {
        self.inner.lock().unwrap().stats.bus_msgs += 1;
        BusMessage {
            cmd,
            addr: self.geometry.block_base(addr),
            src_pe: self.pe_id,
        }
    }

    /// Pick a victim in the target set, write it back if dirty and refill it
    /// with the block containing `addr`. Returns the chosen way; the caller
    /// sets the new state.
    fn evict_and_fill(
        &self,
        inner: &mut CacheInner,
        addr: Address,
        fields: &AddrFields,
    ) -> Result<usize, MemError> {
        let way = inner.victim_way(fields.index);
        let victim_state = inner.sets[fields.index][way].state;
        if victim_state == MesiState::Modified {
            inner.writeback(&self.geometry, &self.mem, fields.index, way)?;
        }
        if victim_state != MesiState::Invalid {
            let victim_addr = self
                .geometry
                .block_addr(inner.sets[fields.index][way].tag, fields.index);
            self.transition(fields.index, way, victim_state, MesiState::Invalid, victim_addr);
        }
        // Invalid until the fill completes, so a failed fill leaves a
        // well-defined line.
        inner.sets[fields.index][way].state = MesiState::Invalid;
        inner.fill(&self.geometry, &self.mem, addr, fields.index, way, fields.tag)?;
        Ok(way)
    }

    fn invalidate(&self, inner: &mut CacheInner, index: usize, way: usize, addr: Address) {
        let from = inner.sets[index][way].state;
        self.transition(index, way, from, MesiState::Invalid, addr);
        inner.sets[index][way].state = MesiState::Invalid;
        inner.stats.invalidations += 1;
    }

    fn snoop_writeback(&self, inner: &mut CacheInner, index: usize, way: usize) -> bool {
        match inner.writeback(&self.geometry, &self.mem, index, way) {
            Ok(()) => true,
            Err(e) => {
                // Cannot happen for a block that was filled through the same
                // geometry; leave the line untouched and let the origin's
                // own fill surface the failure.
                tracing::error!(pe = self.pe_id, error = %e, "snoop write-back failed");
                false
            }
        }
    }

    fn transition(&self, set: usize, way: usize, from: MesiState, to: MesiState, addr: Address) {
        if from != to {
            tracing::debug!(
                pe = self.pe_id,
                set,
                way,
                %from,
                %to,
                addr,
                "mesi transition"
            );
        }
    }
}

/// Capability the PE programs against: an 8-byte load/store port. The
/// coherent L1 cache is the real implementation; [`FlatMemory`] bypasses
/// caching entirely.
pub trait DataPort: Send + Sync {
    fn load_double(&self, addr: Address) -> Result<f64, MemError>;
    fn store_double(&self, addr: Address, value: f64) -> Result<(), MemError>;
}

impl DataPort for L1Cache {
    fn load_double(&self, addr: Address) -> Result<f64, MemError> {
        self.read_double(addr)
    }

    fn store_double(&self, addr: Address, value: f64) -> Result<(), MemError> {
        self.write_double(addr, value)
    }
}

/// Uncached pass-through port straight to shared memory. Used by tests and
/// as a reference for what the memory holds without coherence in between.
pub struct FlatMemory {
    mem: Arc<SharedMemory>,
}

impl FlatMemory {
    pub fn new(mem: Arc<SharedMemory>) -> Self {
        Self { mem }
    }
}

impl DataPort for FlatMemory {
    fn load_double(&self, addr: Address) -> Result<f64, MemError> {
        self.mem.load_f64(addr)
    }

    fn store_double(&self, addr: Address, value: f64) -> Result<(), MemError> {
        self.mem.store_f64(addr, value)
    }
}

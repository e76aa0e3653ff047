use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use thiserror::Error;

/// Byte address into main memory.
pub type Address = u64;

/// Size of a machine word in bytes. Every scalar the PEs move is one word.
pub const WORD_BYTES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemError {
    #[error("unaligned access at byte address {0:#x}, required alignment {1}")]
    Alignment(Address, u64),
    #[error("byte address {0:#x} out of range for {1} words of memory")]
    Range(Address, u32),
    #[error("block payload must be {0} bytes, got {1}")]
    BlockSize(usize, usize),
    #[error("shared memory worker has stopped")]
    Stopped,
}

/// Region of memory associated with a PE, informational only: the memory
/// serves any request regardless of segment ownership.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub pe_id: usize,
    pub base_word: u32,
    pub len_words: u32,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MemStats {
    pub word_reads: u64,
    pub word_writes: u64,
    pub block_reads: u64,
    pub block_writes: u64,
}

impl fmt::Display for MemStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "word_reads={} word_writes={} block_reads={} block_writes={}",
            self.word_reads, self.word_writes, self.block_reads, self.block_writes
        )
    }
}

#[derive(Default)]
struct Counters {
    word_reads: AtomicU64,
    word_writes: AtomicU64,
    block_reads: AtomicU64,
    block_writes: AtomicU64,
}

/// One queued memory operation, carrying its single-use reply channel.
enum Request {
    ReadWord {
        addr: Address,
        reply: Sender<Result<u64, MemError>>,
    },
    WriteWord {
        addr: Address,
        value: u64,
        reply: Sender<Result<(), MemError>>,
    },
    ReadBlock {
        addr: Address,
        reply: Sender<Result<Vec<u8>, MemError>>,
    },
    WriteBlock {
        addr: Address,
        data: Vec<u8>,
        reply: Sender<Result<(), MemError>>,
    },
    Shutdown,
}

/// Shared main memory: a contiguous word array served by a single worker
/// thread draining a request queue. All public operations block the caller
/// until the worker has answered, which also makes them atomic with respect
/// to one another.
pub struct SharedMemory {
    tx: Sender<Request>,
    worker: Mutex<Option<JoinHandle<()>>>,
    segments: Mutex<Vec<Segment>>,
    counters: Arc<Counters>,
    size_words: u32,
    block_bytes: usize,
}

impl SharedMemory {
    pub fn new(size_words: u32, block_bytes: usize) -> Self {
        assert!(block_bytes.is_power_of_two() && block_bytes >= WORD_BYTES);
        let (tx, rx) = unbounded();
        let counters = Arc::new(Counters::default());
        let worker_counters = Arc::clone(&counters);
        let worker = std::thread::Builder::new()
            .name("shared-memory".to_string())
            .spawn(move || worker_loop(rx, size_words, block_bytes, worker_counters))
            .expect("failed to spawn shared memory worker");
        Self {
            tx,
            worker: Mutex::new(Some(worker)),
            segments: Mutex::new(Vec::new()),
            counters,
            size_words,
            block_bytes,
        }
    }

    pub fn size_words(&self) -> u32 {
        self.size_words
    }

    pub fn block_bytes(&self) -> usize {
        self.block_bytes
    }

    pub fn add_segment(&self, pe_id: usize, base_word: u32, len_words: u32) {
        self.segments.lock().unwrap().push(Segment {
            pe_id,
            base_word,
            len_words,
        });
    }

    /// PE owning the segment covering `byte_addr`, if any.
    pub fn owner_segment(&self, byte_addr: Address) -> Option<usize> {
        let word = (byte_addr / WORD_BYTES as u64) as u32;
        self.segments
            .lock()
            .unwrap()
            .iter()
            .find(|s| word >= s.base_word && word < s.base_word + s.len_words)
            .map(|s| s.pe_id)
    }

    /// Read the aligned 8-byte word at `addr`.
    pub fn read_word(&self, addr: Address) -> Result<u64, MemError> {
        let (reply, rx) = bounded(1);
        self.send(Request::ReadWord { addr, reply })?;
        recv(rx)
    }

    /// Store an 8-byte word at the aligned address `addr`.
    pub fn write_word(&self, addr: Address, value: u64) -> Result<(), MemError> {
        let (reply, rx) = bounded(1);
        self.send(Request::WriteWord { addr, value, reply })?;
        recv(rx)
    }

    /// Read `block_bytes` bytes starting at the block-aligned address `addr`.
    pub fn read_block(&self, addr: Address) -> Result<Vec<u8>, MemError> {
        let (reply, rx) = bounded(1);
        self.send(Request::ReadBlock { addr, reply })?;
        recv(rx)
    }

    /// Store `block_bytes` bytes starting at the block-aligned address `addr`.
    pub fn write_block(&self, addr: Address, data: &[u8]) -> Result<(), MemError> {
        let (reply, rx) = bounded(1);
        self.send(Request::WriteBlock {
            addr,
            data: data.to_vec(),
            reply,
        })?;
        recv(rx)
    }

    /// Read the word at `addr` reinterpreted as a double.
    pub fn load_f64(&self, addr: Address) -> Result<f64, MemError> {
        Ok(f64::from_bits(self.read_word(addr)?))
    }

    /// Store a double into the word at `addr`.
    pub fn store_f64(&self, addr: Address, value: f64) -> Result<(), MemError> {
        self.write_word(addr, value.to_bits())
    }

    pub fn stats(&self) -> MemStats {
        MemStats {
            word_reads: self.counters.word_reads.load(Ordering::Relaxed),
            word_writes: self.counters.word_writes.load(Ordering::Relaxed),
            block_reads: self.counters.block_reads.load(Ordering::Relaxed),
            block_writes: self.counters.block_writes.load(Ordering::Relaxed),
        }
    }

    /// Terminate the worker. Requests issued afterwards fail with
    /// [`MemError::Stopped`].
    pub fn stop(&self) {
        let _ = self.tx.send(Request::Shutdown);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn send(&self, req: Request) -> Result<(), MemError> {
        self.tx.send(req).map_err(|_| MemError::Stopped)
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        self.stop();
    }
}

fn recv<T>(rx: Receiver<Result<T, MemError>>) -> Result<T, MemError> {
    rx.recv().map_err(|_| MemError::Stopped)?
}

fn worker_loop(rx: Receiver<Request>, size_words: u32, block_bytes: usize, counters: Arc<Counters>) {
    let mut mem = vec![0u64; size_words as usize];
    while let Ok(req) = rx.recv() {
        match req {
            Request::Shutdown => break,
            Request::ReadWord { addr, reply } => {
                let res = word_index(addr, size_words).map(|idx| {
                    counters.word_reads.fetch_add(1, Ordering::Relaxed);
                    mem[idx]
                });
                let _ = reply.send(res);
            }
            Request::WriteWord { addr, value, reply } => {
                let res = word_index(addr, size_words).map(|idx| {
                    mem[idx] = value;
                    counters.word_writes.fetch_add(1, Ordering::Relaxed);
                });
                let _ = reply.send(res);
            }
            Request::ReadBlock { addr, reply } => {
                let res = block_range(addr, size_words, block_bytes).map(|(first, count)| {
                    counters.block_reads.fetch_add(1, Ordering::Relaxed);
                    let mut out = Vec::with_capacity(block_bytes);
                    for w in &mem[first..first + count] {
                        out.extend_from_slice(&w.to_le_bytes());
                    }
                    out
                });
                let _ = reply.send(res);
            }
            Request::WriteBlock { addr, data, reply } => {
                let res = block_range(addr, size_words, block_bytes).and_then(|(first, count)| {
                    if data.len() != block_bytes {
                        return Err(MemError::BlockSize(block_bytes, data.len()));
                    }
                    for i in 0..count {
                        let mut raw = [0u8; WORD_BYTES];
                        raw.copy_from_slice(&data[i * WORD_BYTES..(i + 1) * WORD_BYTES]);
                        mem[first + i] = u64::from_le_bytes(raw);
                    }
                    counters.block_writes.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                });
                let _ = reply.send(res);
            }
        }
    }
}

fn word_index(addr: Address, size_words: u32) -> Result<usize, MemError> {
    if addr % WORD_BYTES as u64 != 0 {
        return Err(MemError::Alignment(addr, WORD_BYTES as u64));
    }
    let idx = (addr / WORD_BYTES as u64) as usize;
    if idx >= size_words as usize {
        return Err(MemError::Range(addr, size_words));
    }
    Ok(idx)
}

fn block_range(
    addr: Address,
    size_words: u32,
    block_bytes: usize,
) -> Result<(usize, usize), MemError> {
    if addr % block_bytes as u64 != 0 {
        return Err(MemError::Alignment(addr, block_bytes as u64));
    }
    let first = (addr / WORD_BYTES as u64) as usize;
    let count = block_bytes / WORD_BYTES;
    if first + count > size_words as usize {
        return Err(MemError::Range(addr, size_words));
    }
    Ok((first, count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_roundtrip() {
        let mem = SharedMemory::new(16, 32);
        mem.write_word(8, 0xdead_beef).unwrap();
        assert_eq!(mem.read_word(8).unwrap(), 0xdead_beef);
        assert_eq!(mem.read_word(0).unwrap(), 0);
    }

    #[test]
    fn f64_roundtrip() {
        let mem = SharedMemory::new(16, 32);
        mem.store_f64(16, 3.14159).unwrap();
        assert_eq!(mem.load_f64(16).unwrap(), 3.14159);
    }

    #[test]
    fn unaligned_word_is_rejected() {
        let mem = SharedMemory::new(16, 32);
        assert_eq!(mem.read_word(4), Err(MemError::Alignment(4, 8)));
        assert_eq!(mem.write_word(13, 1), Err(MemError::Alignment(13, 8)));
    }

    #[test]
    fn out_of_range_word_is_rejected() {
        let mem = SharedMemory::new(4, 32);
        assert_eq!(mem.read_word(4 * 8), Err(MemError::Range(32, 4)));
    }

    #[test]
    fn block_roundtrip_through_words() {
        let mem = SharedMemory::new(16, 32);
        // Words and blocks view the same storage.
        mem.write_word(32, 7).unwrap();
        let block = mem.read_block(32).unwrap();
        assert_eq!(block.len(), 32);
        assert_eq!(u64::from_le_bytes(block[0..8].try_into().unwrap()), 7);

        let mut data = vec![0u8; 32];
        data[8..16].copy_from_slice(&42u64.to_le_bytes());
        mem.write_block(0, &data).unwrap();
        assert_eq!(mem.read_word(8).unwrap(), 42);
    }

    #[test]
    fn unaligned_block_is_rejected() {
        let mem = SharedMemory::new(16, 32);
        assert_eq!(mem.read_block(8), Err(MemError::Alignment(8, 32)));
    }

    #[test]
    fn short_block_payload_is_rejected() {
        let mem = SharedMemory::new(16, 32);
        assert_eq!(
            mem.write_block(0, &[0u8; 16]),
            Err(MemError::BlockSize(32, 16))
        );
    }

    #[test]
    fn requests_after_stop_fail() {
        let mem = SharedMemory::new(16, 32);
        mem.stop();
        assert_eq!(mem.read_word(0), Err(MemError::Stopped));
    }

    #[test]
    fn segments_report_their_owner() {
        let mem = SharedMemory::new(16, 32);
        mem.add_segment(0, 0, 8);
        mem.add_segment(1, 8, 8);
        assert_eq!(mem.owner_segment(0), Some(0));
        assert_eq!(mem.owner_segment(8 * 8), Some(1));
        assert_eq!(mem.owner_segment(16 * 8), None);
    }

    #[test]
    fn counters_track_operations() {
        let mem = SharedMemory::new(16, 32);
        mem.write_word(0, 1).unwrap();
        mem.read_word(0).unwrap();
        mem.read_block(0).unwrap();
        let stats = mem.stats();
        assert_eq!(stats.word_writes, 1);
        assert_eq!(stats.word_reads, 1);
        assert_eq!(stats.block_reads, 1);
        assert_eq!(stats.block_writes, 0);
    }
}

use std::sync::{Arc, Mutex, Weak};

use crate::smp::cache::L1Cache;
use crate::smp::memory::Address;

/// Commands a cache can place on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusCmd {
    /// Read a block for sharing.
    BusRd,
    /// Read a block with intent to modify, invalidating all other copies.
    BusRdX,
    /// Invalidate other copies of a block already held in Shared.
    BusUpgr,
    /// Write-back notification. Snoopers take no action.
    Flush,
}

#[derive(Debug, Clone, Copy)]
pub struct BusMessage {
    pub cmd: BusCmd,
    /// Block-aligned byte address.
    pub addr: Address,
    /// PE whose cache originated the message.
    pub src_pe: usize,
}

/// Aggregated snoop responses for one transaction.
#[derive(Debug, Default, Clone, Copy)]
pub struct SnoopSummary {
    /// Some other cache held a copy of the block.
    pub shared_seen: bool,
    /// Some other cache held the block in Modified and wrote it back.
    pub mod_seen: bool,
}

/// A single cache's answer to a snooped message.
#[derive(Debug, Default, Clone, Copy)]
pub struct SnoopResponse {
    pub had_copy: bool,
    pub wrote_back: bool,
}

/// Snoopy bus connecting all L1 caches. Owns no data; its transaction mutex
/// is the single serialization point for coherence events, so every cache
/// observes bus messages in the same total order.
#[derive(Default)]
pub struct Interconnect {
    /// Registry of attached caches. Non-owning: the system owns the caches.
    caches: Mutex<Vec<Weak<L1Cache>>>,
    /// Held for the entire duration of a transaction.
    bus: Mutex<()>,
}

impl Interconnect {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, cache: &Arc<L1Cache>) {
        self.caches.lock().unwrap().push(Arc::downgrade(cache));
    }

    /// Run one bus transaction: snoop every registered cache except the
    /// origin, in registry order, then hand the aggregated summary to
    /// `complete` while the transaction mutex is still held. The origin
    /// re-locks its own cache inside `complete`, so its refill and state
    /// transition are part of the same transaction the snoops belong to.
    ///
    /// Snoop handlers must never place a message on the bus themselves: the
    /// transaction mutex is not reentrant.
    pub fn broadcast<R>(&self, msg: BusMessage, complete: impl FnOnce(SnoopSummary) -> R) -> R {
        let _txn = self.bus.lock().unwrap();
        let snapshot: Vec<Arc<L1Cache>> = self
            .caches
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        let mut summary = SnoopSummary::default();
        for cache in snapshot.iter().filter(|c| c.pe_id() != msg.src_pe) {
            let resp = cache.snoop(&msg);
            summary.shared_seen |= resp.had_copy;
            summary.mod_seen |= resp.wrote_back;
        }
        tracing::trace!(
            cmd = ?msg.cmd,
            addr = msg.addr,
            src_pe = msg.src_pe,
            shared_seen = summary.shared_seen,
            mod_seen = summary.mod_seen,
            "bus transaction"
        );
        complete(summary)
    }

    /// Ask every registered cache to write back its Modified lines. Holds
    /// the transaction mutex so the sweep cannot interleave with an ongoing
    /// broadcast.
    pub fn flush_all(&self) -> Result<(), crate::smp::memory::MemError> {
        let _txn = self.bus.lock().unwrap();
        let snapshot: Vec<Arc<L1Cache>> = self
            .caches
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for cache in snapshot {
            cache.flush_all()?;
        }
        Ok(())
    }
}

//! Per-consumer slot state

use std::ptr::NonNull;

use crate::ring::RingBuf;

/// Life-cycle state of one consumer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerStatus {
    /// Producer and consumer are both working
    Active,
    /// Producer finished successfully; the consumer drains what is queued
    Eof,
    /// Producer failed; the consumer must not expect more rows
    Error,
    /// Consumer finished (or was released); safe for the producer to unbind
    Done,
}

/// Transfer counters for one consumer slot
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotStats {
    /// Tuples offered to the slot by the producer
    pub writes: u64,
    /// Tuples dequeued by the consumer
    pub reads: u64,
    /// Tuples diverted into the overflow store
    pub store_writes: u64,
    /// Tuples fetched back out of the overflow store
    pub store_reads: u64,
    /// Tuples rolled back into the overflow store after a failed dump
    pub store_returns: u64,
}

/// State of a single consumer: identity, status, its ring and counters.
///
/// A slot lives inside the consumer lock that serializes it, so plain fields
/// suffice.
#[derive(Debug)]
pub struct ConsumerSlot {
    /// Process id of the bound consumer, 0 while unbound
    pub(crate) pid: u32,
    /// Destination node id, -1 while the slot is unassigned
    pub(crate) node: i32,
    pub(crate) status: ConsumerStatus,
    pub(crate) ring: RingBuf,
    pub(crate) stats: SlotStats,
}

impl ConsumerSlot {
    /// A slot not attached to any queue
    pub fn detached() -> Self {
        Self {
            pid: 0,
            node: -1,
            status: ConsumerStatus::Active,
            ring: RingBuf::detached(),
            stats: SlotStats::default(),
        }
    }

    /// Zero-initialize the slot over its ring range.
    ///
    /// # Safety
    ///
    /// Same contract as [`RingBuf::from_raw`]: the range must stay valid and
    /// is only accessed under this slot's lock.
    pub(crate) unsafe fn format(&mut self, ring_start: NonNull<u8>, ring_length: usize) {
        self.pid = 0;
        self.node = -1;
        self.status = ConsumerStatus::Active;
        self.ring = RingBuf::from_raw(ring_start, ring_length);
        self.stats = SlotStats::default();
    }

    /// Whether any consumer process is bound to the slot
    pub fn is_bound(&self) -> bool {
        self.pid != 0
    }

    /// Destination node id, -1 while unassigned
    pub fn node(&self) -> i32 {
        self.node
    }

    /// Current slot status
    pub fn status(&self) -> ConsumerStatus {
        self.status
    }

    /// Snapshot of the transfer counters
    pub fn stats(&self) -> SlotStats {
        self.stats
    }
}

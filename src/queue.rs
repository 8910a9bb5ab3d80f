//! Queue entry: one per live redistribution edge

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::memory::QueueRegion;
use crate::slot::ConsumerSlot;
use crate::sync::SyncBlock;

/// Longest queue name accepted, terminator included
pub const MAX_QUEUE_NAME: usize = 64;

/// A live shared queue: the registry entry tying a name to its consumer
/// slots and rented sync block.
///
/// The reference count tracks distinct holders (producer, consumers,
/// pre-bind acquirers) and is only mutated while the registry lock is held;
/// the entry is removed when it reaches zero. All remaining state lives
/// inside the sync block's locks.
#[derive(Debug)]
pub struct SharedQueue {
    name: String,
    nconsumers: usize,
    sync_idx: usize,
    sync: Arc<SyncBlock>,
    refcnt: AtomicI32,
}

impl SharedQueue {
    pub(crate) fn new(
        name: String,
        nconsumers: usize,
        sync_idx: usize,
        sync: Arc<SyncBlock>,
    ) -> Self {
        Self {
            name,
            nconsumers,
            sync_idx,
            sync,
            refcnt: AtomicI32::new(1),
        }
    }

    /// The queue name, the stable key shared by all participants
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of consumer slots the queue was formatted for
    pub fn nconsumers(&self) -> usize {
        self.nconsumers
    }

    /// The rented sync block
    pub(crate) fn sync(&self) -> &Arc<SyncBlock> {
        &self.sync
    }

    pub(crate) fn sync_idx(&self) -> usize {
        self.sync_idx
    }

    /// Current number of holders
    pub fn refcnt(&self) -> i32 {
        self.refcnt.load(Ordering::SeqCst)
    }

    pub(crate) fn add_ref(&self) {
        self.refcnt.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one holder, returning the remaining count
    pub(crate) fn release_ref(&self) -> i32 {
        self.refcnt.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// Reset producer identity, latches and consumer slots, carving one
    /// equal ring per consumer out of the queue's region slice.
    ///
    /// Called with the registry lock held exclusively, before any other
    /// process can see the entry.
    pub(crate) fn format(
        &self,
        region: &QueueRegion,
        region_offset: usize,
        queue_size: usize,
    ) -> Result<()> {
        let qsize = queue_size / self.nconsumers;
        {
            let mut head = self.sync.producer.write().unwrap();
            head.pid = 0;
            head.node = -1;
        }
        self.sync.producer_latch.force_clear();

        for i in 0..self.sync.max_consumers() {
            let cons = self.sync.consumer(i);
            let mut slot = cons.lock.lock().unwrap();
            if i < self.nconsumers {
                // Safety: slices are disjoint per consumer index and only
                // touched under this slot's lock from here on.
                unsafe {
                    let ring_start = region.carve(region_offset + i * qsize, qsize)?;
                    slot.format(ring_start, qsize);
                }
            } else {
                *slot = ConsumerSlot::detached();
            }
            cons.latch.force_clear();
        }
        Ok(())
    }
}

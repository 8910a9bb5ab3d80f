//! Pooled synchronization blocks: one per live queue

use std::sync::{Arc, Mutex, RwLock};

use crate::error::{Result, SqueueError};
use crate::slot::ConsumerSlot;
use crate::sync::Latch;

/// Producer identity, guarded by the queue's producer lock
#[derive(Debug, Default)]
pub struct ProducerHead {
    /// Process id of the bound producer, 0 while unbound
    pub pid: u32,
    /// Cluster node the producer works for, -1 while unbound
    pub node: i32,
}

/// Lock and latch pair for one consumer index.
///
/// The lock owns the slot state it serializes; the latch is what the
/// consumer sleeps on.
#[derive(Debug)]
pub struct ConsumerSync {
    pub lock: Mutex<ConsumerSlot>,
    pub latch: Latch,
}

/// Synchronization block rented to one queue for its lifetime.
///
/// Lock order within a block is producer lock first, then exactly one
/// consumer lock; the registry lock sits above both. Consumers take the
/// producer lock in shared mode while reading so the producer, which takes
/// it exclusively, cannot miss their signals.
#[derive(Debug)]
pub struct SyncBlock {
    /// Name of the owning queue; an assertion-only back-reference that
    /// doubles as the pool's claim marker
    claim: Mutex<Option<String>>,
    pub producer: RwLock<ProducerHead>,
    pub producer_latch: Latch,
    consumers: Vec<ConsumerSync>,
}

impl SyncBlock {
    fn new(max_consumers: usize) -> Self {
        Self {
            claim: Mutex::new(None),
            producer: RwLock::new(ProducerHead::default()),
            producer_latch: Latch::new(),
            consumers: (0..max_consumers)
                .map(|_| ConsumerSync {
                    lock: Mutex::new(ConsumerSlot::detached()),
                    latch: Latch::new(),
                })
                .collect(),
        }
    }

    /// Sync entry for consumer index `i`
    pub fn consumer(&self, i: usize) -> &ConsumerSync {
        &self.consumers[i]
    }

    /// Number of consumer entries the block can carry
    pub fn max_consumers(&self) -> usize {
        self.consumers.len()
    }
}

/// Fixed pool of sync blocks, allocated once at fabric startup.
///
/// Blocks are rented on queue creation and returned when the queue entry is
/// removed; renting and returning happen under the registry lock.
#[derive(Debug)]
pub struct SyncPool {
    blocks: Vec<Arc<SyncBlock>>,
}

impl SyncPool {
    /// Allocate `num_blocks` blocks of `max_consumers` consumer entries each
    pub fn new(num_blocks: usize, max_consumers: usize) -> Self {
        Self {
            blocks: (0..num_blocks)
                .map(|_| Arc::new(SyncBlock::new(max_consumers)))
                .collect(),
        }
    }

    /// Rent an unclaimed block for the queue `name`
    pub fn rent(&self, name: &str) -> Result<(usize, Arc<SyncBlock>)> {
        for (idx, block) in self.blocks.iter().enumerate() {
            let mut claim = block.claim.lock().unwrap();
            if claim.is_none() {
                *claim = Some(name.to_string());
                return Ok((idx, Arc::clone(block)));
            }
        }
        Err(SqueueError::capacity_exhausted("sync blocks"))
    }

    /// Return block `idx`, verifying it was claimed by `name`
    pub fn release(&self, idx: usize, name: &str) -> Result<()> {
        let block = self
            .blocks
            .get(idx)
            .ok_or_else(|| SqueueError::corruption("Sync block index out of range"))?;
        let mut claim = block.claim.lock().unwrap();
        match claim.take() {
            Some(owner) if owner == name => Ok(()),
            other => {
                *claim = other.clone();
                Err(SqueueError::corruption(format!(
                    "Sync block {} claimed by {:?}, released as {}",
                    idx, other, name
                )))
            }
        }
    }
}

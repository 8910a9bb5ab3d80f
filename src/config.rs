//! Configuration for the shared queue fabric

use std::mem;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SqueueError};
use crate::memory::BackingType;
use crate::ring::TUPLE_LEN_SIZE;
use crate::sync::{ConsumerSync, Latch, ProducerHead};

/// Configuration for a worker group's queue fabric.
///
/// One fabric is initialized per worker group before any worker starts; the
/// sizes here are fixed for its lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqueueConfig {
    /// Number of queue entries (and sync blocks) in the fabric
    pub num_queues: usize,
    /// Largest node count a queue may serve; each queue carries
    /// `max_nodes - 1` consumer sync entries
    pub max_nodes: usize,
    /// Bytes of data region per queue, split evenly among its consumers
    pub queue_size: usize,
    /// In-memory bound of a producer's overflow store before it spills to disk
    pub work_mem: usize,
    /// How long the producer waits for consumers in one unbind iteration
    /// before declaring never-connected consumers done, in milliseconds
    pub unbind_timeout_ms: u64,
    /// Pause between retries when acquire hits a leftover queue from a
    /// previous execution, in milliseconds
    pub stale_retry_ms: u64,
    /// Number of acquire retries before giving up on a leftover queue
    pub stale_retry_limit: u32,
    /// Backing storage for the data region
    pub backing: BackingType,
    /// Region file location for [`BackingType::FileBacked`]
    pub region_path: Option<PathBuf>,
}

impl Default for SqueueConfig {
    fn default() -> Self {
        Self {
            num_queues: 64,
            max_nodes: 16,
            queue_size: 64 * 1024,
            work_mem: 4 * 1024 * 1024,
            unbind_timeout_ms: 10_000,
            stale_retry_ms: 1_000,
            stale_retry_limit: 10,
            backing: BackingType::Heap,
            region_path: None,
        }
    }
}

impl SqueueConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.num_queues == 0 {
            return Err(SqueueError::invalid_parameter(
                "num_queues",
                "At least one queue entry is required",
            ));
        }
        if self.max_nodes < 2 {
            return Err(SqueueError::invalid_parameter(
                "max_nodes",
                "A queue needs a producer and at least one consumer node",
            ));
        }
        // Even at full fan-out every ring must hold a length prefix plus a byte.
        let min_ring = TUPLE_LEN_SIZE + 1;
        if self.queue_size / (self.max_nodes - 1) < min_ring {
            return Err(SqueueError::invalid_parameter(
                "queue_size",
                format!(
                    "Queue size {} cannot fit {} rings of at least {} bytes",
                    self.queue_size,
                    self.max_nodes - 1,
                    min_ring
                ),
            ));
        }
        if self.stale_retry_limit == 0 {
            return Err(SqueueError::invalid_parameter(
                "stale_retry_limit",
                "At least one acquire attempt is required",
            ));
        }
        Ok(())
    }

    /// Bytes of data region backing the whole fabric
    pub fn region_size(&self) -> usize {
        self.num_queues * self.queue_size
    }

    /// Estimated memory footprint of the fabric: the data region plus the
    /// sync structures (one producer lock/latch and `max_nodes - 1` consumer
    /// lock/latch/slot entries per queue).
    pub fn shmem_size(&self) -> usize {
        let sync_block = mem::size_of::<ProducerHead>()
            + mem::size_of::<Latch>()
            + (self.max_nodes - 1) * mem::size_of::<ConsumerSync>();
        self.num_queues * (sync_block + self.queue_size)
    }
}

//! # squeue - process-shared tuple exchange for distributed query workers
//!
//! When a distributed query plan redistributes intermediate results, one
//! worker (the producer) generates tuples on a host and one worker per
//! destination node (the consumers) drains its own queue and forwards rows
//! to the remote side. This crate is the exchange fabric between them: a
//! fixed shared data region carved into per-consumer cyclic byte rings, a
//! name-keyed registry of live queues, and a latch + lock protocol that lets
//! producers and consumers block without ever sleeping under a lock.
//!
//! ## Architecture
//!
//! ```text
//! registry (name -> queue, outermost lock)
//!   └── queue entry: refcount + rented sync block + region slice
//!         ├── producer lock (shared for readers) + producer latch
//!         └── per consumer: lock ∙ slot ∙ ring ∙ latch
//! producer side: write -> ring, or overflow store when full (spills to disk)
//! consumer side: read <- ring, blocking on its latch until signalled
//! ```
//!
//! Tuples larger than a ring are streamed through in fragments, producer and
//! consumer taking turns. Late binders, never-connecting consumers and
//! producer failure are survived without corrupting shared state or leaking
//! entries.
//!
//! ## Example
//!
//! ```no_run
//! use squeue::{Binding, QueueSession, SharedQueueManager, SqueueConfig};
//! use std::sync::Arc;
//!
//! # fn main() -> squeue::Result<()> {
//! let fabric = Arc::new(SharedQueueManager::new(SqueueConfig::default())?);
//!
//! let mut producer_session = QueueSession::new(Arc::clone(&fabric), 1);
//! producer_session.acquire("step_4", 1)?;
//! let Binding::Producer(mut producer) = producer_session.bind("step_4", &[7], &[7])? else {
//!     unreachable!("first binder becomes the producer");
//! };
//!
//! producer.write(0, b"a row")?;
//! producer.finish()?;
//! producer.unbind(false)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod consumer;
pub mod error;
pub mod manager;
pub mod memory;
pub mod producer;
pub mod queue;
pub mod registry;
pub mod ring;
pub mod session;
pub mod slot;
pub mod store;
pub mod sync;

pub use config::SqueueConfig;
pub use consumer::{ConsumerHandle, ReadOutcome};
pub use error::{Result, SqueueError};
pub use manager::{Binding, SharedQueueManager};
pub use memory::BackingType;
pub use producer::{ProducerHandle, RouteTarget};
pub use queue::{SharedQueue, MAX_QUEUE_NAME};
pub use ring::{RingBuf, LONG_TUPLE, TUPLE_LEN_SIZE};
pub use session::{QueueSession, WorkerId};
pub use slot::{ConsumerStatus, SlotStats};
pub use store::SpillStore;

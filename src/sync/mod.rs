//! Latches and pooled lock/latch blocks coordinating producers and consumers

pub mod latch;
pub mod pool;

pub use latch::Latch;
pub use pool::{ConsumerSync, ProducerHead, SyncBlock, SyncPool};

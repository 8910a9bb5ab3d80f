//! Consumer side of the transfer engine

use std::sync::{Arc, MutexGuard, RwLockReadGuard};

use tracing::{debug, trace};

use crate::error::{Result, SqueueError};
use crate::queue::SharedQueue;
use crate::ring::{LONG_TUPLE, TUPLE_LEN_SIZE};
use crate::session::WorkerId;
use crate::slot::{ConsumerSlot, ConsumerStatus, SlotStats};
use crate::sync::{ConsumerSync, ProducerHead, SyncBlock};

/// Outcome of one read attempt
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// One dequeued tuple payload
    Tuple(Vec<u8>),
    /// Nothing queued and the caller asked not to wait
    Empty,
    /// The producer finished and the ring is drained; no more tuples
    Eof,
}

/// A consumer's binding to its slot of a queue
pub struct ConsumerHandle {
    pub(crate) queue: Arc<SharedQueue>,
    pub(crate) me: WorkerId,
    pub(crate) index: usize,
    pub(crate) finished: bool,
}

impl ConsumerHandle {
    /// Index of this consumer's slot
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    /// Dequeue one tuple.
    ///
    /// With `canwait`, blocks until a tuple arrives, the producer marks EOF
    /// (drained ring turns into [`ReadOutcome::Eof`]) or fails
    /// ([`SqueueError::ProducerFailed`]). Without it, an empty ring returns
    /// [`ReadOutcome::Empty`] immediately.
    pub fn read(&mut self, canwait: bool) -> Result<ReadOutcome> {
        if self.finished {
            return Ok(ReadOutcome::Eof);
        }
        let sync = Arc::clone(self.queue.sync());
        let cons = sync.consumer(self.index);
        // Shared mode lets consumers of different slots read concurrently,
        // while the producer's exclusive acquisition guarantees it cannot
        // miss a signal sent from under these locks.
        let mut head = sync.producer.read().unwrap();
        let mut slot = cons.lock.lock().unwrap();
        debug_assert_ne!(slot.status, ConsumerStatus::Done);

        while slot.ring.ntuples() <= 0 {
            match slot.status {
                ConsumerStatus::Eof => {
                    debug!(
                        queue = self.queue.name(),
                        slot = self.index,
                        "ring drained at EOF, marking done"
                    );
                    slot.status = ConsumerStatus::Done;
                    cons.latch.disown();
                    drop(slot);
                    // The producer may be waiting for consumers to finish.
                    sync.producer_latch.set();
                    drop(head);
                    self.finished = true;
                    return Ok(ReadOutcome::Eof);
                }
                ConsumerStatus::Error => {
                    drop(slot);
                    drop(head);
                    return Err(SqueueError::producer_failed(self.queue.name()));
                }
                _ => {
                    if !canwait {
                        return Ok(ReadOutcome::Empty);
                    }
                    // Reset under the lock so the producer cannot slip a
                    // signal in between, then wait with nothing held.
                    cons.latch.reset();
                    drop(slot);
                    sync.producer_latch.set();
                    drop(head);
                    cons.latch.wait();
                    head = sync.producer.read().unwrap();
                    slot = cons.lock.lock().unwrap();
                }
            }
        }

        let datalen = slot.ring.read_u32() as usize;
        let payload = if datalen > slot.ring.length() - TUPLE_LEN_SIZE {
            let pulled = pull_long_tuple(&sync, cons, head, slot, datalen)?;
            head = pulled.0;
            slot = pulled.1;
            pulled.2
        } else {
            let mut buf = vec![0u8; datalen];
            slot.ring.read_into(&mut buf);
            buf
        };

        slot.ring.ntuples -= 1;
        slot.stats.reads += 1;
        debug_assert_eq!(
            slot.ring.ntuples() == 0,
            slot.ring.read_pos == slot.ring.write_pos
        );
        drop(slot);
        drop(head);
        Ok(ReadOutcome::Tuple(payload))
    }

    /// Close this consumer's slot without draining it, waking a producer
    /// that may be waiting on it.
    pub fn reset(&mut self) {
        let sync = self.queue.sync();
        let head = sync.producer.read().unwrap();
        let cons = sync.consumer(self.index);
        let mut slot = cons.lock.lock().unwrap();
        if slot.status != ConsumerStatus::Done {
            debug!(
                queue = self.queue.name(),
                slot = self.index,
                node = self.me.node,
                "consumer reset, marking done"
            );
            slot.status = ConsumerStatus::Done;
            if slot.is_bound() {
                cons.latch.disown();
            }
            drop(slot);
            sync.producer_latch.set();
        }
        drop(head);
        self.finished = true;
    }

    /// Snapshot of this slot's transfer counters
    pub fn stats(&self) -> SlotStats {
        self.queue
            .sync()
            .consumer(self.index)
            .lock
            .lock()
            .unwrap()
            .stats()
    }
}

type Reacquired<'a> = (
    RwLockReadGuard<'a, ProducerHead>,
    MutexGuard<'a, ConsumerSlot>,
    Vec<u8>,
);

/// Read a tuple larger than the ring, taking turns with the producer.
///
/// Each round reads what the ring holds, then publishes the consumed offset
/// at the ring base, flips the slot into long-tuple mode and sleeps until
/// the producer writes the next fragment. Enters and leaves with both locks
/// held, releasing them only around the waits.
fn pull_long_tuple<'a>(
    sync: &'a SyncBlock,
    cons: &'a ConsumerSync,
    mut head: RwLockReadGuard<'a, ProducerHead>,
    mut slot: MutexGuard<'a, ConsumerSlot>,
    datalen: usize,
) -> Result<Reacquired<'a>> {
    let mut payload = vec![0u8; datalen];
    let chunk_max = slot.ring.length() - TUPLE_LEN_SIZE;
    let mut offset = 0usize;
    let mut len = datalen;
    trace!(len = datalen, "starting long tuple pull");

    loop {
        if len > chunk_max {
            len = chunk_max;
        }
        slot.ring.read_into(&mut payload[offset..offset + len]);
        offset += len;
        if offset == datalen {
            return Ok((head, slot, payload));
        }

        // Exactly one incomplete tuple may be in flight.
        debug_assert_eq!(slot.ring.ntuples(), 1);
        slot.ring.ntuples = LONG_TUPLE;
        slot.ring.store_base_u32(offset as u32);

        while slot.ring.ntuples() == LONG_TUPLE {
            // Wake the producer first; it reads the offset and refills.
            sync.producer_latch.set();
            cons.latch.reset();
            drop(slot);
            drop(head);
            cons.latch.wait();
            head = sync.producer.read().unwrap();
            slot = cons.lock.lock().unwrap();
        }

        // The fragment header carries the remaining length as a cross-check
        // that producer and consumer are on the same tuple.
        len = slot.ring.read_u32() as usize;
        if offset + len != datalen {
            return Err(SqueueError::corruption(format!(
                "Long tuple fragment mismatch: {} consumed + {} remaining != {}",
                offset, len, datalen
            )));
        }
    }
}

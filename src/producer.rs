//! Producer side of the transfer engine

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::manager::SharedQueueManager;
use crate::queue::SharedQueue;
use crate::ring::{LONG_TUPLE, TUPLE_LEN_SIZE};
use crate::session::WorkerId;
use crate::slot::{ConsumerSlot, ConsumerStatus, SlotStats};
use crate::store::{SpillStore, CURSOR_ADVANCE, CURSOR_BOOKMARK};
use crate::sync::Latch;

/// Where tuples for one entry of the distribution list go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    /// The producer's own node: rows are handed off locally, never queued
    Local,
    /// The node will not read (never connects, or already released)
    Discard,
    /// Consumer slot index to write to
    Slot(usize),
}

/// The producer's binding to a queue.
///
/// Owns the per-consumer overflow stores and must be finished with
/// [`unbind`](Self::unbind); a handle dropped without unbinding fails its
/// consumers so none of them waits forever.
pub struct ProducerHandle {
    pub(crate) manager: Arc<SharedQueueManager>,
    pub(crate) queue: Arc<SharedQueue>,
    pub(crate) me: WorkerId,
    pub(crate) routes: Vec<RouteTarget>,
    pub(crate) stores: Vec<Option<SpillStore>>,
    pub(crate) unbound: bool,
}

impl ProducerHandle {
    /// Route per entry of the distribution list passed to bind
    pub fn routes(&self) -> &[RouteTarget] {
        &self.routes
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    pub fn nconsumers(&self) -> usize {
        self.queue.nconsumers()
    }

    /// Per-consumer ring capacity in bytes
    fn ring_length(&self) -> usize {
        self.manager.config().queue_size / self.queue.nconsumers()
    }

    /// Offer one tuple to consumer slot `index`.
    ///
    /// Anything buffered for the slot is opportunistically flushed first
    /// once the ring is at least half free. A tuple that does not fit goes
    /// to the slot's overflow store; a tuple for a slot that is no longer
    /// active is silently discarded. Never fails over ring state.
    pub fn write(&mut self, index: usize, payload: &[u8]) -> Result<()> {
        let sync = Arc::clone(self.queue.sync());
        let cons = sync.consumer(index);
        let mut slot = cons.lock.lock().unwrap();
        debug_assert!(slot.ring.length() > 0);
        slot.stats.writes += 1;

        if self.stores[index].is_some() {
            // Flush buffered tuples first so ring order matches emission
            // order, but only once there is room to make it worthwhile.
            let mut dumped = false;
            if slot.ring.free_space() > slot.ring.length() / 2 {
                let store = self.stores[index].as_mut().unwrap();
                dumped = dump(&mut slot, &cons.latch, store)?;
            }
            if !dumped {
                slot.stats.store_writes += 1;
                drop(slot);
                self.stores[index].as_mut().unwrap().put(payload)?;
                return Ok(());
            }
        }

        if slot.status != ConsumerStatus::Active {
            trace!(
                queue = self.queue.name(),
                slot = index,
                "slot not active, discarding tuple"
            );
            return Ok(());
        }

        if slot.ring.free_space() < TUPLE_LEN_SIZE + payload.len() {
            slot.stats.store_writes += 1;
            drop(slot);
            let work_mem = self.manager.config().work_mem;
            self.stores[index]
                .get_or_insert_with(|| SpillStore::new(work_mem))
                .put(payload)?;
            return Ok(());
        }

        slot.ring.write_u32(payload.len() as u32);
        slot.ring.write(payload);
        // A consumer seeing an empty ring may be asleep.
        if slot.ring.ntuples == 0 {
            cons.latch.set();
        }
        slot.ring.ntuples += 1;
        Ok(())
    }

    /// Flush what fits of every overflow store and mark drained slots EOF.
    /// Returns the number of stores still holding tuples.
    pub fn finish(&mut self) -> Result<usize> {
        let sync = Arc::clone(self.queue.sync());
        let mut nstores = 0;
        debug!(
            queue = self.queue.name(),
            node = self.me.node,
            "finishing queue"
        );
        for i in 0..self.queue.nconsumers() {
            let cons = sync.consumer(i);
            let mut slot = cons.lock.lock().unwrap();
            match self.stores[i].take() {
                Some(mut store) => {
                    if slot.status != ConsumerStatus::Active {
                        // Consumer is gone; its backlog is dropped with the store.
                        debug!(queue = self.queue.name(), slot = i, "dropping backlog");
                    } else {
                        let mut emptied = false;
                        if slot.ring.free_space() > slot.ring.length() / 2 {
                            emptied = dump(&mut slot, &cons.latch, &mut store)?;
                            cons.latch.set();
                        }
                        if emptied {
                            slot.status = ConsumerStatus::Eof;
                        } else {
                            nstores += 1;
                            self.stores[i] = Some(store);
                        }
                    }
                }
                None => {
                    if slot.status == ConsumerStatus::Active {
                        slot.status = ConsumerStatus::Eof;
                        cons.latch.set();
                    }
                }
            }
        }
        Ok(nstores)
    }

    /// Cancel this producer's binding.
    ///
    /// On success, drains remaining overflow stores, then waits until every
    /// consumer slot is done, declaring never-connected consumers done after
    /// each timeout. On failure, transitions active slots to error and wakes
    /// their consumers. Either way the entry reference is dropped and the
    /// entry removed once nobody holds it.
    pub fn unbind(mut self, failed: bool) -> Result<()> {
        let result = self.unbind_inner(failed);
        if result.is_ok() {
            self.unbound = true;
        }
        result
    }

    fn unbind_inner(&mut self, failed: bool) -> Result<()> {
        let sync = Arc::clone(self.queue.sync());
        let timeout = Duration::from_millis(self.manager.config().unbind_timeout_ms);
        debug!(
            queue = self.queue.name(),
            failed,
            node = self.me.node,
            "unbinding producer"
        );

        if !failed {
            // Consumers may still need tuples that never fit their rings.
            loop {
                let pending = self.finish()?;
                if pending == 0 {
                    break;
                }
                debug!(
                    queue = self.queue.name(),
                    pending, "waiting to drain overflow stores"
                );
                if sync.producer_latch.wait_timeout(timeout) {
                    SharedQueueManager::reset_not_connected(&self.queue);
                }
                sync.producer_latch.reset();
            }
        }

        loop {
            // Wait until consumers finish (or are failed).
            loop {
                let mut pending = 0;
                {
                    let head = sync.producer.write().unwrap();
                    for i in 0..self.queue.nconsumers() {
                        let cons = sync.consumer(i);
                        let mut slot = cons.lock.lock().unwrap();
                        if failed && slot.status == ConsumerStatus::Active {
                            debug!(
                                queue = self.queue.name(),
                                slot = i,
                                "producer failed, marking slot error"
                            );
                            slot.status = ConsumerStatus::Error;
                            cons.latch.set();
                        } else if !failed && slot.status != ConsumerStatus::Done {
                            pending += 1;
                            // Wake the consumer and prepare to wait for it.
                            cons.latch.set();
                            sync.producer_latch.reset();
                        }
                    }
                    drop(head);
                }
                if pending == 0 {
                    break;
                }
                debug!(
                    queue = self.queue.name(),
                    pending, "waiting for consumers to finish"
                );
                if sync.producer_latch.wait_timeout(timeout) {
                    warn!(
                        queue = self.queue.name(),
                        "unbind timed out, resetting unconnected consumers"
                    );
                    SharedQueueManager::reset_not_connected(&self.queue);
                }
            }

            // A very late consumer may have bound after the scan above;
            // recheck under the registry lock before tearing down.
            let mut map = self.manager.registry.lock_exclusive();
            let head = sync.producer.write().unwrap();
            let mut running = 0;
            for i in 0..self.queue.nconsumers() {
                let slot = sync.consumer(i).lock.lock().unwrap();
                if slot.status == ConsumerStatus::Active && slot.is_bound() {
                    running += 1;
                }
            }
            if running > 0 {
                debug!(
                    queue = self.queue.name(),
                    running, "consumers bound during unbind, waiting again"
                );
                drop(head);
                drop(map);
                continue;
            }

            sync.producer_latch.disown();
            if self.queue.release_ref() == 0 {
                self.manager.registry.remove_locked(&mut map, &self.queue)?;
                debug!(queue = self.queue.name(), "removed queue entry");
            }
            drop(head);
            return Ok(());
        }
    }

    /// Whether the producer can safely pause: every active consumer has at
    /// least one tuple queued and rings are on average more than half full.
    pub fn can_pause(&self) -> bool {
        let sync = self.queue.sync();
        let mut result = true;
        let mut used = 0usize;
        let mut active = 0usize;
        for i in 0..self.queue.nconsumers() {
            if !result {
                break;
            }
            let slot = sync.consumer(i).lock.lock().unwrap();
            if slot.status == ConsumerStatus::Active {
                result = slot.ring.ntuples() > 0;
                used += slot.ring.used_space();
                active += 1;
            }
        }
        if active == 0 {
            return false;
        }
        result && used / active > self.ring_length() / 2
    }

    /// Wait for a consumer signal for up to `timeout_ms`; returns whether
    /// the wait timed out.
    pub fn wait_on_signal(&self, timeout_ms: u64) -> bool {
        let latch = &self.queue.sync().producer_latch;
        let timed_out = latch.wait_timeout(Duration::from_millis(timeout_ms));
        latch.reset();
        timed_out
    }

    /// Fail every consumer that is still working, discarding queued bytes,
    /// and wake everyone. Used on producer-side error paths before the
    /// handle goes away.
    pub fn reset(&self) {
        let sync = self.queue.sync();
        let head = sync.producer.read().unwrap();
        for i in 0..self.queue.nconsumers() {
            let cons = sync.consumer(i);
            let mut slot = cons.lock.lock().unwrap();
            // A consumer that already has every row (EOF) or finished does
            // not need to see an error.
            if slot.status != ConsumerStatus::Eof && slot.status != ConsumerStatus::Done {
                debug!(
                    queue = self.queue.name(),
                    slot = i,
                    "resetting producer, marking slot error"
                );
                slot.status = ConsumerStatus::Error;
                slot.ring.clear();
                cons.latch.set();
                sync.producer_latch.set();
            }
        }
        drop(head);
    }

    /// Snapshot of the transfer counters of consumer slot `index`
    pub fn slot_stats(&self, index: usize) -> SlotStats {
        self.queue.sync().consumer(index).lock.lock().unwrap().stats()
    }
}

impl Drop for ProducerHandle {
    fn drop(&mut self) {
        if !self.unbound {
            warn!(
                queue = self.queue.name(),
                "producer handle dropped without unbind, failing consumers"
            );
            self.reset();
        }
    }
}

/// Push buffered tuples into the slot's ring until the store runs dry or a
/// tuple does not fit. Returns whether the store was fully drained.
fn dump(slot: &mut ConsumerSlot, latch: &Latch, store: &mut SpillStore) -> Result<bool> {
    if slot.status != ConsumerStatus::Active {
        debug!("slot not active, discarding buffered tuples");
        store.clear();
        return Ok(true);
    }

    store.select(CURSOR_ADVANCE);
    loop {
        // Bookmark the position so an unfitting tuple can be rolled back.
        store.copy_cursor(CURSOR_ADVANCE, CURSOR_BOOKMARK);
        let payload = match store.fetch()? {
            Some(payload) => payload,
            None => break,
        };
        slot.stats.store_reads += 1;

        if slot.ring.free_space() < TUPLE_LEN_SIZE + payload.len() {
            if slot.ring.ntuples() <= 0 {
                // Too big for an empty ring: stream it through in fragments.
                let done = push_long_tuple(slot, &payload);
                // Some bytes were written either way, wake the consumer.
                latch.set();
                if done {
                    continue;
                }
            }
            store.copy_cursor(CURSOR_BOOKMARK, CURSOR_ADVANCE);
            slot.stats.store_returns += 1;
            store.trim();
            store.select(CURSOR_BOOKMARK);
            return Ok(false);
        }

        slot.ring.write_u32(payload.len() as u32);
        slot.ring.write(&payload);
        if slot.ring.ntuples == 0 {
            latch.set();
        }
        slot.ring.ntuples += 1;
    }

    store.trim();
    store.select(CURSOR_BOOKMARK);
    Ok(true)
}

/// Write the next fragment of a tuple larger than the ring.
///
/// The first fragment carries the full length and as much payload as fits.
/// Later fragments are written only after the consumer has stored the number
/// of bytes it consumed at the ring base and entered long-tuple mode; they
/// carry the remaining length for the consumer to cross-check. Returns
/// whether the whole payload has been written.
fn push_long_tuple(slot: &mut ConsumerSlot, payload: &[u8]) -> bool {
    let chunk = slot.ring.length() - TUPLE_LEN_SIZE;
    if slot.ring.ntuples == 0 {
        trace!(len = payload.len(), "starting long tuple push");
        slot.ring.write_u32(payload.len() as u32);
        debug_assert!(payload.len() > chunk);
        slot.ring.write(&payload[..chunk]);
        slot.ring.ntuples = 1;
        false
    } else {
        debug_assert_eq!(slot.ring.ntuples, LONG_TUPLE);
        let offset = slot.ring.load_base_u32() as usize;
        debug_assert!(offset > 0 && offset < payload.len());
        let remaining = payload.len() - offset;
        slot.ring.write_u32(remaining as u32);
        if remaining > chunk {
            slot.ring.write(&payload[offset..offset + chunk]);
            slot.ring.ntuples = 1;
            false
        } else {
            slot.ring.write(&payload[offset..]);
            slot.ring.ntuples = 1;
            true
        }
    }
}

//! Queue lifecycle: acquire, bind, release, disconnect

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::SqueueConfig;
use crate::consumer::ConsumerHandle;
use crate::error::{Result, SqueueError};
use crate::producer::{ProducerHandle, RouteTarget};
use crate::queue::SharedQueue;
use crate::registry::Registry;
use crate::session::WorkerId;
use crate::slot::ConsumerStatus;

/// Result of binding to a queue: the first binder becomes the producer,
/// everyone after it a consumer.
pub enum Binding {
    Producer(ProducerHandle),
    Consumer(ConsumerHandle),
}

/// The worker group's queue fabric.
///
/// Created once before any worker starts; owns the registry, the sync-block
/// pool and the data region. Workers address it through [`crate::QueueSession`]
/// or directly with an explicit [`WorkerId`].
#[derive(Debug)]
pub struct SharedQueueManager {
    config: SqueueConfig,
    pub(crate) registry: Registry,
}

impl SharedQueueManager {
    /// Initialize the fabric. Fails if the configuration is invalid or the
    /// data region cannot be allocated.
    pub fn new(config: SqueueConfig) -> Result<Self> {
        let registry = Registry::new(&config)?;
        Ok(Self { config, registry })
    }

    pub fn config(&self) -> &SqueueConfig {
        &self.config
    }

    /// Number of live queues in the registry
    pub fn queue_count(&self) -> usize {
        self.registry.len()
    }

    /// Reserve the named queue and format it for `nconsumers` if this caller
    /// is first.
    ///
    /// An entry left over from a previous execution of the same plan (its
    /// producer still bound while this caller's slot is already done) is
    /// given a bounded grace period to unbind before the call fails.
    pub fn acquire(&self, me: WorkerId, name: &str, nconsumers: usize) -> Result<()> {
        let mut tries = 0;
        loop {
            {
                let mut map = self.registry.lock_exclusive();
                match map.get(name).cloned() {
                    None => {
                        self.registry.create_locked(&mut map, name, nconsumers)?;
                        debug!(queue = name, nconsumers, "created and formatted queue");
                        return Ok(());
                    }
                    Some(queue) => {
                        if !self.entry_is_stale(&queue, me) {
                            queue.add_ref();
                            debug!(queue = name, refcnt = queue.refcnt(), "joined existing queue");
                            return Ok(());
                        }
                    }
                }
            }
            // A previous execution still owns the entry. Let its producer
            // finish unbinding and try again.
            tries += 1;
            if tries >= self.config.stale_retry_limit {
                return Err(SqueueError::stale_queue(name, tries));
            }
            warn!(
                queue = name,
                tries, "queue held by previous execution, retrying"
            );
            thread::sleep(Duration::from_millis(self.config.stale_retry_ms));
        }
    }

    /// An entry is stale when a producer is still bound but this caller's
    /// consumer slot (if any) has already finished a previous execution.
    fn entry_is_stale(&self, queue: &SharedQueue, me: WorkerId) -> bool {
        let sync = queue.sync();
        let head = sync.producer.read().unwrap();
        if head.pid == 0 {
            return false;
        }
        let mut stale = true;
        for i in 0..queue.nconsumers() {
            let slot = sync.consumer(i).lock.lock().unwrap();
            if slot.node == me.node {
                if slot.status != ConsumerStatus::Done {
                    stale = false;
                }
                break;
            }
        }
        drop(head);
        stale
    }

    /// Bind to the named queue.
    ///
    /// The first binder becomes the producer: it claims the producer slot,
    /// assigns consumer slots to the nodes of `consumer_nodes` and receives
    /// a route per entry of `distribution_nodes`. Later binders become
    /// consumers of their node's slot; they fail with
    /// [`SqueueError::ProducerFailed`] if the producer is already gone.
    pub fn bind(
        manager: &Arc<SharedQueueManager>,
        me: WorkerId,
        name: &str,
        consumer_nodes: &[i32],
        distribution_nodes: &[i32],
    ) -> Result<Binding> {
        let map = manager.registry.lock_exclusive();
        let queue = map
            .get(name)
            .cloned()
            .ok_or_else(|| SqueueError::no_such_queue(name))?;
        let sync = Arc::clone(queue.sync());
        // Queue-specific lock before dropping the top-level lock; the strict
        // registry -> producer -> consumer order is what keeps this
        // deadlock-free.
        let mut head = sync.producer.write().unwrap();
        drop(map);

        if head.pid == 0 {
            // First binder: become the producer.
            debug!(queue = name, node = me.node, "binding as producer");
            head.pid = me.pid;
            head.node = me.node;
            sync.producer_latch.own(me.pid);

            let mut routes = Vec::with_capacity(distribution_nodes.len());
            for &nodeid in distribution_nodes {
                if nodeid == me.node {
                    // Rows for the producer's own node are handed off
                    // locally, not queued.
                    debug_assert!(consumer_nodes.contains(&nodeid));
                    routes.push(RouteTarget::Local);
                } else if consumer_nodes.contains(&nodeid) {
                    let mut target = RouteTarget::Discard;
                    for j in 0..queue.nconsumers() {
                        let mut slot = sync.consumer(j).lock.lock().unwrap();
                        if slot.node == nodeid {
                            target = if slot.status == ConsumerStatus::Done {
                                debug!(queue = name, nodeid, slot = j, "node already released");
                                RouteTarget::Discard
                            } else {
                                RouteTarget::Slot(j)
                            };
                            break;
                        } else if slot.node == -1 {
                            slot.node = nodeid;
                            target = RouteTarget::Slot(j);
                            break;
                        }
                    }
                    routes.push(target);
                } else {
                    // The node never executes the upper step and will not
                    // connect; anything routed there is discarded.
                    routes.push(RouteTarget::Discard);
                }
            }
            queue.add_ref();
            drop(head);

            let stores = (0..queue.nconsumers()).map(|_| None).collect();
            Ok(Binding::Producer(ProducerHandle {
                manager: Arc::clone(manager),
                queue,
                me,
                routes,
                stores,
                unbound: false,
            }))
        } else {
            debug!(
                queue = name,
                producer_node = head.node,
                node = me.node,
                "binding as consumer"
            );
            // Every node of the consumer list must map onto a slot the
            // producer assigned, ours included.
            let mut self_index = None;
            let mut matched = 0;
            for &nodeid in consumer_nodes {
                if nodeid == head.node {
                    continue;
                }
                let mut found = None;
                for j in 0..queue.nconsumers() {
                    let slot = sync.consumer(j).lock.lock().unwrap();
                    if slot.node == nodeid {
                        found = Some(j);
                        break;
                    }
                }
                match found {
                    Some(j) => {
                        matched += 1;
                        if nodeid == me.node {
                            self_index = Some(j);
                        }
                    }
                    None => {
                        return Err(SqueueError::mismatched_consumers(
                            name,
                            queue.nconsumers(),
                            matched,
                        ));
                    }
                }
            }
            if matched != queue.nconsumers() {
                return Err(SqueueError::mismatched_consumers(
                    name,
                    queue.nconsumers(),
                    matched,
                ));
            }
            let index = self_index.ok_or_else(|| {
                SqueueError::mismatched_consumers(name, queue.nconsumers(), matched)
            })?;

            let cons = sync.consumer(index);
            let mut slot = cons.lock.lock().unwrap();
            debug_assert!(!slot.is_bound());
            debug_assert!(slot.ring.length() > 0);
            if slot.status == ConsumerStatus::Error || slot.status == ConsumerStatus::Done {
                // Producer failed before we connected. Mark the slot done so
                // the producer can unbind, and report the failure upward.
                slot.status = ConsumerStatus::Done;
                drop(slot);
                sync.producer_latch.set();
                return Err(SqueueError::producer_failed(name));
            }
            slot.pid = me.pid;
            cons.latch.own(me.pid);
            drop(slot);
            drop(head);

            Ok(Binding::Consumer(ConsumerHandle {
                queue,
                me,
                index,
                finished: false,
            }))
        }
    }

    /// Mark this worker's consumer slot done, or every unassigned slot if the
    /// worker never bound, so a waiting producer can finish. Removes the
    /// entry once the reference count reaches zero. A missing queue is not
    /// an error.
    pub fn release(&self, me: WorkerId, name: &str) -> Result<()> {
        let mut map = self.registry.lock_exclusive();
        let Some(queue) = map.get(name).cloned() else {
            return Ok(());
        };
        let sync = Arc::clone(queue.sync());
        {
            let head = sync.producer.write().unwrap();
            if head.node == -1 {
                // Nobody bound yet. A fresh entry may be about to get a
                // producer; the future producer releases it.
                debug!(queue = name, "release before any bind");
            } else if head.node != me.node {
                let mut found = false;
                for i in 0..queue.nconsumers() {
                    let cons = sync.consumer(i);
                    let mut slot = cons.lock.lock().unwrap();
                    if slot.node == me.node {
                        found = true;
                        if !slot.is_bound() {
                            // A previous execution already consumed and
                            // released this slot; touching it now would
                            // corrupt the next execution's state.
                            debug!(queue = name, node = me.node, "slot already released");
                        } else if slot.status != ConsumerStatus::Done {
                            slot.status = ConsumerStatus::Done;
                            cons.latch.disown();
                            slot.pid = 0;
                            drop(slot);
                            sync.producer_latch.set();
                            debug!(queue = name, node = me.node, slot = i, "released consumer");
                        }
                        break;
                    }
                }
                if !found {
                    // This node never bound. Mark unassigned slots done so
                    // the producer knows the node will never consume.
                    for i in 0..queue.nconsumers() {
                        let cons = sync.consumer(i);
                        let mut slot = cons.lock.lock().unwrap();
                        if slot.node == -1 {
                            slot.status = ConsumerStatus::Done;
                            drop(slot);
                            sync.producer_latch.set();
                        }
                    }
                }
            }
            // When this worker is the producer all the work happens in
            // unbind; only the reference is dropped here.
            drop(head);
        }
        if queue.release_ref() == 0 {
            self.registry.remove_locked(&mut map, &queue)?;
            debug!(queue = name, "removed queue entry");
        }
        Ok(())
    }

    /// A remote node signalled it will not read: mark its slots done and
    /// discard anything queued for it. A no-op if the queue does not exist
    /// or no producer has bound yet.
    pub fn disconnect_consumer(&self, me: WorkerId, name: &str) {
        let map = self.registry.lock_exclusive();
        let Some(queue) = map.get(name).cloned() else {
            return;
        };
        let sync = Arc::clone(queue.sync());
        let head = sync.producer.write().unwrap();
        if head.pid == 0 {
            return;
        }
        drop(map);
        for i in 0..queue.nconsumers() {
            let mut slot = sync.consumer(i).lock.lock().unwrap();
            if slot.node == me.node {
                debug!(queue = name, node = me.node, slot = i, "disconnecting consumer");
                slot.status = ConsumerStatus::Done;
                slot.ring.clear();
            }
        }
        sync.producer_latch.set();
        drop(head);
    }

    /// Assume consumers that never bound will never bind and mark their
    /// slots done, so the producer cannot hang on parties that never arrive.
    pub(crate) fn reset_not_connected(queue: &SharedQueue) {
        let sync = queue.sync();
        let head = sync.producer.write().unwrap();
        for i in 0..queue.nconsumers() {
            let cons = sync.consumer(i);
            let mut slot = cons.lock.lock().unwrap();
            if !slot.is_bound() && slot.status != ConsumerStatus::Done {
                warn!(
                    queue = queue.name(),
                    slot = i,
                    node = slot.node,
                    "consumer never connected, marking done"
                );
                slot.status = ConsumerStatus::Done;
                slot.ring.clear();
                cons.latch.set();
            }
        }
        drop(head);
    }
}

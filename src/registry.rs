//! Fixed-capacity registry of live queues

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::SqueueConfig;
use crate::error::{Result, SqueueError};
use crate::memory::QueueRegion;
use crate::queue::{SharedQueue, MAX_QUEUE_NAME};
use crate::ring::TUPLE_LEN_SIZE;
use crate::sync::SyncPool;

pub(crate) type RegistryMap = HashMap<String, Arc<SharedQueue>>;

/// Name-keyed table of live queues plus the sync-block pool and the data
/// region entries are carved from.
///
/// The table lock is the outermost lock of the fabric: no queue lock may be
/// held while acquiring it. Capacity is fixed at init; running out is a hard
/// error, never a wait.
#[derive(Debug)]
pub struct Registry {
    map: RwLock<RegistryMap>,
    capacity: usize,
    queue_size: usize,
    pool: SyncPool,
    region: QueueRegion,
}

impl Registry {
    pub fn new(config: &SqueueConfig) -> Result<Self> {
        config.validate()?;
        let region = QueueRegion::new(
            config.region_size(),
            config.backing,
            config.region_path.clone(),
        )?;
        Ok(Self {
            map: RwLock::new(HashMap::with_capacity(config.num_queues)),
            capacity: config.num_queues,
            queue_size: config.queue_size,
            pool: SyncPool::new(config.num_queues, config.max_nodes - 1),
            region,
        })
    }

    /// Number of live queue entries
    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn lock_exclusive(&self) -> RwLockWriteGuard<'_, RegistryMap> {
        self.map.write().unwrap()
    }

    #[allow(dead_code)]
    pub(crate) fn lock_shared(&self) -> RwLockReadGuard<'_, RegistryMap> {
        self.map.read().unwrap()
    }

    /// Create a new entry formatted for `nconsumers`, renting a sync block
    /// and a region slice. Caller holds the registry lock exclusively and
    /// has verified no entry exists under `name`.
    pub(crate) fn create_locked(
        &self,
        map: &mut RegistryMap,
        name: &str,
        nconsumers: usize,
    ) -> Result<Arc<SharedQueue>> {
        debug_assert!(!map.contains_key(name));
        if name.is_empty() || name.len() >= MAX_QUEUE_NAME {
            return Err(SqueueError::invalid_parameter(
                "name",
                format!("Queue names must be 1..{} bytes", MAX_QUEUE_NAME),
            ));
        }
        if map.len() >= self.capacity {
            return Err(SqueueError::capacity_exhausted("shared queues"));
        }

        let (sync_idx, sync) = self.pool.rent(name)?;
        let checks = (|| -> Result<()> {
            if nconsumers == 0 || nconsumers > sync.max_consumers() {
                return Err(SqueueError::invalid_parameter(
                    "nconsumers",
                    format!("Expected 1..={} consumers", sync.max_consumers()),
                ));
            }
            if self.queue_size / nconsumers <= TUPLE_LEN_SIZE {
                return Err(SqueueError::invalid_parameter(
                    "nconsumers",
                    "Per-consumer ring would be too small to frame a tuple",
                ));
            }
            Ok(())
        })();
        if let Err(err) = checks {
            self.pool.release(sync_idx, name)?;
            return Err(err);
        }

        let queue = Arc::new(SharedQueue::new(
            name.to_string(),
            nconsumers,
            sync_idx,
            sync,
        ));
        if let Err(err) = queue.format(&self.region, sync_idx * self.queue_size, self.queue_size) {
            self.pool.release(sync_idx, name)?;
            return Err(err);
        }
        map.insert(name.to_string(), Arc::clone(&queue));
        Ok(queue)
    }

    /// Remove an entry whose reference count reached zero, returning its
    /// sync block to the pool. Caller holds the registry lock exclusively.
    pub(crate) fn remove_locked(
        &self,
        map: &mut RegistryMap,
        queue: &Arc<SharedQueue>,
    ) -> Result<()> {
        debug_assert_eq!(queue.refcnt(), 0);
        match map.remove(queue.name()) {
            Some(entry) if Arc::ptr_eq(&entry, queue) => {
                self.pool.release(queue.sync_idx(), queue.name())
            }
            Some(entry) => {
                map.insert(queue.name().to_string(), entry);
                Err(SqueueError::corruption(
                    "Registry removal found a different entry under the queue name",
                ))
            }
            None => Err(SqueueError::corruption(
                "Registry removal found no entry under the queue name",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> SqueueConfig {
        SqueueConfig {
            num_queues: 2,
            max_nodes: 4,
            queue_size: 256,
            ..Default::default()
        }
    }

    #[test]
    fn test_create_lookup_remove() {
        let registry = Registry::new(&small_config()).unwrap();
        let queue = {
            let mut map = registry.lock_exclusive();
            registry.create_locked(&mut map, "edge_1", 2).unwrap()
        };
        assert_eq!(registry.len(), 1);
        assert_eq!(queue.nconsumers(), 2);
        assert!(registry.lock_shared().contains_key("edge_1"));

        queue.release_ref();
        let mut map = registry.lock_exclusive();
        registry.remove_locked(&mut map, &queue).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn test_capacity_is_a_hard_error() {
        let registry = Registry::new(&small_config()).unwrap();
        let mut map = registry.lock_exclusive();
        registry.create_locked(&mut map, "a", 1).unwrap();
        registry.create_locked(&mut map, "b", 1).unwrap();
        assert!(matches!(
            registry.create_locked(&mut map, "c", 1),
            Err(SqueueError::CapacityExhausted { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_names_and_fanout() {
        let registry = Registry::new(&small_config()).unwrap();
        let mut map = registry.lock_exclusive();
        assert!(registry.create_locked(&mut map, "", 1).is_err());
        let long = "x".repeat(MAX_QUEUE_NAME);
        assert!(registry.create_locked(&mut map, &long, 1).is_err());
        // max_nodes = 4 allows at most 3 consumers.
        assert!(registry.create_locked(&mut map, "q", 4).is_err());
        // A failed create leaves its sync block available.
        registry.create_locked(&mut map, "q", 3).unwrap();
        registry.create_locked(&mut map, "r", 1).unwrap();
    }
}

//! Per-process shared-mapping lifecycle.
//!
//! Every installed hook owned by a process holds one reference on that
//! process's `MappingMetadata`. The final release tears the mapping down:
//! the shared object is destroyed, reflector pages go back to the pool, and
//! the death callback fires exactly once. A destroy that reports the object
//! as still pinned parks the metadata, page list included, on the orphan
//! queue for a later sweep instead of surfacing the failure. Pages stay out
//! of the pool until the object is actually gone; a page must never be
//! reclaimable while something can still execute from it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, warn};

use crate::kernel::{MemoryObject, VmBusy, VmSpace};
use crate::pool::ReflectorPool;
use crate::types::{HookError, ProcessId, Protection};

type DeathCallback = Box<dyn FnOnce() + Send>;

pub struct MappingMetadata {
    refcnt: AtomicU64,
    pub owner: ProcessId,
    pub memory_object: MemoryObject,
    /// Where the owning process sees the shared object.
    pub user_base: u64,
    pages: Mutex<Vec<usize>>,
    death_callback: Mutex<Option<DeathCallback>>,
}

impl MappingMetadata {
    /// Take a reference, unless the mapping is already dying (refcnt 0).
    fn try_retain(&self) -> bool {
        let mut cur = self.refcnt.load(Ordering::Relaxed);
        loop {
            if cur == 0 {
                return false;
            }
            match self.refcnt.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(seen) => cur = seen,
            }
        }
    }

    pub fn refcnt(&self) -> u64 {
        self.refcnt.load(Ordering::Acquire)
    }

    fn fire_death_callback(&self) {
        let cb = self.death_callback.lock().unwrap().take();
        if let Some(cb) = cb {
            cb();
        }
    }
}

struct OrphanMapping {
    meta: Arc<MappingMetadata>,
    pages: Vec<usize>,
}

pub struct MappingManager<V: VmSpace> {
    vm: Arc<V>,
    pool: Mutex<ReflectorPool>,
    maps: RwLock<HashMap<ProcessId, Arc<MappingMetadata>>>,
    orphans: Mutex<VecDeque<OrphanMapping>>,
}

impl<V: VmSpace> MappingManager<V> {
    pub fn new(vm: Arc<V>, pool: ReflectorPool) -> Self {
        Self {
            vm,
            pool: Mutex::new(pool),
            maps: RwLock::new(HashMap::new()),
            orphans: Mutex::new(VecDeque::new()),
        }
    }

    /// Take a reference on `pid`'s mapping, creating it on first use.
    pub fn acquire(&self, pid: ProcessId) -> Result<Arc<MappingMetadata>, HookError> {
        if let Some(meta) = self.maps.read().unwrap().get(&pid) {
            if meta.try_retain() {
                return Ok(Arc::clone(meta));
            }
        }

        let mut maps = self.maps.write().unwrap();
        // Raced with another creator, or with a teardown that has not yet
        // removed its entry.
        if let Some(meta) = maps.get(&pid) {
            if meta.try_retain() {
                return Ok(Arc::clone(meta));
            }
        }

        let object = self.vm.create_shared_mapping(pid, self.vm.page_size())?;
        let user_base = match self.vm.map_into(pid, &object, Protection::RX) {
            Ok(base) => base,
            Err(err) => {
                // Best effort; an undestroyable fresh object has no users.
                let _ = self.vm.destroy_shared_mapping(&object);
                return Err(err);
            }
        };
        debug!("created shared mapping for process {pid} (handle {})", object.handle);
        let meta = Arc::new(MappingMetadata {
            refcnt: AtomicU64::new(1),
            owner: pid,
            memory_object: object,
            user_base,
            pages: Mutex::new(Vec::new()),
            death_callback: Mutex::new(None),
        });
        maps.insert(pid, Arc::clone(&meta));
        Ok(meta)
    }

    /// Drop one reference; the zero transition tears the mapping down.
    pub fn release(&self, meta: &Arc<MappingMetadata>) {
        if meta.refcnt.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.teardown(meta);
        }
    }

    fn teardown(&self, meta: &Arc<MappingMetadata>) {
        {
            let mut maps = self.maps.write().unwrap();
            match maps.get(&meta.owner) {
                Some(cur) if Arc::ptr_eq(cur, meta) => {
                    maps.remove(&meta.owner);
                }
                _ => {}
            }
        }

        let pages: Vec<usize> = meta.pages.lock().unwrap().drain(..).collect();
        match self.vm.destroy_shared_mapping(&meta.memory_object) {
            Ok(()) => {
                debug!("tore down mapping for process {}", meta.owner);
                self.return_pages(&pages);
                meta.fire_death_callback();
            }
            Err(VmBusy) => {
                // The object is still pinned, so its pages stay claimed; the
                // orphan keeps the list until a sweep destroys the object.
                warn!("mapping for process {} still pinned, deferring teardown", meta.owner);
                self.orphans
                    .lock()
                    .unwrap()
                    .push_back(OrphanMapping { meta: Arc::clone(meta), pages });
            }
        }
    }

    fn return_pages(&self, pages: &[usize]) {
        if pages.is_empty() {
            return;
        }
        let mut pool = self.pool.lock().unwrap();
        for &idx in pages {
            pool.release(idx);
        }
    }

    /// Retry destruction of every orphaned mapping. Returns how many were
    /// reclaimed; the rest stay queued.
    pub fn sweep(&self) -> usize {
        let drained: Vec<OrphanMapping> =
            self.orphans.lock().unwrap().drain(..).collect();
        let mut reclaimed = 0;
        let mut still_busy = VecDeque::new();
        for orphan in drained {
            match self.vm.destroy_shared_mapping(&orphan.meta.memory_object) {
                Ok(()) => {
                    debug!("reclaimed orphaned mapping for process {}", orphan.meta.owner);
                    self.return_pages(&orphan.pages);
                    orphan.meta.fire_death_callback();
                    reclaimed += 1;
                }
                Err(VmBusy) => still_busy.push_back(orphan),
            }
        }
        self.orphans.lock().unwrap().append(&mut still_busy);
        reclaimed
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().unwrap().len()
    }

    /// Claim `count` reflector pages for `meta`, all or nothing.
    pub fn claim_pages(
        &self,
        meta: &MappingMetadata,
        count: usize,
    ) -> Result<Vec<usize>, HookError> {
        let mut pool = self.pool.lock().unwrap();
        let mut claimed = Vec::with_capacity(count);
        for _ in 0..count {
            match pool.claim() {
                Ok(idx) => claimed.push(idx),
                Err(err) => {
                    for idx in claimed {
                        pool.release(idx);
                    }
                    return Err(err);
                }
            }
        }
        meta.pages.lock().unwrap().extend_from_slice(&claimed);
        Ok(claimed)
    }

    /// Return pages claimed by [`claim_pages`] before the mapping dies.
    pub fn release_pages(&self, meta: &MappingMetadata, indices: &[usize]) {
        let mut held = meta.pages.lock().unwrap();
        held.retain(|idx| !indices.contains(idx));
        drop(held);
        let mut pool = self.pool.lock().unwrap();
        for &idx in indices {
            pool.release(idx);
        }
    }

    pub fn page_size(&self) -> u64 {
        self.pool.lock().unwrap().page_size()
    }

    pub fn page_addr(&self, idx: usize) -> u64 {
        self.pool.lock().unwrap().addr(idx)
    }

    pub fn pages_in_use(&self) -> usize {
        self.pool.lock().unwrap().in_use()
    }

    /// Register a callback fired exactly once when `pid`'s mapping is fully
    /// torn down. No-op when the process has no live mapping.
    pub fn set_death_callback<F>(&self, pid: ProcessId, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(meta) = self.maps.read().unwrap().get(&pid) {
            *meta.death_callback.lock().unwrap() = Some(Box::new(callback));
        }
    }
}

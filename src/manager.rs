// # Region manager and public facade
//
// `RegionManager` is the process singleton that lazily constructs the
// buffer, fault channel, and worker pools on the first region, and tears
// them down when the last region is removed. `VmEngine` is the thin,
// cloneable handle applications hold. Grounded in
// `examples/original_source/src/umap/umap.cpp` (the C API's lazy
// construct-on-first-map / destroy-on-last-unmap lifecycle) and the
// teacher's singleton-registry idiom (`OnceLock`-guarded statics) seen in
// `harborgrid-justin-rusty-db`'s catalog and transaction managers.

use crate::buffer::{Buffer, WorkItem};
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::{EngineError, Result};
use crate::evict::{EvictManager, EvictPool};
use crate::fault::{FaultChannel, SimChannel};
use crate::fill::FillPool;
use crate::region::{RegionDescriptor, RegionId};
use crate::store::Store;
use crossbeam::channel::unbounded;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::info;

/// Flags accepted by [`VmEngine::map`]. Mirrors `mmap`'s PRIVATE/FIXED pair,
/// the only two the core distinguishes (`spec.md` §6).
#[derive(Debug, Clone, Copy, Default)]
pub struct MapFlags {
    pub private: bool,
    pub fixed: bool,
}

struct Services {
    buffer: Arc<Buffer>,
    channel: Arc<dyn FaultChannel>,
    fill_pool: Option<FillPool>,
    fill_tx: crossbeam::channel::Sender<WorkItem>,
    filler_count: usize,
    evict_manager: Option<EvictManager>,
    evict_manager_tx: crossbeam::channel::Sender<WorkItem>,
    evict_pool: Option<EvictPool>,
    evict_worker_tx: crossbeam::channel::Sender<WorkItem>,
    evictor_count: usize,
    dispatcher: Option<Dispatcher>,
}

struct Inner {
    config: Config,
    services: Option<Services>,
    regions: HashMap<RegionId, Arc<RegionDescriptor>>,
    next_base: usize,
}

/// Process-singleton lifecycle owner. Never constructed directly by
/// applications; reached through [`VmEngine`].
pub struct RegionManager {
    inner: RwLock<Inner>,
}

fn singleton() -> &'static RegionManager {
    static INSTANCE: OnceLock<RegionManager> = OnceLock::new();
    INSTANCE.get_or_init(|| RegionManager {
        inner: RwLock::new(Inner {
            config: Config::from_env(),
            services: None,
            regions: HashMap::new(),
            next_base: 0x7f00_0000_0000,
        }),
    })
}

/// Looks a region up by id through the live singleton, so fill/evict
/// workers started once at construction time always see the current
/// region table rather than a stale snapshot.
fn lookup_by_id(id: RegionId) -> Option<Arc<RegionDescriptor>> {
    singleton().inner.read().regions.get(&id).cloned()
}

fn lookup_by_address(addr: usize) -> Option<Arc<RegionDescriptor>> {
    singleton().inner.read().regions.values().find(|r| r.contains(addr)).cloned()
}

impl RegionManager {
    fn ensure_services(inner: &mut Inner) -> Arc<Buffer> {
        if let Some(services) = &inner.services {
            return services.buffer.clone();
        }
        let channel: Arc<dyn FaultChannel> = Arc::new(SimChannel::new());
        let (fill_tx, fill_rx) = unbounded();
        // Two distinct queues: the manager hears only `Threshold` from the
        // buffer and decides how much to evict; the worker pool hears
        // `Evict` from the manager plus `FastEvict`/`Flush` posted directly
        // by the buffer (region teardown and explicit flush don't wait on a
        // watermark crossing).
        let (evict_manager_tx, evict_manager_rx) = unbounded();
        let (evict_worker_tx, evict_worker_rx) = unbounded();
        let buffer = Arc::new(Buffer::new(
            &inner.config,
            channel.clone(),
            fill_tx.clone(),
            evict_manager_tx.clone(),
            evict_worker_tx.clone(),
        ));

        let max_page_size = inner.config.page_size.max(crate::config::system_page_size());
        let fill_pool = FillPool::start(
            inner.config.filler_count,
            max_page_size,
            fill_rx,
            buffer.clone(),
            channel.clone(),
            Arc::new(lookup_by_id),
        );
        let evict_pool = EvictPool::start(
            inner.config.evictor_count,
            evict_worker_rx,
            buffer.clone(),
            channel.clone(),
            Arc::new(lookup_by_id),
        );
        let evict_manager = EvictManager::start(evict_manager_rx, buffer.clone(), evict_worker_tx.clone());

        let dispatcher = Dispatcher::start(
            channel.clone(),
            buffer.clone(),
            inner.config.max_fault_events,
            Arc::new(lookup_by_address),
        );

        inner.services = Some(Services {
            buffer: buffer.clone(),
            channel,
            fill_pool: Some(fill_pool),
            fill_tx,
            filler_count: inner.config.filler_count,
            evict_manager: Some(evict_manager),
            evict_manager_tx,
            evict_pool: Some(evict_pool),
            evict_worker_tx,
            evictor_count: inner.config.evictor_count,
            dispatcher: Some(dispatcher),
        });
        buffer
    }

    fn add_region(
        &self,
        base: Option<usize>,
        length: usize,
        page_size: Option<usize>,
        flags: MapFlags,
        store: Arc<dyn Store>,
    ) -> Result<Arc<RegionDescriptor>> {
        if !flags.private {
            return Err(EngineError::MissingPrivateFlag);
        }
        let mut inner = self.inner.write();
        let page_size = page_size.unwrap_or(inner.config.page_size);
        let system_page_size = crate::config::system_page_size();
        if page_size < system_page_size {
            return Err(EngineError::PageSizeTooSmall(page_size, system_page_size));
        }
        let length = length.div_ceil(page_size) * page_size;

        let base = match base {
            Some(b) => {
                if b % page_size != 0 {
                    return Err(EngineError::UnalignedAddress(b));
                }
                b
            }
            None => {
                // Round up to this region's page size: the previous
                // auto-placement may have only been aligned to a smaller
                // page size.
                let b = inner.next_base.div_ceil(page_size) * page_size;
                // Leave a guard gap between auto-placed regions.
                inner.next_base = b + length + page_size;
                b
            }
        };
        if inner.regions.values().any(|r| r.overlaps(base, length)) {
            return Err(EngineError::OverlappingRegion(base, base + length));
        }

        let buffer = Self::ensure_services(&mut inner);
        let region = Arc::new(RegionDescriptor {
            id: RegionId::next(),
            base,
            length,
            page_size,
            store,
        });
        buffer.channel().register_region(base, length, page_size);
        inner.regions.insert(region.id, region.clone());
        info!(base, length, page_size, "region mapped");
        Ok(region)
    }

    fn remove_region(&self, base: usize) -> Result<()> {
        // Resolve the region and clone the service handles, then drop the
        // lock before the blocking `evict_region` call below: its evict
        // workers resolve the page's owning region through `lookup_by_id`,
        // which takes this same lock, so holding it here across the wait
        // would deadlock the calling thread against its own workers. The
        // region stays in the map during eviction so that lookup succeeds.
        let (id, region, buffer, channel) = {
            let inner = self.inner.read();
            let region = inner
                .regions
                .values()
                .find(|r| r.base == base)
                .cloned()
                .ok_or(EngineError::NoSuchRegion(base))?;
            let services = inner.services.as_ref().expect("region existed, services are live");
            (region.id, region, services.buffer.clone(), services.channel.clone())
        };

        buffer.evict_region(id);
        channel.unregister_region(region.base, region.length);
        info!(base = region.base, "region unmapped");

        let mut inner = self.inner.write();
        inner.regions.remove(&id);
        if inner.regions.is_empty() {
            let services = inner.services.take().expect("just checked");
            Self::teardown(services);
        }
        Ok(())
    }

    /// Tears down services in order: evict manager, then evict workers,
    /// then fill workers, then the fault channel's dispatcher, then the
    /// buffer (dropped with the `Arc` once this function returns). Each
    /// pool gets exactly one `Exit` per worker — an unbounded channel
    /// delivers each message to exactly one receiver, so under-sending
    /// leaves a worker blocked on `recv` forever.
    fn teardown(services: Services) {
        let Services {
            buffer,
            channel: _channel,
            fill_pool,
            fill_tx,
            filler_count,
            evict_manager,
            evict_manager_tx,
            evict_pool,
            evict_worker_tx,
            evictor_count,
            dispatcher,
        } = services;

        let _ = evict_manager_tx.send(WorkItem::exit());
        if let Some(m) = evict_manager {
            m.join();
        }
        for _ in 0..evictor_count {
            let _ = evict_worker_tx.send(WorkItem::exit());
        }
        if let Some(pool) = evict_pool {
            pool.join();
        }
        for _ in 0..filler_count {
            let _ = fill_tx.send(WorkItem::exit());
        }
        if let Some(pool) = fill_pool {
            pool.join();
        }
        buffer.channel().wake();
        if let Some(d) = dispatcher {
            d.join();
        }
        info!("engine services torn down");
    }

    fn flush_all(&self) {
        let inner = self.inner.read();
        if let Some(services) = &inner.services {
            services.buffer.flush_dirty_pages();
        }
    }

    fn containing_region(&self, addr: usize) -> Option<Arc<RegionDescriptor>> {
        self.inner.read().regions.values().find(|r| r.contains(addr)).cloned()
    }

    fn config(&self) -> Config {
        self.inner.read().config.clone()
    }

    fn set_config(&self, config: Config) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.regions.is_empty() {
            return Err(EngineError::ConfigurationLocked(inner.regions.len()));
        }
        inner.config = config;
        Ok(())
    }
}

/// The engine's public handle. Cheap to clone; every instance refers to the
/// same process-wide [`RegionManager`] singleton (`spec.md` §4.7).
#[derive(Clone, Copy)]
pub struct VmEngine;

impl VmEngine {
    pub fn new() -> Self {
        Self
    }

    /// Registers a region backed by `store`. `addr` must be page-aligned if
    /// given; `flags.private` must be set. Returns the mapped base address.
    pub fn map(
        &self,
        addr: Option<usize>,
        length: usize,
        flags: MapFlags,
        store: Arc<dyn Store>,
        page_size: Option<usize>,
    ) -> Result<usize> {
        let region = singleton().add_region(addr, length, page_size, flags, store)?;
        Ok(region.base)
    }

    /// Forces full eviction of the region at `addr` and unregisters it.
    pub fn unmap(&self, addr: usize) -> Result<()> {
        singleton().remove_region(addr)
    }

    /// Performs a simulated load/store at `addr`: blocks until the engine
    /// has faulted the page in (and, for a write, disabled write-protect),
    /// then runs `f` against the byte range. Stands in for the ordinary
    /// memory access a real mapping would let the application perform
    /// directly; only works when the engine was built with [`SimChannel`]
    /// (the only fault channel this crate ships).
    pub fn access(&self, addr: usize, len: usize, is_write: bool, f: impl FnOnce(&mut [u8])) {
        let manager = singleton();
        let inner = manager.inner.read();
        let services = inner.services.as_ref().expect("access called with no active region");
        let sim = services
            .channel
            .as_any()
            .downcast_ref::<SimChannel>()
            .expect("access requires a SimChannel-backed engine");
        sim.access(addr, len, is_write, f);
    }

    /// Writes back every dirty page across every active region.
    pub fn flush(&self) {
        singleton().flush_all();
    }

    /// Best-effort pre-population: raises a read fault at each address's
    /// page base.
    pub fn prefetch(&self, addresses: &[usize]) {
        let manager = singleton();
        let inner = manager.inner.read();
        let Some(services) = &inner.services else { return };
        for &addr in addresses {
            if let Some(region) = inner.regions.values().find(|r| r.contains(addr)) {
                let page_addr = region.page_base(addr);
                services.buffer.process_page_events(region, &[page_addr], &[false]);
            }
        }
    }

    /// Blocking bulk materialization of `[addr, addr+size)`, pinned against
    /// eviction for the region's lifetime.
    pub fn fetch_and_pin(&self, addr: usize, size: usize) -> Result<()> {
        let manager = singleton();
        let inner = manager.inner.read();
        let region = inner
            .regions
            .values()
            .find(|r| r.contains(addr))
            .ok_or(EngineError::NoSuchRegion(addr))?
            .clone();
        let services = inner.services.as_ref().expect("region exists, services are live");
        let offset = addr - region.base;
        services.buffer.fetch_and_pin(&region, offset, size);
        Ok(())
    }

    pub fn containing_region(&self, addr: usize) -> Option<Arc<RegionDescriptor>> {
        singleton().containing_region(addr)
    }

    pub fn config(&self) -> Config {
        singleton().config()
    }

    pub fn set_config(&self, config: Config) -> Result<()> {
        singleton().set_config(config)
    }
}

impl Default for VmEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    // The `RegionManager` is a process-wide singleton, so tests that map
    // regions share state across the test binary; each test uses a
    // dedicated address range to avoid colliding with others.
    fn flags() -> MapFlags {
        MapFlags { private: true, fixed: false }
    }

    #[test]
    fn map_rejects_non_private_flags() {
        let engine = VmEngine::new();
        let store = Arc::new(MemoryStore::new(0x1000, 0x1000));
        let err = engine
            .map(Some(0x5000_0000_0000), 0x1000, MapFlags::default(), store, Some(0x1000))
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingPrivateFlag));
    }

    #[test]
    fn map_rejects_unaligned_base() {
        let engine = VmEngine::new();
        let store = Arc::new(MemoryStore::new(0x1000, 0x1000));
        let err = engine.map(Some(0x5000_0000_0001), 0x1000, flags(), store, Some(0x1000)).unwrap_err();
        assert!(matches!(err, EngineError::UnalignedAddress(_)));
    }

    #[test]
    fn map_then_unmap_round_trips() {
        let engine = VmEngine::new();
        let store = Arc::new(MemoryStore::new(0x4000, 0x1000));
        let base = engine.map(Some(0x5000_1000_0000), 0x4000, flags(), store, Some(0x1000)).unwrap();
        assert!(engine.containing_region(base).is_some());
        engine.unmap(base).unwrap();
        assert!(engine.containing_region(base).is_none());
    }

    #[test]
    fn overlapping_regions_are_rejected() {
        let engine = VmEngine::new();
        let store_a = Arc::new(MemoryStore::new(0x2000, 0x1000));
        let store_b = Arc::new(MemoryStore::new(0x2000, 0x1000));
        let base = engine.map(Some(0x5000_2000_0000), 0x2000, flags(), store_a, Some(0x1000)).unwrap();
        let err = engine.map(Some(base + 0x1000), 0x2000, flags(), store_b, Some(0x1000)).unwrap_err();
        assert!(matches!(err, EngineError::OverlappingRegion(_, _)));
        engine.unmap(base).unwrap();
    }
}

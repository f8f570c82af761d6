// # Buffer
//
// The locking center of the engine. A fixed-size pool of page descriptors,
// a present-address index for O(1) hit detection, a free list, and a busy
// deque ordered by insertion (front = newest, back = oldest) used for
// eviction victim selection. Everything here is protected by one mutex plus
// two condition variables — state-change and free-descriptor-availability —
// exactly as in the engine's concurrency model (`spec.md` §5).
//
// Grounded in `examples/original_source/src/umap/Buffer.{hpp,cpp}`: the
// member layout (`m_free_pages`, `m_busy_pages`, the two condvars, the
// watermark percentages) and the entry points below (`process_page_events`,
// `mark_page_as_present`, `mark_page_as_free`, `evict_oldest_pages`,
// `evict_region`, `flush_dirty_pages`, `fetch_and_pin`) mirror it directly,
// translated from a `pthread_mutex_t` + two `pthread_cond_t` pair into
// `parking_lot::{Mutex, Condvar}`, the lock idiom the teacher
// (`harborgrid-justin-rusty-db`) uses throughout `src/buffer/manager.rs`.

mod workitem;

pub use workitem::{WorkItem, WorkType};

use crate::config::Config;
use crate::fault::FaultChannel;
use crate::page::{PageDescriptor, PageState};
use crate::region::{RegionDescriptor, RegionId};
use crossbeam::channel::Sender;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Eviction candidates returned by one `evict_oldest_pages` call.
const EVICT_BATCH_SIZE: usize = 8;

struct Slots {
    descriptors: Vec<PageDescriptor>,
    free: Vec<usize>,
    busy: VecDeque<usize>,
    present: HashMap<usize, usize>,
    /// Outstanding `Flush` work items, so `flush_dirty_pages` can block
    /// until the evict pool has actually written every page back.
    pending_flushes: usize,
    /// Active descriptor count. Starts equal to `descriptors.len()`; shrunk
    /// by `fetch_and_pin` when it permanently gives up free descriptors to
    /// honor `MemAvailable`, mirroring `Buffer::m_size` being recomputed
    /// after the same shrink in the original.
    size: usize,
}

impl Slots {
    fn invariants_hold(&self) -> bool {
        self.free.len() + self.busy.len() == self.size
    }
}

pub struct Buffer {
    slots: Mutex<Slots>,
    state_change: Condvar,
    available: Condvar,
    capacity: usize,
    low_watermark: usize,
    high_watermark: usize,
    fill_tx: Sender<WorkItem>,
    /// Posts `Threshold` only; consumed solely by the evict manager.
    evict_manager_tx: Sender<WorkItem>,
    /// Posts `FastEvict`/`Flush` directly to the worker pool, bypassing the
    /// manager (region teardown and explicit flush don't wait for a
    /// watermark crossing).
    evict_worker_tx: Sender<WorkItem>,
    channel: Arc<dyn FaultChannel>,
    pin_margin_kb: u64,
}

impl Buffer {
    pub fn new(
        config: &Config,
        channel: Arc<dyn FaultChannel>,
        fill_tx: Sender<WorkItem>,
        evict_manager_tx: Sender<WorkItem>,
        evict_worker_tx: Sender<WorkItem>,
    ) -> Self {
        let descriptors = (0..config.buffer_capacity)
            .map(|_| PageDescriptor::new_free())
            .collect::<Vec<_>>();
        let free = (0..descriptors.len()).collect();
        let size = descriptors.len();
        Self {
            slots: Mutex::new(Slots {
                descriptors,
                free,
                busy: VecDeque::new(),
                present: HashMap::new(),
                pending_flushes: 0,
                size,
            }),
            state_change: Condvar::new(),
            available: Condvar::new(),
            capacity: config.buffer_capacity,
            low_watermark: config.low_watermark_pages(),
            high_watermark: config.high_watermark_pages(),
            fill_tx,
            evict_manager_tx,
            evict_worker_tx,
            channel,
            pin_margin_kb: config.pin_margin_kb,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn busy_count(&self) -> usize {
        self.slots.lock().busy.len()
    }

    pub fn free_count(&self) -> usize {
        self.slots.lock().free.len()
    }

    pub fn low_threshold_reached(&self) -> bool {
        self.slots.lock().busy.len() <= self.low_watermark
    }

    /// Batch entry point called by the fault dispatcher, once per region
    /// represented in a drained batch. `addresses[i]`/`is_write[i]` are
    /// already rounded to this region's page size and deduplicated.
    pub fn process_page_events(
        &self,
        region: &RegionDescriptor,
        addresses: &[usize],
        is_write: &[bool],
    ) {
        let mut slots = self.slots.lock();
        for (addr, write) in addresses.iter().zip(is_write.iter()) {
            self.process_one_event(&mut slots, region, *addr, *write);
            // Checked after every event, not once per batch: a batch that
            // allocates several new pages at once could otherwise step
            // over the exact watermark value and never post a Threshold.
            if slots.busy.len() == self.high_watermark {
                debug!(busy = slots.busy.len(), high = self.high_watermark, "high watermark crossed");
                let _ = self.evict_manager_tx.send(WorkItem {
                    descriptor: None,
                    work_type: WorkType::Threshold,
                });
            }
        }
        debug_assert!(slots.invariants_hold());
    }

    fn process_one_event(
        &self,
        slots: &mut MutexGuard<Slots>,
        region: &RegionDescriptor,
        addr: usize,
        is_write: bool,
    ) {
        loop {
            if let Some(&idx) = slots.present.get(&addr) {
                let state = slots.descriptors[idx].state;
                match state {
                    PageState::Present if is_write && !slots.descriptors[idx].dirty => {
                        // Clean -> dirty always routes through the fill path,
                        // to serialize with any concurrent fill of this page.
                        slots.descriptors[idx].transition(PageState::Updating);
                        slots.descriptors[idx].dirty = true;
                        let _ = self.fill_tx.send(WorkItem {
                            descriptor: Some(idx),
                            work_type: WorkType::Refresh,
                        });
                        return;
                    }
                    PageState::Present => {
                        slots.descriptors[idx].spurious_count += 1;
                        trace!(addr, "spurious fault on present page");
                        return;
                    }
                    PageState::Filling | PageState::Updating | PageState::Leaving => {
                        self.state_change.wait(slots);
                        continue;
                    }
                    PageState::Free => unreachable!("present index points at a free descriptor"),
                }
            } else {
                if slots.free.is_empty() {
                    self.available.wait(slots);
                    if slots.present.contains_key(&addr) {
                        continue;
                    }
                    if slots.free.is_empty() {
                        continue;
                    }
                }
                let idx = slots.free.pop().expect("checked non-empty above");
                slots.descriptors[idx].init_for_fill(addr, region.id, is_write);
                slots.present.insert(addr, idx);
                slots.busy.push_front(idx);
                let _ = self.fill_tx.send(WorkItem {
                    descriptor: Some(idx),
                    work_type: WorkType::Fill,
                });
                return;
            }
        }
    }

    /// Returns `(page address, owning region id, is_write)` for a
    /// descriptor a fill worker just dequeued a `Fill` item for.
    pub fn page_fill_context(&self, idx: usize) -> (usize, RegionId, bool) {
        let slots = self.slots.lock();
        let d = &slots.descriptors[idx];
        (
            d.page.expect("Fill target has an address"),
            d.region.expect("Fill target has a region"),
            d.dirty,
        )
    }

    /// Runs `f` with the descriptor's page address, without otherwise
    /// touching its state. Used by `Refresh` handling, which only needs the
    /// address to disable write-protect at the fault channel.
    pub fn with_page_address(&self, idx: usize, f: impl FnOnce(usize)) {
        let addr = self.slots.lock().descriptors[idx].page.expect("descriptor has an address");
        f(addr);
    }

    /// Marks a descriptor's first successful fill as having happened.
    pub fn mark_data_present(&self, idx: usize) {
        self.slots.lock().descriptors[idx].data_present = true;
    }

    /// Returns `(page address, dirty)` for an evict/flush target.
    pub fn page_evict_context(&self, idx: usize) -> (usize, bool) {
        let slots = self.slots.lock();
        let d = &slots.descriptors[idx];
        (d.page.expect("Evict target has an address"), d.dirty)
    }

    /// Clears the dirty flag after a successful write-back.
    pub fn clear_dirty(&self, idx: usize) {
        self.slots.lock().descriptors[idx].dirty = false;
    }

    /// Returns the region id owning a descriptor, for evict workers that
    /// need to resolve the backing store.
    pub fn descriptor_region(&self, idx: usize) -> RegionId {
        self.slots.lock().descriptors[idx].region.expect("descriptor has a region")
    }

    /// Called by a fill worker once data is in place (or, for a
    /// clean-to-dirty refresh, once write-protect has been disabled).
    pub fn mark_page_as_present(&self, idx: usize) {
        let mut slots = self.slots.lock();
        slots.descriptors[idx].transition(PageState::Present);
        self.state_change.notify_all();
    }

    /// Called by an evict worker after a successful write-back (if dirty)
    /// and release of the backing page.
    pub fn mark_page_as_free(&self, idx: usize) {
        let mut slots = self.slots.lock();
        let page = slots.descriptors[idx].page.expect("leaving descriptor has an address");
        slots.present.remove(&page);
        let deferred = slots.descriptors[idx].deferred;
        slots.descriptors[idx].transition(PageState::Free);
        slots.descriptors[idx].reset_to_free();
        slots.busy.retain(|&i| i != idx);
        if !deferred {
            slots.free.push(idx);
            self.available.notify_all();
        }
        self.state_change.notify_all();
    }

    /// Non-blocking victim selection: scans the tail of the busy deque,
    /// setting aside deferred or non-`Present` pages (restored to the same
    /// end, same order), and transitions up to `EVICT_BATCH_SIZE` `Present`
    /// non-deferred pages to `Leaving`.
    pub fn evict_oldest_pages(&self) -> Vec<usize> {
        let mut slots = self.slots.lock();
        let mut chosen = Vec::new();
        let mut scanned = Vec::new();

        while chosen.len() < EVICT_BATCH_SIZE {
            let Some(idx) = slots.busy.pop_back() else { break };
            let d = &slots.descriptors[idx];
            if d.state == PageState::Present && !d.deferred && !d.pinned {
                slots.descriptors[idx].transition(PageState::Leaving);
                chosen.push(idx);
            }
            scanned.push(idx);
        }
        // Restore every scanned descriptor, chosen ones included: a
        // descriptor stays a member of the busy deque until
        // `mark_page_as_free` actually retires it, even once it's
        // transitioned to `Leaving`.
        for idx in scanned.into_iter().rev() {
            slots.busy.push_back(idx);
        }
        chosen
    }

    /// Forces eviction of every descriptor owned by `region`, blocking
    /// until each one has cycled back to `Free`. Called on region teardown.
    pub fn evict_region(&self, region: RegionId) {
        loop {
            let target = {
                let mut slots = self.slots.lock();
                let found = slots
                    .descriptors
                    .iter()
                    .position(|d| d.region == Some(region) && d.state != PageState::Free);
                let Some(idx) = found else { return };
                slots.descriptors[idx].deferred = true;
                // A deferred page already mid-eviction (e.g. picked by the
                // watermark-driven evict manager just before this call)
                // settles to `Free` on its own once the evict worker marks
                // it so; nothing to send for it, and `idx` is no longer
                // this region's to rescan until the outer loop looks again.
                let mut already_freed = false;
                while slots.descriptors[idx].state != PageState::Present {
                    if slots.descriptors[idx].state == PageState::Free {
                        already_freed = true;
                        break;
                    }
                    self.state_change.wait(&mut slots);
                }
                if already_freed {
                    None
                } else {
                    slots.descriptors[idx].transition(PageState::Leaving);
                    Some(idx)
                }
            };
            let Some(target) = target else { continue };
            let _ = self.evict_worker_tx.send(WorkItem {
                descriptor: Some(target),
                work_type: WorkType::FastEvict,
            });
            let mut slots = self.slots.lock();
            while slots.descriptors[target].state != PageState::Free {
                self.state_change.wait(&mut slots);
            }
        }
    }

    /// Writes back every dirty `Present` page without releasing backing
    /// memory, then waits for the evict pool to drain.
    pub fn flush_dirty_pages(&self) {
        let indices: Vec<usize> = {
            let mut slots = self.slots.lock();
            let indices: Vec<usize> = slots
                .busy
                .iter()
                .copied()
                .filter(|&idx| {
                    let d = &slots.descriptors[idx];
                    d.state == PageState::Present && d.dirty
                })
                .collect();
            slots.pending_flushes += indices.len();
            indices
        };
        debug!(count = indices.len(), "flush scheduled");
        for idx in &indices {
            let _ = self.evict_worker_tx.send(WorkItem {
                descriptor: Some(*idx),
                work_type: WorkType::Flush,
            });
        }
        let mut slots = self.slots.lock();
        while slots.pending_flushes > 0 {
            self.state_change.wait(&mut slots);
        }
    }

    /// Called by an evict worker once a `Flush` item's write-back has
    /// completed (the page stays `Present`, so there is no state transition
    /// to observe — this is the only signal `flush_dirty_pages` has to wait
    /// on).
    pub fn mark_flush_done(&self) {
        let mut slots = self.slots.lock();
        slots.pending_flushes -= 1;
        self.state_change.notify_all();
    }

    pub fn channel(&self) -> &Arc<dyn FaultChannel> {
        &self.channel
    }

    /// Pre-materializes `[region.base + offset, region.base + offset +
    /// size)` and holds it resident: the reserved descriptors are marked
    /// `pinned` and are skipped by `evict_oldest_pages` until the region is
    /// removed. Validates against `MemAvailable`, shrinking the free pool
    /// rather than evicting (per `spec.md` §4.4, evicting to make room for
    /// a pin is unsupported — mirroring `Buffer::fetch_and_pin`'s own
    /// `UMAP_ERROR` when the pinned range exceeds the free pool).
    pub fn fetch_and_pin(&self, region: &RegionDescriptor, offset: usize, size: usize) {
        let size = size.min(region.length - offset);
        let page_size = region.page_size;
        let start_page = (offset / page_size) * page_size;
        let end_page = (offset + size).div_ceil(page_size) * page_size;
        let num_pages = (end_page - start_page) / page_size;

        // One guard across the memory check and the reservation: a
        // concurrent `process_page_events` popping the free list between
        // the two would otherwise let `slots.free.pop()` below underrun
        // what the check above just validated.
        let mut slots = self.slots.lock();

        if let Some(avail_kb) = crate::config::mem_available_kb() {
            let usable_kb = avail_kb.saturating_sub(self.pin_margin_kb);
            let usable_bytes = usable_kb * 1024;
            let free_bytes = slots.free.len() as u64 * page_size as u64;
            let needed = size as u64;
            if free_bytes + needed >= usable_bytes {
                let reduced = (free_bytes + needed) - usable_bytes;
                if reduced < free_bytes {
                    let new_free_len = ((free_bytes - reduced) / page_size as u64) as usize;
                    let dropped = slots.free.len() - new_free_len;
                    slots.free.truncate(new_free_len);
                    slots.size -= dropped;
                    warn!(new_free_len, "fetch_and_pin reduced free pool to honor MemAvailable");
                } else {
                    panic!("fetch_and_pin: pinned range exceeds available free pages");
                }
            }
        }

        let reserved: Vec<(usize, usize)> = (0..num_pages)
            .map(|i| {
                let addr = region.base + start_page + i * page_size;
                let idx = slots.free.pop().expect("reserved above; free pool not empty");
                slots.descriptors[idx].init_for_fill(addr, region.id, false);
                slots.descriptors[idx].pinned = true;
                slots.present.insert(addr, idx);
                slots.busy.push_front(idx);
                (idx, addr)
            })
            .collect();
        drop(slots);

        const MAX_FETCH_THREADS: usize = 8;
        let num_threads = if num_pages > 1024 { MAX_FETCH_THREADS } else { 1 };
        let chunk = reserved.len().div_ceil(num_threads).max(1);
        std::thread::scope(|scope| {
            for chunk_items in reserved.chunks(chunk) {
                scope.spawn(move || {
                    let mut scratch = vec![0u8; page_size];
                    for &(idx, addr) in chunk_items {
                        let store_off = region.store_offset(addr);
                        region
                            .store
                            .read_at(store_off, &mut scratch)
                            .unwrap_or_else(|e| {
                                tracing::error!(error = %e, "fatal store read failure during fetch_and_pin");
                                std::process::abort();
                            });
                        self.channel.inject_page(addr, &scratch, true);
                        self.mark_page_as_present(idx);
                    }
                });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crossbeam::channel::unbounded;

    fn test_buffer(capacity: usize) -> (Buffer, crossbeam::channel::Receiver<WorkItem>, crossbeam::channel::Receiver<WorkItem>) {
        let mut cfg = Config::from_env();
        cfg.buffer_capacity = capacity;
        let (fill_tx, fill_rx) = unbounded();
        let (evict_manager_tx, evict_manager_rx) = unbounded();
        let (evict_worker_tx, _evict_worker_rx) = unbounded();
        let channel = Arc::new(crate::fault::SimChannel::new());
        (
            Buffer::new(&cfg, channel, fill_tx, evict_manager_tx, evict_worker_tx),
            fill_rx,
            evict_manager_rx,
        )
    }

    fn test_region() -> RegionDescriptor {
        RegionDescriptor {
            id: RegionId::next(),
            base: 0x10000,
            length: 0x10000,
            page_size: 0x1000,
            store: Arc::new(MemoryStore::new(0x10000, 0x1000)),
        }
    }

    #[test]
    fn new_fault_allocates_free_descriptor_and_schedules_fill() {
        let (buf, fill_rx, _evict_rx) = test_buffer(4);
        let region = test_region();
        buf.process_page_events(&region, &[0x10000], &[false]);
        assert_eq!(buf.busy_count(), 1);
        assert_eq!(buf.free_count(), 3);
        let item = fill_rx.try_recv().unwrap();
        assert_eq!(item.work_type, WorkType::Fill);
    }

    #[test]
    fn repeat_read_fault_on_present_page_is_spurious() {
        let (buf, fill_rx, _evict_rx) = test_buffer(4);
        let region = test_region();
        buf.process_page_events(&region, &[0x10000], &[false]);
        let item = fill_rx.try_recv().unwrap();
        buf.mark_page_as_present(item.descriptor.unwrap());

        buf.process_page_events(&region, &[0x10000], &[false]);
        assert!(fill_rx.try_recv().is_err());
    }

    #[test]
    fn evict_oldest_pages_only_selects_present_non_deferred() {
        let (buf, fill_rx, _evict_rx) = test_buffer(4);
        let region = test_region();
        buf.process_page_events(&region, &[0x10000, 0x11000], &[false, false]);
        let a = fill_rx.try_recv().unwrap().descriptor.unwrap();
        let _b = fill_rx.try_recv().unwrap().descriptor.unwrap();
        buf.mark_page_as_present(a);
        // b stays in Filling: not a valid eviction candidate yet.
        let chosen = buf.evict_oldest_pages();
        assert_eq!(chosen, vec![a]);
    }

    #[test]
    fn mark_page_as_free_restores_free_list_and_notifies() {
        let (buf, fill_rx, _evict_rx) = test_buffer(1);
        let region = test_region();
        buf.process_page_events(&region, &[0x10000], &[false]);
        let idx = fill_rx.try_recv().unwrap().descriptor.unwrap();
        buf.mark_page_as_present(idx);
        let chosen = buf.evict_oldest_pages();
        assert_eq!(chosen, vec![idx]);
        buf.mark_page_as_free(idx);
        assert_eq!(buf.free_count(), 1);
        assert_eq!(buf.busy_count(), 0);
    }
}

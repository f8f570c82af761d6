use super::{FaultChannel, FaultEvent, PollResult};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;

/// A simulated fault channel standing in for a real `userfaultfd`-backed
/// one (out of scope per `spec.md` §1: "kernel-facing primitives ...
/// specified only as an abstract fault-channel contract"). Application
/// threads drive faults explicitly via [`SimChannel::access`] instead of
/// the kernel raising them from real `mmap`'d load/store instructions,
/// which lets the engine's end-to-end scenarios run without Linux uffd
/// privileges.
///
/// Grounded in `Uffd.hpp`'s operation set: event draining, write-protect
/// toggling, and page injection are all represented; only the delivery
/// mechanism (an explicit call instead of a kernel trap) differs.
pub struct SimChannel {
    inner: Mutex<Inner>,
    cond: Condvar,
}

struct Inner {
    queue: Vec<FaultEvent>,
    woken: bool,
    regions: Vec<(usize, usize, usize)>, // base, length, page_size
    pages: HashMap<usize, Vec<u8>>,
    protected: std::collections::HashSet<usize>,
}

impl SimChannel {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: Vec::new(),
                woken: false,
                regions: Vec::new(),
                pages: HashMap::new(),
                protected: std::collections::HashSet::new(),
            }),
            cond: Condvar::new(),
        }
    }

    fn page_size_for(inner: &Inner, addr: usize) -> usize {
        inner
            .regions
            .iter()
            .find(|(base, len, _)| addr >= *base && addr < base + len)
            .map(|(_, _, ps)| *ps)
            .expect("address not inside any registered region")
    }

    /// Raises a fault at `address` and enqueues it for the dispatcher to
    /// observe, mirroring how a real page fault becomes a `uffd_msg`.
    pub fn touch(&self, address: usize, is_write: bool) {
        let mut inner = self.inner.lock();
        inner.queue.push(FaultEvent { address, is_write });
        self.cond.notify_all();
    }

    /// Blocks the calling application thread until the page containing
    /// `address` is present and (if `is_write`) unprotected, then performs
    /// the byte-range access. This is the simulated equivalent of an
    /// ordinary load/store instruction taking a page fault, being resolved
    /// by the engine, and resuming.
    pub fn access(&self, address: usize, len: usize, is_write: bool, f: impl FnOnce(&mut [u8])) {
        let mut inner = self.inner.lock();
        let page_size = Self::page_size_for(&inner, address);
        let page_addr = address - (address % page_size);

        loop {
            let present = inner.pages.contains_key(&page_addr);
            let blocked_by_protect = is_write && inner.protected.contains(&page_addr);
            if present && !blocked_by_protect {
                break;
            }
            inner.queue.push(FaultEvent { address, is_write });
            self.cond.notify_all();
            self.cond.wait(&mut inner);
        }

        let page = inner.pages.get_mut(&page_addr).unwrap();
        let off = address - page_addr;
        f(&mut page[off..off + len]);
    }

    pub fn page_snapshot(&self, page_addr: usize) -> Option<Vec<u8>> {
        self.inner.lock().pages.get(&page_addr).cloned()
    }
}

impl Default for SimChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultChannel for SimChannel {
    fn register_region(&self, base: usize, length: usize, page_size: usize) {
        self.inner.lock().regions.push((base, length, page_size));
    }

    fn unregister_region(&self, base: usize, length: usize) {
        let mut inner = self.inner.lock();
        inner.regions.retain(|(b, l, _)| !(*b == base && *l == length));
        inner.pages.retain(|addr, _| !(*addr >= base && *addr < base + length));
        inner.protected.retain(|addr| !(*addr >= base && *addr < base + length));
    }

    fn poll(&self, max_events: usize) -> PollResult {
        let mut inner = self.inner.lock();
        loop {
            if inner.woken {
                inner.woken = false;
                return PollResult::Woken;
            }
            if !inner.queue.is_empty() {
                let n = inner.queue.len().min(max_events);
                let drained: Vec<_> = inner.queue.drain(..n).collect();
                return PollResult::Events(drained);
            }
            self.cond.wait(&mut inner);
        }
    }

    fn wake(&self) {
        let mut inner = self.inner.lock();
        inner.woken = true;
        self.cond.notify_all();
    }

    fn inject_page(&self, address: usize, data: &[u8], write_protect: bool) {
        let mut inner = self.inner.lock();
        inner.pages.insert(address, data.to_vec());
        if write_protect {
            inner.protected.insert(address);
        } else {
            inner.protected.remove(&address);
        }
        self.cond.notify_all();
    }

    fn write_protect(&self, address: usize) {
        let mut inner = self.inner.lock();
        inner.protected.insert(address);
    }

    fn unprotect(&self, address: usize) {
        let mut inner = self.inner.lock();
        inner.protected.remove(&address);
        self.cond.notify_all();
    }

    fn read_resident_page(&self, address: usize, len: usize) -> Vec<u8> {
        let inner = self.inner.lock();
        inner
            .pages
            .get(&address)
            .map(|p| p[..len.min(p.len())].to_vec())
            .unwrap_or_else(|| panic!("read_resident_page: {address:#x} is not resident"))
    }

    fn drop_backing(&self, address: usize) {
        let mut inner = self.inner.lock();
        inner.pages.remove(&address);
        inner.protected.remove(&address);
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_drains_queued_events_sorted_by_nothing_in_particular() {
        let chan = SimChannel::new();
        chan.register_region(0x1000, 0x2000, 0x1000);
        chan.touch(0x1000, false);
        chan.touch(0x1800, true);
        match chan.poll(256) {
            PollResult::Events(events) => assert_eq!(events.len(), 2),
            PollResult::Woken => panic!("expected events"),
        }
    }

    #[test]
    fn wake_takes_priority_over_empty_queue() {
        let chan = SimChannel::new();
        chan.wake();
        match chan.poll(256) {
            PollResult::Woken => {}
            PollResult::Events(_) => panic!("expected wake"),
        }
    }

    #[test]
    fn unregister_region_drops_its_pages() {
        let chan = SimChannel::new();
        chan.register_region(0x1000, 0x1000, 0x1000);
        chan.inject_page(0x1000, &[1u8; 0x1000], false);
        chan.unregister_region(0x1000, 0x1000);
        assert!(chan.page_snapshot(0x1000).is_none());
    }
}

// # Fault dispatcher
//
// A single dedicated thread: block on the fault channel, drain a batch,
// sort by address ascending then write-before-read, coalesce duplicates,
// partition by region, and hand each region's surviving addresses to the
// buffer in one call. Grounded in
// `examples/original_source/src/umap/FaultMonitor.cpp`'s drain-sort-dispatch
// loop.

use crate::buffer::Buffer;
use crate::fault::{FaultChannel, PollResult};
use crate::region::RegionDescriptor;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::trace;

pub struct Dispatcher {
    handle: JoinHandle<()>,
}

impl Dispatcher {
    pub fn start(
        channel: Arc<dyn FaultChannel>,
        buffer: Arc<Buffer>,
        max_fault_events: usize,
        containing_region: Arc<dyn Fn(usize) -> Option<Arc<RegionDescriptor>> + Send + Sync>,
    ) -> Self {
        let handle = std::thread::Builder::new()
            .name("vmap-dispatcher".into())
            .spawn(move || loop {
                match channel.poll(max_fault_events) {
                    PollResult::Woken => return,
                    PollResult::Events(events) => {
                        dispatch_batch(&buffer, &containing_region, events);
                    }
                }
            })
            .expect("failed to spawn fault dispatcher");
        Self { handle }
    }

    pub fn join(self) {
        let _ = self.handle.join();
    }
}

fn dispatch_batch(
    buffer: &Buffer,
    containing_region: &Arc<dyn Fn(usize) -> Option<Arc<RegionDescriptor>> + Send + Sync>,
    events: Vec<crate::fault::FaultEvent>,
) {
    // Round each address down to its region's page size, then sort by
    // address ascending, write-before-read at equal address, so coalescing
    // a batch never downgrades a write to a read.
    let mut rounded: Vec<(Arc<RegionDescriptor>, usize, bool)> = events
        .into_iter()
        .filter_map(|ev| {
            let region = containing_region(ev.address)?;
            let page_addr = region.page_base(ev.address);
            Some((region, page_addr, ev.is_write))
        })
        .collect();

    rounded.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| b.2.cmp(&a.2)));

    let mut per_region: HashMap<usize, (Arc<RegionDescriptor>, Vec<usize>, Vec<bool>)> = HashMap::new();
    let mut last_addr: Option<usize> = None;
    for (region, addr, is_write) in rounded {
        if last_addr == Some(addr) {
            trace!(addr, "coalescing duplicate fault in batch");
            continue;
        }
        last_addr = Some(addr);
        let entry = per_region
            .entry(region.id.0 as usize)
            .or_insert_with(|| (region.clone(), Vec::new(), Vec::new()));
        entry.1.push(addr);
        entry.2.push(is_write);
    }

    for (_, (region, addresses, writes)) in per_region {
        buffer.process_page_events(&region, &addresses, &writes);
    }
}

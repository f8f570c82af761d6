// # Fill worker pool
//
// N workers consuming `Fill`/`Refresh` work items. Each owns a scratch
// buffer sized to the largest page size registered with the engine.
// Grounded in `examples/original_source/src/umap/{FillWorkers,PageFiller}.{cpp,hpp}`
// and the teacher's worker-thread idiom (`std::thread` + `crossbeam`
// bounded channels) seen throughout `harborgrid-justin-rusty-db`'s
// concurrency code.

use crate::buffer::{Buffer, WorkItem, WorkType};
use crate::fault::FaultChannel;
use crate::region::{RegionDescriptor, RegionId};
use crossbeam::channel::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error};

pub struct FillPool {
    handles: Vec<JoinHandle<()>>,
}

impl FillPool {
    pub fn start(
        num_workers: usize,
        max_page_size: usize,
        rx: Receiver<WorkItem>,
        buffer: Arc<Buffer>,
        channel: Arc<dyn FaultChannel>,
        region_lookup: Arc<dyn Fn(RegionId) -> Option<Arc<RegionDescriptor>> + Send + Sync>,
    ) -> Self {
        let handles = (0..num_workers)
            .map(|id| {
                let rx = rx.clone();
                let buffer = buffer.clone();
                let channel = channel.clone();
                let region_lookup = region_lookup.clone();
                std::thread::Builder::new()
                    .name(format!("vmap-fill-{id}"))
                    .spawn(move || run(rx, buffer, channel, region_lookup, max_page_size))
                    .expect("failed to spawn fill worker")
            })
            .collect();
        Self { handles }
    }

    pub fn join(self) {
        for h in self.handles {
            let _ = h.join();
        }
    }
}

fn run(
    rx: Receiver<WorkItem>,
    buffer: Arc<Buffer>,
    channel: Arc<dyn FaultChannel>,
    region_lookup: Arc<dyn Fn(RegionId) -> Option<Arc<RegionDescriptor>> + Send + Sync>,
    max_page_size: usize,
) {
    let mut scratch = vec![0u8; max_page_size];
    loop {
        let Ok(item) = rx.recv() else { return };
        match item.work_type {
            WorkType::Exit => return,
            WorkType::Refresh => {
                let idx = item.descriptor.expect("Refresh carries a descriptor");
                debug!(idx, "disabling write-protect for clean->dirty refresh");
                // The descriptor's address is read by the caller through the
                // buffer; for a refresh we only need to unprotect at the
                // fault channel and mark present again.
                buffer.with_page_address(idx, |addr| channel.unprotect(addr));
                buffer.mark_page_as_present(idx);
            }
            WorkType::Fill => {
                let idx = item.descriptor.expect("Fill carries a descriptor");
                let (addr, region_id, is_write) = buffer.page_fill_context(idx);
                let Some(region) = region_lookup(region_id) else {
                    error!(addr, "fill worker: page address not inside any known region");
                    std::process::abort();
                };
                let page_size = region.page_size;
                if scratch.len() < page_size {
                    // A region mapped after this pool started can carry a
                    // page size larger than the one in effect at startup.
                    scratch.resize(page_size, 0);
                }
                let store_off = region.store_offset(addr);
                if let Err(e) = region.store.read_at(store_off, &mut scratch[..page_size]) {
                    error!(error = %e, addr, "fatal store read failure");
                    std::process::abort();
                }
                channel.inject_page(addr, &scratch[..page_size], !is_write);
                buffer.mark_data_present(idx);
                buffer.mark_page_as_present(idx);
            }
            WorkType::Threshold | WorkType::Evict | WorkType::FastEvict | WorkType::Flush => {
                unreachable!("work item {:?} routed to the wrong pool", item.work_type)
            }
        }
    }
}

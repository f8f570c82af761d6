// # Evict manager and worker pool
//
// One dedicated manager thread that drains the buffer toward the low
// watermark by repeatedly calling `evict_oldest_pages`, plus M worker
// threads that perform the actual write-back and backing release for each
// selected descriptor. Grounded in
// `examples/original_source/src/umap/{EvictManager,EvictWorkers,PageFlusher}.{cpp,hpp}`.

use crate::buffer::{Buffer, WorkItem, WorkType};
use crate::fault::FaultChannel;
use crate::region::{RegionDescriptor, RegionId};
use crossbeam::channel::{Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error};

pub struct EvictManager {
    handle: JoinHandle<()>,
}

impl EvictManager {
    pub fn start(rx: Receiver<WorkItem>, buffer: Arc<Buffer>, evict_tx: Sender<WorkItem>) -> Self {
        let handle = std::thread::Builder::new()
            .name("vmap-evict-manager".into())
            .spawn(move || {
                loop {
                    let Ok(item) = rx.recv() else { return };
                    match item.work_type {
                        WorkType::Exit => return,
                        WorkType::Threshold => {
                            while !buffer.low_threshold_reached() {
                                let victims = buffer.evict_oldest_pages();
                                if victims.is_empty() {
                                    break;
                                }
                                for idx in victims {
                                    let _ = evict_tx.send(WorkItem {
                                        descriptor: Some(idx),
                                        work_type: WorkType::Evict,
                                    });
                                }
                            }
                        }
                        other => {
                            debug!(?other, "evict manager ignoring non-threshold work item");
                        }
                    }
                }
            })
            .expect("failed to spawn evict manager");
        Self { handle }
    }

    pub fn join(self) {
        let _ = self.handle.join();
    }
}

pub struct EvictPool {
    handles: Vec<JoinHandle<()>>,
}

impl EvictPool {
    pub fn start(
        num_workers: usize,
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
                    .name(format!("vmap-evict-{id}"))
                    .spawn(move || run(rx, buffer, channel, region_lookup))
                    .expect("failed to spawn evict worker")
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
) {
    loop {
        let Ok(item) = rx.recv() else { return };
        match item.work_type {
            WorkType::Exit => return,
            WorkType::Evict | WorkType::FastEvict | WorkType::Flush => {
                let idx = item.descriptor.expect("evict item carries a descriptor");
                let (addr, dirty) = buffer.page_evict_context(idx);
                if dirty {
                    // Write-protect before write-back: a concurrent writer
                    // must not finish after the page has already been
                    // flushed to the store.
                    channel.write_protect(addr);
                    let region_id = buffer.descriptor_region(idx);
                    let Some(region) = region_lookup(region_id) else {
                        error!(addr, "evict worker: page address not inside any known region");
                        std::process::abort();
                    };
                    let store_off = region.store_offset(addr);
                    let data = channel.read_resident_page(addr, region.page_size);
                    if let Err(e) = region.store.write_at(store_off, &data) {
                        error!(error = %e, addr, "fatal store write failure");
                        std::process::abort();
                    }
                    buffer.clear_dirty(idx);
                }

                if item.work_type == WorkType::Flush {
                    // Flush never leaves Present: the page was never
                    // transitioned away from it, so there is nothing to
                    // transition back.
                    buffer.mark_flush_done();
                    continue;
                }

                channel.drop_backing(addr);
                buffer.mark_page_as_free(idx);
            }
            other => {
                debug!(?other, "evict worker ignoring work item not meant for it");
            }
        }
    }
}

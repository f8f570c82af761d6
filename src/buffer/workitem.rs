/// What kind of work a fill or evict worker should do for a `WorkItem`.
///
/// `Fill` and `Refresh` are consumed by the fill pool; `Evict`, `FastEvict`,
/// and `Flush` by the evict pool; `Threshold` wakes the evict manager
/// rather than a worker; `Exit` terminates the worker that dequeues it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkType {
    Exit,
    Threshold,
    /// A brand new page: read from the store and inject.
    Fill,
    /// A clean page that just took its first write fault: disable
    /// write-protect and mark present, without touching the store.
    Refresh,
    Evict,
    FastEvict,
    Flush,
}

/// Unit of work exchanged between the buffer and the worker pools. Carries
/// an optional descriptor index (`None` only for `Exit`/`Threshold`, which
/// target no specific page) and a [`WorkType`].
#[derive(Debug, Clone, Copy)]
pub struct WorkItem {
    pub descriptor: Option<usize>,
    pub work_type: WorkType,
}

impl WorkItem {
    pub fn exit() -> Self {
        Self { descriptor: None, work_type: WorkType::Exit }
    }
}

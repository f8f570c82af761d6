// # Fault channel
//
// An abstract channel over which the kernel (or, here, an application
// driving a simulated channel) delivers fault events for registered
// regions. The engine's core is written entirely against this trait; a
// real `userfaultfd`-backed implementation is an external collaborator and
// out of scope (see `spec.md` §1) — it would replace [`SimChannel`] without
// the dispatcher, buffer, or worker pools changing at all.

mod sim;

pub use sim::SimChannel;

/// One drained fault event.
#[derive(Debug, Clone, Copy)]
pub struct FaultEvent {
    pub address: usize,
    pub is_write: bool,
}

/// Result of a blocking poll: either events were drained, or the channel
/// was woken via its out-of-band wake signal with nothing to drain.
pub enum PollResult {
    Events(Vec<FaultEvent>),
    Woken,
}

/// The kernel-mediated contract the fault dispatcher and buffer need.
/// Addresses are system-page granularity; events may repeat and are
/// delivered in unspecified order.
pub trait FaultChannel: Send + Sync {
    /// Registers a region's address range so its faults are delivered.
    fn register_region(&self, base: usize, length: usize, page_size: usize);

    /// Deregisters a region's address range.
    fn unregister_region(&self, base: usize, length: usize);

    /// Blocks until either fault events are ready or the channel is woken,
    /// draining up to `max_events` events in the former case.
    fn poll(&self, max_events: usize) -> PollResult;

    /// Delivers the wake signal, unblocking a concurrent `poll`.
    fn wake(&self);

    /// Injects a page of data at `address`, optionally leaving it
    /// write-protected.
    fn inject_page(&self, address: usize, data: &[u8], write_protect: bool);

    /// Enables write-protect on the page at `address`.
    fn write_protect(&self, address: usize);

    /// Disables write-protect on the page at `address`.
    fn unprotect(&self, address: usize);

    /// Reads the current content of the resident page at `address`, for
    /// write-back. On a real mapping this is an ordinary memory copy out of
    /// the mapped address range; here it reads the simulated backing.
    fn read_resident_page(&self, address: usize, len: usize) -> Vec<u8>;

    /// Advises the kernel to drop the physical backing for the page at
    /// `address`, releasing memory (`MADV_DONTNEED` on a real mapping).
    fn drop_backing(&self, address: usize);

    /// Downcasting hook so callers that know they're holding a
    /// [`SimChannel`] (tests, the engine's own `access` helper) can reach
    /// its `access` method, which a real kernel-backed channel has no
    /// equivalent for.
    fn as_any(&self) -> &dyn std::any::Any;
}

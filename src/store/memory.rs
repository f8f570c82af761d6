use super::Store;
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

/// An in-memory store for unit and integration tests, so the core's
/// end-to-end scenarios can run without a filesystem. Tracks a per-page
/// read counter so tests can assert on fill counts (e.g. the pin scenario
/// in the engine's testable properties).
pub struct MemoryStore {
    data: Mutex<Vec<u8>>,
    page_size: usize,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new(length: usize, page_size: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; length]),
            page_size,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Builds a store pre-populated by `f(page_index) -> page_bytes`.
    pub fn generated(num_pages: usize, page_size: usize, mut f: impl FnMut(usize, &mut [u8])) -> Self {
        let mut data = vec![0u8; num_pages * page_size];
        for i in 0..num_pages {
            f(i, &mut data[i * page_size..(i + 1) * page_size]);
        }
        Self {
            data: Mutex::new(data),
            page_size,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }
}

impl Store for MemoryStore {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let data = self.data.lock();
        let off = offset as usize;
        if off + buf.len() > data.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "read past end"));
        }
        buf.copy_from_slice(&data[off..off + buf.len()]);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut data = self.data.lock();
        let off = offset as usize;
        if off + buf.len() > data.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "write past end"));
        }
        data[off..off + buf.len()].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_read_count_for_pin_scenario() {
        let store = MemoryStore::new(8192, 4096);
        let mut buf = [0u8; 4096];
        store.read_at(0, &mut buf).unwrap();
        store.read_at(0, &mut buf).unwrap();
        assert_eq!(store.read_count(), 2);
    }

    #[test]
    fn generated_content_is_addressable_by_page_index() {
        let store = MemoryStore::generated(4, 8, |i, page| {
            page[0] = i as u8;
        });
        let mut buf = [0u8; 8];
        store.read_at(16, &mut buf).unwrap();
        assert_eq!(buf[0], 2);
        assert_eq!(store.page_size(), 8);
    }
}

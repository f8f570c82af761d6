// # Configuration
//
// Tunables for the virtual memory engine, read once from the environment
// when the first region is mapped. Mirrors the teacher's `Config`/
// `DatabaseConfig::default()` pattern: a plain struct with a `Default` impl,
// overridden by environment variables at construction time.

use std::env;

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u8(name: &str, default: u8) -> u8 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// System page size, queried once via `libc::sysconf`.
pub fn system_page_size() -> usize {
    let rc = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if rc > 0 {
        rc as usize
    } else {
        4096
    }
}

fn default_buffer_capacity(page_size: usize) -> usize {
    let total_ram = total_ram_bytes().unwrap_or(1 << 30);
    ((total_ram as f64 * 0.95) as usize / page_size).max(1)
}

/// Reads `MemAvailable` from `/proc/meminfo`, in kibibytes. Used by
/// `fetch_and_pin` to decide whether the free-descriptor pool must shrink
/// to make room for a pinned range.
pub fn mem_available_kb() -> Option<u64> {
    let contents = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            return rest.split_whitespace().next()?.parse().ok();
        }
    }
    None
}

fn total_ram_bytes() -> Option<u64> {
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if pages > 0 && page_size > 0 {
        Some(pages as u64 * page_size as u64)
    } else {
        None
    }
}

fn default_worker_count() -> usize {
    num_cpus::get().clamp(1, 16)
}

/// Tunables controlling buffer sizing, worker pool sizing, and eviction
/// watermarks. Constructed once with [`Config::from_env`]; later attempts to
/// build a second, different configuration while regions are active are
/// rejected by the region manager (see [`crate::manager`]).
#[derive(Debug, Clone)]
pub struct Config {
    /// Default page size for regions that don't request one explicitly.
    pub page_size: usize,
    /// Upper bound on resident pages across all regions.
    pub buffer_capacity: usize,
    /// Number of fill workers.
    pub filler_count: usize,
    /// Number of evict workers.
    pub evictor_count: usize,
    /// Eviction stop threshold, as a percentage of `buffer_capacity`.
    pub low_watermark_pct: u8,
    /// Eviction start threshold, as a percentage of `buffer_capacity`.
    pub high_watermark_pct: u8,
    /// Max fault events drained per dispatcher wake.
    pub max_fault_events: usize,
    /// Read-ahead window, in pages. Reserved for prefetch policy.
    pub read_ahead: usize,
    /// Safety margin, in KiB, subtracted from `MemAvailable` before
    /// `fetch_and_pin` decides whether the free-descriptor pool must
    /// shrink. Defaults to the 16 GiB upstream uses; tests on
    /// memory-constrained hosts override it via `VMAP_PIN_MARGIN_KB`.
    pub pin_margin_kb: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

impl Config {
    /// Builds a configuration from environment variables, falling back to
    /// the documented defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let page_size = env_usize("VMAP_PAGE_SIZE", system_page_size());
        let filler_count = {
            let v = env_usize("VMAP_FILLER_COUNT", 0);
            if v > 0 { v } else { default_worker_count() }
        };
        let evictor_count = {
            let v = env_usize("VMAP_EVICTOR_COUNT", 0);
            if v > 0 { v } else { default_worker_count() }
        };
        Self {
            page_size,
            buffer_capacity: env_usize("VMAP_BUFFER_CAPACITY", default_buffer_capacity(page_size)),
            filler_count,
            evictor_count,
            low_watermark_pct: env_u8("VMAP_LOW_WATERMARK", 70),
            high_watermark_pct: env_u8("VMAP_HIGH_WATERMARK", 90),
            max_fault_events: env_usize("VMAP_MAX_FAULT_EVENTS", 256),
            read_ahead: env_usize("VMAP_READ_AHEAD", 0),
            pin_margin_kb: env::var("VMAP_PIN_MARGIN_KB")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(16 * 1024 * 1024),
        }
    }

    pub fn low_watermark_pages(&self) -> usize {
        self.buffer_capacity * self.low_watermark_pct as usize / 100
    }

    pub fn high_watermark_pages(&self) -> usize {
        self.buffer_capacity * self.high_watermark_pct as usize / 100
    }
}

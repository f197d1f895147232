//! Counters behind `execstat()`.

use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Default)]
pub struct ExecStats {
    read_hits: AtomicI64,
    write_hits: AtomicI64,
    evictions: AtomicI64,
    writebacks: AtomicI64,
    invalidations: AtomicI64,
    close_writebacks: AtomicI64,
    close_evictions: AtomicI64,
}

/// A snapshot of [`ExecStats`], mirroring the original `pfs_execstat`
/// struct's field list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecStatSnapshot {
    pub read_hits: i64,
    pub write_hits: i64,
    pub evictions: i64,
    pub writebacks: i64,
    pub invalidations: i64,
    pub close_writebacks: i64,
    pub close_evictions: i64,
}

impl ExecStats {
    pub fn record_read_hit(&self) {
        self.read_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_hit(&self) {
        self.write_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, n: u64) {
        self.evictions.fetch_add(n as i64, Ordering::Relaxed);
    }

    pub fn record_writeback(&self) {
        self.writebacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_close_evictions(&self, n: u64) {
        self.close_evictions.fetch_add(n as i64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ExecStatSnapshot {
        ExecStatSnapshot {
            read_hits: self.read_hits.load(Ordering::Relaxed),
            write_hits: self.write_hits.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            writebacks: self.writebacks.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            close_writebacks: self.close_writebacks.load(Ordering::Relaxed),
            close_evictions: self.close_evictions.load(Ordering::Relaxed),
        }
    }
}

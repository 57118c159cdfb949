// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Memory pressure valve.
//!
//! When the process grows past a configured high-water mark, the harvest drops
//! everything it holds instead of waiting for the next delivery. A reclaim
//! hook (e.g. asking the allocator to return freed pages) runs at most once
//! per [`RECLAIM_COOLDOWN`] across all callers.

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::config::Config;

pub const RECLAIM_COOLDOWN: Duration = Duration::from_secs(30);

const PROC_STATM_PATH: &str = "/proc/self/statm";
const PAGE_SIZE: u64 = 4096;

/// Source of the current memory footprint in bytes.
pub trait HeapUsageReader: Send + Sync {
    fn read(&self) -> Option<u64>;
}

/// Resident set size from `/proc/self/statm`.
pub struct ProcStatmReader;

impl HeapUsageReader for ProcStatmReader {
    fn read(&self) -> Option<u64> {
        let rss_pages = fs::read_to_string(PROC_STATM_PATH)
            .ok()
            .and_then(|contents| parse_statm_rss(&contents));
        if rss_pages.is_none() {
            debug!("Could not read resident set size from {PROC_STATM_PATH}");
        }
        rss_pages.map(|pages| pages * PAGE_SIZE)
    }
}

/// The second field of statm is the resident page count.
fn parse_statm_rss(contents: &str) -> Option<u64> {
    contents.split_whitespace().nth(1)?.parse().ok()
}

/// Reports a fixed value. Useful where the real footprint is irrelevant.
pub struct FixedUsageReader(pub AtomicU64);

impl FixedUsageReader {
    #[must_use]
    pub fn new(bytes: u64) -> Self {
        FixedUsageReader(AtomicU64::new(bytes))
    }

    pub fn set(&self, bytes: u64) {
        self.0.store(bytes, Ordering::Relaxed);
    }
}

impl HeapUsageReader for FixedUsageReader {
    fn read(&self) -> Option<u64> {
        Some(self.0.load(Ordering::Relaxed))
    }
}

/// Decides, given the current usage, whether to go ahead with a dump.
pub type DumpPredicate = Box<dyn Fn(u64) -> bool + Send + Sync>;
pub type ReclaimHook = Box<dyn Fn() + Send + Sync>;

pub struct MemoryMonitor {
    threshold_bytes: u64,
    predicate: Option<DumpPredicate>,
    reader: Box<dyn HeapUsageReader>,
    reclaim: Option<ReclaimHook>,
    // Seconds since the epoch of the last reclaim, 0 if never.
    last_reclaim: AtomicU64,
}

impl std::fmt::Debug for MemoryMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMonitor")
            .field("threshold_bytes", &self.threshold_bytes)
            .field("last_reclaim", &self.last_reclaim)
            .finish_non_exhaustive()
    }
}

impl MemoryMonitor {
    #[must_use]
    pub fn new(threshold_bytes: u64, reader: Box<dyn HeapUsageReader>) -> Self {
        MemoryMonitor {
            threshold_bytes,
            predicate: None,
            reader,
            reclaim: None,
            last_reclaim: AtomicU64::new(0),
        }
    }

    /// Reads RSS from `/proc` against the configured threshold. `None` when
    /// the threshold is 0.
    #[must_use]
    pub fn from_config(config: &Config) -> Option<Self> {
        (config.memory_threshold_bytes > 0)
            .then(|| MemoryMonitor::new(config.memory_threshold_bytes, Box::new(ProcStatmReader)))
    }

    #[must_use]
    pub fn with_predicate(mut self, predicate: DumpPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    #[must_use]
    pub fn with_reclaim(mut self, reclaim: ReclaimHook) -> Self {
        self.reclaim = Some(reclaim);
        self
    }

    #[must_use]
    pub fn threshold_bytes(&self) -> u64 {
        self.threshold_bytes
    }

    /// Whether the harvest should dump its live data now. A threshold of 0
    /// disables the check.
    pub fn check(&self, now: SystemTime) -> bool {
        if self.threshold_bytes == 0 {
            return false;
        }
        let Some(used) = self.reader.read() else {
            return false;
        };
        if used <= self.threshold_bytes {
            return false;
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(used) {
                debug!("Memory at {used} bytes, dump declined");
                return false;
            }
        }
        warn!(
            "Memory at {used} bytes exceeds {} bytes, dropping harvest data",
            self.threshold_bytes
        );
        self.try_reclaim(now);
        true
    }

    /// Runs the reclaim hook unless one ran within the cooldown. Returns
    /// whether this call won the slot.
    pub fn try_reclaim(&self, now: SystemTime) -> bool {
        let now_secs = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let last = self.last_reclaim.load(Ordering::Acquire);
        if last != 0 && now_secs < last + RECLAIM_COOLDOWN.as_secs() {
            return false;
        }
        if self
            .last_reclaim
            .compare_exchange(last, now_secs, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Some(reclaim) = &self.reclaim {
            reclaim();
        }
        true
    }
}

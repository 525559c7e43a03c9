//! Memory accounting for page buffers.
//!
//! Decoded RGBA pages are large (a US-Letter page at 144 DPI is ~19 MB) and
//! a scan session touches every page of the document, so the orchestrator
//! keeps its working set on a leash with three pieces:
//!
//! - [`PageImageCache`]: a TTL + capacity bounded cache of fetched pages,
//!   so a retried page does not pay the provider round-trip again.
//! - [`MemoryTracker`]: RAII accounting of buffers currently held by an
//!   in-flight decode.
//! - [`MemoryProbe`]: an override point for hosts that want the limit
//!   enforced against process RSS or an allocator metric instead of the
//!   library's own working set.
//!
//! ## Why expire on read?
//!
//! The cache is only touched from the scan loop, one page at a time, so a
//! background sweeper task would be pure overhead. Entries are checked
//! against the TTL when read and swept in bulk during the periodic cleanup
//! the orchestrator already performs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::decode::PixelBuffer;

/// Reports current memory usage, in megabytes, for the pressure check that
/// runs before each page.
///
/// When no probe is configured the orchestrator measures its own working
/// set (cached pages plus in-flight buffers). Supplying a probe lets a host
/// application enforce the limit against whatever it actually cares about.
#[async_trait]
pub trait MemoryProbe: Send + Sync {
    async fn current_usage_mb(&self) -> f64;
}

pub(crate) fn bytes_to_mb(bytes: usize) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

struct CacheEntry {
    buffer: Arc<PixelBuffer>,
    inserted_at: Instant,
}

/// Bounded page-buffer cache. Entries expire `ttl` after insertion and the
/// oldest entry is evicted when `capacity` is reached.
pub(crate) struct PageImageCache {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<u32, CacheEntry>,
}

impl PageImageCache {
    pub(crate) fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            entries: HashMap::new(),
        }
    }

    /// Fetch a cached page, expiring it instead when past its TTL.
    pub(crate) fn get(&mut self, page_number: u32) -> Option<Arc<PixelBuffer>> {
        let expired = match self.entries.get(&page_number) {
            Some(entry) => entry.inserted_at.elapsed() >= self.ttl,
            None => return None,
        };
        if expired {
            self.entries.remove(&page_number);
            return None;
        }
        self.entries
            .get(&page_number)
            .map(|entry| Arc::clone(&entry.buffer))
    }

    pub(crate) fn insert(&mut self, page_number: u32, buffer: Arc<PixelBuffer>) {
        if self.capacity == 0 {
            return;
        }
        if !self.entries.contains_key(&page_number) && self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entries.insert(
            page_number,
            CacheEntry {
                buffer,
                inserted_at: Instant::now(),
            },
        );
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.inserted_at)
            .map(|(page, _)| *page);
        if let Some(page) = oldest {
            self.entries.remove(&page);
        }
    }

    /// Drop all entries past their TTL. Returns the number removed.
    pub(crate) fn purge_expired(&mut self) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.inserted_at.elapsed() < ttl);
        before - self.entries.len()
    }

    /// Drop everything. Returns the bytes freed.
    pub(crate) fn clear(&mut self) -> usize {
        let freed = self.bytes();
        self.entries.clear();
        freed
    }

    pub(crate) fn bytes(&self) -> usize {
        self.entries
            .values()
            .map(|entry| entry.buffer.byte_len())
            .sum()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Counts bytes held by in-flight page buffers. Reservations are RAII so a
/// decode that fails or panics still returns its bytes.
#[derive(Default)]
pub(crate) struct MemoryTracker {
    in_use: Arc<AtomicUsize>,
}

impl MemoryTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reserve(&self, bytes: usize) -> MemoryReservation {
        self.in_use.fetch_add(bytes, Ordering::SeqCst);
        MemoryReservation {
            bytes,
            in_use: Arc::clone(&self.in_use),
        }
    }

    pub(crate) fn in_use_bytes(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }
}

pub(crate) struct MemoryReservation {
    bytes: usize,
    in_use: Arc<AtomicUsize>,
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.in_use.fetch_sub(self.bytes, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(bytes: usize) -> Arc<PixelBuffer> {
        // 1-pixel-tall strip with the requested payload size.
        let width = (bytes / 4).max(1) as u32;
        Arc::new(PixelBuffer::new(width, 1, vec![0; width as usize * 4]))
    }

    #[test]
    fn tracker_releases_reservation_on_drop() {
        let tracker = MemoryTracker::new();
        assert_eq!(tracker.in_use_bytes(), 0);
        {
            let _first = tracker.reserve(1024);
            let _second = tracker.reserve(512);
            assert_eq!(tracker.in_use_bytes(), 1536);
        }
        assert_eq!(tracker.in_use_bytes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_serves_entries_until_ttl() {
        let mut cache = PageImageCache::new(Duration::from_secs(10), 4);
        cache.insert(1, page(64));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cache.get(1).is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get(1).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_evicts_oldest_at_capacity() {
        let mut cache = PageImageCache::new(Duration::from_secs(60), 2);
        cache.insert(1, page(64));
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.insert(2, page(64));
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.insert(3, page(64));

        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
        assert!(cache.get(3).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reinserting_a_page_does_not_evict() {
        let mut cache = PageImageCache::new(Duration::from_secs(60), 2);
        cache.insert(1, page(64));
        cache.insert(2, page(64));
        cache.insert(2, page(128));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(1).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_removes_only_expired_entries() {
        let mut cache = PageImageCache::new(Duration::from_secs(10), 4);
        cache.insert(1, page(64));
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.insert(2, page(64));
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.get(2).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_reports_freed_bytes() {
        let mut cache = PageImageCache::new(Duration::from_secs(60), 4);
        cache.insert(1, page(64));
        cache.insert(2, page(64));
        assert_eq!(cache.bytes(), 128);
        assert_eq!(cache.clear(), 128);
        assert_eq!(cache.bytes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_capacity_disables_caching() {
        let mut cache = PageImageCache::new(Duration::from_secs(60), 0);
        cache.insert(1, page(64));
        assert!(cache.get(1).is_none());
    }
}

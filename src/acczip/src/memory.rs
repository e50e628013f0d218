use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Pinned,
    Common,
}

#[derive(Debug, Default)]
pub struct MemoryTracker {
    regions: Mutex<BTreeMap<usize, usize>>,
    pinned_bytes: AtomicUsize,
    allocations: AtomicU64,
}

impl MemoryTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn alloc_pinned(self: &Arc<Self>, len: usize) -> Result<PinnedBuf, AcczipError> {
        if len == 0 {
            return Err(AcczipError::InvalidParams(
                "pinned allocation must be non-empty",
            ));
        }
        let data = vec![0_u8; len].into_boxed_slice();
        let start = data.as_ptr() as usize;
        lock(&self.regions)?.insert(start, len);
        self.pinned_bytes.fetch_add(len, Ordering::Relaxed);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(PinnedBuf {
            data,
            tracker: Arc::clone(self),
        })
    }

    /// True when every byte of `bytes` lies inside one pinned allocation.
    pub fn is_pinned(&self, bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return false;
        }
        let start = bytes.as_ptr() as usize;
        let Some(end) = start.checked_add(bytes.len()) else {
            return false;
        };
        let Ok(regions) = self.regions.lock() else {
            return false;
        };
        regions
            .range(..=start)
            .next_back()
            .is_some_and(|(&region_start, &region_len)| end <= region_start + region_len)
    }

    pub fn classify(&self, bytes: &[u8]) -> MemoryKind {
        if self.is_pinned(bytes) {
            MemoryKind::Pinned
        } else {
            MemoryKind::Common
        }
    }

    pub fn pinned_bytes(&self) -> usize {
        self.pinned_bytes.load(Ordering::Relaxed)
    }

    pub fn region_count(&self) -> usize {
        self.regions.lock().map(|regions| regions.len()).unwrap_or(0)
    }

    pub fn total_allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    fn unregister(&self, start: usize, len: usize) {
        if let Ok(mut regions) = self.regions.lock()
            && regions.remove(&start).is_some()
        {
            self.pinned_bytes.fetch_sub(len, Ordering::Relaxed);
        }
    }
}

pub struct PinnedBuf {
    data: Box<[u8]>,
    tracker: Arc<MemoryTracker>,
}

impl PinnedBuf {
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Deref for PinnedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PinnedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for PinnedBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedBuf")
            .field("len", &self.data.len())
            .finish()
    }
}

impl Drop for PinnedBuf {
    fn drop(&mut self) {
        self.tracker
            .unregister(self.data.as_ptr() as usize, self.data.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_ranges_are_recognized() {
        let tracker = MemoryTracker::new();
        let buf = tracker.alloc_pinned(4096).expect("alloc should succeed");
        assert!(tracker.is_pinned(&buf));
        assert!(tracker.is_pinned(&buf[100..200]));
        assert_eq!(tracker.classify(&buf[4000..]), MemoryKind::Pinned);
        assert_eq!(tracker.pinned_bytes(), 4096);

        let common = vec![0_u8; 4096];
        assert!(!tracker.is_pinned(&common));
        assert!(!tracker.is_pinned(&buf[..0]));
    }

    #[test]
    fn dropping_buffer_unregisters_it() {
        let tracker = MemoryTracker::new();
        let first = tracker.alloc_pinned(128).expect("alloc should succeed");
        let second = tracker.alloc_pinned(256).expect("alloc should succeed");
        assert_eq!(tracker.region_count(), 2);
        drop(first);
        assert_eq!(tracker.region_count(), 1);
        assert_eq!(tracker.pinned_bytes(), 256);
        drop(second);
        assert_eq!(tracker.region_count(), 0);
        assert_eq!(tracker.total_allocations(), 2);
    }

    #[test]
    fn zero_length_allocation_is_rejected() {
        let tracker = MemoryTracker::new();
        assert!(matches!(
            tracker.alloc_pinned(0),
            Err(AcczipError::InvalidParams(_))
        ));
    }
}

//! Recycled surface headers.

use super::SurfaceHeader;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Counters describing header reuse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Headers served from the free list.
    pub reused: u64,
    /// Headers that had to be freshly allocated.
    pub fresh: u64,
    /// Headers currently parked on the free list.
    pub available: usize,
}

/// Bounded free list of surface headers.
///
/// Every surface the context hands out, pool-backed or one-shot, takes its
/// header from here and gives it back on release, so the control path of a
/// steady-state pipeline does not touch the global allocator. When the
/// list is empty a fresh header is allocated; when it is full a returned
/// header is simply dropped.
#[derive(Debug)]
pub struct HeaderArena {
    free: Mutex<Vec<Box<SurfaceHeader>>>,
    capacity: usize,
    reused: AtomicU64,
    fresh: AtomicU64,
}

impl HeaderArena {
    /// Create an arena that parks at most `capacity` headers.
    ///
    /// With `preallocate`, the free list is filled up front.
    pub fn new(capacity: usize, preallocate: bool) -> Self {
        let mut free = Vec::with_capacity(capacity);
        if preallocate {
            free.extend((0..capacity).map(|_| Box::<SurfaceHeader>::default()));
        }
        Self {
            free: Mutex::new(free),
            capacity,
            reused: AtomicU64::new(0),
            fresh: AtomicU64::new(0),
        }
    }

    /// Take a zeroed header.
    pub(crate) fn acquire(&self) -> Box<SurfaceHeader> {
        let recycled = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match recycled {
            Some(mut header) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                *header = SurfaceHeader::default();
                header
            }
            None => {
                self.fresh.fetch_add(1, Ordering::Relaxed);
                Box::default()
            }
        }
    }

    /// Give a header back.
    pub(crate) fn release(&self, header: Box<SurfaceHeader>) {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.capacity {
            free.push(header);
        }
    }

    /// Maximum number of parked headers.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current reuse statistics.
    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            reused: self.reused.load(Ordering::Relaxed),
            fresh: self.fresh.load(Ordering::Relaxed),
            available: self.free.lock().unwrap_or_else(PoisonError::into_inner).len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse_after_release() {
        let arena = HeaderArena::new(2, false);
        let a = arena.acquire();
        arena.release(a);
        let _b = arena.acquire();
        let stats = arena.stats();
        assert_eq!(stats.fresh, 1);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.available, 0);
    }

    #[test]
    fn test_capacity_bounds_free_list() {
        let arena = HeaderArena::new(1, false);
        let a = arena.acquire();
        let b = arena.acquire();
        arena.release(a);
        arena.release(b);
        assert_eq!(arena.stats().available, 1);
    }

    #[test]
    fn test_preallocate_and_reset() {
        let arena = HeaderArena::new(4, true);
        assert_eq!(arena.stats().available, 4);

        let mut header = arena.acquire();
        header.num_filled = 3;
        header.pts = 99;
        arena.release(header);

        // Drain to reach the recycled one.
        let headers: Vec<_> = (0..4).map(|_| arena.acquire()).collect();
        assert!(headers.iter().all(|h| h.num_filled == 0 && h.pts == 0));
        assert_eq!(arena.stats().fresh, 0);
    }
}

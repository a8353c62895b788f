//! Slot structures and global state.
//!
//! Every registered thread owns one slot holding the epoch it is pinned at.
//! The global state holds the epoch counter, the slot table, the thread ID
//! allocator and the orphan bag for threads that exited with pending garbage.
//!
//! The slot table is a list of segments that double in size. Segments are
//! allocated on first use and never move, so a slot reference stays valid
//! for the lifetime of the table and the number of live threads is unbounded.

use crate::retired::{Bag, Retired};
use crate::spin::SpinLock;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr;
use core::slice;
use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering, fence};
use crossbeam_utils::CachePadded;
use once_cell::race::OnceBox;
use tracing::trace;

/// Segment `i` of the slot table holds `FIRST_SEGMENT_LEN << i` slots.
const FIRST_SEGMENT_SHIFT: u32 = 6;
const FIRST_SEGMENT_LEN: usize = 1 << FIRST_SEGMENT_SHIFT;

/// Enough segments to address every `usize` thread ID.
const SEGMENTS: usize = (usize::BITS - FIRST_SEGMENT_SHIFT) as usize;

/// Collection frequency on the retire path (collect every `freq` retires)
pub(crate) const RETIRE_FREQ: usize = 64;

/// Collection frequency on the pin path (collect every `freq` outermost pins)
pub(crate) const COLLECT_FREQ: usize = 128;

/// Slot value of a thread outside any critical section.
pub(crate) const INACTIVE: u64 = u64::MAX;

/// Per-thread announcement of the pinned epoch.
pub(crate) struct Slot {
    epoch: AtomicU64,
}

impl Slot {
    const fn new() -> Self {
        Self {
            epoch: AtomicU64::new(INACTIVE),
        }
    }

    /// Announce `epoch` and make the announcement visible before any
    /// subsequent pointer load of the critical section.
    #[inline]
    pub(crate) fn pin(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::Relaxed);
        fence(Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn unpin(&self) {
        self.epoch.store(INACTIVE, Ordering::Release);
    }

    #[inline]
    pub(crate) fn load(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }
}

/// Segment index and offset of `tid` in the slot table.
#[inline]
fn locate(tid: usize) -> (usize, usize) {
    let n = tid + FIRST_SEGMENT_LEN;
    let bit = usize::BITS - 1 - n.leading_zeros();
    ((bit - FIRST_SEGMENT_SHIFT) as usize, n - (1usize << bit))
}

#[inline]
const fn segment_len(index: usize) -> usize {
    FIRST_SEGMENT_LEN << index
}

/// Global reclamation state
pub(crate) struct Global {
    epoch: CachePadded<AtomicU64>,
    /// First slot of each allocated segment, null until the segment is used.
    segments: [AtomicPtr<CachePadded<Slot>>; SEGMENTS],
    /// High-water mark of allocated thread IDs; slots above it were never used.
    next_tid: AtomicUsize,
    free_tids: SpinLock<Vec<usize>>,
    orphans: SpinLock<Bag>,
    pending: AtomicUsize,
}

impl Global {
    fn new() -> Self {
        Self {
            epoch: CachePadded::new(AtomicU64::new(0)),
            segments: [const { AtomicPtr::new(ptr::null_mut()) }; SEGMENTS],
            next_tid: AtomicUsize::new(0),
            free_tids: SpinLock::new(Vec::new()),
            orphans: SpinLock::new(Bag::new()),
            pending: AtomicUsize::new(0),
        }
    }

    /// Current global epoch
    #[inline]
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn slot(&self, tid: usize) -> &Slot {
        let (index, offset) = locate(tid);
        let first = self.segments[index].load(Ordering::Acquire);
        let first = if first.is_null() {
            self.grow(index)
        } else {
            first
        };
        // SAFETY: a published segment holds `segment_len(index)` slots and
        // lives until `self` is dropped; `offset` is below that length.
        unsafe { &**first.add(offset) }
    }

    /// Allocate segment `index`, or adopt the one a racing thread installed.
    #[cold]
    fn grow(&self, index: usize) -> *mut CachePadded<Slot> {
        let len = segment_len(index);
        let fresh = Box::into_raw(
            (0..len)
                .map(|_| CachePadded::new(Slot::new()))
                .collect::<Box<[_]>>(),
        )
        .cast::<CachePadded<Slot>>();

        match self.segments[index].compare_exchange(
            ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                trace!(segment = index, slots = len, "allocated slot segment");
                fresh
            }
            Err(installed) => {
                // SAFETY: `fresh` was never published.
                unsafe { drop(Box::from_raw(ptr::slice_from_raw_parts_mut(fresh, len))) };
                installed
            }
        }
    }

    /// Number of retired entries not yet freed
    #[inline]
    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn add_pending(&self, n: usize) {
        self.pending.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn sub_pending(&self, n: usize) {
        self.pending.fetch_sub(n, Ordering::Relaxed);
    }

    /// Tag an entry with the epoch current at its retirement.
    ///
    /// The fence orders the caller's unlinking store before the epoch read,
    /// pairing with the fence in [`Slot::pin`].
    ///
    /// # Safety
    ///
    /// Same contract as [`Retired::new`].
    #[inline]
    pub(crate) unsafe fn tag<T>(&self, ptr: *mut T) -> Retired {
        fence(Ordering::SeqCst);
        // SAFETY: forwarded to the caller.
        unsafe { Retired::new(ptr, self.epoch()) }
    }

    /// Advance the global epoch if every pinned thread has caught up with it.
    ///
    /// Returns the epoch observed after the attempt, which is never older
    /// than the one observed before it.
    pub(crate) fn try_advance(&self) -> u64 {
        let epoch = self.epoch.load(Ordering::Relaxed);
        fence(Ordering::SeqCst);

        let high = self.next_tid.load(Ordering::Acquire);
        let segments = match high.checked_sub(1) {
            Some(last) => locate(last).0 + 1,
            None => 0,
        };
        for (index, segment) in self.segments[..segments].iter().enumerate() {
            let first = segment.load(Ordering::Acquire);
            if first.is_null() {
                // No thread in it has pinned yet.
                continue;
            }
            // SAFETY: see `slot`.
            let slots = unsafe { slice::from_raw_parts(first, segment_len(index)) };
            for slot in slots {
                let pinned = slot.load();
                if pinned != INACTIVE && pinned != epoch {
                    return epoch;
                }
            }
        }
        fence(Ordering::Acquire);

        match self.epoch.compare_exchange(
            epoch,
            epoch + 1,
            Ordering::Release,
            Ordering::Relaxed,
        ) {
            Ok(_) => {
                trace!(epoch = epoch + 1, "advanced global epoch");
                epoch + 1
            }
            Err(current) => current,
        }
    }

    /// Allocate a thread ID, preferring recycled ones.
    pub(crate) fn alloc_tid(&self) -> usize {
        if let Some(tid) = self.free_tids.lock().pop() {
            return tid;
        }
        self.next_tid.fetch_add(1, Ordering::AcqRel)
    }

    /// Return a thread ID to the pool
    pub(crate) fn free_tid(&self, tid: usize) {
        self.slot(tid).unpin();
        self.free_tids.lock().push(tid);
    }

    /// Park entries whose owning thread is gone.
    pub(crate) fn orphan(&self, entries: Vec<Retired>) {
        if entries.is_empty() {
            return;
        }
        self.orphans.lock().absorb(entries);
    }

    /// Take the orphaned entries that have expired at `epoch`.
    pub(crate) fn take_expired_orphans(&self, epoch: u64) -> Vec<Retired> {
        let mut orphans = self.orphans.lock();
        if orphans.is_empty() {
            return Vec::new();
        }
        orphans.take_expired(epoch)
    }
}

impl Drop for Global {
    fn drop(&mut self) {
        for (index, segment) in self.segments.iter_mut().enumerate() {
            let first = *segment.get_mut();
            if !first.is_null() {
                let len = segment_len(index);
                // SAFETY: allocated in `grow` as a boxed slice of `len` slots.
                unsafe { drop(Box::from_raw(ptr::slice_from_raw_parts_mut(first, len))) };
            }
        }
    }
}

/// Global singleton instance
static GLOBAL: OnceBox<Global> = OnceBox::new();

/// Get reference to global state
#[inline]
pub(crate) fn global() -> &'static Global {
    GLOBAL.get_or_init(|| Box::new(Global::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reclaim;
    use alloc::sync::Arc;

    #[test]
    fn test_pinned_slot_blocks_advance() {
        let global = Global::new();
        let tid = global.alloc_tid();

        global.slot(tid).pin(global.epoch());
        assert_eq!(global.try_advance(), 1);
        // Pinned at 0 while the global epoch is 1.
        assert_eq!(global.try_advance(), 1);
        assert_eq!(global.try_advance(), 1);

        global.slot(tid).unpin();
        assert_eq!(global.try_advance(), 2);
        assert_eq!(global.try_advance(), 3);
    }

    #[test]
    fn test_unused_slots_ignored() {
        let global = Global::new();
        let a = global.alloc_tid();
        let b = global.alloc_tid();
        global.slot(b).pin(global.epoch());
        global.free_tid(b);

        assert_eq!(global.try_advance(), 1);
        global.slot(a).pin(global.epoch());
        assert_eq!(global.try_advance(), 2);
        global.slot(a).unpin();
    }

    #[test]
    fn test_tid_recycled() {
        let global = Global::new();
        let a = global.alloc_tid();
        let b = global.alloc_tid();
        assert_ne!(a, b);

        global.free_tid(a);
        assert_eq!(global.alloc_tid(), a);
        assert_eq!(global.alloc_tid(), 2);
    }

    #[test]
    fn test_locate() {
        assert_eq!(locate(0), (0, 0));
        assert_eq!(locate(63), (0, 63));
        assert_eq!(locate(64), (1, 0));
        assert_eq!(locate(191), (1, 127));
        assert_eq!(locate(192), (2, 0));
        assert_eq!(locate(447), (2, 255));
        assert_eq!(locate(448), (3, 0));
    }

    #[test]
    fn test_slot_table_grows() {
        let global = Global::new();
        let tids: Vec<_> = (0..1_000).map(|_| global.alloc_tid()).collect();
        assert_eq!(tids, (0..1_000).collect::<Vec<_>>());

        let far = 900;
        assert!(!ptr::eq(global.slot(far), global.slot(far - 1)));
        assert!(ptr::eq(global.slot(far), global.slot(far)));

        global.slot(far).pin(global.epoch());
        assert_eq!(global.try_advance(), 1);
        assert_eq!(global.try_advance(), 1);

        global.free_tid(far);
        assert_eq!(global.try_advance(), 2);
        assert_eq!(global.alloc_tid(), far);
    }

    #[test]
    fn test_unallocated_segment_skipped() {
        let global = Global::new();
        let tids: Vec<_> = (0..200).map(|_| global.alloc_tid()).collect();
        // Only the third segment was ever touched.
        global.slot(tids[199]).pin(global.epoch());
        assert!(global.segments[0].load(Ordering::Relaxed).is_null());
        assert!(global.segments[1].load(Ordering::Relaxed).is_null());

        assert_eq!(global.try_advance(), 1);
        assert_eq!(global.try_advance(), 1);
        global.slot(tids[199]).unpin();
        assert_eq!(global.try_advance(), 2);
    }

    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_orphan_newer_than_collector_epoch_kept() {
        let global = Global::new();
        let drops = Arc::new(AtomicUsize::new(0));

        // A collector read the epoch, then stalled while it moved on.
        let stale = global.epoch();
        assert_eq!(global.try_advance(), 1);

        let reader = global.alloc_tid();
        global.slot(reader).pin(global.epoch());

        let ptr = Box::into_raw(Box::new(Counted(drops.clone())));
        let entry = unsafe { global.tag(ptr) };
        assert_eq!(entry.epoch(), 1);
        global.add_pending(1);
        global.orphan(vec![entry]);

        assert!(global.take_expired_orphans(stale).is_empty());
        reclaim::collect_orphans(&global, stale);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(global.pending(), 1);

        // The reader pinned at the tag epoch holds it through one advance.
        assert_eq!(global.try_advance(), 2);
        assert_eq!(global.try_advance(), 2);
        reclaim::collect_orphans(&global, global.epoch());
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        global.slot(reader).unpin();
        assert_eq!(global.try_advance(), 3);
        reclaim::collect_orphans(&global, global.epoch());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(global.pending(), 0);
    }
}

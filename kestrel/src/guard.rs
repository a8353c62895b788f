//! Guard and Handle for critical section management.
//!
//! - Pin: announce the global epoch in the thread's slot (outermost pin only)
//! - Retire: tag with the global epoch, park in the thread-local bag
//! - Collect: try to advance the epoch, free what has aged two epochs
//! - Thread exit: hand leftover garbage to the global orphan bag
//! - Pin during thread teardown: borrow a slot for the guard alone

use crate::reclaim;
use crate::retired::Bag;
use crate::slot::{self, COLLECT_FREQ, Global, RETIRE_FREQ};
use core::cell::{Cell, RefCell};
use core::fmt;
use core::marker::PhantomData as marker;
use tracing::{debug, trace};

/// RAII guard representing an active critical section.
///
/// While a Guard exists, the thread's slot holds the epoch it pinned at,
/// which keeps every pointer loaded through it from being freed.
/// Dropping the last Guard on a thread marks the slot inactive.
///
/// Nested `pin()` calls are cheap: only the outermost pin touches the slot,
/// inner guards share its protection.
pub struct Guard {
    /// Slot registered for this guard alone, when the thread-local handle
    /// was already destroyed at pin time.
    detached: Option<usize>,
    marker: marker<*mut ()>,
}

impl Guard {
    #[cold]
    fn detached() -> Self {
        let global = slot::global();
        let tid = global.alloc_tid();
        global.slot(tid).pin(global.epoch());
        trace!(tid, "pinned without thread-local state");
        Guard {
            detached: Some(tid),
            marker,
        }
    }
}

impl Drop for Guard {
    #[inline]
    fn drop(&mut self) {
        match self.detached {
            Some(tid) => slot::global().free_tid(tid),
            // The handle is gone only during thread teardown, where its own
            // destructor has already released the slot.
            None => {
                let _ = HANDLE.try_with(Handle::unpin);
            }
        }
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Guard { .. }")
    }
}

/// Thread-local reclamation state.
struct Handle {
    global: Cell<Option<&'static Global>>,
    /// Thread ID (lazily allocated on first pin)
    tid: Cell<Option<usize>>,
    /// Number of live Guard instances on this thread.
    pin_count: Cell<usize>,
    /// Outermost pins so far; drives periodic collection.
    pins: Cell<usize>,
    retires: Cell<usize>,
    bag: RefCell<Bag>,
}

impl Handle {
    const fn new() -> Self {
        Self {
            global: Cell::new(None),
            tid: Cell::new(None),
            pin_count: Cell::new(0),
            pins: Cell::new(0),
            retires: Cell::new(0),
            bag: RefCell::new(Bag::new()),
        }
    }

    #[inline]
    fn global(&self) -> &'static Global {
        match self.global.get() {
            Some(g) => g,
            None => {
                let g = slot::global();
                self.global.set(Some(g));
                g
            }
        }
    }

    /// Get or allocate thread ID
    #[inline]
    fn tid(&self) -> usize {
        match self.tid.get() {
            Some(tid) => tid,
            None => {
                let tid = self.global().alloc_tid();
                self.tid.set(Some(tid));
                debug!(tid, "registered thread");
                tid
            }
        }
    }

    fn pin(&self) -> Guard {
        let count = self.pin_count.get();
        if count == 0 {
            let global = self.global();
            global.slot(self.tid()).pin(global.epoch());
        }
        // Only counted once the slot is announced; the guard releases it if
        // a destructor run by `collect` unwinds.
        self.pin_count.set(count + 1);
        let guard = Guard {
            detached: None,
            marker,
        };

        if count == 0 {
            let pins = self.pins.get().wrapping_add(1);
            self.pins.set(pins);
            if pins.is_multiple_of(COLLECT_FREQ) {
                self.collect();
            }
        }
        guard
    }

    fn unpin(&self) {
        let count = self.pin_count.get();
        debug_assert!(count > 0, "Guard dropped with pin_count == 0");
        self.pin_count.set(count - 1);

        if count == 1 {
            if let Some(tid) = self.tid.get() {
                self.global().slot(tid).unpin();
            }
        }
    }

    unsafe fn retire<T>(&self, ptr: *mut T) {
        let global = self.global();
        // SAFETY: forwarded to the caller of `retire`.
        let entry = unsafe { global.tag(ptr) };
        global.add_pending(1);
        self.bag.borrow_mut().push(entry);

        let retires = self.retires.get().wrapping_add(1);
        self.retires.set(retires);
        if retires.is_multiple_of(RETIRE_FREQ) {
            self.collect();
        }
    }

    fn collect(&self) {
        let global = self.global();
        let epoch = global.try_advance();

        let expired = self.bag.borrow_mut().take_expired(epoch);
        // SAFETY: `take_expired` only yields entries at least two epochs old.
        unsafe { reclaim::free(global, expired) };
        reclaim::collect_orphans(global, epoch);
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let Some(global) = self.global.get() else {
            // Never pinned nor retired.
            return;
        };
        if let Some(tid) = self.tid.get() {
            global.slot(tid).unpin();
        }

        let epoch = global.try_advance();
        let bag = self.bag.get_mut();
        let expired = bag.take_expired(epoch);
        let leftover = bag.take_all();
        debug!(
            tid = ?self.tid.get(),
            orphaned = leftover.len(),
            "thread exiting"
        );
        global.orphan(leftover);

        if let Some(tid) = self.tid.take() {
            global.free_tid(tid);
        }
        // SAFETY: `take_expired` only yields entries at least two epochs old.
        unsafe { reclaim::free(global, expired) };
    }
}

thread_local! {
    static HANDLE: Handle = const { Handle::new() };
}

/// Enter a critical section.
///
/// Returns a `Guard` that represents the active critical section.
/// While the guard exists, any `Shared<'g, T>` pointers loaded through it
/// stay valid even if another thread unlinks and retires them.
///
/// Pinning also works from thread-local destructors that run after this
/// crate's own thread state is gone; such a guard registers a slot of its
/// own and releases it on drop.
#[inline]
pub fn pin() -> Guard {
    HANDLE
        .try_with(Handle::pin)
        .unwrap_or_else(|_| Guard::detached())
}

/// Retire an unlinked allocation for deferred reclamation.
///
/// The allocation is freed once every thread that could have observed it
/// has left its critical section. Freeing may happen on any thread.
///
/// If the calling thread is already tearing down its thread-local state,
/// the entry is handed straight to the global orphan bag.
///
/// # Safety
///
/// - `ptr` must come from `Box::into_raw` (or an allocation with the same
///   layout from the global allocator).
/// - `ptr` must already be unreachable for threads that pin from now on.
/// - `ptr` must not be retired more than once.
/// - Dropping the `T` on another thread must be sound.
#[inline]
pub unsafe fn retire<T: 'static>(ptr: *mut T) {
    // SAFETY: the caller upholds the contract.
    let retired = HANDLE.try_with(|handle| unsafe { handle.retire(ptr) });
    if retired.is_err() {
        let global = slot::global();
        // SAFETY: the caller upholds the contract.
        let entry = unsafe { global.tag(ptr) };
        global.add_pending(1);
        global.orphan(alloc::vec![entry]);
    }
}

/// Run a collection pass on the calling thread.
///
/// Tries to advance the global epoch, then frees this thread's expired
/// entries and any expired orphans. Collection also runs on its own every
/// few pins and retires, so calling this is never required for progress.
pub fn collect() {
    if HANDLE.try_with(Handle::collect).is_err() {
        reclaim::collect_global(slot::global());
    }
}

/// Number of retired allocations that have not been freed yet.
pub fn pending() -> usize {
    slot::global().pending()
}

/// Current value of the global epoch.
pub fn current_epoch() -> u64 {
    slot::global().epoch()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_nested_pin_keeps_slot() {
        thread::spawn(|| {
            let outer = pin();
            let tid = HANDLE.with(|h| h.tid.get()).unwrap();
            let global = slot::global();
            let pinned = global.slot(tid).load();
            assert_ne!(pinned, slot::INACTIVE);

            let inner = pin();
            drop(inner);
            assert_eq!(global.slot(tid).load(), pinned);

            drop(outer);
            assert_eq!(global.slot(tid).load(), slot::INACTIVE);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_pin_count_balanced() {
        thread::spawn(|| {
            let guards: Vec<Guard> = (0..5).map(|_| pin()).collect();
            assert_eq!(HANDLE.with(|h| h.pin_count.get()), 5);
            drop(guards);
            assert_eq!(HANDLE.with(|h| h.pin_count.get()), 0);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_detached_guard_blocks_advance() {
        let global = slot::global();
        let guard = Guard::detached();
        let tid = guard.detached.unwrap();
        let pinned = global.slot(tid).load();
        assert_ne!(pinned, slot::INACTIVE);

        // At most one advance past the pinned epoch.
        for _ in 0..10 {
            collect();
        }
        assert!(current_epoch() <= pinned + 1);
        assert_eq!(global.slot(tid).load(), pinned);
        drop(guard);
    }

    #[test]
    fn test_epoch_monotonic() {
        let before = current_epoch();
        for _ in 0..10 {
            collect();
        }
        assert!(current_epoch() >= before);
    }
}

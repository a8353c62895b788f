//! Retired entries and the per-thread bag that holds them.
//!
//! A retired entry is a type-erased pointer plus the destructor that knows
//! its real type, tagged with the global epoch observed at retirement.

use alloc::boxed::Box;
use alloc::vec::Vec;

/// Type-erased destructor function
pub(crate) type DestructorFn = unsafe fn(*mut ());

/// Number of epoch advances an entry has to wait out before it is freed.
///
/// A thread pinned at epoch `e` blocks the advance from `e` to `e + 1`,
/// so once the global epoch reaches `tag + 2` every thread that was pinned
/// when the entry was unlinked has left its critical section.
pub(crate) const GRACE_EPOCHS: u64 = 2;

/// An unlinked allocation waiting for its grace period to pass.
pub(crate) struct Retired {
    ptr: *mut (),
    destructor: DestructorFn,
    epoch: u64,
}

// SAFETY: the pointee is unreachable from the data structure once retired;
// the entry is only a deferred `free` and may run on any thread.
unsafe impl Send for Retired {}

impl Retired {
    /// Wrap a `Box`-allocated pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `Box::into_raw` and must not be retired twice.
    pub(crate) unsafe fn new<T>(ptr: *mut T, epoch: u64) -> Self {
        unsafe fn destroy<T>(ptr: *mut ()) {
            // SAFETY: `ptr` was created from `Box<T>` in `Retired::new`.
            unsafe { drop(Box::from_raw(ptr.cast::<T>())) }
        }

        Self {
            ptr: ptr.cast(),
            destructor: destroy::<T>,
            epoch,
        }
    }

    /// Epoch the entry was tagged with
    #[inline]
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether the grace period has elapsed at `global_epoch`.
    ///
    /// A collector may hold an epoch older than the tag of an entry that was
    /// orphaned after it read the epoch; such an entry is never expired.
    #[inline]
    pub(crate) fn is_expired(&self, global_epoch: u64) -> bool {
        global_epoch
            .checked_sub(self.epoch)
            .is_some_and(|age| age >= GRACE_EPOCHS)
    }

    /// Run the destructor.
    ///
    /// # Safety
    ///
    /// No thread may still hold a reference to the pointee.
    #[inline]
    pub(crate) unsafe fn reclaim(self) {
        // SAFETY: forwarded to the caller.
        unsafe { (self.destructor)(self.ptr) }
    }
}

/// Thread-local collection of retired entries.
///
/// Entries are pushed in retirement order, so tags are non-decreasing from
/// front to back and expired entries always form a prefix.
#[derive(Default)]
pub(crate) struct Bag {
    entries: Vec<Retired>,
}

impl Bag {
    pub(crate) const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn push(&mut self, entry: Retired) {
        self.entries.push(entry);
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Split off every entry whose grace period has elapsed.
    ///
    /// The caller runs the destructors after releasing its borrow of the bag,
    /// so a destructor is free to retire more nodes on this thread.
    pub(crate) fn take_expired(&mut self, global_epoch: u64) -> Vec<Retired> {
        let split = self
            .entries
            .iter()
            .position(|entry| !entry.is_expired(global_epoch))
            .unwrap_or(self.entries.len());
        let rest = self.entries.split_off(split);
        core::mem::replace(&mut self.entries, rest)
    }

    /// Move every entry out, leaving the bag empty.
    pub(crate) fn take_all(&mut self) -> Vec<Retired> {
        core::mem::take(&mut self.entries)
    }

    /// Append entries handed over by another owner, keeping tag order.
    pub(crate) fn absorb(&mut self, entries: Vec<Retired>) {
        self.entries.extend(entries);
        self.entries.sort_by_key(Retired::epoch);
    }
}

//! Freeing of expired entries.
//!
//! Entries are always moved out of their bag before any destructor runs, so
//! a destructor may pin, retire or collect without tripping over a borrow or
//! a held lock.

use crate::retired::Retired;
use crate::slot::Global;
use alloc::vec::Vec;
use tracing::{debug, trace};

/// Run the destructors of `entries`.
///
/// # Safety
///
/// Every entry must be past its grace period.
pub(crate) unsafe fn free(global: &Global, entries: Vec<Retired>) {
    let count = entries.len();
    if count == 0 {
        return;
    }
    for entry in entries {
        // SAFETY: caller guarantees the grace period has elapsed.
        unsafe { entry.reclaim() };
    }
    global.sub_pending(count);
    trace!(count, "freed retired entries");
}

/// Adopt and free orphaned entries that expired at `epoch`.
pub(crate) fn collect_orphans(global: &Global, epoch: u64) {
    let adopted = global.take_expired_orphans(epoch);
    if adopted.is_empty() {
        return;
    }
    debug!(count = adopted.len(), epoch, "adopted orphaned entries");
    // SAFETY: `take_expired_orphans` only yields expired entries.
    unsafe { free(global, adopted) };
}

/// One collection pass without a thread-local bag.
pub(crate) fn collect_global(global: &Global) {
    let epoch = global.try_advance();
    collect_orphans(global, epoch);
}

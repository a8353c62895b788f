//! Kestrel: epoch-based memory reclamation for lock-free data structures.
//!
//! A lock-free structure that unlinks a node cannot free it on the spot:
//! another thread may have loaded the pointer a moment earlier and still be
//! reading through it. Kestrel defers the free until every such reader is
//! provably gone.
//!
//! # How it works
//!
//! - A reader calls [`pin`] before loading shared pointers. The returned
//!   [`Guard`] announces the current global epoch in the thread's slot.
//! - A writer that unlinked a node passes it to [`retire`]. The node is
//!   tagged with the global epoch and parked in a thread-local bag.
//! - The global epoch only advances once every pinned thread has announced
//!   it. An entry tagged `e` is freed once the epoch reaches `e + 2`, at
//!   which point nobody pinned at or before `e` can still hold it.
//! - Collection runs every few pins and retires, or on demand with
//!   [`collect`]. Garbage of exiting threads is adopted by the survivors.
//!
//! # Example
//!
//! ```rust
//! use std::sync::atomic::Ordering;
//! use kestrel::{pin, retire, Atomic, Shared};
//!
//! let atomic = Atomic::new(Box::into_raw(Box::new(42)));
//!
//! let guard = pin();
//! let old = atomic.swap(Shared::null(), Ordering::AcqRel, &guard);
//!
//! // Still readable: the guard keeps the node alive.
//! assert_eq!(unsafe { old.as_ref() }, Some(&42));
//!
//! // Unlinked, so hand it over for deferred freeing.
//! unsafe { retire(old.as_raw()) };
//! drop(guard);
//! ```

#![warn(missing_docs)]

extern crate alloc;

mod atomic;
mod guard;
mod reclaim;
mod retired;
mod slot;
mod spin;

pub use atomic::{Atomic, Shared};
pub use guard::{Guard, collect, current_epoch, pending, pin, retire};

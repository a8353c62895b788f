//! A lock-free LIFO stack with epoch-based memory reclamation.
//!
//! [`TreiberStack`] links and unlinks nodes at its head with compare-and-swap
//! only. No thread ever blocks another: a thread that loses a race backs off
//! briefly and retries with the fresh head.
//!
//! Popped nodes are not freed on the spot. They are retired to the
//! [`kestrel`] reclaimer and freed once no thread can still hold a pointer
//! to them, which rules out use-after-free and ABA through address reuse.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::thread;
//! use kestrel_stack::TreiberStack;
//!
//! let stack = Arc::new(TreiberStack::new());
//!
//! let handles: Vec<_> = (0..4)
//!     .map(|t| {
//!         let stack = stack.clone();
//!         thread::spawn(move || {
//!             for i in 0..100 {
//!                 stack.push(t * 100 + i);
//!             }
//!         })
//!     })
//!     .collect();
//! for h in handles {
//!     h.join().unwrap();
//! }
//!
//! let mut seen = 0;
//! while stack.pop().is_ok() {
//!     seen += 1;
//! }
//! assert_eq!(seen, 400);
//! ```

#![warn(missing_docs)]

mod error;
mod node;
mod stack;

pub use error::{AllocError, EmptyError};
pub use stack::TreiberStack;

//! The Treiber stack: CAS push/pop on a single head pointer.

use crate::error::{AllocError, EmptyError};
use crate::node::Node;
use crossbeam_utils::Backoff;
use kestrel::{Atomic, Guard, Shared, pin, retire};
use std::alloc::handle_alloc_error;
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use tracing::debug;

/// A lock-free LIFO stack.
///
/// All mutation goes through compare-and-swap on the head pointer. Popped
/// nodes are retired to the epoch reclaimer rather than freed, so a thread
/// that is still looking at a node never sees its memory reused.
///
/// # Examples
///
/// ```
/// use kestrel_stack::TreiberStack;
///
/// let stack = TreiberStack::new();
/// stack.push(1);
/// stack.push(2);
///
/// assert_eq!(stack.pop(), Ok(2));
/// assert_eq!(stack.try_pop(), Some(1));
/// assert!(stack.pop().is_err());
/// ```
pub struct TreiberStack<T: 'static> {
    head: Atomic<Node<T>>,
    _marker: PhantomData<T>,
}

// SAFETY: values move in and out of the stack whole; no `&T` is shared
// across threads except through `peek`, which requires `T: Copy + Sync`.
unsafe impl<T: Send + 'static> Send for TreiberStack<T> {}
// SAFETY: see above.
unsafe impl<T: Send + 'static> Sync for TreiberStack<T> {}

impl<T: 'static> TreiberStack<T> {
    /// Creates an empty stack.
    pub const fn new() -> Self {
        Self {
            head: Atomic::null(),
            _marker: PhantomData,
        }
    }

    /// Pushes a value on top of the stack.
    ///
    /// Aborts through [`handle_alloc_error`] if the node cannot be allocated;
    /// use [`try_push`](Self::try_push) to get the value back instead.
    pub fn push(&self, value: T) {
        match Node::alloc(value) {
            Ok(node) => self.link(node),
            Err(_) => handle_alloc_error(Node::<T>::LAYOUT),
        }
    }

    /// Pushes a value, handing it back if the node cannot be allocated.
    ///
    /// Either the value is fully linked or the stack is left untouched.
    pub fn try_push(&self, value: T) -> Result<(), AllocError<T>> {
        let node = Node::alloc(value).map_err(|value| {
            debug!(size = Node::<T>::LAYOUT.size(), "stack node allocation failed");
            AllocError::new(value)
        })?;
        self.link(node);
        Ok(())
    }

    /// Publish a private node as the new head.
    fn link(&self, node: *mut Node<T>) {
        let guard = pin();
        // SAFETY: the node is private to this thread until the CAS succeeds.
        let new = unsafe { Shared::from_raw(node) };
        let backoff = Backoff::new();

        loop {
            let head = self.head.load(Acquire, &guard);
            // SAFETY: as above, nobody else can see `node` yet.
            unsafe { (*node).next.store(head, Relaxed) };

            match self.head.compare_exchange(head, new, Release, Relaxed, &guard) {
                Ok(_) => return,
                Err(_) => backoff.spin(),
            }
        }
    }

    /// Removes the top value.
    ///
    /// Returns [`EmptyError`] if the stack was observed empty.
    pub fn pop(&self) -> Result<T, EmptyError> {
        let guard = pin();
        let backoff = Backoff::new();

        loop {
            let head = self.head.load(Acquire, &guard);
            // SAFETY: the guard keeps every node observed through it alive.
            let Some(node) = (unsafe { head.as_ref() }) else {
                return Err(EmptyError);
            };
            let next = node.next.load(Acquire, &guard);

            match self.head.compare_exchange(head, next, Release, Relaxed, &guard) {
                Ok(_) => {
                    // SAFETY: the winning CAS unlinked `node` for us alone.
                    let value = unsafe { Node::take_value(node) };
                    // SAFETY: unlinked, allocated as a `Box`, retired once.
                    unsafe { retire(head.as_raw()) };
                    return Ok(value);
                }
                Err(_) => backoff.spin(),
            }
        }
    }

    /// Removes the top value, if any.
    pub fn try_pop(&self) -> Option<T> {
        self.pop().ok()
    }

    /// Returns `true` if the stack was observed empty.
    ///
    /// Advisory only: other threads may push or pop right after.
    pub fn is_empty(&self) -> bool {
        let guard = pin();
        self.head.load(Acquire, &guard).is_null()
    }

    /// Copies out the top value without removing it.
    ///
    /// Advisory only. Restricted to `Copy` values because a concurrent pop may
    /// take and drop the value while it is being read. The value is read in
    /// place while the popping thread moves it out, so `T` must be `Sync`:
    ///
    /// ```compile_fail
    /// use std::cell::Cell;
    /// use std::marker::PhantomData;
    ///
    /// let stack = kestrel_stack::TreiberStack::<PhantomData<Cell<u8>>>::new();
    /// stack.peek();
    /// ```
    pub fn peek(&self) -> Option<T>
    where
        T: Copy + Sync,
    {
        let guard = pin();
        top(&self.head, &guard).map(|node| *node.value)
    }
}

fn top<'g, T>(head: &Atomic<Node<T>>, guard: &'g Guard) -> Option<&'g Node<T>> {
    // SAFETY: the guard keeps every node observed through it alive.
    unsafe { head.load(Acquire, guard).as_ref() }
}

impl<T: 'static> Default for TreiberStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Drop for TreiberStack<T> {
    fn drop(&mut self) {
        // Exclusive access: nobody can observe the chain, free it directly.
        let mut cur = self.head.take();
        while !cur.is_null() {
            // SAFETY: every linked node came from `Node::alloc` and is owned
            // by this stack alone.
            let mut node = unsafe { Box::from_raw(cur) };
            cur = node.next.take();
            // SAFETY: linked nodes still own their value.
            unsafe { ManuallyDrop::drop(&mut node.value) };
        }
    }
}

impl<T: 'static> Extend<T> for TreiberStack<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for value in iter {
            self.push(value);
        }
    }
}

impl<T: 'static> FromIterator<T> for TreiberStack<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut stack = Self::new();
        stack.extend(iter);
        stack
    }
}

impl<T: 'static> fmt::Debug for TreiberStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreiberStack")
            .field("is_empty", &self.is_empty())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifo_order() {
        let stack = TreiberStack::new();
        stack.push(1);
        stack.push(2);
        stack.push(3);

        assert_eq!(stack.pop(), Ok(3));
        assert_eq!(stack.pop(), Ok(2));
        assert_eq!(stack.pop(), Ok(1));
        assert_eq!(stack.pop(), Err(EmptyError));
    }

    #[test]
    fn test_empty_pop_is_repeatable() {
        let stack: TreiberStack<String> = TreiberStack::default();
        for _ in 0..3 {
            assert_eq!(stack.pop(), Err(EmptyError));
            assert!(stack.try_pop().is_none());
        }
        assert!(stack.is_empty());
    }

    #[test]
    fn test_peek_and_is_empty() {
        let stack = TreiberStack::new();
        assert_eq!(stack.peek(), None);
        assert!(stack.is_empty());

        stack.push(10u64);
        stack.push(20u64);
        assert_eq!(stack.peek(), Some(20));
        assert_eq!(stack.peek(), Some(20));
        assert!(!stack.is_empty());

        assert_eq!(stack.pop(), Ok(20));
        assert_eq!(stack.peek(), Some(10));
    }

    #[test]
    fn test_try_push() {
        let stack = TreiberStack::new();
        assert!(stack.try_push(String::from("a")).is_ok());
        assert_eq!(stack.pop().as_deref(), Ok("a"));
    }

    #[test]
    fn test_from_iter_reverses() {
        let stack: TreiberStack<_> = (0..5).collect();
        let drained: Vec<_> = std::iter::from_fn(|| stack.try_pop()).collect();
        assert_eq!(drained, [4, 3, 2, 1, 0]);
    }

    #[test]
    fn test_debug() {
        let stack = TreiberStack::new();
        assert_eq!(format!("{stack:?}"), "TreiberStack { is_empty: true, .. }");
        stack.push(());
        assert_eq!(format!("{stack:?}"), "TreiberStack { is_empty: false, .. }");
    }
}

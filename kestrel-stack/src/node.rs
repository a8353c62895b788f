//! Heap cells of the stack.

use kestrel::Atomic;
use std::alloc::{Layout, alloc};
use std::mem::ManuallyDrop;

/// One stack entry.
///
/// `value` is moved out bitwise by the popping thread, so the shell that goes
/// to the reclaimer must never drop it again.
pub(crate) struct Node<T> {
    pub(crate) value: ManuallyDrop<T>,
    pub(crate) next: Atomic<Node<T>>,
}

impl<T> Node<T> {
    /// Allocation layout of a node, as reported on allocation failure.
    pub(crate) const LAYOUT: Layout = Layout::new::<Self>();

    /// Allocate a node holding `value`.
    ///
    /// Returns the value back if the allocator is out of memory. The pointer
    /// is compatible with `Box::from_raw`.
    pub(crate) fn alloc(value: T) -> Result<*mut Self, T> {
        // SAFETY: `Node` contains a pointer, so the layout is never zero-sized.
        let ptr = unsafe { alloc(Self::LAYOUT) }.cast::<Self>();
        if ptr.is_null() {
            return Err(value);
        }
        // SAFETY: `ptr` is freshly allocated with the layout of `Self`.
        unsafe {
            ptr.write(Self {
                value: ManuallyDrop::new(value),
                next: Atomic::null(),
            });
        }
        Ok(ptr)
    }

    /// Move the value out of a node still linked somewhere.
    ///
    /// # Safety
    ///
    /// The caller must have exclusively unlinked `node`, and must call this
    /// at most once per node.
    pub(crate) unsafe fn take_value(node: &Self) -> T {
        // SAFETY: forwarded to the caller; the shell never drops `value`.
        unsafe { ManuallyDrop::into_inner(std::ptr::read(&node.value)) }
    }
}

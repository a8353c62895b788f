//! Atomic pointer types tied to a guard.
//!
//! `Atomic<T>` is the shared cell; `Shared<'g, T>` is a snapshot of it that
//! cannot outlive the [`Guard`] it was loaded under.

use crate::guard::Guard;
use core::fmt;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

/// An atomic pointer to a heap-allocated `T`.
///
/// Every read hands back a [`Shared`] bound to a guard, so a pointer that
/// another thread unlinks and retires stays dereferenceable for as long as
/// the reader keeps its guard.
///
/// # Examples
///
/// ```
/// use kestrel::{Atomic, pin};
/// use std::sync::atomic::Ordering;
///
/// let atomic = Atomic::new(Box::into_raw(Box::new(42)));
/// let guard = pin();
/// let ptr = atomic.load(Ordering::Acquire, &guard);
/// assert_eq!(unsafe { ptr.as_ref() }, Some(&42));
/// # drop(guard);
/// # let mut atomic = atomic;
/// # drop(unsafe { Box::from_raw(atomic.take()) });
/// ```
pub struct Atomic<T> {
    ptr: AtomicPtr<T>,
}

unsafe impl<T: Send + Sync> Send for Atomic<T> {}
unsafe impl<T: Send + Sync> Sync for Atomic<T> {}

impl<T> Atomic<T> {
    /// Creates a new atomic pointer.
    #[inline]
    pub const fn new(ptr: *mut T) -> Self {
        Self {
            ptr: AtomicPtr::new(ptr),
        }
    }

    /// Creates a null atomic pointer.
    #[inline]
    pub const fn null() -> Self {
        Self::new(ptr::null_mut())
    }

    /// Loads the pointer under `guard`.
    #[inline]
    pub fn load<'g>(&self, order: Ordering, _guard: &'g Guard) -> Shared<'g, T> {
        Shared::new(self.ptr.load(order))
    }

    /// Stores a pointer into the atomic.
    #[inline]
    pub fn store(&self, new: Shared<'_, T>, order: Ordering) {
        self.ptr.store(new.ptr, order);
    }

    /// Stores `new` if the current value is `current`.
    ///
    /// On success returns the previous value (equal to `current`); on failure
    /// returns the value actually found.
    #[inline]
    pub fn compare_exchange<'g>(
        &self,
        current: Shared<'_, T>,
        new: Shared<'_, T>,
        success: Ordering,
        failure: Ordering,
        _guard: &'g Guard,
    ) -> Result<Shared<'g, T>, Shared<'g, T>> {
        self.ptr
            .compare_exchange(current.ptr, new.ptr, success, failure)
            .map(Shared::new)
            .map_err(Shared::new)
    }

    /// Swaps the pointer with a new value.
    #[inline]
    pub fn swap<'g>(
        &self,
        new: Shared<'_, T>,
        order: Ordering,
        _guard: &'g Guard,
    ) -> Shared<'g, T> {
        Shared::new(self.ptr.swap(new.ptr, order))
    }

    /// Takes the pointer out through exclusive access, leaving null.
    ///
    /// No guard is needed: `&mut self` rules out concurrent readers.
    #[inline]
    pub fn take(&mut self) -> *mut T {
        core::mem::replace(self.ptr.get_mut(), ptr::null_mut())
    }
}

impl<T> Default for Atomic<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> fmt::Debug for Atomic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Atomic")
            .field(&self.ptr.load(Ordering::Relaxed))
            .finish()
    }
}

/// A pointer loaded under a guard.
///
/// The pointee is guaranteed not to be freed before the guard drops, as
/// long as it was reachable from the shared structure when loaded.
pub struct Shared<'g, T> {
    ptr: *mut T,
    _marker: PhantomData<(&'g Guard, *mut T)>,
}

impl<'g, T> Shared<'g, T> {
    #[inline]
    fn new(ptr: *mut T) -> Self {
        Self {
            ptr,
            _marker: PhantomData,
        }
    }

    /// A null pointer.
    #[inline]
    pub fn null() -> Self {
        Self::new(ptr::null_mut())
    }

    /// Wraps a raw pointer.
    ///
    /// # Safety
    ///
    /// The pointer must be null or stay valid for `'g`: either it is still
    /// private to the caller, or it was loaded under a guard living for `'g`.
    #[inline]
    pub unsafe fn from_raw(ptr: *mut T) -> Self {
        Self::new(ptr)
    }

    /// Returns the raw pointer.
    #[inline]
    pub fn as_raw(&self) -> *mut T {
        self.ptr
    }

    /// Returns true if the pointer is null.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// Converts to an optional reference.
    ///
    /// # Safety
    ///
    /// A non-null pointer must point to an initialized `T`.
    #[inline]
    pub unsafe fn as_ref(&self) -> Option<&'g T> {
        // SAFETY: caller guarantees validity; the guard keeps it alive.
        unsafe { self.ptr.as_ref() }
    }

    /// Converts to a reference without checking for null.
    ///
    /// # Safety
    ///
    /// The pointer must be non-null and point to an initialized `T`.
    #[inline]
    pub unsafe fn deref(&self) -> &'g T {
        // SAFETY: caller guarantees validity; the guard keeps it alive.
        unsafe { &*self.ptr }
    }
}

impl<T> Clone for Shared<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Shared<'_, T> {}

impl<T> PartialEq for Shared<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for Shared<'_, T> {}

impl<T> fmt::Debug for Shared<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shared({:p})", self.ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pin;
    use core::sync::atomic::Ordering::{AcqRel, Acquire};

    #[test]
    fn test_cas_reports_actual_value() {
        let a = Box::into_raw(Box::new(1u32));
        let b = Box::into_raw(Box::new(2u32));
        let mut atomic = Atomic::new(a);
        let guard = pin();

        let new = unsafe { Shared::from_raw(b) };
        let found = atomic
            .compare_exchange(Shared::null(), new, AcqRel, Acquire, &guard)
            .unwrap_err();
        assert_eq!(found.as_raw(), a);

        let prev = atomic
            .compare_exchange(found, new, AcqRel, Acquire, &guard)
            .unwrap();
        assert_eq!(prev.as_raw(), a);
        assert_eq!(unsafe { atomic.load(Ordering::Acquire, &guard).deref() }, &2);
        drop(guard);

        unsafe {
            drop(Box::from_raw(a));
            drop(Box::from_raw(atomic.take()));
        }
        assert!(atomic.take().is_null());
    }

    #[test]
    fn test_swap_and_store() {
        let a = Box::into_raw(Box::new("a"));
        let atomic = Atomic::null();
        let guard = pin();

        atomic.store(unsafe { Shared::from_raw(a) }, Ordering::Release);
        let prev = atomic.swap(Shared::null(), Ordering::AcqRel, &guard);
        assert_eq!(prev.as_raw(), a);
        assert!(atomic.load(Ordering::Acquire, &guard).is_null());
        assert!(unsafe { atomic.load(Ordering::Acquire, &guard).as_ref() }.is_none());

        drop(guard);
        unsafe { drop(Box::from_raw(a)) };
    }
}

//! Error types for stack operations.

use std::fmt;
use thiserror::Error;

/// Returned by [`pop`](crate::TreiberStack::pop) when the stack holds no values.
///
/// This is an ordinary outcome under concurrency, not a failure of the
/// structure: another thread may simply have taken the last value first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[error("pop from an empty stack")]
pub struct EmptyError;

/// Returned by [`try_push`](crate::TreiberStack::try_push) when no node could be
/// allocated.
///
/// The stack is left untouched and the rejected value is handed back.
#[derive(Error)]
#[error("failed to allocate a stack node")]
pub struct AllocError<T>(T);

impl<T> AllocError<T> {
    pub(crate) fn new(value: T) -> Self {
        Self(value)
    }

    /// Recover the value that could not be pushed.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for AllocError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocError").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Opaque(u8);

    #[test]
    fn test_display() {
        assert_eq!(EmptyError.to_string(), "pop from an empty stack");
        assert_eq!(
            AllocError::new(Opaque(1)).to_string(),
            "failed to allocate a stack node"
        );
    }

    #[test]
    fn test_alloc_error_returns_value() {
        let err = AllocError::new(Opaque(7));
        assert_eq!(format!("{err:?}"), "AllocError { .. }");
        assert_eq!(err.into_inner().0, 7);
    }

    #[test]
    fn test_errors_box_into_dyn_error() {
        let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(AllocError::new(vec![1u8]));
        assert!(boxed.source().is_none());
        let boxed: Box<dyn std::error::Error> = EmptyError.into();
        assert_eq!(boxed.to_string(), "pop from an empty stack");
    }
}

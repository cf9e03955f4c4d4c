//! Cooperative cancellation.
//!
//! A [`CancelToken`] is a single shared flag set by the controlling side and
//! polled by every blocking loop in the core. It is always passed explicitly
//! into the operation that should honor it; nothing reads ambient state.
//! Once set, in-flight operations terminate within one poll interval and
//! report [`SweepError::Cancelled`](crate::error::SweepError::Cancelled)
//! rather than a timeout or success.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{SweepError, SweepResult};

/// Shared cancellation flag. Cloning produces another handle to the same
/// flag; setting is sticky for the lifetime of the token.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a fresh, unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// True once cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Early-exit helper for blocking loops: `token.check()?` at the top of
    /// every iteration.
    pub fn check(&self) -> SweepResult<()> {
        if self.is_cancelled() {
            Err(SweepError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(token.check().is_ok());
        other.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(SweepError::Cancelled)));
    }

    #[test]
    fn cancel_is_idempotent() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }
}

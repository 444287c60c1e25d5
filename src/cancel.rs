use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type CancelCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Cooperative cancellation flag shared between a polling loop and its owner.
///
/// Loops check the token once per iteration, never in the middle of a parse,
/// so a cancelled loop always leaves the session consistent.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    check: Option<CancelCheck>,
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.flag.load(Ordering::Relaxed))
            .field("has_check", &self.check.is_some())
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that also fires when `check` returns true (e.g. a pending
    /// interrupt signal). `check` runs on every `is_cancelled` call.
    pub fn with_check(check: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        Self {
            flag: Arc::default(),
            check: Some(Arc::new(check)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::Relaxed) {
            return true;
        }
        match &self.check {
            Some(check) if check() => {
                self.cancel();
                true
            }
            _ => false,
        }
    }

    /// Clear a previous cancellation so the token can be reused.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn clones_share_the_flag() {
        let token = CancelToken::new();
        let handle = token.clone();
        assert!(!token.is_cancelled());
        handle.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn check_fires_once_and_latches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let token = CancelToken::with_check(move || seen.fetch_add(1, Ordering::SeqCst) == 2);

        assert!(!token.is_cancelled());
        assert!(!token.is_cancelled());
        assert!(token.is_cancelled());
        assert!(token.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

//! Lock helpers that recover from poisoning.
//!
//! A panic while holding one of these locks leaves plain bookkeeping data
//! (call history, ledger rows) that is still valid, so the guard is recovered
//! instead of propagating the poison.

use std::sync::{Mutex, MutexGuard};

/// Extension trait for `Mutex` that ignores lock poisoning.
pub trait IgnoreLock<T> {
    /// Lock the mutex, recovering the guard if it was poisoned.
    fn lock_ignore_poison(&self) -> MutexGuard<'_, T>;
}

impl<T> IgnoreLock<T> for Mutex<T> {
    fn lock_ignore_poison(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_poisoned_mutex_is_recovered() {
        let shared = Arc::new(Mutex::new(vec![1]));
        let clone = Arc::clone(&shared);
        let handle = thread::spawn(move || {
            let _guard = clone.lock_ignore_poison();
            panic!("poison the lock");
        });
        assert!(handle.join().is_err());
        assert!(shared.is_poisoned());

        shared.lock_ignore_poison().push(2);
        assert_eq!(*shared.lock_ignore_poison(), vec![1, 2]);
    }
}

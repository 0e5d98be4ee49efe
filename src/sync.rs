use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock `mutex`, recovering the guard if a holder panicked
///
/// Every value guarded in this crate is left consistent between statements,
/// so a poisoned lock carries no torn state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lock_survives_poisoning() {
        let shared = Arc::new(Mutex::new(1));
        let poisoner = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let _guard = shared.lock().unwrap();
                panic!("poison the lock");
            })
        };
        assert!(poisoner.join().is_err());
        assert!(shared.is_poisoned());

        *lock(&shared) += 1;
        assert_eq!(*lock(&shared), 2);
    }
}

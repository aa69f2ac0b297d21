use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the guard if a previous holder panicked.
/// Every critical section in this crate leaves its data consistent.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

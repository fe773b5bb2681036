// src/util/mod.rs

//! Small synchronization helpers shared across the crate.

mod call_once;
mod callbacks;

pub use call_once::CallOnce;
pub use callbacks::{CallbackId, FailureCallbacks};

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

/// Boxed, sendable future used to type-erase async callbacks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Plain notification callback used for failure reporting.
pub type FailureCallback = Arc<dyn Fn() + Send + Sync>;

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

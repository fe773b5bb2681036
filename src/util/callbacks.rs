// src/util/callbacks.rs

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

use super::{lock_ignore_poison, FailureCallback};
use crate::log_error;

/// Handle returned by [`FailureCallbacks::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Registry of failure callbacks.
///
/// Invocation works on a snapshot taken under the registry lock, so callbacks
/// may register or remove callbacks without deadlocking. A panicking
/// callback is logged and does not stop the remaining ones.
#[derive(Default)]
pub struct FailureCallbacks {
    inner: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    callbacks: Vec<(CallbackId, FailureCallback)>,
}

impl FailureCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, callback: FailureCallback) -> CallbackId {
        // ---
        let mut registry = lock_ignore_poison(&self.inner);
        registry.next_id += 1;
        let id = CallbackId(registry.next_id);
        registry.callbacks.push((id, callback));
        id
    }

    /// Returns whether the callback was registered.
    pub fn remove(&self, id: CallbackId) -> bool {
        // ---
        let mut registry = lock_ignore_poison(&self.inner);
        let before = registry.callbacks.len();
        registry.callbacks.retain(|(existing, _)| *existing != id);
        registry.callbacks.len() != before
    }

    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.inner).callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every registered callback.
    pub fn invoke_all(&self) {
        // ---
        let snapshot: Vec<FailureCallback> = lock_ignore_poison(&self.inner)
            .callbacks
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();

        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                log_error!("failure callback panicked");
            }
        }
    }
}

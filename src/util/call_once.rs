// src/util/call_once.rs

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::FailureCallback;

/// Wraps a callback so that it runs at most once, no matter how many
/// threads trigger it.
pub struct CallOnce {
    called: AtomicBool,
    action: Box<dyn Fn() + Send + Sync>,
}

impl CallOnce {
    pub fn new(action: impl Fn() + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            called: AtomicBool::new(false),
            action: Box::new(action),
        })
    }

    /// Run the action if nobody has yet. Returns whether this call ran it.
    pub fn call(&self) -> bool {
        // ---
        if self
            .called
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        (self.action)();
        true
    }

    pub fn has_been_called(&self) -> bool {
        self.called.load(Ordering::Acquire)
    }

    /// View as a plain failure callback.
    pub fn into_callback(self: Arc<Self>) -> FailureCallback {
        Arc::new(move || {
            self.call();
        })
    }
}

impl fmt::Debug for CallOnce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOnce")
            .field("called", &self.has_been_called())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn runs_only_once() {
        // ---
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let once = CallOnce::new(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(once.call());
        assert!(!once.call());
        assert!(once.has_been_called());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn runs_once_under_contention() {
        // ---
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let callback = CallOnce::new(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        })
        .into_callback();

        let threads: Vec<_> = (0..16)
            .map(|_| {
                let callback = callback.clone();
                thread::spawn(move || callback())
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}

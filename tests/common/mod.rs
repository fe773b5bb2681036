// tests/common/mod.rs

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;

    use tracing_subscriber::EnvFilter;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

/// Route crate logs to the test harness, filtered by `RUST_LOG`.
pub fn init_logging() {
    imp::init();
}

//! Test utilities and global setup
//!
//! Provides centralized test logging configuration.

/// Test logging utilities
#[cfg(all(test, feature = "test-logging"))]
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    /// Initialize test logging globally - safe to call multiple times
    ///
    /// Respects `RUST_LOG`; defaults to debug for this crate and info for tokio.
    ///
    /// ```bash
    /// RUST_LOG=index_builder::index=trace cargo test --features test-logging
    /// ```
    pub fn init() {
        INIT.call_once(|| {
            let env_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("debug,tokio=info"));

            fmt()
                .with_env_filter(env_filter)
                .with_test_writer()
                .with_target(true)
                .with_thread_ids(true)
                .compact()
                .try_init()
                .ok(); // Another test may have initialised it already
        });
    }
}

/// Auto-initialize test logging for every test in the invoking module
#[cfg(all(test, feature = "test-logging"))]
#[macro_export]
macro_rules! setup_test_logging {
    () => {
        #[ctor::ctor]
        fn init_test_logging() {
            $crate::test_utils::logging::init();
        }
    };
}

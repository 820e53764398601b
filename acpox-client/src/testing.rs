//! Helpers for tests, shared with the integration tests by way of a `#[path]` attribute.

/// Initialize tracing for tests, once, honoring `RUST_LOG`
pub fn init_test_logging() {
    use std::sync::OnceLock;

    static INIT_LOGGING: OnceLock<()> = OnceLock::new();

    INIT_LOGGING.get_or_init(|| {
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".into()))
            .with_test_writer()
            .try_init()
            .unwrap()
    });
}

//! Test support: logging setup and an in-memory pair of line transports.
//!
//! This module is only compiled when `test` is enabled.  Integration tests pull it in with a
//! `#[path]` attribute, so it must not refer to anything in this crate.
use futures::StreamExt;
use futures::channel::mpsc;

/// Send `tracing` output to the test harness's captured stdout.  `RUST_LOG` overrides the
/// default of logging everything.  Safe to call from every test.
pub fn init_test_logging() {
    use std::sync::Once;
    use tracing_subscriber::EnvFilter;

    static LOGGING: Once = Once::new();

    LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trace"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// One end of an in-memory channel of lines; a stream of inbound lines and a sink for outbound
/// ones, which is all it takes to be a transport.
pub type TestTransport = (
    futures::stream::Map<mpsc::UnboundedReceiver<String>, fn(String) -> Result<String, std::io::Error>>,
    mpsc::UnboundedSender<String>,
);

/// Make a pair of transports connected to each other in memory.  Lines written to one come out of
/// the other.  Dropping one end closes the other's inbound stream.
pub fn setup_test_channel() -> (TestTransport, TestTransport) {
    let (a_tx, a_rx) = mpsc::unbounded();
    let (b_tx, b_rx) = mpsc::unbounded();

    let ok: fn(String) -> Result<String, std::io::Error> = Ok;

    ((b_rx.map(ok), a_tx), (a_rx.map(ok), b_tx))
}

//! Helpers shared by the cross-crate scenario tests

/// Install a fmt subscriber honoring `RUST_LOG`; safe to call from every
/// test, only the first wins
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

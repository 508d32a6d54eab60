//! Tracing setup for binaries and tests embedding the session layer.

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` (e.g. `"dc_session=info"`).
///
/// Safe to call more than once; later calls are ignored.
pub fn init(default_directive: &str) {
    let filter = match default_directive.parse() {
        Ok(directive) => EnvFilter::from_default_env().add_directive(directive),
        Err(_) => EnvFilter::from_default_env(),
    };
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

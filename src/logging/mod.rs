//! Process-wide tracing setup.
//!
//! The rest of the crate logs through the `tracing` macros directly; this
//! module only owns the subscriber that turns those events into output.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber from `RUST_LOG`, defaulting to
/// `info` when the variable is unset or fails to parse.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

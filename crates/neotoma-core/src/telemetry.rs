//! Optional `tracing_subscriber` wiring for binaries and tests. Library code
//! in this crate never calls this — only a `main.rs` or a test harness
//! should configure a global subscriber.

use tracing_subscriber::{fmt, EnvFilter};

/// Installs an `EnvFilter` + `fmt` subscriber reading `RUST_LOG` (defaulting
/// to `info` when unset). Panics if a global subscriber is already set,
/// matching `tracing`'s own `set_global_default` contract.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();
}

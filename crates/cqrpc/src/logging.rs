//! Log output for binaries built on cqrpc.
//!
//! The library itself only emits `tracing` events. Binaries call [`init`]
//! once to print them, filtered by `CQRPC_LOG` (`EnvFilter` syntax, e.g.
//! `CQRPC_LOG=cqrpc_engine=trace,info`).

use tracing_subscriber::EnvFilter;

/// Variable holding the log filter.
pub const LOG_ENV: &str = "CQRPC_LOG";

const DEFAULT_FILTER: &str = "info";

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install a formatting subscriber. Returns false if one was already set.
pub fn init() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_thread_names(true)
        .try_init()
        .is_ok()
}

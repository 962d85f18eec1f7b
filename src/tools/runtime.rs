//! Tokio runtime bootstrap for the command line entry points.

use std::future::Future;

/// Build a runtime and block on `fut`. Used as the async run hook for the
/// CLI command dispatcher.
pub fn main<F: Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(fut)
}

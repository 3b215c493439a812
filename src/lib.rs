//! Request dispatch and pass-through read/write core for a block-level
//! caching engine: resolves each request's effective cache mode, routes
//! it to the matching engine, and forwards pass-through I/O straight to
//! the backing core device under the cache-line and hash-bucket locking
//! discipline the metadata layer requires.
//!
//! The metadata layer itself (line allocation, eviction, promotion
//! heuristics) and the wire/storage format are out of scope; this crate
//! defines those as trait seams (see [`concurrency`], [`traverse`],
//! [`cache`]) and ships in-process reference implementations of them
//! for the demo binary and the test suite.

pub mod cache;
pub mod concurrency;
pub mod config;
pub mod core_device;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod mode;
pub mod parallelize;
pub mod queue;
pub mod request;
pub mod stats;
pub mod traverse;

/// Initializes `env_logger` from `RUST_LOG`, defaulting to `info` when
/// unset. Safe to call more than once; only the first call takes
/// effect.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(false)
        .try_init();
}

//! Retry and backoff primitives shared by the mesh router, Nostr relay pool,
//! and message manager when they need to retry a fallible network operation.

pub mod retry_backoff;

pub use retry_backoff::{
    BackoffStrategy, RetryConfig, RetryConfigBuilder, RetryError, RetryExecutor,
    retry_with_backoff,
};

//! Async timeout wrappers.

use std::future::Future;
use std::time::Duration;

use crate::error::{Result, WireError};

/// Default timeout for individual operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for connection establishment.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for graceful shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs `future` under `duration`, mapping expiry to [`WireError::Timeout`].
pub async fn with_timeout<F: Future>(future: F, duration: Duration) -> Result<F::Output> {
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| WireError::Timeout)
}

/// Like [`with_timeout`] for fallible futures, flattening the result.
pub async fn with_timeout_error<T>(
    future: impl Future<Output = Result<T>>,
    duration: Duration,
) -> Result<T> {
    with_timeout(future, duration).await?
}

use autotrade_broker::{BrokerError, Result};
use std::future::Future;
use std::time::Duration;

/// Runs a broker call under a hard timeout; expiry is a `Timeout` failure, never a retry.
pub(crate) async fn with_deadline<T, F>(timeout: Duration, what: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(BrokerError::Timeout(format!(
            "{what} exceeded {}ms",
            timeout.as_millis()
        ))),
    }
}

//! Timeout helper for upstream attempts
//!
//! Each forwarding attempt runs under its own deadline; expiry is reported
//! as a distinct error so callers can classify it as a transport failure.

use std::future::Future;
use std::time::Duration;

/// Apply a deadline to a fallible async operation
pub async fn with_timeout<T, E>(
    timeout: Duration,
    future: impl Future<Output = Result<T, E>>,
) -> Result<T, TimeoutError<E>> {
    match tokio::time::timeout(timeout, future).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(TimeoutError::Inner(err)),
        Err(_) => Err(TimeoutError::Timeout(timeout)),
    }
}

/// Error type for timeout operations
#[derive(Debug, thiserror::Error)]
pub enum TimeoutError<E> {
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Inner(E),
}

impl<E> TimeoutError<E> {
    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, TimeoutError::Timeout(_))
    }

    /// Collapse into the inner error type, mapping a timeout with `on_timeout`
    pub fn flatten(self, on_timeout: impl FnOnce(Duration) -> E) -> E {
        match self {
            TimeoutError::Inner(e) => e,
            TimeoutError::Timeout(after) => on_timeout(after),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result: Result<i32, TimeoutError<String>> =
            with_timeout(Duration::from_secs(1), async { Ok::<_, String>(42) }).await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_timeout_inner_error() {
        let result: Result<i32, TimeoutError<String>> = with_timeout(
            Duration::from_secs(1),
            async { Err::<i32, _>("inner error".to_string()) },
        )
        .await;

        let err = result.unwrap_err();
        assert!(!err.is_timeout());
        assert_eq!(err.flatten(|_| "timeout".to_string()), "inner error");
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result: Result<i32, TimeoutError<String>> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, String>(42)
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(
            err.flatten(|after| format!("timed out after {}ms", after.as_millis())),
            "timed out after 10ms"
        );
    }
}

// src/services/deadline.rs
use std::future::Future;
use std::time::Duration;

use crate::error::AppError;

/// Runs `fut` with an upper bound. Expiry drops the future and yields a
/// recoverable `AppError::Timeout` naming `operation`.
pub async fn time_boxed<T, F>(operation: &'static str, limit: Duration, fut: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation, limit_ms = limit.as_millis() as u64, "⏱️ operation timed out");
            Err(AppError::Timeout { operation, limit })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_passes_through_result_within_limit() {
        let value = time_boxed("quick", Duration::from_secs(1), async { Ok::<_, AppError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_expiry_is_a_recoverable_timeout() {
        let err = time_boxed("slow", Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, AppError>(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, AppError::Timeout { operation: "slow", .. }));
        assert!(err.is_recoverable());
    }
}

//! Deadline and cancellation wrapper shared by dispatch, spawn, and messaging.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::OrchestratorError;

/// Run `fut` until it finishes, `limit` elapses, or `cancel` fires.
///
/// Cancellation wins ties so a terminated runner never reports a partial result.
/// The future is dropped on timeout or cancellation.
pub async fn bounded<T, F>(
    operation: &str,
    limit: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, OrchestratorError>
where
    F: Future<Output = Result<T, OrchestratorError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OrchestratorError::Cancelled),
        outcome = tokio::time::timeout(limit, fut) => match outcome {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(operation, secs = limit.as_secs(), "Operation timed out");
                Err(OrchestratorError::Timeout {
                    operation: operation.to_string(),
                    secs: limit.as_secs(),
                })
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passes_through_result() {
        let token = CancellationToken::new();
        let out = bounded("op", Duration::from_secs(1), &token, async { Ok(7) }).await;
        assert_eq!(out.unwrap(), 7);
    }

    #[tokio::test]
    async fn times_out() {
        let token = CancellationToken::new();
        let out: Result<(), _> = bounded("slow op", Duration::from_millis(20), &token, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(out, Err(OrchestratorError::Timeout { operation, .. }) if operation == "slow op"));
    }

    #[tokio::test]
    async fn cancellation_aborts() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let out: Result<(), _> = bounded("op", Duration::from_secs(5), &token, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(out, Err(OrchestratorError::Cancelled)));
    }

    #[tokio::test]
    async fn already_cancelled_never_polls() {
        let token = CancellationToken::new();
        token.cancel();
        let out = bounded("op", Duration::from_secs(1), &token, async { Ok(1) }).await;
        assert!(matches!(out, Err(OrchestratorError::Cancelled)));
    }
}

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::proxy::ProxyPool;
use crate::error::{CrawlError, CrawlResult, TransientKind};
use crate::scrapers::EgressIdentity;

/// Retry budget for adapter calls
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub timeout: Duration,
}

/// Run `call` with a deadline; running out of time is a transient failure.
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> CrawlResult<T>
where
    F: Future<Output = CrawlResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(CrawlError::transient(
            TransientKind::Timeout,
            format!("no response within {}s", timeout.as_secs_f32()),
        )),
    }
}

/// One adapter call through a pooled identity. Failures that implicate the
/// identity are reported back to the pool before the error is returned.
pub async fn attempt<T, F, Fut>(pool: &ProxyPool, timeout: Duration, call: F) -> CrawlResult<T>
where
    F: FnOnce(EgressIdentity) -> Fut,
    Fut: Future<Output = CrawlResult<T>>,
{
    let egress = pool.acquire().await?;
    let result = with_timeout(timeout, call(egress.clone())).await;
    if let Err(err) = &result {
        if let Some(kind) = err.transient_kind() {
            pool.report_failure(&egress, kind).await;
        }
    }
    result
}

/// Repeat [`attempt`] while it fails transiently, up to the policy's budget
/// or until cancellation. The last error is returned when the budget runs out.
pub async fn retry<T, F, Fut>(
    policy: RetryPolicy,
    pool: &ProxyPool,
    cancel: &CancellationToken,
    mut call: F,
) -> CrawlResult<T>
where
    F: FnMut(EgressIdentity) -> Fut,
    Fut: Future<Output = CrawlResult<T>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match attempt(pool, policy.timeout, &mut call).await {
            Err(err) if err.is_transient() => {
                if attempts >= policy.max_attempts || cancel.is_cancelled() {
                    return Err(err);
                }
                debug!(attempt = attempts, error = %err, "Retrying transient failure");
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawl::proxy::StaticProxies;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    async fn direct_pool() -> ProxyPool {
        ProxyPool::spawn(
            Arc::new(StaticProxies(Vec::new())),
            Duration::from_millis(1),
            CancellationToken::new(),
        )
        .await
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn slow_calls_time_out_as_transient() {
        let result: CrawlResult<()> = with_timeout(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(
            result.unwrap_err().transient_kind(),
            Some(TransientKind::Timeout)
        );
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let pool = direct_pool().await;
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let value = retry(policy(3), &pool, &CancellationToken::new(), move |_| async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CrawlError::transient(TransientKind::Connection, "reset"))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn budget_is_bounded_and_not_found_is_never_retried() {
        let pool = direct_pool().await;
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let err = retry(policy(2), &pool, &CancellationToken::new(), move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(CrawlError::transient(TransientKind::Blocked, "429"))
        })
        .await
        .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        calls.store(0, Ordering::SeqCst);
        let err = retry(policy(5), &pool, &CancellationToken::new(), move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(CrawlError::NotFound("room 1".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, CrawlError::NotFound(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

//! Consumer-side concurrency accounting and limiting

use crate::filter::Filter;
use crate::invocation::{RpcInvocation, RpcResult};
use crate::invoker::Invoker;
use crate::status::RpcStatus;
use async_trait::async_trait;
use mizzen_core::constants::{ACTIVES_KEY, DEFAULT_TIMEOUT_MS, TIMEOUT_KEY};
use mizzen_core::{Error, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Tracks the per-(url, method) active count on the consumer side and, when
/// the `actives` parameter is set, waits for a slot up to the call timeout
/// before giving up with `LimitExceeded`.
pub struct ActiveLimitFilter;

#[async_trait]
impl Filter for ActiveLimitFilter {
    fn name(&self) -> &'static str {
        "activelimit"
    }

    async fn invoke(
        &self,
        next: &Arc<dyn Invoker>,
        invocation: RpcInvocation,
    ) -> Result<RpcResult> {
        let url = next.url();
        let method = invocation.method().to_string();
        let max = url.method_param_u32(&method, ACTIVES_KEY, 0);

        if max > 0 {
            let timeout = url.method_param_u64(&method, TIMEOUT_KEY, DEFAULT_TIMEOUT_MS);
            let deadline = Instant::now() + Duration::from_millis(timeout);
            loop {
                if RpcStatus::of(url, &method).active() < max {
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(Error::LimitExceeded(format!(
                        "waited {}ms for an active slot on {}.{} (limit {})",
                        timeout,
                        url.service_key(),
                        method,
                        max
                    )));
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }

        let status = RpcStatus::begin_count(url, &method);
        let started = Instant::now();
        let outcome = next.invoke(invocation).await;
        status.end_count(started.elapsed(), outcome.is_ok());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::build_filter_chain;
    use mizzen_core::Url;
    use tokio::sync::Semaphore;

    struct Gate {
        url: Url,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl Invoker for Gate {
        fn url(&self) -> &Url {
            &self.url
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn invoke(&self, _invocation: RpcInvocation) -> Result<RpcResult> {
            let _permit = self.gate.acquire().await.unwrap();
            Ok(RpcResult::null())
        }

        fn destroy(&self) {}
    }

    #[tokio::test]
    async fn counts_actives_around_invoke() {
        let url = Url::new("mizzen", "127.0.0.1", 7201, "org.demo.Active");
        let gate = Arc::new(Semaphore::new(0));
        let invoker: Arc<dyn Invoker> =
            Arc::new(Gate { url: url.clone(), gate: gate.clone() });
        let chain = build_filter_chain(invoker, &[Arc::new(ActiveLimitFilter)]);

        let handle = tokio::spawn({
            let chain = chain.clone();
            async move { chain.invoke(RpcInvocation::new("m")).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(RpcStatus::of(&url, "m").active(), 1);

        gate.add_permits(1);
        handle.await.unwrap().unwrap();
        assert_eq!(RpcStatus::of(&url, "m").active(), 0);
    }

    #[tokio::test]
    async fn rejects_when_limit_stays_full() {
        let url = Url::new("mizzen", "127.0.0.1", 7202, "org.demo.Active")
            .with_param(ACTIVES_KEY, 1)
            .with_param(TIMEOUT_KEY, 40);
        let gate = Arc::new(Semaphore::new(0));
        let invoker: Arc<dyn Invoker> =
            Arc::new(Gate { url: url.clone(), gate: gate.clone() });
        let chain = build_filter_chain(invoker, &[Arc::new(ActiveLimitFilter)]);

        let blocked = tokio::spawn({
            let chain = chain.clone();
            async move { chain.invoke(RpcInvocation::new("m")).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = chain.invoke(RpcInvocation::new("m")).await.unwrap_err();
        assert!(matches!(err, Error::LimitExceeded(_)));

        gate.add_permits(2);
        blocked.await.unwrap().unwrap();
    }
}

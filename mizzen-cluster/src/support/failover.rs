//! Retry-on-failure policy

use crate::cluster::{Cluster, ClusterSupport};
use crate::directory::Directory;
use crate::loadbalance::LoadBalanceRegistry;
use async_trait::async_trait;
use mizzen_core::constants::{DEFAULT_RETRIES, RETRIES_KEY};
use mizzen_core::{Error, Result, Url};
use mizzen_rpc::{Invoker, RpcInvocation, RpcResult};
use std::sync::Arc;
use tracing::warn;

/// Try up to `retries + 1` distinct invokers; the last failure surfaces
/// when every attempt is spent. Service-raised errors are never retried.
pub struct FailoverCluster {
    load_balances: Arc<LoadBalanceRegistry>,
}

impl FailoverCluster {
    pub fn new(load_balances: Arc<LoadBalanceRegistry>) -> Self {
        Self { load_balances }
    }
}

impl Cluster for FailoverCluster {
    fn name(&self) -> &'static str {
        "failover"
    }

    fn join(&self, directory: Arc<dyn Directory>) -> Arc<dyn Invoker> {
        Arc::new(FailoverClusterInvoker {
            support: ClusterSupport::new(directory, self.load_balances.clone()),
        })
    }
}

struct FailoverClusterInvoker {
    support: ClusterSupport,
}

#[async_trait]
impl Invoker for FailoverClusterInvoker {
    fn url(&self) -> &Url {
        self.support.url()
    }

    fn is_available(&self) -> bool {
        self.support.is_available()
    }

    async fn invoke(&self, invocation: RpcInvocation) -> Result<RpcResult> {
        let method = invocation.method().to_string();
        let retries = self
            .support
            .url()
            .method_param_u32(&method, RETRIES_KEY, DEFAULT_RETRIES);
        let attempts = retries + 1;

        let mut invokers = self.support.list(&invocation)?;
        let mut tried: Vec<Arc<dyn Invoker>> = Vec::new();
        let mut last_error: Option<Error> = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                // the directory may have changed since the failed attempt
                self.support.check_destroyed()?;
                invokers = self.support.list(&invocation)?;
            }
            let invoker = self.support.select(&invocation, &invokers, &tried)?;
            tried.push(invoker.clone());
            // fresh clone per attempt so filter-set attachments cannot leak
            match invoker.invoke(invocation.clone()).await {
                Ok(result) => {
                    if attempt > 0 {
                        warn!(
                            "{}.{} succeeded on attempt {} after {:?}",
                            self.support.url().service_key(),
                            method,
                            attempt + 1,
                            last_error
                        );
                    }
                    return Ok(result);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(
                        "{}.{} attempt {} on {} failed: {}",
                        self.support.url().service_key(),
                        method,
                        attempt + 1,
                        invoker.url().address(),
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        let last = last_error
            .unwrap_or_else(|| Error::Internal("failover finished without attempts".into()));
        Err(match last {
            Error::Timeout(m) => {
                Error::Timeout(format!("{} ({} attempts exhausted)", m, attempts))
            }
            Error::Network(m) => {
                Error::Network(format!("{} ({} attempts exhausted)", m, attempts))
            }
            other => other,
        })
    }

    fn destroy(&self) {
        self.support.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use crate::loadbalance;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        url: Url,
        calls: AtomicU32,
        fail_times: u32,
        error: fn(String) -> Error,
    }

    impl Flaky {
        fn new(host: &str, fail_times: u32) -> Arc<Self> {
            Arc::new(Self {
                url: Url::new("mizzen", host, 20880, "org.demo.Over"),
                calls: AtomicU32::new(0),
                fail_times,
                error: Error::Network,
            })
        }
    }

    #[async_trait]
    impl Invoker for Flaky {
        fn url(&self) -> &Url {
            &self.url
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn invoke(&self, _invocation: RpcInvocation) -> Result<RpcResult> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_times {
                Err((self.error)(format!("{} is down", self.url.host())))
            } else {
                Ok(RpcResult::value(self.url.host().as_bytes().to_vec()))
            }
        }

        fn destroy(&self) {}
    }

    fn join(invokers: Vec<Arc<dyn Invoker>>, url: Url) -> Arc<dyn Invoker> {
        let cluster = FailoverCluster::new(loadbalance::builtin_registry());
        cluster.join(Arc::new(StaticDirectory::new(url, invokers)))
    }

    fn consumer() -> Url {
        Url::new("consumer", "127.0.0.1", 0, "org.demo.Over")
    }

    #[tokio::test]
    async fn retries_a_different_invoker() {
        let dead = Flaky::new("10.0.0.1", u32::MAX);
        let live = Flaky::new("10.0.0.2", 0);
        let invoker = join(vec![dead.clone(), live.clone()], consumer());

        for _ in 0..10 {
            let result = invoker.invoke(RpcInvocation::new("m")).await.unwrap();
            assert_eq!(result.get_value(), Some("10.0.0.2".as_bytes()));
        }
        // the dead endpoint was tried at most once per call
        assert!(dead.calls.load(Ordering::SeqCst) <= 10);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_last_error() {
        let dead = Flaky::new("10.0.0.1", u32::MAX);
        let also_dead = Flaky::new("10.0.0.2", u32::MAX);
        let url = consumer().with_param(RETRIES_KEY, 2);
        let invoker = join(vec![dead, also_dead], url);

        let err = invoker.invoke(RpcInvocation::new("m")).await.unwrap_err();
        assert!(matches!(err, Error::Network(_)));
        assert!(err.to_string().contains("3 attempts"));
    }

    #[tokio::test]
    async fn biz_errors_are_not_retried() {
        let biz = Arc::new(Flaky {
            url: Url::new("mizzen", "10.0.0.1", 20880, "org.demo.Over"),
            calls: AtomicU32::new(0),
            fail_times: u32::MAX,
            error: |m| Error::Biz { message: m, payload: Vec::new() },
        });
        let invoker = join(vec![biz.clone()], consumer());
        let err = invoker.invoke(RpcInvocation::new("m")).await.unwrap_err();
        assert!(err.is_biz());
        assert_eq!(biz.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_retries_means_single_attempt() {
        let dead = Flaky::new("10.0.0.1", u32::MAX);
        let url = consumer().with_param(RETRIES_KEY, 0);
        let invoker = join(vec![dead.clone()], url);
        invoker.invoke(RpcInvocation::new("m")).await.unwrap_err();
        assert_eq!(dead.calls.load(Ordering::SeqCst), 1);
    }
}

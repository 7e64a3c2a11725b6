//! Invoke-everyone policy

use crate::cluster::{Cluster, ClusterSupport};
use crate::directory::Directory;
use crate::loadbalance::LoadBalanceRegistry;
use async_trait::async_trait;
use mizzen_core::{Result, Url};
use mizzen_rpc::{Invoker, RpcInvocation, RpcResult};
use std::sync::Arc;
use tracing::warn;

/// Every provider is invoked in turn; the call succeeds only when all of
/// them do, and the first failure surfaces after the sweep completes. Used
/// to push state (cache invalidation, config) to every instance.
pub struct BroadcastCluster {
    load_balances: Arc<LoadBalanceRegistry>,
}

impl BroadcastCluster {
    pub fn new(load_balances: Arc<LoadBalanceRegistry>) -> Self {
        Self { load_balances }
    }
}

impl Cluster for BroadcastCluster {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    fn join(&self, directory: Arc<dyn Directory>) -> Arc<dyn Invoker> {
        Arc::new(BroadcastClusterInvoker {
            support: ClusterSupport::new(directory, self.load_balances.clone()),
        })
    }
}

struct BroadcastClusterInvoker {
    support: ClusterSupport,
}

#[async_trait]
impl Invoker for BroadcastClusterInvoker {
    fn url(&self) -> &Url {
        self.support.url()
    }

    fn is_available(&self) -> bool {
        self.support.is_available()
    }

    async fn invoke(&self, invocation: RpcInvocation) -> Result<RpcResult> {
        let invokers = self.support.list(&invocation)?;
        let mut first_error = None;
        let mut last_result = RpcResult::null();
        for invoker in &invokers {
            // no short-circuit: every provider sees the call
            match invoker.invoke(invocation.clone()).await {
                Ok(result) => last_result = result,
                Err(e) => {
                    warn!(
                        "broadcast to {} failed: {}",
                        invoker.url().address(),
                        e
                    );
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(last_result),
        }
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
    use mizzen_core::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counting {
        url: Url,
        calls: AtomicU32,
        fail: bool,
        kind: fn(String) -> Error,
    }

    impl Counting {
        fn new(host: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                url: Url::new("mizzen", host, 20880, "org.demo.Cast"),
                calls: AtomicU32::new(0),
                fail,
                kind: Error::Network,
            })
        }
    }

    #[async_trait]
    impl Invoker for Counting {
        fn url(&self) -> &Url {
            &self.url
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn invoke(&self, _invocation: RpcInvocation) -> Result<RpcResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err((self.kind)(format!("{} failed", self.url.host())))
            } else {
                Ok(RpcResult::null())
            }
        }

        fn destroy(&self) {}
    }

    fn join(invokers: Vec<Arc<dyn Invoker>>) -> Arc<dyn Invoker> {
        let cluster = BroadcastCluster::new(loadbalance::builtin_registry());
        cluster.join(Arc::new(StaticDirectory::new(
            Url::new("consumer", "127.0.0.1", 0, "org.demo.Cast"),
            invokers,
        )))
    }

    #[tokio::test]
    async fn every_provider_is_called_even_after_a_failure() {
        let a = Counting::new("10.0.0.1", true);
        let b = Counting::new("10.0.0.2", false);
        let c = Counting::new("10.0.0.3", true);
        let invoker = join(vec![a.clone(), b.clone(), c.clone()]);

        let err = invoker.invoke(RpcInvocation::new("m")).await.unwrap_err();
        assert!(err.to_string().contains("10.0.0.1"), "first failure surfaces: {}", err);
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 1);
        assert_eq!(c.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn all_success_succeeds() {
        let a = Counting::new("10.0.0.1", false);
        let b = Counting::new("10.0.0.2", false);
        let invoker = join(vec![a, b]);
        assert!(invoker.invoke(RpcInvocation::new("m")).await.is_ok());
    }
}

//! Single-attempt policy

use crate::cluster::{Cluster, ClusterSupport};
use crate::directory::Directory;
use crate::loadbalance::LoadBalanceRegistry;
use async_trait::async_trait;
use mizzen_core::{Result, Url};
use mizzen_rpc::{Invoker, RpcInvocation, RpcResult};
use std::sync::Arc;

/// One attempt, every failure surfaces immediately
pub struct FailfastCluster {
    load_balances: Arc<LoadBalanceRegistry>,
}

impl FailfastCluster {
    pub fn new(load_balances: Arc<LoadBalanceRegistry>) -> Self {
        Self { load_balances }
    }
}

impl Cluster for FailfastCluster {
    fn name(&self) -> &'static str {
        "failfast"
    }

    fn join(&self, directory: Arc<dyn Directory>) -> Arc<dyn Invoker> {
        Arc::new(FailfastClusterInvoker {
            support: ClusterSupport::new(directory, self.load_balances.clone()),
        })
    }
}

struct FailfastClusterInvoker {
    support: ClusterSupport,
}

#[async_trait]
impl Invoker for FailfastClusterInvoker {
    fn url(&self) -> &Url {
        self.support.url()
    }

    fn is_available(&self) -> bool {
        self.support.is_available()
    }

    async fn invoke(&self, invocation: RpcInvocation) -> Result<RpcResult> {
        let invokers = self.support.list(&invocation)?;
        let invoker = self.support.select(&invocation, &invokers, &[])?;
        invoker.invoke(invocation).await
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

    struct Dead {
        url: Url,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Invoker for Dead {
        fn url(&self) -> &Url {
            &self.url
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn invoke(&self, _invocation: RpcInvocation) -> Result<RpcResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Network("down".into()))
        }

        fn destroy(&self) {}
    }

    #[tokio::test]
    async fn fails_on_first_error_without_retry() {
        let dead = Arc::new(Dead {
            url: Url::new("mizzen", "10.0.0.1", 20880, "org.demo.Fast"),
            calls: AtomicU32::new(0),
        });
        let other = Arc::new(Dead {
            url: Url::new("mizzen", "10.0.0.2", 20880, "org.demo.Fast"),
            calls: AtomicU32::new(0),
        });
        let cluster = FailfastCluster::new(loadbalance::builtin_registry());
        let invoker = cluster.join(Arc::new(StaticDirectory::new(
            Url::new("consumer", "127.0.0.1", 0, "org.demo.Fast"),
            vec![dead.clone(), other.clone()],
        )));

        assert!(invoker.invoke(RpcInvocation::new("m")).await.is_err());
        let total = dead.calls.load(Ordering::SeqCst) + other.calls.load(Ordering::SeqCst);
        assert_eq!(total, 1);
    }
}

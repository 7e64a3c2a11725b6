//! Swallow-and-log policy

use crate::cluster::{Cluster, ClusterSupport};
use crate::directory::Directory;
use crate::loadbalance::LoadBalanceRegistry;
use async_trait::async_trait;
use mizzen_core::{Result, Url};
use mizzen_rpc::{Invoker, RpcInvocation, RpcResult};
use std::sync::Arc;
use tracing::warn;

/// One attempt; failures are logged and an empty result returned, for
/// write-to-audit-log style calls that must never break the caller
pub struct FailsafeCluster {
    load_balances: Arc<LoadBalanceRegistry>,
}

impl FailsafeCluster {
    pub fn new(load_balances: Arc<LoadBalanceRegistry>) -> Self {
        Self { load_balances }
    }
}

impl Cluster for FailsafeCluster {
    fn name(&self) -> &'static str {
        "failsafe"
    }

    fn join(&self, directory: Arc<dyn Directory>) -> Arc<dyn Invoker> {
        Arc::new(FailsafeClusterInvoker {
            support: ClusterSupport::new(directory, self.load_balances.clone()),
        })
    }
}

struct FailsafeClusterInvoker {
    support: ClusterSupport,
}

#[async_trait]
impl Invoker for FailsafeClusterInvoker {
    fn url(&self) -> &Url {
        self.support.url()
    }

    fn is_available(&self) -> bool {
        self.support.is_available()
    }

    async fn invoke(&self, invocation: RpcInvocation) -> Result<RpcResult> {
        let attempt = async {
            let invokers = self.support.list(&invocation)?;
            let invoker = self.support.select(&invocation, &invokers, &[])?;
            invoker.invoke(invocation.clone()).await
        };
        match attempt.await {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!(
                    "failsafe ignoring failure of {}.{}: {}",
                    self.support.url().service_key(),
                    invocation.method(),
                    e
                );
                Ok(RpcResult::null())
            }
        }
    }

    fn destroy(&self) {
        self.support.destroy();
    }
}

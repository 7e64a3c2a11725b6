//! First-available policy

use crate::cluster::{Cluster, ClusterSupport};
use crate::directory::Directory;
use crate::loadbalance::LoadBalanceRegistry;
use async_trait::async_trait;
use mizzen_core::{Error, Result, Url};
use mizzen_rpc::{Invoker, RpcInvocation, RpcResult};
use std::sync::Arc;

/// No balancing at all: the first invoker reporting itself available takes
/// the call
pub struct AvailableCluster {
    load_balances: Arc<LoadBalanceRegistry>,
}

impl AvailableCluster {
    pub fn new(load_balances: Arc<LoadBalanceRegistry>) -> Self {
        Self { load_balances }
    }
}

impl Cluster for AvailableCluster {
    fn name(&self) -> &'static str {
        "available"
    }

    fn join(&self, directory: Arc<dyn Directory>) -> Arc<dyn Invoker> {
        Arc::new(AvailableClusterInvoker {
            support: ClusterSupport::new(directory, self.load_balances.clone()),
        })
    }
}

struct AvailableClusterInvoker {
    support: ClusterSupport,
}

#[async_trait]
impl Invoker for AvailableClusterInvoker {
    fn url(&self) -> &Url {
        self.support.url()
    }

    fn is_available(&self) -> bool {
        self.support.is_available()
    }

    async fn invoke(&self, invocation: RpcInvocation) -> Result<RpcResult> {
        let invokers = self.support.list(&invocation)?;
        for invoker in &invokers {
            if invoker.is_available() {
                return invoker.invoke(invocation).await;
            }
        }
        Err(Error::Forbidden(format!(
            "no available provider for {}",
            self.support.url().service_key()
        )))
    }

    fn destroy(&self) {
        self.support.destroy();
    }
}

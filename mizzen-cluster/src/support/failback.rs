//! Fail-and-retry-in-background policy

use crate::cluster::{Cluster, ClusterSupport};
use crate::directory::Directory;
use crate::loadbalance::LoadBalanceRegistry;
use async_trait::async_trait;
use mizzen_core::constants::DEFAULT_FAILBACK_PERIOD_MS;
use mizzen_core::{Result, Url};
use mizzen_rpc::{Invoker, RpcInvocation, RpcResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const MAX_BACKGROUND_ATTEMPTS: u32 = 3;

/// One attempt; on failure the call is acknowledged with an empty result
/// and replayed in the background at a fixed period, for best-effort
/// notification style traffic
pub struct FailbackCluster {
    load_balances: Arc<LoadBalanceRegistry>,
}

impl FailbackCluster {
    pub fn new(load_balances: Arc<LoadBalanceRegistry>) -> Self {
        Self { load_balances }
    }
}

impl Cluster for FailbackCluster {
    fn name(&self) -> &'static str {
        "failback"
    }

    fn join(&self, directory: Arc<dyn Directory>) -> Arc<dyn Invoker> {
        Arc::new(FailbackClusterInvoker {
            support: Arc::new(ClusterSupport::new(directory, self.load_balances.clone())),
            pending_retries: Arc::new(AtomicUsize::new(0)),
            retry_period: Duration::from_millis(DEFAULT_FAILBACK_PERIOD_MS),
        })
    }
}

struct FailbackClusterInvoker {
    support: Arc<ClusterSupport>,
    pending_retries: Arc<AtomicUsize>,
    retry_period: Duration,
}

impl FailbackClusterInvoker {
    fn schedule_retry(&self, invocation: RpcInvocation) {
        let support = self.support.clone();
        let pending = self.pending_retries.clone();
        let period = self.retry_period;
        pending.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            for attempt in 1..=MAX_BACKGROUND_ATTEMPTS {
                tokio::time::sleep(period).await;
                if support.check_destroyed().is_err() {
                    break;
                }
                let outcome = async {
                    let invokers = support.list(&invocation)?;
                    let invoker = support.select(&invocation, &invokers, &[])?;
                    invoker.invoke(invocation.clone()).await
                }
                .await;
                match outcome {
                    Ok(_) => {
                        info!(
                            "failback retry {} of {}.{} succeeded",
                            attempt,
                            support.url().service_key(),
                            invocation.method()
                        );
                        break;
                    }
                    Err(e) => warn!(
                        "failback retry {} of {}.{} failed: {}",
                        attempt,
                        support.url().service_key(),
                        invocation.method(),
                        e
                    ),
                }
            }
            pending.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

#[async_trait]
impl Invoker for FailbackClusterInvoker {
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
                    "failback acknowledging failed {}.{}, will replay: {}",
                    self.support.url().service_key(),
                    invocation.method(),
                    e
                );
                self.schedule_retry(invocation);
                Ok(RpcResult::null())
            }
        }
    }

    fn destroy(&self) {
        self.support.destroy();
    }
}

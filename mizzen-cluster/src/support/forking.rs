//! Parallel fan-out policy

use crate::cluster::{Cluster, ClusterSupport};
use crate::directory::Directory;
use crate::loadbalance::LoadBalanceRegistry;
use async_trait::async_trait;
use mizzen_core::constants::{DEFAULT_FORKS, FORKS_KEY};
use mizzen_core::{Error, Result, Url};
use mizzen_rpc::{Invoker, RpcInvocation, RpcResult};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Invoke `forks` providers at once and complete with the first success;
/// only when every branch fails does the last failure surface. Trades
/// provider load for tail latency.
pub struct ForkingCluster {
    load_balances: Arc<LoadBalanceRegistry>,
}

impl ForkingCluster {
    pub fn new(load_balances: Arc<LoadBalanceRegistry>) -> Self {
        Self { load_balances }
    }
}

impl Cluster for ForkingCluster {
    fn name(&self) -> &'static str {
        "forking"
    }

    fn join(&self, directory: Arc<dyn Directory>) -> Arc<dyn Invoker> {
        Arc::new(ForkingClusterInvoker {
            support: ClusterSupport::new(directory, self.load_balances.clone()),
        })
    }
}

struct ForkingClusterInvoker {
    support: ClusterSupport,
}

#[async_trait]
impl Invoker for ForkingClusterInvoker {
    fn url(&self) -> &Url {
        self.support.url()
    }

    fn is_available(&self) -> bool {
        self.support.is_available()
    }

    async fn invoke(&self, invocation: RpcInvocation) -> Result<RpcResult> {
        let invokers = self.support.list(&invocation)?;
        let forks = self.support.url().param_u32(FORKS_KEY, DEFAULT_FORKS) as usize;

        let targets: Vec<Arc<dyn Invoker>> = if forks == 0 || forks >= invokers.len() {
            invokers
        } else {
            let mut picked: Vec<Arc<dyn Invoker>> = Vec::with_capacity(forks);
            for _ in 0..forks {
                let invoker = self.support.select(&invocation, &invokers, &picked)?;
                picked.push(invoker);
            }
            picked
        };

        let (tx, mut rx) = mpsc::channel::<Result<RpcResult>>(targets.len());
        for target in &targets {
            let target = target.clone();
            let invocation = invocation.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                tx.send(target.invoke(invocation).await).await.ok();
            });
        }
        drop(tx);

        let mut last_error = None;
        for _ in 0..targets.len() {
            match rx.recv().await {
                Some(Ok(result)) => return Ok(result),
                Some(Err(e)) => last_error = Some(e),
                None => break,
            }
        }
        Err(last_error.unwrap_or_else(|| {
            Error::Forbidden(format!(
                "no provider available to fork for {}",
                self.support.url().service_key()
            ))
        }))
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
    use std::time::Duration;

    struct Timed {
        url: Url,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl Invoker for Timed {
        fn url(&self) -> &Url {
            &self.url
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn invoke(&self, _invocation: RpcInvocation) -> Result<RpcResult> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                Err(Error::Network(format!("{} is down", self.url.host())))
            } else {
                Ok(RpcResult::value(self.url.host().as_bytes().to_vec()))
            }
        }

        fn destroy(&self) {}
    }

    fn timed(host: &str, delay_ms: u64, fail: bool) -> Arc<dyn Invoker> {
        Arc::new(Timed {
            url: Url::new("mizzen", host, 20880, "org.demo.Fork"),
            delay: Duration::from_millis(delay_ms),
            fail,
        })
    }

    fn join(invokers: Vec<Arc<dyn Invoker>>, forks: u32) -> Arc<dyn Invoker> {
        let cluster = ForkingCluster::new(loadbalance::builtin_registry());
        let url = Url::new("consumer", "127.0.0.1", 0, "org.demo.Fork")
            .with_param(FORKS_KEY, forks);
        cluster.join(Arc::new(StaticDirectory::new(url, invokers)))
    }

    #[tokio::test]
    async fn first_success_wins() {
        let invoker = join(
            vec![timed("10.0.0.1", 200, false), timed("10.0.0.2", 10, false)],
            2,
        );
        let started = std::time::Instant::now();
        let result = invoker.invoke(RpcInvocation::new("m")).await.unwrap();
        assert_eq!(result.get_value(), Some("10.0.0.2".as_bytes()));
        assert!(started.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn one_failing_branch_does_not_fail_the_call() {
        let invoker = join(
            vec![timed("10.0.0.1", 5, true), timed("10.0.0.2", 30, false)],
            2,
        );
        let result = invoker.invoke(RpcInvocation::new("m")).await.unwrap();
        assert_eq!(result.get_value(), Some("10.0.0.2".as_bytes()));
    }

    #[tokio::test]
    async fn all_branches_failing_surfaces_last_error() {
        let invoker = join(
            vec![timed("10.0.0.1", 5, true), timed("10.0.0.2", 10, true)],
            2,
        );
        let err = invoker.invoke(RpcInvocation::new("m")).await.unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }
}

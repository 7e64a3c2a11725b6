//! Cluster policies: a directory wrapped as one composite invoker

use crate::directory::Directory;
use crate::loadbalance::{LoadBalance, LoadBalanceRegistry};
use crate::support;
use mizzen_core::constants::{LOADBALANCE_KEY, STICKY_KEY};
use mizzen_core::extension::ExtensionRegistry;
use mizzen_core::{Error, Result, Url};
use mizzen_rpc::{Invoker, RpcInvocation};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Wraps a directory into a single invoker applying one failure policy
pub trait Cluster: Send + Sync {
    fn name(&self) -> &'static str;

    fn join(&self, directory: Arc<dyn Directory>) -> Arc<dyn Invoker>;
}

/// Registry type for clusters
pub type ClusterRegistry = ExtensionRegistry<dyn Cluster>;

/// A fresh registry with the built-in policies, defaulting to `failover`
pub fn builtin_registry(load_balances: Arc<LoadBalanceRegistry>) -> Arc<ClusterRegistry> {
    let registry = Arc::new(ClusterRegistry::with_default("Cluster", "failover"));
    macro_rules! register {
        ($name:literal, $ty:ty) => {
            let lb = load_balances.clone();
            registry.register($name, move || Arc::new(<$ty>::new(lb.clone())));
        };
    }
    register!("failover", support::FailoverCluster);
    register!("failfast", support::FailfastCluster);
    register!("failsafe", support::FailsafeCluster);
    register!("failback", support::FailbackCluster);
    register!("forking", support::ForkingCluster);
    register!("broadcast", support::BroadcastCluster);
    register!("available", support::AvailableCluster);
    registry
}

/// Selection state shared by every cluster invoker: directory access,
/// load-balancer resolution, sticky bookkeeping, and reselection that
/// avoids already-tried candidates
pub struct ClusterSupport {
    directory: Arc<dyn Directory>,
    url: Url,
    load_balances: Arc<LoadBalanceRegistry>,
    sticky_invoker: Mutex<Option<Arc<dyn Invoker>>>,
    destroyed: AtomicBool,
}

impl ClusterSupport {
    pub fn new(directory: Arc<dyn Directory>, load_balances: Arc<LoadBalanceRegistry>) -> Self {
        let url = directory.url().clone();
        Self {
            directory,
            url,
            load_balances,
            sticky_invoker: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub fn check_destroyed(&self) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Destroyed(format!(
                "cluster invoker for {}",
                self.url.service_key()
            )));
        }
        Ok(())
    }

    pub fn is_available(&self) -> bool {
        !self.destroyed.load(Ordering::SeqCst) && self.directory.is_available()
    }

    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sticky_invoker.lock().take();
        self.directory.destroy();
    }

    /// Candidate invokers for this invocation
    pub fn list(&self, invocation: &RpcInvocation) -> Result<Vec<Arc<dyn Invoker>>> {
        self.check_destroyed()?;
        let invokers = self.directory.list(invocation)?;
        if invokers.is_empty() {
            return Err(Error::Forbidden(format!(
                "no provider available for {} after routing",
                self.url.service_key()
            )));
        }
        Ok(invokers)
    }

    /// Pick one invoker, honoring stickiness and avoiding `excluded`
    /// (already-tried) candidates where possible
    pub fn select(
        &self,
        invocation: &RpcInvocation,
        invokers: &[Arc<dyn Invoker>],
        excluded: &[Arc<dyn Invoker>],
    ) -> Result<Arc<dyn Invoker>> {
        if invokers.is_empty() {
            return Err(Error::Forbidden(format!(
                "no provider available for {}",
                self.url.service_key()
            )));
        }
        let method = invocation.method();
        let sticky = self.url.method_param_bool(method, STICKY_KEY, false);
        if sticky {
            let held = self.sticky_invoker.lock().clone();
            if let Some(held) = held {
                let still_listed = invokers.iter().any(|i| Arc::ptr_eq(i, &held));
                let tried = excluded.iter().any(|i| Arc::ptr_eq(i, &held));
                if still_listed && !tried && held.is_available() {
                    return Ok(held);
                }
            }
        }

        let balancer = self
            .load_balances
            .get(self.url.method_param(method, LOADBALANCE_KEY).unwrap_or("random"))?;

        let untried: Vec<Arc<dyn Invoker>> = invokers
            .iter()
            .filter(|i| !excluded.iter().any(|e| Arc::ptr_eq(e, i)))
            .cloned()
            .collect();
        // every candidate already failed once: reselect across the full list
        let pool = if untried.is_empty() { invokers } else { &untried[..] };
        let picked = balancer.select(pool, &self.url, invocation)?;

        if sticky {
            *self.sticky_invoker.lock() = Some(picked.clone());
        }
        Ok(picked)
    }
}

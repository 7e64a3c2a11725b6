//! Per-endpoint invocation counters
//!
//! One [`RpcStatus`] exists per (url, method); the least-active load
//! balancer and the limiting filters read these counters, and the monitor
//! filter drives them around every call.

use dashmap::DashMap;
use mizzen_core::Url;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

static METHOD_STATUS: Lazy<DashMap<String, Arc<RpcStatus>>> = Lazy::new(DashMap::new);

/// Atomic counters for one (url, method) pair
#[derive(Debug, Default)]
pub struct RpcStatus {
    active: AtomicU32,
    total: AtomicU64,
    failed: AtomicU64,
    succeeded_elapsed: AtomicU64,
    failed_elapsed: AtomicU64,
}

impl RpcStatus {
    /// Counters for a (url, method) pair, created on first touch
    pub fn of(url: &Url, method: &str) -> Arc<RpcStatus> {
        let key = format!("{}#{}", url.address_key(), method);
        METHOD_STATUS.entry(key).or_default().clone()
    }

    /// Forget counters for an endpoint, e.g. when its invoker is destroyed
    pub fn remove(url: &Url, method: &str) {
        let key = format!("{}#{}", url.address_key(), method);
        METHOD_STATUS.remove(&key);
    }

    pub fn begin_count(url: &Url, method: &str) -> Arc<RpcStatus> {
        let status = Self::of(url, method);
        status.active.fetch_add(1, Ordering::SeqCst);
        status
    }

    pub fn end_count(&self, elapsed: Duration, succeeded: bool) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::Relaxed);
        let elapsed_ms = elapsed.as_millis() as u64;
        if succeeded {
            self.succeeded_elapsed.fetch_add(elapsed_ms, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
            self.failed_elapsed.fetch_add(elapsed_ms, Ordering::Relaxed);
        }
    }

    pub fn active(&self) -> u32 {
        self.active.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn succeeded_elapsed(&self) -> u64 {
        self.succeeded_elapsed.load(Ordering::Relaxed)
    }

    pub fn failed_elapsed(&self) -> u64 {
        self.failed_elapsed.load(Ordering::Relaxed)
    }
}

trait AddressKey {
    fn address_key(&self) -> String;
}

impl AddressKey for Url {
    fn address_key(&self) -> String {
        format!("{}://{}/{}", self.protocol(), self.address(), self.path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(port: u16) -> Url {
        Url::new("mizzen", "127.0.0.1", port, "org.demo.Status")
    }

    #[test]
    fn begin_end_updates_counters() {
        let url = url(7101);
        let status = RpcStatus::begin_count(&url, "m");
        assert_eq!(status.active(), 1);
        status.end_count(Duration::from_millis(5), true);
        assert_eq!(status.active(), 0);
        assert_eq!(status.total(), 1);
        assert_eq!(status.failed(), 0);
        assert!(status.succeeded_elapsed() >= 5);
    }

    #[test]
    fn failures_tracked_separately() {
        let url = url(7102);
        let status = RpcStatus::begin_count(&url, "m");
        status.end_count(Duration::from_millis(3), false);
        assert_eq!(status.failed(), 1);
        assert!(status.failed_elapsed() >= 3);
    }

    #[test]
    fn same_pair_shares_counters() {
        let url = url(7103);
        let a = RpcStatus::of(&url, "m");
        let b = RpcStatus::of(&url, "m");
        assert!(Arc::ptr_eq(&a, &b));
        let other = RpcStatus::of(&url, "n");
        assert!(!Arc::ptr_eq(&a, &other));
    }
}

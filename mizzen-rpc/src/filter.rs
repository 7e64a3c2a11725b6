//! Invocation interceptors
//!
//! A filter wraps one side of an invoker; the chain for an endpoint is
//! assembled from the filter registry's activate metadata plus the URL's
//! filter list, outermost first.

use crate::invocation::{RpcInvocation, RpcResult};
use crate::invoker::Invoker;
use async_trait::async_trait;
use mizzen_core::extension::ExtensionRegistry;
use mizzen_core::{Result, Url};
use std::sync::Arc;

/// One interceptor in an invocation chain. Filters may short-circuit,
/// rewrite the invocation, or post-process the result.
#[async_trait]
pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn invoke(
        &self,
        next: &Arc<dyn Invoker>,
        invocation: RpcInvocation,
    ) -> Result<RpcResult>;
}

/// Registry type for filters
pub type FilterRegistry = ExtensionRegistry<dyn Filter>;

struct FilterInvoker {
    filter: Arc<dyn Filter>,
    next: Arc<dyn Invoker>,
}

#[async_trait]
impl Invoker for FilterInvoker {
    fn url(&self) -> &Url {
        self.next.url()
    }

    fn is_available(&self) -> bool {
        self.next.is_available()
    }

    async fn invoke(&self, invocation: RpcInvocation) -> Result<RpcResult> {
        self.filter.invoke(&self.next, invocation).await
    }

    fn destroy(&self) {
        self.next.destroy();
    }
}

/// Wrap `invoker` so a call traverses `filters` front to back before
/// reaching it
pub fn build_filter_chain(
    invoker: Arc<dyn Invoker>,
    filters: &[Arc<dyn Filter>],
) -> Arc<dyn Invoker> {
    let mut chain = invoker;
    for filter in filters.iter().rev() {
        chain = Arc::new(FilterInvoker { filter: filter.clone(), next: chain });
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use mizzen_core::Error;
    use parking_lot::Mutex;

    struct Recorder {
        label: &'static str,
        seen: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Filter for Recorder {
        fn name(&self) -> &'static str {
            self.label
        }

        async fn invoke(
            &self,
            next: &Arc<dyn Invoker>,
            invocation: RpcInvocation,
        ) -> Result<RpcResult> {
            self.seen.lock().push(self.label);
            next.invoke(invocation).await
        }
    }

    struct Terminal {
        url: Url,
    }

    #[async_trait]
    impl Invoker for Terminal {
        fn url(&self) -> &Url {
            &self.url
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn invoke(&self, _invocation: RpcInvocation) -> Result<RpcResult> {
            Ok(RpcResult::value(vec![1]))
        }

        fn destroy(&self) {}
    }

    struct ShortCircuit;

    #[async_trait]
    impl Filter for ShortCircuit {
        fn name(&self) -> &'static str {
            "short"
        }

        async fn invoke(
            &self,
            _next: &Arc<dyn Invoker>,
            _invocation: RpcInvocation,
        ) -> Result<RpcResult> {
            Err(Error::Forbidden("stopped".into()))
        }
    }

    #[tokio::test]
    async fn filters_run_in_declared_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let terminal: Arc<dyn Invoker> =
            Arc::new(Terminal { url: Url::new("mizzen", "h", 1, "s") });
        let chain = build_filter_chain(
            terminal,
            &[
                Arc::new(Recorder { label: "outer", seen: seen.clone() }) as Arc<dyn Filter>,
                Arc::new(Recorder { label: "inner", seen: seen.clone() }) as Arc<dyn Filter>,
            ],
        );
        chain.invoke(RpcInvocation::new("m")).await.unwrap();
        assert_eq!(*seen.lock(), vec!["outer", "inner"]);
    }

    #[tokio::test]
    async fn short_circuit_skips_the_rest() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let terminal: Arc<dyn Invoker> =
            Arc::new(Terminal { url: Url::new("mizzen", "h", 1, "s") });
        let chain = build_filter_chain(
            terminal,
            &[
                Arc::new(ShortCircuit) as Arc<dyn Filter>,
                Arc::new(Recorder { label: "never", seen: seen.clone() }) as Arc<dyn Filter>,
            ],
        );
        assert!(chain.invoke(RpcInvocation::new("m")).await.is_err());
        assert!(seen.lock().is_empty());
    }
}

//! Provider-side token validation

use crate::filter::Filter;
use crate::invocation::{RpcInvocation, RpcResult};
use crate::invoker::Invoker;
use async_trait::async_trait;
use mizzen_core::constants::TOKEN_KEY;
use mizzen_core::{Error, Result};
use std::sync::Arc;

/// Rejects calls whose `token` attachment does not match the token the
/// provider registered with. Consumers obtain the token from the provider
/// URL at the registry, so direct connections without it are refused.
pub struct TokenFilter;

#[async_trait]
impl Filter for TokenFilter {
    fn name(&self) -> &'static str {
        "token"
    }

    async fn invoke(
        &self,
        next: &Arc<dyn Invoker>,
        invocation: RpcInvocation,
    ) -> Result<RpcResult> {
        if let Some(expected) = next.url().param(TOKEN_KEY) {
            let presented = invocation.attachment(TOKEN_KEY);
            if presented != Some(expected) {
                return Err(Error::Forbidden(format!(
                    "invalid token for {}.{}",
                    next.url().service_key(),
                    invocation.method()
                )));
            }
        }
        next.invoke(invocation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::build_filter_chain;
    use mizzen_core::Url;

    struct Always(Url);

    #[async_trait]
    impl Invoker for Always {
        fn url(&self) -> &Url {
            &self.0
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn invoke(&self, _invocation: RpcInvocation) -> Result<RpcResult> {
            Ok(RpcResult::null())
        }

        fn destroy(&self) {}
    }

    #[tokio::test]
    async fn matching_token_passes() {
        let url = Url::new("mizzen", "h", 1, "s").with_param(TOKEN_KEY, "tk");
        let chain = build_filter_chain(
            Arc::new(Always(url)) as Arc<dyn Invoker>,
            &[Arc::new(TokenFilter)],
        );
        let invocation = RpcInvocation::new("m").with_attachment(TOKEN_KEY, "tk");
        chain.invoke(invocation).await.unwrap();
    }

    #[tokio::test]
    async fn missing_or_wrong_token_is_forbidden() {
        let url = Url::new("mizzen", "h", 1, "s").with_param(TOKEN_KEY, "tk");
        let chain = build_filter_chain(
            Arc::new(Always(url)) as Arc<dyn Invoker>,
            &[Arc::new(TokenFilter)],
        );
        let err = chain.invoke(RpcInvocation::new("m")).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        let invocation = RpcInvocation::new("m").with_attachment(TOKEN_KEY, "bad");
        let err = chain.invoke(invocation).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }
}

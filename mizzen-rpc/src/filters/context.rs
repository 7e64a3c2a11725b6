//! Attachment propagation at the consumer and provider edges

use crate::filter::Filter;
use crate::invocation::{RpcInvocation, RpcResult};
use crate::invoker::Invoker;
use async_trait::async_trait;
use mizzen_core::constants::{
    APPLICATION_KEY, FRAMEWORK_ATTACHMENT_KEYS, INTERFACE_ATTACHMENT_KEY,
};
use mizzen_core::Result;
use std::sync::Arc;

/// Consumer edge: stamp outbound invocations with caller identity taken
/// from the reference URL
pub struct ConsumerContextFilter;

#[async_trait]
impl Filter for ConsumerContextFilter {
    fn name(&self) -> &'static str {
        "consumercontext"
    }

    async fn invoke(
        &self,
        next: &Arc<dyn Invoker>,
        mut invocation: RpcInvocation,
    ) -> Result<RpcResult> {
        let url = next.url();
        if let Some(application) = url.param(APPLICATION_KEY) {
            invocation.set_attachment_if_absent(APPLICATION_KEY, application);
        }
        invocation.set_attachment_if_absent(INTERFACE_ATTACHMENT_KEY, url.service_interface());
        next.invoke(invocation).await
    }
}

/// Provider edge: strip framework routing attachments before the
/// invocation reaches the service implementation
pub struct ContextFilter;

#[async_trait]
impl Filter for ContextFilter {
    fn name(&self) -> &'static str {
        "context"
    }

    async fn invoke(
        &self,
        next: &Arc<dyn Invoker>,
        mut invocation: RpcInvocation,
    ) -> Result<RpcResult> {
        for key in FRAMEWORK_ATTACHMENT_KEYS {
            invocation.remove_attachment(key);
        }
        next.invoke(invocation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::build_filter_chain;
    use mizzen_core::constants::{PATH_ATTACHMENT_KEY, TOKEN_KEY};
    use mizzen_core::Url;
    use parking_lot::Mutex;

    struct Capture {
        url: Url,
        seen: Arc<Mutex<Option<RpcInvocation>>>,
    }

    #[async_trait]
    impl Invoker for Capture {
        fn url(&self) -> &Url {
            &self.url
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn invoke(&self, invocation: RpcInvocation) -> Result<RpcResult> {
            *self.seen.lock() = Some(invocation);
            Ok(RpcResult::null())
        }

        fn destroy(&self) {}
    }

    #[tokio::test]
    async fn consumer_context_stamps_identity() {
        let url = Url::new("mizzen", "127.0.0.1", 7501, "org.demo.Ctx")
            .with_param(APPLICATION_KEY, "shop");
        let seen = Arc::new(Mutex::new(None));
        let chain = build_filter_chain(
            Arc::new(Capture { url, seen: seen.clone() }) as Arc<dyn Invoker>,
            &[Arc::new(ConsumerContextFilter)],
        );
        chain.invoke(RpcInvocation::new("m")).await.unwrap();
        let invocation = seen.lock().take().unwrap();
        assert_eq!(invocation.attachment(APPLICATION_KEY), Some("shop"));
        assert_eq!(invocation.attachment(INTERFACE_ATTACHMENT_KEY), Some("org.demo.Ctx"));
    }

    #[tokio::test]
    async fn provider_context_strips_framework_keys() {
        let url = Url::new("mizzen", "127.0.0.1", 7502, "org.demo.Ctx");
        let seen = Arc::new(Mutex::new(None));
        let chain = build_filter_chain(
            Arc::new(Capture { url, seen: seen.clone() }) as Arc<dyn Invoker>,
            &[Arc::new(ContextFilter)],
        );
        let invocation = RpcInvocation::new("m")
            .with_attachment(PATH_ATTACHMENT_KEY, "org.demo.Ctx")
            .with_attachment(TOKEN_KEY, "secret")
            .with_attachment("user", "alice");
        chain.invoke(invocation).await.unwrap();
        let invocation = seen.lock().take().unwrap();
        assert!(invocation.attachment(PATH_ATTACHMENT_KEY).is_none());
        assert!(invocation.attachment(TOKEN_KEY).is_none());
        assert_eq!(invocation.attachment("user"), Some("alice"));
    }
}

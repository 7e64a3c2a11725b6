//! The invoker capability

use crate::invocation::{RpcInvocation, RpcResult};
use async_trait::async_trait;
use mizzen_core::{Result, Url};
use std::sync::Arc;

/// A callable endpoint, local or remote.
///
/// Invokers are owned by the component that created them (a protocol, a
/// cluster, a filter wrapper); `destroy` is idempotent and cascades through
/// wrappers, and invoking a destroyed invoker returns a permanent error.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// The URL this invoker was created from
    fn url(&self) -> &Url;

    /// Interface name this invoker serves
    fn interface(&self) -> &str {
        self.url().service_interface()
    }

    fn is_available(&self) -> bool;

    async fn invoke(&self, invocation: RpcInvocation) -> Result<RpcResult>;

    fn destroy(&self);
}

impl std::fmt::Debug for dyn Invoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invoker").field("url", self.url()).finish()
    }
}

/// Lifetime handle for an exported service; destroy to unexport
pub trait Exporter: Send + Sync {
    fn invoker(&self) -> Arc<dyn Invoker>;

    fn unexport(&self);
}

/// Notified when an invoker is referred or destroyed
pub trait InvokerListener: Send + Sync {
    fn referred(&self, _invoker: &Arc<dyn Invoker>) {}
    fn destroyed(&self, _invoker: &Arc<dyn Invoker>) {}
}

/// Notified when an exporter is created or unexported
pub trait ExporterListener: Send + Sync {
    fn exported(&self, _exporter: &Arc<dyn Exporter>) {}
    fn unexported(&self, _exporter: &Arc<dyn Exporter>) {}
}

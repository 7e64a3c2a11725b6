//! # Mizzen RPC
//!
//! The invocation pipeline of the Mizzen framework: invokers and
//! invocations, protocol export/refer, the filter chain, typed proxies, and
//! per-endpoint call statistics.

pub mod filter;
pub mod filters;
pub mod invocation;
pub mod invoker;
pub mod protocol;
pub mod proxy;
pub mod status;

pub use filter::{build_filter_chain, Filter, FilterRegistry};
pub use invocation::{RpcInvocation, RpcResult};
pub use invoker::{Exporter, ExporterListener, Invoker, InvokerListener};
pub use protocol::{
    InjvmProtocol, MizzenProtocol, Protocol, ProtocolFilterWrapper, ProtocolListenerWrapper,
    ProtocolRegistry, RequestPayload, ResponsePayload,
};
pub use proxy::{service_invoker, LocalService, MethodHandler, ServiceProxy, TypedHandler};
pub use status::RpcStatus;

#[cfg(test)]
pub(crate) fn test_invocation<T: serde::Serialize>(method: &str, argument: &T) -> RpcInvocation {
    let bytes = mizzen_net::SerializationFormat::default()
        .serialize(argument)
        .unwrap();
    RpcInvocation::new(method).with_arguments(vec![bytes])
}

//! Interface-to-invoker and invoker-to-interface adaptation
//!
//! [`ServiceProxy`] is the typed client stub: it encodes arguments, builds
//! invocations, and turns result exceptions back into errors.
//! [`LocalService`] is the inverse, a method table dispatching inbound
//! invocations onto handler functions; both keep a raw byte path open for
//! generic callers.

use crate::invocation::{RpcInvocation, RpcResult};
use crate::invoker::Invoker;
use async_trait::async_trait;
use mizzen_core::constants::{ONEWAY_KEY, SERIALIZATION_KEY};
use mizzen_core::{Error, Result, Url};
use mizzen_net::SerializationFormat;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn format_of(url: &Url) -> SerializationFormat {
    url.param(SERIALIZATION_KEY)
        .and_then(|name| SerializationFormat::from_name(name).ok())
        .unwrap_or_default()
}

/// Typed client stub over an invoker
#[derive(Clone)]
pub struct ServiceProxy {
    invoker: Arc<dyn Invoker>,
    format: SerializationFormat,
}

impl std::fmt::Debug for ServiceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProxy")
            .field("url", self.invoker.url())
            .field("format", &self.format)
            .finish()
    }
}

impl ServiceProxy {
    pub fn new(invoker: Arc<dyn Invoker>) -> Self {
        let format = format_of(invoker.url());
        Self { invoker, format }
    }

    pub fn invoker(&self) -> &Arc<dyn Invoker> {
        &self.invoker
    }

    pub fn is_available(&self) -> bool {
        self.invoker.is_available()
    }

    pub fn destroy(&self) {
        self.invoker.destroy();
    }

    fn encode_args<Req: Serialize>(&self, request: &Req) -> Result<Vec<Vec<u8>>> {
        Ok(vec![self.format.serialize(request)?])
    }

    /// Call a single-argument method and decode its return value
    pub async fn call<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let invocation = RpcInvocation::new(method).with_arguments(self.encode_args(request)?);
        match self.invoker.invoke(invocation).await?.recreate()? {
            Some(value) => self.format.deserialize(&value),
            None => Err(Error::Serialization(format!(
                "method '{}' returned null where a value was expected",
                method
            ))),
        }
    }

    /// Call a method whose return value is discarded
    pub async fn call_void<Req: Serialize>(&self, method: &str, request: &Req) -> Result<()> {
        let invocation = RpcInvocation::new(method).with_arguments(self.encode_args(request)?);
        self.invoker.invoke(invocation).await?.recreate()?;
        Ok(())
    }

    /// Fire-and-forget call: no response is awaited
    pub async fn call_oneway<Req: Serialize>(&self, method: &str, request: &Req) -> Result<()> {
        let invocation = RpcInvocation::new(method)
            .with_arguments(self.encode_args(request)?)
            .with_attachment(ONEWAY_KEY, true);
        self.invoker.invoke(invocation).await?;
        Ok(())
    }

    /// Generic path: pre-encoded arguments in, raw optional value out
    pub async fn call_raw(
        &self,
        invocation: RpcInvocation,
    ) -> Result<Option<Vec<u8>>> {
        self.invoker.invoke(invocation).await?.recreate()
    }
}

/// Handles one method of a local service
pub trait MethodHandler: Send + Sync {
    fn handle(
        &self,
        format: SerializationFormat,
        arguments: &[Vec<u8>],
    ) -> Result<Option<Vec<u8>>>;
}

/// Handler decoding one typed argument and encoding a typed return value.
/// Errors from the wrapped function surface as service exceptions.
pub struct TypedHandler<Req, Resp, F>
where
    F: Fn(Req) -> Result<Resp> + Send + Sync,
{
    handler: F,
    _phantom: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp, F> TypedHandler<Req, Resp, F>
where
    F: Fn(Req) -> Result<Resp> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self { handler, _phantom: PhantomData }
    }
}

impl<Req, Resp, F> MethodHandler for TypedHandler<Req, Resp, F>
where
    Req: DeserializeOwned,
    Resp: Serialize,
    F: Fn(Req) -> Result<Resp> + Send + Sync,
{
    fn handle(
        &self,
        format: SerializationFormat,
        arguments: &[Vec<u8>],
    ) -> Result<Option<Vec<u8>>> {
        let first = arguments
            .first()
            .ok_or_else(|| Error::Serialization("missing argument".into()))?;
        let request: Req = format.deserialize(first)?;
        match (self.handler)(request) {
            Ok(response) => Ok(Some(format.serialize(&response)?)),
            // anything the implementation raises is a service exception
            Err(e) if e.is_biz() => Err(e),
            Err(e) => Err(Error::biz(e.to_string())),
        }
    }
}

/// Handler receiving raw argument bytes
pub struct RawHandler<F>
where
    F: Fn(&[Vec<u8>]) -> Result<Option<Vec<u8>>> + Send + Sync,
{
    handler: F,
}

impl<F> MethodHandler for RawHandler<F>
where
    F: Fn(&[Vec<u8>]) -> Result<Option<Vec<u8>>> + Send + Sync,
{
    fn handle(
        &self,
        _format: SerializationFormat,
        arguments: &[Vec<u8>],
    ) -> Result<Option<Vec<u8>>> {
        (self.handler)(arguments)
    }
}

/// Method table for one exported service implementation
#[derive(Clone)]
pub struct LocalService {
    interface: String,
    methods: HashMap<String, Arc<dyn MethodHandler>>,
}

impl LocalService {
    pub fn new(interface: &str) -> Self {
        Self { interface: interface.to_string(), methods: HashMap::new() }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn add_method(&mut self, name: &str, handler: Arc<dyn MethodHandler>) {
        self.methods.insert(name.to_string(), handler);
    }

    pub fn add_typed_method<Req, Resp, F>(&mut self, name: &str, handler: F)
    where
        Req: DeserializeOwned + 'static,
        Resp: Serialize + 'static,
        F: Fn(Req) -> Result<Resp> + Send + Sync + 'static,
    {
        self.add_method(name, Arc::new(TypedHandler::new(handler)));
    }

    pub fn add_raw_method<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&[Vec<u8>]) -> Result<Option<Vec<u8>>> + Send + Sync + 'static,
    {
        self.add_method(name, Arc::new(RawHandler { handler }));
    }

    pub fn method_names(&self) -> Vec<&str> {
        self.methods.keys().map(|s| s.as_str()).collect()
    }

    fn method(&self, name: &str) -> Option<&Arc<dyn MethodHandler>> {
        self.methods.get(name)
    }
}

struct LocalInvoker {
    service: LocalService,
    url: Url,
    format: SerializationFormat,
    destroyed: AtomicBool,
}

#[async_trait]
impl Invoker for LocalInvoker {
    fn url(&self) -> &Url {
        &self.url
    }

    fn is_available(&self) -> bool {
        !self.destroyed.load(Ordering::SeqCst)
    }

    async fn invoke(&self, invocation: RpcInvocation) -> Result<RpcResult> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Destroyed(format!(
                "service invoker for {}",
                self.service.interface
            )));
        }
        let Some(handler) = self.service.method(invocation.method()) else {
            return Err(Error::Unknown(format!(
                "no method '{}' on {}",
                invocation.method(),
                self.service.interface
            )));
        };
        match handler.handle(self.format, invocation.arguments()) {
            Ok(Some(value)) => Ok(RpcResult::value(value)),
            Ok(None) => Ok(RpcResult::null()),
            Err(e) if e.is_biz() => Ok(RpcResult::exception(e)),
            Err(e) => Err(e),
        }
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

/// Turn a [`LocalService`] into an invoker bound to `url`
pub fn service_invoker(service: LocalService, url: Url) -> Arc<dyn Invoker> {
    let format = format_of(&url);
    Arc::new(LocalInvoker { service, url, format, destroyed: AtomicBool::new(false) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calc_invoker() -> Arc<dyn Invoker> {
        let mut service = LocalService::new("org.demo.Calc");
        service.add_typed_method("double", |x: u32| Ok(x * 2));
        service.add_typed_method("reject", |_: u32| -> Result<u32> {
            Err(Error::biz("nope"))
        });
        service_invoker(service, Url::new("mizzen", "127.0.0.1", 7601, "org.demo.Calc"))
    }

    #[tokio::test]
    async fn typed_round_trip_through_proxy() {
        let proxy = ServiceProxy::new(calc_invoker());
        let out: u32 = proxy.call("double", &21u32).await.unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn result_exception_becomes_error() {
        let proxy = ServiceProxy::new(calc_invoker());
        let err = proxy.call::<u32, u32>("reject", &1).await.unwrap_err();
        assert!(err.is_biz());
    }

    #[tokio::test]
    async fn unknown_method_is_a_framework_error() {
        let invoker = calc_invoker();
        let err = invoker
            .invoke(crate::test_invocation("missing", &1u32))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unknown(_)));
    }

    #[tokio::test]
    async fn raw_method_dispatch() {
        let mut service = LocalService::new("org.demo.Raw");
        service.add_raw_method("first", |args| Ok(args.first().cloned()));
        let invoker = service_invoker(
            service,
            Url::new("mizzen", "127.0.0.1", 7602, "org.demo.Raw"),
        );
        let result = invoker
            .invoke(RpcInvocation::new("first").with_arguments(vec![vec![9, 9]]))
            .await
            .unwrap();
        assert_eq!(result.get_value(), Some(&[9u8, 9u8][..]));
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_permanent() {
        let invoker = calc_invoker();
        invoker.destroy();
        invoker.destroy();
        let err = invoker
            .invoke(crate::test_invocation("double", &1u32))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Destroyed(_)));
    }
}

//! Protocol implementations: binding services to transport and building
//! remote invokers
//!
//! `export` publishes a service-side invoker on a transport server shared
//! per `host:port`; `refer` produces a client-side invoker over a
//! connection shared the same way. Wrappers compose the filter chain and
//! lifecycle listeners around both directions.

use crate::filter::{build_filter_chain, Filter, FilterRegistry};
use crate::invocation::{RpcInvocation, RpcResult};
use crate::invoker::{Exporter, ExporterListener, Invoker, InvokerListener};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use mizzen_core::constants::{
    DEFAULT_TIMEOUT_MS, GROUP_KEY, ONEWAY_KEY, PATH_ATTACHMENT_KEY, REFERENCE_FILTER_KEY,
    REGISTRY_PROTOCOL, SERVICE_FILTER_KEY, SIDE_CONSUMER, SIDE_PROVIDER, TIMEOUT_KEY, TOKEN_KEY,
    VERSION_KEY, FRAMEWORK_VERSION,
};
use mizzen_core::{Error, Result, Url};
use mizzen_net::exchange::{
    ExchangeClient, ExchangeHandler, ExchangeReply, ExchangeRequest, ExchangeServer,
};
use mizzen_net::transport::Channel;
use mizzen_net::status;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Request body travelling after the frame header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPayload {
    pub framework: String,
    pub path: String,
    pub version: Option<String>,
    pub method: String,
    pub arguments: Vec<Vec<u8>>,
    pub attachments: BTreeMap<String, String>,
}

/// Response body variants; attachments ride along when present
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponsePayload {
    Exception { message: String, payload: Vec<u8> },
    Value(Vec<u8>),
    Null,
    ExceptionWithAttachments {
        message: String,
        payload: Vec<u8>,
        attachments: BTreeMap<String, String>,
    },
    ValueWithAttachments { value: Vec<u8>, attachments: BTreeMap<String, String> },
    NullWithAttachments { attachments: BTreeMap<String, String> },
}

impl ResponsePayload {
    fn from_result(result: &RpcResult) -> Self {
        let attachments = result.attachments().clone();
        match (result.get_exception(), result.get_value()) {
            (Some(e), _) => {
                let (message, payload) = match e {
                    Error::Biz { message, payload } => (message.clone(), payload.clone()),
                    other => (other.to_string(), Vec::new()),
                };
                if attachments.is_empty() {
                    ResponsePayload::Exception { message, payload }
                } else {
                    ResponsePayload::ExceptionWithAttachments { message, payload, attachments }
                }
            }
            (None, Some(value)) => {
                if attachments.is_empty() {
                    ResponsePayload::Value(value.to_vec())
                } else {
                    ResponsePayload::ValueWithAttachments { value: value.to_vec(), attachments }
                }
            }
            (None, None) => {
                if attachments.is_empty() {
                    ResponsePayload::Null
                } else {
                    ResponsePayload::NullWithAttachments { attachments }
                }
            }
        }
    }

    fn into_result(self) -> RpcResult {
        match self {
            ResponsePayload::Exception { message, payload } => {
                RpcResult::exception(Error::Biz { message, payload })
            }
            ResponsePayload::Value(value) => RpcResult::value(value),
            ResponsePayload::Null => RpcResult::null(),
            ResponsePayload::ExceptionWithAttachments { message, payload, attachments } => {
                RpcResult::exception(Error::Biz { message, payload }).with_attachments(attachments)
            }
            ResponsePayload::ValueWithAttachments { value, attachments } => {
                RpcResult::value(value).with_attachments(attachments)
            }
            ResponsePayload::NullWithAttachments { attachments } => {
                RpcResult::null().with_attachments(attachments)
            }
        }
    }
}

/// Binds service invokers to servers and builds remote invokers
#[async_trait]
pub trait Protocol: Send + Sync {
    fn name(&self) -> &'static str;

    /// Publish a service-side invoker; destroy the exporter to unexport
    async fn export(&self, invoker: Arc<dyn Invoker>) -> Result<Arc<dyn Exporter>>;

    /// Build a client-side invoker for the service addressed by `url`
    async fn refer(&self, url: &Url) -> Result<Arc<dyn Invoker>>;

    async fn destroy(&self);
}

/// Registry type for protocols
pub type ProtocolRegistry = mizzen_core::extension::ExtensionRegistry<dyn Protocol>;

fn payload_service_key(
    group: Option<&str>,
    path: &str,
    version: Option<&str>,
) -> String {
    let mut key = String::new();
    if let Some(group) = group {
        key.push_str(group);
        key.push('/');
    }
    key.push_str(path);
    if let Some(version) = version {
        key.push(':');
        key.push_str(version);
    }
    key
}

type ExportTable = Arc<DashMap<String, Arc<dyn Invoker>>>;

struct MizzenServerHandler {
    exports: ExportTable,
}

#[async_trait]
impl ExchangeHandler for MizzenServerHandler {
    async fn reply(&self, channel: Channel, request: ExchangeRequest) -> ExchangeReply {
        let payload: RequestPayload = match request.format.deserialize(&request.body) {
            Ok(p) => p,
            Err(e) => {
                return ExchangeReply::error(status::BAD_REQUEST, request.format, &e.to_string())
            }
        };

        let service_key = payload_service_key(
            payload.attachments.get(GROUP_KEY).map(|s| s.as_str()),
            &payload.path,
            payload.version.as_deref(),
        );
        let export_key = format!("{}:{}", service_key, channel.local_addr().port());
        let Some(invoker) = self.exports.get(&export_key).map(|e| e.value().clone()) else {
            return ExchangeReply::error(
                status::SERVICE_NOT_FOUND,
                request.format,
                &format!("no exported service matches {}", export_key),
            );
        };

        let mut invocation =
            RpcInvocation::new(&payload.method).with_arguments(payload.arguments);
        for (key, value) in payload.attachments {
            invocation.set_attachment(&key, value);
        }

        match invoker.invoke(invocation).await {
            Ok(result) => {
                let body = match request.format.serialize(&ResponsePayload::from_result(&result)) {
                    Ok(b) => b,
                    Err(e) => {
                        return ExchangeReply::error(
                            status::SERVER_ERROR,
                            request.format,
                            &e.to_string(),
                        )
                    }
                };
                ExchangeReply::ok(body.into())
            }
            Err(e) => {
                let code = match e.kind() {
                    mizzen_core::ErrorKind::Timeout => status::SERVER_TIMEOUT,
                    mizzen_core::ErrorKind::Forbidden => status::SERVICE_NOT_FOUND,
                    mizzen_core::ErrorKind::LimitExceeded => {
                        status::SERVER_THREADPOOL_EXHAUSTED
                    }
                    _ => status::SERVICE_ERROR,
                };
                ExchangeReply::error(code, request.format, &e.to_string())
            }
        }
    }
}

struct MizzenExporter {
    key: String,
    invoker: Arc<dyn Invoker>,
    exports: ExportTable,
    unexported: AtomicBool,
}

impl Exporter for MizzenExporter {
    fn invoker(&self) -> Arc<dyn Invoker> {
        self.invoker.clone()
    }

    fn unexport(&self) {
        if self.unexported.swap(true, Ordering::SeqCst) {
            return;
        }
        self.exports.remove(&self.key);
        self.invoker.destroy();
        info!("unexported {}", self.key);
    }
}

struct MizzenInvoker {
    url: Url,
    client: Arc<ExchangeClient>,
    destroyed: AtomicBool,
}

impl MizzenInvoker {
    fn build_payload(&self, invocation: &RpcInvocation) -> RequestPayload {
        let mut attachments = invocation.attachments().clone();
        attachments.insert(PATH_ATTACHMENT_KEY.to_string(), self.url.path().to_string());
        if let Some(group) = self.url.param(GROUP_KEY) {
            attachments.insert(GROUP_KEY.to_string(), group.to_string());
        }
        if let Some(token) = self.url.param(TOKEN_KEY) {
            attachments.insert(TOKEN_KEY.to_string(), token.to_string());
        }
        RequestPayload {
            framework: FRAMEWORK_VERSION.to_string(),
            path: self.url.path().to_string(),
            version: self.url.param(VERSION_KEY).map(|s| s.to_string()),
            method: invocation.method().to_string(),
            arguments: invocation.arguments().to_vec(),
            attachments,
        }
    }
}

#[async_trait]
impl Invoker for MizzenInvoker {
    fn url(&self) -> &Url {
        &self.url
    }

    fn is_available(&self) -> bool {
        !self.destroyed.load(Ordering::SeqCst) && self.client.is_connected()
    }

    async fn invoke(&self, invocation: RpcInvocation) -> Result<RpcResult> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Destroyed(format!(
                "invoker for {} has been destroyed",
                self.url.service_key()
            )));
        }
        let method = invocation.method().to_string();
        let timeout_ms = invocation
            .attachment(TIMEOUT_KEY)
            .and_then(|t| t.parse().ok())
            .unwrap_or_else(|| {
                self.url.method_param_u64(&method, TIMEOUT_KEY, DEFAULT_TIMEOUT_MS)
            });
        let oneway = invocation
            .attachment(ONEWAY_KEY)
            .map(|v| v == "true")
            .unwrap_or_else(|| self.url.method_param_bool(&method, ONEWAY_KEY, false));

        let payload = self.build_payload(&invocation);
        let body: Bytes = self.client.format().serialize(&payload)?.into();

        if oneway {
            self.client.oneway(body)?;
            return Ok(RpcResult::null());
        }

        let raw = self
            .client
            .request(body)?
            .wait(Duration::from_millis(timeout_ms))
            .await?;
        match raw.status {
            status::OK => {
                let payload: ResponsePayload = raw.format.deserialize(&raw.body)?;
                Ok(payload.into_result())
            }
            code => {
                let message: String = raw
                    .format
                    .deserialize(&raw.body)
                    .unwrap_or_else(|_| "no detail".to_string());
                Err(remote_error(code, &message))
            }
        }
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

fn remote_error(code: u8, message: &str) -> Error {
    match code {
        status::CLIENT_TIMEOUT | status::SERVER_TIMEOUT => {
            Error::Timeout(format!("remote status {}: {}", code, message))
        }
        status::SERVER_THREADPOOL_EXHAUSTED => {
            Error::LimitExceeded(format!("remote status {}: {}", code, message))
        }
        status::SERVICE_NOT_FOUND => {
            Error::Forbidden(format!("remote status {}: {}", code, message))
        }
        status::BAD_REQUEST | status::BAD_RESPONSE => {
            Error::Serialization(format!("remote status {}: {}", code, message))
        }
        _ => Error::Unknown(format!("remote status {}: {}", code, message)),
    }
}

/// The framework's own wire protocol: framed exchange over TCP
pub struct MizzenProtocol {
    servers: DashMap<String, Arc<ExchangeServer>>,
    clients: DashMap<String, Arc<ExchangeClient>>,
    exports: ExportTable,
    endpoint_lock: Mutex<()>,
    destroyed: AtomicBool,
}

impl MizzenProtocol {
    pub fn new() -> Self {
        Self {
            servers: DashMap::new(),
            clients: DashMap::new(),
            exports: Arc::new(DashMap::new()),
            endpoint_lock: Mutex::new(()),
            destroyed: AtomicBool::new(false),
        }
    }

    fn check_alive(&self) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Destroyed("mizzen protocol".into()));
        }
        Ok(())
    }

    async fn server_for(&self, url: &Url) -> Result<Arc<ExchangeServer>> {
        let address = url.address();
        if url.port() != 0 {
            if let Some(server) = self.servers.get(&address) {
                return Ok(server.value().clone());
            }
        }
        let _guard = self.endpoint_lock.lock().await;
        if url.port() != 0 {
            if let Some(server) = self.servers.get(&address) {
                return Ok(server.value().clone());
            }
        }
        let handler = Arc::new(MizzenServerHandler { exports: self.exports.clone() });
        let server = ExchangeServer::bind(url.clone(), handler).await?;
        let bound = format!("{}:{}", url.host(), server.local_addr().port());
        self.servers.insert(bound, server.clone());
        Ok(server)
    }

    async fn client_for(&self, url: &Url) -> Result<Arc<ExchangeClient>> {
        let address = url.address();
        if let Some(client) = self.clients.get(&address) {
            if client.is_connected() {
                return Ok(client.value().clone());
            }
        }
        let _guard = self.endpoint_lock.lock().await;
        if let Some(client) = self.clients.get(&address) {
            if client.is_connected() {
                return Ok(client.value().clone());
            }
        }
        let client = ExchangeClient::connect(url.clone()).await?;
        self.clients.insert(address, client.clone());
        Ok(client)
    }
}

impl Default for MizzenProtocol {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Protocol for MizzenProtocol {
    fn name(&self) -> &'static str {
        "mizzen"
    }

    async fn export(&self, invoker: Arc<dyn Invoker>) -> Result<Arc<dyn Exporter>> {
        self.check_alive()?;
        let url = invoker.url().clone();
        let server = self.server_for(&url).await?;
        let key = format!("{}:{}", url.service_key(), server.local_addr().port());
        self.exports.insert(key.clone(), invoker.clone());
        info!("exported {} on {}", key, server.local_addr());
        Ok(Arc::new(MizzenExporter {
            key,
            invoker,
            exports: self.exports.clone(),
            unexported: AtomicBool::new(false),
        }))
    }

    async fn refer(&self, url: &Url) -> Result<Arc<dyn Invoker>> {
        self.check_alive()?;
        let client = self.client_for(url).await?;
        debug!("referred {} at {}", url.service_key(), url.address());
        Ok(Arc::new(MizzenInvoker {
            url: url.clone(),
            client,
            destroyed: AtomicBool::new(false),
        }))
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        for entry in self.exports.iter() {
            entry.value().destroy();
        }
        self.exports.clear();
        for entry in self.servers.iter() {
            entry.value().close();
        }
        self.servers.clear();
        for entry in self.clients.iter() {
            entry.value().close();
        }
        self.clients.clear();
        info!("mizzen protocol destroyed");
    }
}

/// In-process protocol for services consumed inside the exporting process
pub struct InjvmProtocol {
    exports: ExportTable,
    destroyed: AtomicBool,
}

impl InjvmProtocol {
    pub fn new() -> Self {
        Self { exports: Arc::new(DashMap::new()), destroyed: AtomicBool::new(false) }
    }
}

impl Default for InjvmProtocol {
    fn default() -> Self {
        Self::new()
    }
}

struct InjvmInvoker {
    url: Url,
    key: String,
    exports: ExportTable,
    destroyed: AtomicBool,
}

#[async_trait]
impl Invoker for InjvmInvoker {
    fn url(&self) -> &Url {
        &self.url
    }

    fn is_available(&self) -> bool {
        !self.destroyed.load(Ordering::SeqCst) && self.exports.contains_key(&self.key)
    }

    async fn invoke(&self, invocation: RpcInvocation) -> Result<RpcResult> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Destroyed(format!(
                "in-process invoker for {}",
                self.key
            )));
        }
        // late binding: the provider may export after this refer
        let Some(target) = self.exports.get(&self.key).map(|e| e.value().clone()) else {
            return Err(Error::Forbidden(format!(
                "no in-process provider for {}",
                self.key
            )));
        };
        target.invoke(invocation).await
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Protocol for InjvmProtocol {
    fn name(&self) -> &'static str {
        "injvm"
    }

    async fn export(&self, invoker: Arc<dyn Invoker>) -> Result<Arc<dyn Exporter>> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Destroyed("injvm protocol".into()));
        }
        let key = invoker.url().service_key().to_string();
        self.exports.insert(key.clone(), invoker.clone());
        Ok(Arc::new(MizzenExporter {
            key,
            invoker,
            exports: self.exports.clone(),
            unexported: AtomicBool::new(false),
        }))
    }

    async fn refer(&self, url: &Url) -> Result<Arc<dyn Invoker>> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Destroyed("injvm protocol".into()));
        }
        Ok(Arc::new(InjvmInvoker {
            key: url.service_key().to_string(),
            url: url.clone(),
            exports: self.exports.clone(),
            destroyed: AtomicBool::new(false),
        }))
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        for entry in self.exports.iter() {
            entry.value().destroy();
        }
        self.exports.clear();
    }
}

/// Wraps a protocol so exported and referred invokers carry the activate
/// filter chain for their side
pub struct ProtocolFilterWrapper {
    inner: Arc<dyn Protocol>,
    filters: Arc<FilterRegistry>,
}

impl ProtocolFilterWrapper {
    pub fn new(inner: Arc<dyn Protocol>, filters: Arc<FilterRegistry>) -> Self {
        Self { inner, filters }
    }

    fn chain(&self, invoker: Arc<dyn Invoker>, key: &str, group: &str) -> Result<Arc<dyn Invoker>> {
        let filters: Vec<Arc<dyn Filter>> = self.filters.activate(invoker.url(), key, group)?;
        Ok(build_filter_chain(invoker, &filters))
    }
}

#[async_trait]
impl Protocol for ProtocolFilterWrapper {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn export(&self, invoker: Arc<dyn Invoker>) -> Result<Arc<dyn Exporter>> {
        if invoker.url().protocol() == REGISTRY_PROTOCOL {
            return self.inner.export(invoker).await;
        }
        let wrapped = self.chain(invoker, SERVICE_FILTER_KEY, SIDE_PROVIDER)?;
        self.inner.export(wrapped).await
    }

    async fn refer(&self, url: &Url) -> Result<Arc<dyn Invoker>> {
        if url.protocol() == REGISTRY_PROTOCOL {
            return self.inner.refer(url).await;
        }
        let invoker = self.inner.refer(url).await?;
        self.chain(invoker, REFERENCE_FILTER_KEY, SIDE_CONSUMER)
    }

    async fn destroy(&self) {
        self.inner.destroy().await;
    }
}

struct ListenerExporter {
    inner: Arc<dyn Exporter>,
    listeners: Vec<Arc<dyn ExporterListener>>,
}

impl Exporter for ListenerExporter {
    fn invoker(&self) -> Arc<dyn Invoker> {
        self.inner.invoker()
    }

    fn unexport(&self) {
        self.inner.unexport();
        let this: Arc<dyn Exporter> = self.inner.clone();
        for listener in &self.listeners {
            listener.unexported(&this);
        }
    }
}

struct ListenerInvoker {
    inner: Arc<dyn Invoker>,
    listeners: Vec<Arc<dyn InvokerListener>>,
}

#[async_trait]
impl Invoker for ListenerInvoker {
    fn url(&self) -> &Url {
        self.inner.url()
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    async fn invoke(&self, invocation: RpcInvocation) -> Result<RpcResult> {
        self.inner.invoke(invocation).await
    }

    fn destroy(&self) {
        self.inner.destroy();
        for listener in &self.listeners {
            listener.destroyed(&self.inner);
        }
    }
}

/// Wraps a protocol so export/refer lifecycle listeners fire
pub struct ProtocolListenerWrapper {
    inner: Arc<dyn Protocol>,
    exporter_listeners: Vec<Arc<dyn ExporterListener>>,
    invoker_listeners: Vec<Arc<dyn InvokerListener>>,
}

impl ProtocolListenerWrapper {
    pub fn new(
        inner: Arc<dyn Protocol>,
        exporter_listeners: Vec<Arc<dyn ExporterListener>>,
        invoker_listeners: Vec<Arc<dyn InvokerListener>>,
    ) -> Self {
        Self { inner, exporter_listeners, invoker_listeners }
    }
}

#[async_trait]
impl Protocol for ProtocolListenerWrapper {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn export(&self, invoker: Arc<dyn Invoker>) -> Result<Arc<dyn Exporter>> {
        if invoker.url().protocol() == REGISTRY_PROTOCOL {
            return self.inner.export(invoker).await;
        }
        let exporter = self.inner.export(invoker).await?;
        for listener in &self.exporter_listeners {
            listener.exported(&exporter);
        }
        Ok(Arc::new(ListenerExporter {
            inner: exporter,
            listeners: self.exporter_listeners.clone(),
        }) as Arc<dyn Exporter>)
    }

    async fn refer(&self, url: &Url) -> Result<Arc<dyn Invoker>> {
        if url.protocol() == REGISTRY_PROTOCOL {
            return self.inner.refer(url).await;
        }
        let invoker = self.inner.refer(url).await?;
        for listener in &self.invoker_listeners {
            listener.referred(&invoker);
        }
        Ok(Arc::new(ListenerInvoker {
            inner: invoker,
            listeners: self.invoker_listeners.clone(),
        }) as Arc<dyn Invoker>)
    }

    async fn destroy(&self) {
        self.inner.destroy().await;
    }
}

impl std::fmt::Debug for MizzenProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MizzenProtocol")
            .field("servers", &self.servers.len())
            .field("clients", &self.clients.len())
            .field("exports", &self.exports.len())
            .finish()
    }
}

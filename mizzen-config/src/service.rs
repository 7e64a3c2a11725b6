//! Service export pipeline
//!
//! Turns a [`ServiceDescriptor`] plus a [`LocalService`] into provider
//! URLs, binds them through the configured protocols, and registers them at
//! every configured registry. Exporters are retained for unexport.

use crate::context::MizzenContext;
use crate::descriptor::{MethodDescriptor, ProtocolDescriptor, Scope, ServiceDescriptor};
use crate::env;
use mizzen_core::constants::{
    ACTIVES_KEY, APPLICATION_KEY, DISPATCHER_KEY, EXECUTES_KEY, EXPORT_KEY, GROUP_KEY,
    HEARTBEAT_KEY, INJVM_PROTOCOL, INTERFACE_KEY, METHODS_KEY, ONEWAY_KEY, PAYLOAD_KEY,
    QUEUES_KEY, REGISTRY_KEY, REGISTRY_PROTOCOL, RETRIES_KEY, SERIALIZATION_KEY, SIDE_KEY,
    SIDE_PROVIDER, STICKY_KEY, THREADPOOL_KEY, THREADS_KEY, TIMEOUT_KEY, TIMESTAMP_KEY,
    TOKEN_KEY, VERSION_KEY, WEIGHT_KEY,
};
use mizzen_core::{Error, Result, Url};
use mizzen_rpc::{service_invoker, Exporter, LocalService, Protocol};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

pub const DEFAULT_PORT: u16 = 20880;

/// Lifecycle handle for one configured service
pub struct ServiceConfig {
    descriptor: ServiceDescriptor,
    service: LocalService,
    context: Arc<MizzenContext>,
    exporters: Mutex<Vec<Arc<dyn Exporter>>>,
    exported: AtomicBool,
}

impl ServiceConfig {
    pub fn new(
        descriptor: ServiceDescriptor,
        service: LocalService,
        context: Arc<MizzenContext>,
    ) -> Self {
        Self {
            descriptor,
            service,
            context,
            exporters: Mutex::new(Vec::new()),
            exported: AtomicBool::new(false),
        }
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn exported_count(&self) -> usize {
        self.exporters.lock().len()
    }

    fn method_params(url: Url, method: &MethodDescriptor) -> Url {
        let mut url = url;
        if let Some(timeout) = method.timeout_ms {
            url = url.with_param(format!("{}.{}", method.name, TIMEOUT_KEY).as_str(), timeout);
        }
        if let Some(retries) = method.retries {
            url = url.with_param(format!("{}.{}", method.name, RETRIES_KEY).as_str(), retries);
        }
        if method.oneway {
            url = url.with_param(format!("{}.{}", method.name, ONEWAY_KEY).as_str(), true);
        }
        if let Some(actives) = method.actives {
            url = url.with_param(format!("{}.{}", method.name, ACTIVES_KEY).as_str(), actives);
        }
        if let Some(executes) = method.executes {
            url = url.with_param(format!("{}.{}", method.name, EXECUTES_KEY).as_str(), executes);
        }
        if let Some(sticky) = method.sticky {
            url = url.with_param(format!("{}.{}", method.name, STICKY_KEY).as_str(), sticky);
        }
        url
    }

    /// Assemble the provider URL for one protocol
    fn provider_url(&self, protocol: &ProtocolDescriptor) -> Url {
        let descriptor = &self.descriptor;
        let bind_host =
            env::resolve_bind_host(&protocol.name, protocol.host.as_deref(), &descriptor.registries);
        let bind_port = env::resolve_bind_port(&protocol.name, protocol.port, DEFAULT_PORT);
        let registry_host = env::resolve_registry_host(&protocol.name, &bind_host);
        let registry_port = env::resolve_registry_port(&protocol.name, bind_port);

        let mut url = Url::new(&protocol.name, &registry_host, registry_port, &descriptor.interface)
            .with_param(SIDE_KEY, SIDE_PROVIDER)
            .with_param(APPLICATION_KEY, &descriptor.application)
            .with_param(INTERFACE_KEY, &descriptor.interface)
            .with_param(
                TIMESTAMP_KEY,
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0),
            );
        if registry_host != bind_host {
            url = url.with_param("bind.ip", &bind_host);
        }
        if registry_port != bind_port {
            url = url.with_param("bind.port", bind_port);
        }
        if let Some(group) = &descriptor.group {
            url = url.with_param(GROUP_KEY, group);
        }
        if let Some(version) = &descriptor.version {
            url = url.with_param(VERSION_KEY, version);
        }
        if let Some(timeout) = descriptor.timeout_ms {
            url = url.with_param(TIMEOUT_KEY, timeout);
        }
        if let Some(retries) = descriptor.retries {
            url = url.with_param(RETRIES_KEY, retries);
        }
        if let Some(weight) = descriptor.weight {
            url = url.with_param(WEIGHT_KEY, weight);
        }
        if let Some(token) = &descriptor.token {
            url = url.with_param(TOKEN_KEY, token);
        }
        if !descriptor.methods.is_empty() {
            let names: Vec<&str> =
                descriptor.methods.iter().map(|m| m.name.as_str()).collect();
            url = url.with_param(METHODS_KEY, names.join(","));
            for method in &descriptor.methods {
                url = Self::method_params(url, method);
            }
        }
        if let Some(serialization) = &protocol.serialization {
            url = url.with_param(SERIALIZATION_KEY, serialization);
        }
        if let Some(threadpool) = &protocol.threadpool {
            url = url.with_param(THREADPOOL_KEY, threadpool);
        }
        if let Some(threads) = protocol.threads {
            url = url.with_param(THREADS_KEY, threads);
        }
        if let Some(queues) = protocol.queues {
            url = url.with_param(QUEUES_KEY, queues);
        }
        if let Some(dispatcher) = &protocol.dispatcher {
            url = url.with_param(DISPATCHER_KEY, dispatcher);
        }
        if let Some(payload) = protocol.payload {
            url = url.with_param(PAYLOAD_KEY, payload);
        }
        if let Some(heartbeat) = protocol.heartbeat_ms {
            url = url.with_param(HEARTBEAT_KEY, heartbeat);
        }
        for (key, value) in &descriptor.parameters {
            url = url.with_param(key, value);
        }
        url
    }

    /// Export over every configured (protocol, registry) pair
    pub async fn export(&self) -> Result<()> {
        if self.exported.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.descriptor.scope == Scope::None {
            info!("scope none, skipping export of {}", self.descriptor.interface);
            return Ok(());
        }
        let protocols = if self.descriptor.protocols.is_empty() {
            vec![ProtocolDescriptor::new("mizzen")]
        } else {
            self.descriptor.protocols.clone()
        };

        let mut exporters = Vec::new();
        if matches!(self.descriptor.scope, Scope::Local | Scope::Both) {
            exporters.push(self.export_local().await?);
        }
        if matches!(self.descriptor.scope, Scope::Remote | Scope::Both) {
            for protocol in &protocols {
                let provider_url = self.provider_url(protocol);
                if self.descriptor.registries.is_empty() {
                    let invoker =
                        service_invoker(self.service.clone(), provider_url.clone());
                    let exporter = self
                        .context
                        .protocols
                        .get(provider_url.protocol())?
                        .export(invoker)
                        .await?;
                    exporters.push(exporter);
                } else {
                    for registry in &self.descriptor.registries {
                        let export_url = registry
                            .with_protocol(REGISTRY_PROTOCOL)
                            .with_param(REGISTRY_KEY, registry.protocol())
                            .with_param(EXPORT_KEY, provider_url.to_full_string());
                        let invoker =
                            service_invoker(self.service.clone(), export_url);
                        let exporter = self
                            .context
                            .protocols
                            .get(REGISTRY_PROTOCOL)?
                            .export(invoker)
                            .await?;
                        exporters.push(exporter);
                    }
                }
            }
        }
        info!(
            "exported {} through {} endpoint(s)",
            self.descriptor.interface,
            exporters.len()
        );
        *self.exporters.lock() = exporters;
        Ok(())
    }

    async fn export_local(&self) -> Result<Arc<dyn Exporter>> {
        let mut url = Url::new(INJVM_PROTOCOL, "127.0.0.1", 0, &self.descriptor.interface)
            .with_param(SIDE_KEY, SIDE_PROVIDER)
            .with_param(APPLICATION_KEY, &self.descriptor.application);
        if let Some(group) = &self.descriptor.group {
            url = url.with_param(GROUP_KEY, group);
        }
        if let Some(version) = &self.descriptor.version {
            url = url.with_param(VERSION_KEY, version);
        }
        let invoker = service_invoker(self.service.clone(), url);
        self.context.protocols.get(INJVM_PROTOCOL)?.export(invoker).await
    }

    /// Tear every export down; safe to call twice
    pub async fn unexport(&self) -> Result<()> {
        if !self.exported.load(Ordering::SeqCst) {
            return Err(Error::InvalidArgument(format!(
                "{} was never exported",
                self.descriptor.interface
            )));
        }
        let exporters: Vec<Arc<dyn Exporter>> =
            self.exporters.lock().drain(..).collect();
        for exporter in exporters {
            exporter.unexport();
        }
        info!("unexported {}", self.descriptor.interface);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello_service() -> LocalService {
        let mut service = LocalService::new("org.demo.Hello");
        service.add_typed_method("greet", |name: String| Ok(format!("hello {}", name)));
        service
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn provider_url_carries_policy_parameters() {
        let descriptor = ServiceDescriptor::new("org.demo.Hello", "shop")
            .with_group("g")
            .with_version("1.0")
            .with_token("tk")
            .with_method(MethodDescriptor::new("greet").with_timeout_ms(250).with_retries(1))
            .with_protocol(ProtocolDescriptor::new("mizzen").with_host("10.0.0.1").with_port(20880));
        let config = ServiceConfig::new(descriptor, hello_service(), MizzenContext::new());
        let url = config.provider_url(&config.descriptor.protocols[0]);

        assert_eq!(url.protocol(), "mizzen");
        assert_eq!(url.address(), "10.0.0.1:20880");
        assert_eq!(url.param(GROUP_KEY), Some("g"));
        assert_eq!(url.service_key(), "g/org.demo.Hello:1.0");
        assert_eq!(url.param(TOKEN_KEY), Some("tk"));
        assert_eq!(url.method_param_u64("greet", TIMEOUT_KEY, 0), 250);
        assert_eq!(url.method_param_u32("greet", RETRIES_KEY, 9), 1);
        assert_eq!(url.param(SIDE_KEY), Some(SIDE_PROVIDER));
    }

    #[tokio::test]
    async fn direct_export_binds_a_server() {
        let descriptor = ServiceDescriptor::new("org.demo.Hello", "shop")
            .with_scope(Scope::Remote)
            .with_protocol(
                ProtocolDescriptor::new("mizzen").with_host("127.0.0.1").with_port(free_port()),
            );
        let config = ServiceConfig::new(descriptor, hello_service(), MizzenContext::new());
        config.export().await.unwrap();
        assert_eq!(config.exported_count(), 1);

        // second export is a no-op
        config.export().await.unwrap();
        assert_eq!(config.exported_count(), 1);

        config.unexport().await.unwrap();
        assert_eq!(config.exported_count(), 0);
    }

    #[tokio::test]
    async fn scope_local_exports_in_process_only() {
        let descriptor =
            ServiceDescriptor::new("org.demo.Hello", "shop").with_scope(Scope::Local);
        let context = MizzenContext::new();
        let config = ServiceConfig::new(descriptor, hello_service(), context.clone());
        config.export().await.unwrap();
        assert_eq!(config.exported_count(), 1);

        let injvm = context.protocols.get(INJVM_PROTOCOL).unwrap();
        let url = Url::new(INJVM_PROTOCOL, "127.0.0.1", 0, "org.demo.Hello");
        let invoker = injvm.refer(&url).await.unwrap();
        assert!(invoker.is_available());
    }

    #[tokio::test]
    async fn unexport_before_export_is_an_error() {
        let descriptor = ServiceDescriptor::new("org.demo.Hello", "shop");
        let config = ServiceConfig::new(descriptor, hello_service(), MizzenContext::new());
        assert!(config.unexport().await.is_err());
    }
}

//! The `registry://` protocol
//!
//! Exporting through it binds the real transport protocol and then
//! publishes the provider URL at the registry; referring through it builds
//! a [`RegistryDirectory`], subscribes it, and wraps it with the cluster
//! policy named on the consumer URL.

use crate::cluster::{Cluster, ClusterRegistry};
use crate::directory::RegistryDirectory;
use async_trait::async_trait;
use mizzen_core::constants::{
    CATEGORY_KEY, CLUSTER_KEY, CONFIGURATORS_CATEGORY, EXPORT_KEY, PROVIDERS_CATEGORY,
    REFER_KEY, REGISTRY_KEY, ROUTERS_CATEGORY,
};
use mizzen_core::{Error, Result, Url};
use mizzen_registry::{Registry, RegistryFactoryRegistry};
use mizzen_rpc::{Exporter, Invoker, Protocol, ProtocolRegistry, RpcInvocation, RpcResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Lets a service invoker travel under the concrete provider URL while the
/// orchestrator addressed it with a registry URL
struct DelegatingInvoker {
    url: Url,
    inner: Arc<dyn Invoker>,
}

#[async_trait]
impl Invoker for DelegatingInvoker {
    fn url(&self) -> &Url {
        &self.url
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    async fn invoke(&self, invocation: RpcInvocation) -> Result<RpcResult> {
        self.inner.invoke(invocation).await
    }

    fn destroy(&self) {
        self.inner.destroy();
    }
}

struct RegistryExporter {
    exporter: Arc<dyn Exporter>,
    registry: Arc<dyn Registry>,
    registered_url: Url,
    unexported: AtomicBool,
}

impl Exporter for RegistryExporter {
    fn invoker(&self) -> Arc<dyn Invoker> {
        self.exporter.invoker()
    }

    fn unexport(&self) {
        if self.unexported.swap(true, Ordering::SeqCst) {
            return;
        }
        let registry = self.registry.clone();
        let url = self.registered_url.clone();
        tokio::spawn(async move {
            if let Err(e) = registry.unregister(&url).await {
                warn!("unregister {} failed: {}", url.address(), e);
            }
        });
        self.exporter.unexport();
    }
}

/// Export/refer through a registry
pub struct RegistryProtocol {
    registry_factories: Arc<RegistryFactoryRegistry>,
    protocols: Arc<ProtocolRegistry>,
    clusters: Arc<ClusterRegistry>,
    destroyed: AtomicBool,
}

impl RegistryProtocol {
    pub fn new(
        registry_factories: Arc<RegistryFactoryRegistry>,
        protocols: Arc<ProtocolRegistry>,
        clusters: Arc<ClusterRegistry>,
    ) -> Self {
        Self {
            registry_factories,
            protocols,
            clusters,
            destroyed: AtomicBool::new(false),
        }
    }

    /// Resolve the concrete registry from a `registry://` URL: the real
    /// backend protocol rides in the `registry` parameter
    async fn registry_for(&self, url: &Url) -> Result<Arc<dyn Registry>> {
        let backend = url.param_or(REGISTRY_KEY, "memory").to_string();
        let registry_url = url
            .with_protocol(&backend)
            .without_param(EXPORT_KEY)
            .without_param(REFER_KEY)
            .without_param(REGISTRY_KEY);
        let factory = self.registry_factories.get(&backend)?;
        factory.get(&registry_url).await
    }

    fn check_alive(&self) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Destroyed("registry protocol".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Protocol for RegistryProtocol {
    fn name(&self) -> &'static str {
        "registry"
    }

    async fn export(&self, invoker: Arc<dyn Invoker>) -> Result<Arc<dyn Exporter>> {
        self.check_alive()?;
        let registry_url = invoker.url().clone();
        let provider_url = Url::parse(registry_url.param(EXPORT_KEY).ok_or_else(|| {
            Error::InvalidArgument("registry export url lacks the export parameter".into())
        })?)?;

        let protocol = self.protocols.get(provider_url.protocol())?;
        let exporter = protocol
            .export(Arc::new(DelegatingInvoker { url: provider_url.clone(), inner: invoker }))
            .await?;

        let registry = self.registry_for(&registry_url).await?;
        let registered_url = provider_url.with_param_if_absent(CATEGORY_KEY, PROVIDERS_CATEGORY);
        registry.register(&registered_url).await?;
        info!(
            "exported and registered {} at {}",
            registered_url.service_key(),
            registry.url().address()
        );

        Ok(Arc::new(RegistryExporter {
            exporter,
            registry,
            registered_url,
            unexported: AtomicBool::new(false),
        }))
    }

    async fn refer(&self, url: &Url) -> Result<Arc<dyn Invoker>> {
        self.check_alive()?;
        let consumer_url = Url::parse(url.param(REFER_KEY).ok_or_else(|| {
            Error::InvalidArgument("registry refer url lacks the refer parameter".into())
        })?)?;

        let registry = self.registry_for(url).await?;
        let subscribe_url = consumer_url.with_param(
            CATEGORY_KEY,
            format!(
                "{},{},{}",
                PROVIDERS_CATEGORY, CONFIGURATORS_CATEGORY, ROUTERS_CATEGORY
            ),
        );
        let directory =
            RegistryDirectory::new(consumer_url.clone(), subscribe_url, self.protocols.clone());
        directory.subscribe(registry).await?;

        let cluster = self
            .clusters
            .get(consumer_url.param(CLUSTER_KEY).unwrap_or("failover"))?;
        Ok(cluster.join(directory))
    }

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mizzen_core::constants::CHECK_KEY;
    use mizzen_registry::{MemoryRegistryFactory, RegistryFactory};
    use mizzen_rpc::{LocalService, MizzenProtocol, ServiceProxy};

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn wiring() -> RegistryProtocol {
        let protocols = Arc::new(ProtocolRegistry::new("Protocol"));
        protocols.register("mizzen", || Arc::new(MizzenProtocol::new()));
        let factories = Arc::new(RegistryFactoryRegistry::with_default(
            "RegistryFactory",
            "memory",
        ));
        factories.register("memory", || {
            Arc::new(MemoryRegistryFactory::new()) as Arc<dyn RegistryFactory>
        });
        let load_balances = crate::loadbalance::builtin_registry();
        let clusters = crate::cluster::builtin_registry(load_balances);
        RegistryProtocol::new(factories, protocols, clusters)
    }

    fn hello_service() -> LocalService {
        let mut service = LocalService::new("org.demo.Hello");
        service.add_typed_method("greet", |name: String| Ok(format!("hello {}", name)));
        service
    }

    #[tokio::test]
    async fn export_then_refer_through_registry() {
        let registry_protocol = wiring();
        let hub = "reg-proto-rt";
        let port = free_port();

        let provider_url = Url::new("mizzen", "127.0.0.1", port, "org.demo.Hello")
            .with_param(CHECK_KEY, false);
        let registry_url = Url::new("registry", hub, 0, "org.demo.Hello")
            .with_param(EXPORT_KEY, provider_url.to_full_string());
        let service_invoker = mizzen_rpc::service_invoker(hello_service(), registry_url);
        let _exporter = registry_protocol.export(service_invoker).await.unwrap();

        let consumer_url = Url::new("consumer", "127.0.0.1", 0, "org.demo.Hello")
            .with_param(CHECK_KEY, false);
        let refer_url = Url::new("registry", hub, 0, "org.demo.Hello")
            .with_param(REFER_KEY, consumer_url.to_full_string());
        let invoker = registry_protocol.refer(&refer_url).await.unwrap();

        // directory population is asynchronous from the subscribe
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let proxy = ServiceProxy::new(invoker);
        let out: String = proxy.call("greet", &"registry".to_string()).await.unwrap();
        assert_eq!(out, "hello registry");
    }

    #[tokio::test]
    async fn unexport_unregisters() {
        let registry_protocol = wiring();
        let hub = "reg-proto-unexp";
        let port = free_port();

        let provider_url = Url::new("mizzen", "127.0.0.1", port, "org.demo.Hello")
            .with_param(CHECK_KEY, false);
        let registry_url = Url::new("registry", hub, 0, "org.demo.Hello")
            .with_param(EXPORT_KEY, provider_url.to_full_string());
        let exporter = registry_protocol
            .export(Arc::new(DelegatingInvoker {
                url: registry_url,
                inner: mizzen_rpc::service_invoker(
                    hello_service(),
                    provider_url.clone(),
                ),
            }))
            .await
            .unwrap();

        assert_eq!(
            mizzen_registry::MemoryHub::get(hub)
                .children("org.demo.Hello", PROVIDERS_CATEGORY)
                .len(),
            1
        );
        exporter.unexport();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(mizzen_registry::MemoryHub::get(hub)
            .children("org.demo.Hello", PROVIDERS_CATEGORY)
            .is_empty());
    }
}

//! Process context: the wired extension plane
//!
//! All extension registries live here, already wired together: protocols
//! carry the filter-chain wrapper, and the `registry` protocol captures the
//! registry factories and clusters it composes. Production code shares one
//! context; tests build as many fresh ones as they like.

use mizzen_cluster::{builtin_clusters, builtin_load_balances, ClusterRegistry, LoadBalanceRegistry, RegistryProtocol};
use mizzen_registry::{MemoryRegistryFactory, RegistryFactory, RegistryFactoryRegistry};
use mizzen_rpc::{
    filters, FilterRegistry, InjvmProtocol, MizzenProtocol, Protocol, ProtocolFilterWrapper,
    ProtocolRegistry,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

pub struct MizzenContext {
    pub protocols: Arc<ProtocolRegistry>,
    pub clusters: Arc<ClusterRegistry>,
    pub load_balances: Arc<LoadBalanceRegistry>,
    pub filters: Arc<FilterRegistry>,
    pub registry_factories: Arc<RegistryFactoryRegistry>,
    destroyed: AtomicBool,
}

impl MizzenContext {
    pub fn new() -> Arc<Self> {
        let filters = filters::builtin_registry();
        let load_balances = builtin_load_balances();
        let clusters = builtin_clusters(load_balances.clone());

        let registry_factories = Arc::new(RegistryFactoryRegistry::with_default(
            "RegistryFactory",
            "memory",
        ));
        registry_factories.register("memory", || {
            Arc::new(MemoryRegistryFactory::new()) as Arc<dyn RegistryFactory>
        });

        let protocols = Arc::new(ProtocolRegistry::with_default("Protocol", "mizzen"));
        {
            let filters = filters.clone();
            protocols.register_wrapper(move |inner| {
                Arc::new(ProtocolFilterWrapper::new(inner, filters.clone())) as Arc<dyn Protocol>
            });
        }
        protocols.register("mizzen", || Arc::new(MizzenProtocol::new()));
        protocols.register("injvm", || Arc::new(InjvmProtocol::new()));
        {
            // the registry protocol composes the rest of the plane; a weak
            // handle avoids a reference cycle through its own registry
            let weak_protocols = Arc::downgrade(&protocols);
            let registry_factories = registry_factories.clone();
            let clusters = clusters.clone();
            protocols.register("registry", move || {
                let protocols = weak_protocols
                    .upgrade()
                    .expect("protocol registry gone while constructing registry protocol");
                Arc::new(RegistryProtocol::new(
                    registry_factories.clone(),
                    protocols,
                    clusters.clone(),
                ))
            });
        }

        Arc::new(Self {
            protocols,
            clusters,
            load_balances,
            filters,
            registry_factories,
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Destroy registries first, then protocols; safe to call twice
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        for factory in self.registry_factories.loaded() {
            factory.destroy_all().await;
        }
        for protocol in self.protocols.loaded() {
            protocol.destroy().await;
        }
        info!("mizzen context destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn context_wires_the_builtin_plane() {
        let context = MizzenContext::new();
        assert!(context.protocols.has("mizzen"));
        assert!(context.protocols.has("injvm"));
        assert!(context.protocols.has("registry"));
        assert!(context.clusters.has("failover"));
        assert!(context.load_balances.has("leastactive"));
        assert!(context.registry_factories.has("memory"));
        assert!(context.filters.has("token"));
    }

    #[tokio::test]
    async fn contexts_are_isolated() {
        let a = MizzenContext::new();
        let b = MizzenContext::new();
        let pa = a.protocols.get("mizzen").unwrap();
        let pb = b.protocols.get("mizzen").unwrap();
        assert!(!Arc::ptr_eq(&pa, &pb));
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let context = MizzenContext::new();
        context.protocols.get("mizzen").unwrap();
        context.destroy().await;
        context.destroy().await;
        assert!(context.is_destroyed());
    }
}

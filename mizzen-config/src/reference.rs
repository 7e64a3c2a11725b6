//! Reference pipeline
//!
//! Turns a [`ReferenceDescriptor`] into a consumer URL, refers it through
//! the registry protocol (or directly at a fixed endpoint), and hands back
//! a typed [`ServiceProxy`]. The invoker is built lazily and cached.

use crate::context::MizzenContext;
use crate::descriptor::ReferenceDescriptor;
use crate::env;
use mizzen_core::constants::{
    APPLICATION_KEY, CHECK_KEY, CLUSTER_KEY, CONSUMER_PROTOCOL, GROUP_KEY, INTERFACE_KEY,
    LOADBALANCE_KEY, REFER_KEY, REGISTRY_KEY, REGISTRY_PROTOCOL, RETRIES_KEY, STICKY_KEY,
    TIMEOUT_KEY, VERSION_KEY,
};
use mizzen_core::{Error, Result, Url};
use mizzen_cluster::{Cluster as _, StaticDirectory};
use mizzen_rpc::{Invoker, Protocol, ServiceProxy};
use std::sync::Arc;
use tracing::info;

/// Lifecycle handle for one configured reference
pub struct ReferenceConfig {
    descriptor: ReferenceDescriptor,
    context: Arc<MizzenContext>,
    invoker: tokio::sync::Mutex<Option<Arc<dyn Invoker>>>,
}

impl ReferenceConfig {
    pub fn new(descriptor: ReferenceDescriptor, context: Arc<MizzenContext>) -> Self {
        Self { descriptor, context, invoker: tokio::sync::Mutex::new(None) }
    }

    pub fn descriptor(&self) -> &ReferenceDescriptor {
        &self.descriptor
    }

    /// Assemble the consumer URL announcing this reference
    fn consumer_url(&self) -> Url {
        let descriptor = &self.descriptor;
        let host = env::resolve_bind_host(CONSUMER_PROTOCOL, None, &descriptor.registries);
        let mut url = Url::new(CONSUMER_PROTOCOL, &host, 0, &descriptor.interface)
            .with_param(mizzen_core::constants::SIDE_KEY, mizzen_core::constants::SIDE_CONSUMER)
            .with_param(APPLICATION_KEY, &descriptor.application)
            .with_param(INTERFACE_KEY, &descriptor.interface)
            .with_param(CHECK_KEY, descriptor.check);
        if let Some(group) = &descriptor.group {
            url = url.with_param(GROUP_KEY, group);
        }
        if let Some(version) = &descriptor.version {
            url = url.with_param(VERSION_KEY, version);
        }
        if let Some(cluster) = &descriptor.cluster {
            url = url.with_param(CLUSTER_KEY, cluster);
        }
        if let Some(loadbalance) = &descriptor.loadbalance {
            url = url.with_param(LOADBALANCE_KEY, loadbalance);
        }
        if let Some(timeout) = descriptor.timeout_ms {
            url = url.with_param(TIMEOUT_KEY, timeout);
        }
        if let Some(retries) = descriptor.retries {
            url = url.with_param(RETRIES_KEY, retries);
        }
        if descriptor.sticky {
            url = url.with_param(STICKY_KEY, true);
        }
        for method in &descriptor.methods {
            if let Some(timeout) = method.timeout_ms {
                url = url.with_param(format!("{}.{}", method.name, TIMEOUT_KEY).as_str(), timeout);
            }
            if let Some(retries) = method.retries {
                url = url.with_param(format!("{}.{}", method.name, RETRIES_KEY).as_str(), retries);
            }
            if let Some(sticky) = method.sticky {
                url = url.with_param(format!("{}.{}", method.name, STICKY_KEY).as_str(), sticky);
            }
        }
        for (key, value) in &descriptor.parameters {
            url = url.with_param(key, value);
        }
        url
    }

    async fn build_invoker(&self) -> Result<Arc<dyn Invoker>> {
        let descriptor = &self.descriptor;
        let consumer_url = self.consumer_url();

        // a direct URL bypasses the registry entirely
        if let Some(direct) = &descriptor.direct_url {
            let mut target = direct.clone();
            for (key, value) in consumer_url.parameters() {
                target = target.with_param_if_absent(key, value);
            }
            let invoker = self
                .context
                .protocols
                .get(target.protocol())?
                .refer(&target)
                .await?;
            info!(
                "referred {} directly at {}",
                descriptor.interface,
                direct.address()
            );
            return Ok(invoker);
        }

        if descriptor.registries.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "reference to {} has neither a registry nor a direct url",
                descriptor.interface
            )));
        }

        let registry_protocol = self.context.protocols.get(REGISTRY_PROTOCOL)?;
        let mut invokers = Vec::new();
        for registry in &descriptor.registries {
            let refer_url = registry
                .with_protocol(REGISTRY_PROTOCOL)
                .with_param(REGISTRY_KEY, registry.protocol())
                .with_param(REFER_KEY, consumer_url.to_full_string());
            invokers.push(registry_protocol.refer(&refer_url).await?);
        }
        if invokers.len() == 1 {
            return Ok(invokers.remove(0));
        }
        // several registries: take whichever has live providers
        let directory = Arc::new(StaticDirectory::new(consumer_url, invokers));
        let available = self.context.clusters.get("available")?;
        Ok(available.join(directory))
    }

    /// The typed stub, building and caching the invoker on first use
    pub async fn get(&self) -> Result<ServiceProxy> {
        let mut slot = self.invoker.lock().await;
        let invoker = match slot.as_ref() {
            Some(existing) => existing.clone(),
            None => {
                let invoker = self.build_invoker().await?;
                if self.descriptor.check && !invoker.is_available() {
                    invoker.destroy();
                    return Err(Error::Forbidden(format!(
                        "no provider available for {} at reference time (set check=false to defer)",
                        self.descriptor.interface
                    )));
                }
                *slot = Some(invoker.clone());
                invoker
            }
        };
        Ok(ServiceProxy::new(invoker))
    }

    pub async fn destroy(&self) {
        if let Some(invoker) = self.invoker.lock().await.take() {
            invoker.destroy();
        }
    }
}

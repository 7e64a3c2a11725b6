//! Directories produce the live invoker list for a service
//!
//! A [`StaticDirectory`] holds a fixed list; a [`RegistryDirectory`]
//! subscribes to a service key and rebuilds its invokers from every
//! full-state notification, diffing against what it already holds so
//! unchanged providers keep their connections.

use crate::configurator::{apply_configurators, configurators_from_urls, Configurator};
use crate::router::{routers_from_urls, Router};
use async_trait::async_trait;
use mizzen_core::constants::{
    CONFIGURATORS_CATEGORY, DYNAMIC_KEY, EMPTY_PROTOCOL, GROUP_KEY, METHODS_KEY,
    PROVIDERS_CATEGORY, ROUTERS_CATEGORY, TIMESTAMP_KEY, TOKEN_KEY, VERSION_KEY, WARMUP_KEY,
    WEIGHT_KEY,
};
use mizzen_core::{Error, Result, Url};
use mizzen_registry::{NotifyListener, Registry};
use mizzen_rpc::{Invoker, Protocol, ProtocolRegistry, RpcInvocation};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Dynamic set of invokers for one service key
pub trait Directory: Send + Sync {
    fn url(&self) -> &Url;

    fn is_available(&self) -> bool;

    /// Candidate invokers for this invocation, after router filtering
    fn list(&self, invocation: &RpcInvocation) -> Result<Vec<Arc<dyn Invoker>>>;

    fn destroy(&self);
}

/// Fixed invoker list, used for direct-URL references and tests
pub struct StaticDirectory {
    url: Url,
    invokers: Vec<Arc<dyn Invoker>>,
    routers: Vec<Arc<dyn Router>>,
    destroyed: AtomicBool,
}

impl StaticDirectory {
    pub fn new(url: Url, invokers: Vec<Arc<dyn Invoker>>) -> Self {
        Self { url, invokers, routers: Vec::new(), destroyed: AtomicBool::new(false) }
    }

    pub fn with_routers(mut self, routers: Vec<Arc<dyn Router>>) -> Self {
        self.routers = routers;
        self
    }
}

impl Directory for StaticDirectory {
    fn url(&self) -> &Url {
        &self.url
    }

    fn is_available(&self) -> bool {
        !self.destroyed.load(Ordering::SeqCst)
            && self.invokers.iter().any(|i| i.is_available())
    }

    fn list(&self, invocation: &RpcInvocation) -> Result<Vec<Arc<dyn Invoker>>> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Destroyed(format!("directory for {}", self.url.service_key())));
        }
        let mut invokers = self.invokers.clone();
        for router in &self.routers {
            invokers = router.route(invokers, &self.url, invocation)?;
        }
        Ok(invokers)
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        for invoker in &self.invokers {
            invoker.destroy();
        }
    }
}

/// Provider URL parameters the consumer side must not override
const PROVIDER_RESERVED_KEYS: &[&str] = &[
    WEIGHT_KEY,
    TIMESTAMP_KEY,
    WARMUP_KEY,
    METHODS_KEY,
    DYNAMIC_KEY,
    TOKEN_KEY,
    VERSION_KEY,
    GROUP_KEY,
];

/// Overlay consumer-side tuning onto a provider URL
fn merge_consumer_params(provider: Url, consumer: &Url) -> Url {
    let mut merged = provider;
    for (key, value) in consumer.parameters() {
        if PROVIDER_RESERVED_KEYS.contains(&key.as_str())
            || key == mizzen_core::constants::CATEGORY_KEY
        {
            continue;
        }
        merged = merged.with_param(key, value);
    }
    merged
}

/// Directory fed by registry notifications
pub struct RegistryDirectory {
    consumer_url: Url,
    subscribe_url: Url,
    protocols: Arc<ProtocolRegistry>,
    registry: OnceCell<Arc<dyn Registry>>,
    invokers: RwLock<Arc<Vec<Arc<dyn Invoker>>>>,
    url_invoker_map: Mutex<HashMap<String, Arc<dyn Invoker>>>,
    routers: RwLock<Vec<Arc<dyn Router>>>,
    configurators: RwLock<Vec<Configurator>>,
    forbidden: AtomicBool,
    destroyed: AtomicBool,
}

impl RegistryDirectory {
    pub fn new(consumer_url: Url, subscribe_url: Url, protocols: Arc<ProtocolRegistry>) -> Arc<Self> {
        Arc::new(Self {
            consumer_url,
            subscribe_url,
            protocols,
            registry: OnceCell::new(),
            invokers: RwLock::new(Arc::new(Vec::new())),
            url_invoker_map: Mutex::new(HashMap::new()),
            routers: RwLock::new(Vec::new()),
            configurators: RwLock::new(Vec::new()),
            forbidden: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Subscribe this directory at the registry; notifications start flowing
    /// before this returns
    pub async fn subscribe(self: &Arc<Self>, registry: Arc<dyn Registry>) -> Result<()> {
        self.registry.set(registry.clone()).ok();
        registry
            .subscribe(&self.subscribe_url, self.clone() as Arc<dyn NotifyListener>)
            .await
    }

    pub fn subscribe_url(&self) -> &Url {
        &self.subscribe_url
    }

    /// Current snapshot without router filtering
    pub fn invokers(&self) -> Vec<Arc<dyn Invoker>> {
        self.invokers.read().as_ref().clone()
    }

    async fn refresh_providers(&self, urls: Vec<Url>) {
        let emptied = urls.is_empty()
            || (urls.len() == 1 && urls[0].protocol() == EMPTY_PROTOCOL);
        if emptied {
            info!(
                "no provider left for {}, forbidding access",
                self.subscribe_url.service_key()
            );
            self.forbidden.store(true, Ordering::SeqCst);
            *self.invokers.write() = Arc::new(Vec::new());
            let old: Vec<(String, Arc<dyn Invoker>)> =
                self.url_invoker_map.lock().drain().collect();
            for (_, invoker) in old {
                invoker.destroy();
            }
            return;
        }
        self.forbidden.store(false, Ordering::SeqCst);

        let configurators = self.configurators.read().clone();
        let mut fresh: HashMap<String, Url> = HashMap::new();
        for url in urls {
            if url.protocol() == EMPTY_PROTOCOL {
                continue;
            }
            let merged = merge_consumer_params(
                apply_configurators(&configurators, url),
                &self.consumer_url,
            );
            fresh.insert(merged.to_full_string().to_string(), merged);
        }

        // refer newcomers outside the map lock, destroy leavers after swap
        let existing: Vec<String> = self.url_invoker_map.lock().keys().cloned().collect();
        let mut created: Vec<(String, Arc<dyn Invoker>)> = Vec::new();
        for (key, url) in &fresh {
            if existing.contains(key) {
                continue;
            }
            let protocol = match self.protocols.get(url.protocol()) {
                Ok(p) => p,
                Err(e) => {
                    warn!("skipping provider {}: {}", url.address(), e);
                    continue;
                }
            };
            match protocol.refer(url).await {
                Ok(invoker) => created.push((key.clone(), invoker)),
                Err(e) => warn!("failed to refer {}: {}", url.address(), e),
            }
        }

        let mut removed: Vec<Arc<dyn Invoker>> = Vec::new();
        let snapshot: Vec<Arc<dyn Invoker>> = {
            let mut map = self.url_invoker_map.lock();
            map.retain(|key, invoker| {
                if fresh.contains_key(key) {
                    true
                } else {
                    removed.push(invoker.clone());
                    false
                }
            });
            for (key, invoker) in created {
                map.insert(key, invoker);
            }
            map.values().cloned().collect()
        };
        *self.invokers.write() = Arc::new(snapshot);
        for invoker in removed {
            invoker.destroy();
        }
        debug!(
            "directory for {} now holds {} invokers",
            self.subscribe_url.service_key(),
            self.invokers.read().len()
        );
    }
}

#[async_trait]
impl NotifyListener for RegistryDirectory {
    async fn notify(&self, urls: Vec<Url>) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let mut providers = Vec::new();
        let mut configurators = Vec::new();
        let mut routers = Vec::new();
        for url in urls {
            match url.category() {
                CONFIGURATORS_CATEGORY => configurators.push(url),
                ROUTERS_CATEGORY => routers.push(url),
                PROVIDERS_CATEGORY => providers.push(url),
                other => debug!("ignoring url of category '{}'", other),
            }
        }
        if !configurators.is_empty() {
            *self.configurators.write() = configurators_from_urls(&configurators);
        }
        if !routers.is_empty() {
            let routers = routers
                .iter()
                .filter(|u| u.protocol() != EMPTY_PROTOCOL)
                .cloned()
                .collect::<Vec<_>>();
            *self.routers.write() = routers_from_urls(&routers);
        }
        if !providers.is_empty() {
            self.refresh_providers(providers).await;
        }
    }
}

impl Directory for RegistryDirectory {
    fn url(&self) -> &Url {
        &self.consumer_url
    }

    fn is_available(&self) -> bool {
        !self.destroyed.load(Ordering::SeqCst)
            && self.invokers.read().iter().any(|i| i.is_available())
    }

    fn list(&self, invocation: &RpcInvocation) -> Result<Vec<Arc<dyn Invoker>>> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Destroyed(format!(
                "directory for {}",
                self.subscribe_url.service_key()
            )));
        }
        if self.forbidden.load(Ordering::SeqCst) {
            return Err(Error::Forbidden(format!(
                "no provider available for {} from registry, please check whether the providers are up",
                self.subscribe_url.service_key()
            )));
        }
        let mut invokers = self.invokers.read().as_ref().clone();
        for router in self.routers.read().iter() {
            invokers = router.route(invokers, &self.consumer_url, invocation)?;
        }
        Ok(invokers)
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let old: Vec<(String, Arc<dyn Invoker>)> = self.url_invoker_map.lock().drain().collect();
        for (_, invoker) in old {
            invoker.destroy();
        }
        *self.invokers.write() = Arc::new(Vec::new());
        info!("directory for {} destroyed", self.subscribe_url.service_key());
    }
}

//! Failure-tolerant registry layer
//!
//! Wraps any [`RegistryBackend`] with the retry discipline every registry
//! must honor: failed operations park in retry sets replayed by a periodic
//! task, `check=false` swallows failures into that machinery, lookups and
//! subscriptions fall back to the local cache while the backend is away,
//! and a reconnect replays every registration and subscription before
//! fresh full notifications flow.

use crate::registry::{NotifyListener, Registry};
use crate::support::{is_ephemeral, RegistryState, Subscription};
use async_trait::async_trait;
use mizzen_core::constants::{CHECK_KEY, DEFAULT_RETRY_PERIOD_MS, RETRY_PERIOD_KEY};
use mizzen_core::{Error, Result, Url};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Raw operations one registry backend provides; the failback layer
/// supplies caching, retries, and recovery on top
#[async_trait]
pub trait RegistryBackend: Send + Sync + 'static {
    fn is_connected(&self) -> bool;

    async fn do_register(&self, url: &Url) -> Result<()>;

    async fn do_unregister(&self, url: &Url) -> Result<()>;

    /// Start watching `url`'s service key; returns the current full state
    /// across every category the URL subscribes to
    async fn do_subscribe(&self, url: &Url) -> Result<Vec<Url>>;

    async fn do_unsubscribe(&self, url: &Url) -> Result<()>;

    async fn do_lookup(&self, url: &Url) -> Result<Vec<Url>>;

    async fn do_destroy(&self);

    /// Wire the event sink; called once before any other operation
    fn attach(&self, events: BackendEvents);
}

/// Callbacks a backend fires into the failback layer
#[derive(Clone)]
pub struct BackendEvents {
    on_change: Arc<dyn Fn(Url, Vec<Url>) + Send + Sync>,
    on_reconnected: Arc<dyn Fn() + Send + Sync>,
}

impl BackendEvents {
    /// Full state for one subscription changed
    pub fn on_change(&self, subscribe_url: Url, urls: Vec<Url>) {
        (self.on_change)(subscribe_url, urls);
    }

    /// The backend session was re-established after a loss
    pub fn on_reconnected(&self) {
        (self.on_reconnected)();
    }
}

#[derive(Default)]
struct FailedSets {
    register: HashSet<Url>,
    unregister: HashSet<Url>,
    subscribe: HashSet<Url>,
    unsubscribe: HashSet<Url>,
}

/// Registry with background retry over an arbitrary backend
pub struct FailbackRegistry<B: RegistryBackend> {
    state: Arc<RegistryState>,
    backend: Arc<B>,
    failed: Mutex<FailedSets>,
    retry_period: Duration,
}

impl<B: RegistryBackend> FailbackRegistry<B> {
    pub fn new(url: Url, backend: Arc<B>) -> Arc<Self> {
        let retry_period = url.param_duration_ms(RETRY_PERIOD_KEY, DEFAULT_RETRY_PERIOD_MS);
        let registry = Arc::new(Self {
            state: Arc::new(RegistryState::new(url)),
            backend,
            failed: Mutex::new(FailedSets::default()),
            retry_period,
        });

        let weak = Arc::downgrade(&registry);
        // one ordered queue per registry so rapid changes are delivered in
        // the order the backend observed them
        let (change_tx, mut change_rx) =
            tokio::sync::mpsc::unbounded_channel::<(Url, Vec<Url>)>();
        {
            let weak = weak.clone();
            tokio::spawn(async move {
                while let Some((subscribe_url, urls)) = change_rx.recv().await {
                    let Some(registry) = weak.upgrade() else { break };
                    for subscription in registry.state.subscriptions_for(&subscribe_url) {
                        registry.state.notify(&subscription, urls.clone()).await;
                    }
                }
            });
        }
        registry.backend.attach(BackendEvents {
            on_change: Arc::new(move |subscribe_url: Url, urls: Vec<Url>| {
                change_tx.send((subscribe_url, urls)).ok();
            }),
            on_reconnected: Arc::new({
                let weak = weak.clone();
                move || {
                    let weak = weak.clone();
                    tokio::spawn(async move {
                        if let Some(registry) = weak.upgrade() {
                            registry.recover().await;
                        }
                    });
                }
            }),
        });

        Self::start_retry_task(weak, retry_period);
        registry
    }

    fn start_retry_task(weak: Weak<Self>, period: Duration) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let Some(registry) = weak.upgrade() else { break };
                if registry.state.is_destroyed() {
                    break;
                }
                registry.retry().await;
            }
        });
    }

    pub fn state(&self) -> &Arc<RegistryState> {
        &self.state
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    fn check(url: &Url) -> bool {
        url.param_bool(CHECK_KEY, true)
    }

    /// Queue everything for replay after a session was re-established
    async fn recover(&self) {
        let registered = self.state.registered();
        let subscriptions = self.state.subscriptions();
        info!(
            "recovering registry {}: {} registrations, {} subscriptions",
            self.state.url().address(),
            registered.len(),
            subscriptions.len()
        );
        {
            let mut failed = self.failed.lock();
            for url in registered {
                failed.register.insert(url);
            }
            for subscription in subscriptions {
                failed.subscribe.insert(subscription.url.clone());
            }
        }
        self.retry().await;
    }

    /// Replay every parked operation once
    pub async fn retry(&self) {
        let snapshot = {
            let mut failed = self.failed.lock();
            FailedSets {
                register: std::mem::take(&mut failed.register),
                unregister: std::mem::take(&mut failed.unregister),
                subscribe: std::mem::take(&mut failed.subscribe),
                unsubscribe: std::mem::take(&mut failed.unsubscribe),
            }
        };

        for url in snapshot.register {
            if let Err(e) = self.backend.do_register(&url).await {
                debug!("retry register {} failed: {}", url.address(), e);
                self.failed.lock().register.insert(url);
            }
        }
        for url in snapshot.unregister {
            if let Err(e) = self.backend.do_unregister(&url).await {
                self.failed.lock().unregister.insert(url);
                debug!("retry unregister failed: {}", e);
            }
        }
        for url in snapshot.subscribe {
            match self.backend.do_subscribe(&url).await {
                Ok(urls) => {
                    for subscription in self.state.subscriptions_for(&url) {
                        self.state.notify(&subscription, urls.clone()).await;
                    }
                }
                Err(e) => {
                    debug!("retry subscribe {} failed: {}", url.service_key(), e);
                    self.failed.lock().subscribe.insert(url);
                }
            }
        }
        for url in snapshot.unsubscribe {
            if let Err(e) = self.backend.do_unsubscribe(&url).await {
                self.failed.lock().unsubscribe.insert(url);
                debug!("retry unsubscribe failed: {}", e);
            }
        }
    }

    #[cfg(test)]
    fn failed_register_len(&self) -> usize {
        self.failed.lock().register.len()
    }
}

#[async_trait]
impl<B: RegistryBackend> Registry for FailbackRegistry<B> {
    fn url(&self) -> &Url {
        self.state.url()
    }

    fn is_available(&self) -> bool {
        !self.state.is_destroyed() && self.backend.is_connected()
    }

    async fn register(&self, url: &Url) -> Result<()> {
        if self.state.is_destroyed() {
            return Err(Error::Destroyed(format!("registry {}", self.state.url().address())));
        }
        self.state.add_registered(url);
        match self.backend.do_register(url).await {
            Ok(()) => Ok(()),
            Err(e) if Self::check(url) => Err(e),
            Err(e) => {
                warn!("register {} failed, will retry: {}", url.address(), e);
                self.failed.lock().register.insert(url.clone());
                Ok(())
            }
        }
    }

    async fn unregister(&self, url: &Url) -> Result<()> {
        self.state.remove_registered(url);
        self.failed.lock().register.remove(url);
        match self.backend.do_unregister(url).await {
            Ok(()) => Ok(()),
            Err(e) if Self::check(url) => Err(e),
            Err(e) => {
                warn!("unregister {} failed, will retry: {}", url.address(), e);
                self.failed.lock().unregister.insert(url.clone());
                Ok(())
            }
        }
    }

    async fn subscribe(&self, url: &Url, listener: Arc<dyn NotifyListener>) -> Result<()> {
        if self.state.is_destroyed() {
            return Err(Error::Destroyed(format!("registry {}", self.state.url().address())));
        }
        let subscription = Subscription::new(url.clone(), listener);
        self.state.add_subscription(subscription.clone());
        match self.backend.do_subscribe(url).await {
            Ok(urls) => {
                self.state.notify(&subscription, urls).await;
                Ok(())
            }
            Err(e) => {
                let cached = self.state.cached_urls(url);
                if !cached.is_empty() {
                    warn!(
                        "subscribe {} failed, serving {} cached urls: {}",
                        url.service_key(),
                        cached.len(),
                        e
                    );
                    self.state.notify(&subscription, cached).await;
                    self.failed.lock().subscribe.insert(url.clone());
                    Ok(())
                } else if Self::check(url) {
                    Err(e)
                } else {
                    warn!("subscribe {} failed, will retry: {}", url.service_key(), e);
                    self.failed.lock().subscribe.insert(url.clone());
                    Ok(())
                }
            }
        }
    }

    async fn unsubscribe(&self, url: &Url, listener: Arc<dyn NotifyListener>) -> Result<()> {
        self.state.remove_subscription(url, &listener);
        // only drop the backend watch when no listener remains on this url
        if self.state.subscriptions_for(url).is_empty() {
            self.failed.lock().subscribe.remove(url);
            if let Err(e) = self.backend.do_unsubscribe(url).await {
                warn!("unsubscribe {} failed, will retry: {}", url.service_key(), e);
                self.failed.lock().unsubscribe.insert(url.clone());
            }
        }
        Ok(())
    }

    async fn lookup(&self, url: &Url) -> Result<Vec<Url>> {
        if self.backend.is_connected() {
            self.backend.do_lookup(url).await
        } else {
            Ok(self.state.cached_urls(url))
        }
    }

    async fn destroy(&self) {
        if !self.state.mark_destroyed() {
            return;
        }
        for url in self.state.registered() {
            if is_ephemeral(&url) {
                if let Err(e) = self.backend.do_unregister(&url).await {
                    warn!("destroy: unregister {} failed: {}", url.address(), e);
                }
            }
        }
        for subscription in self.state.subscriptions() {
            if let Err(e) = self.backend.do_unsubscribe(&subscription.url).await {
                warn!("destroy: unsubscribe failed: {}", e);
            }
        }
        self.backend.do_destroy().await;
        info!("registry {} destroyed", self.state.url().address());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Backend that can be switched off to exercise the retry sets
    struct FlakyBackend {
        up: AtomicBool,
        registered: RwLock<Vec<Url>>,
    }

    impl FlakyBackend {
        fn new(up: bool) -> Arc<Self> {
            Arc::new(Self { up: AtomicBool::new(up), registered: RwLock::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl RegistryBackend for FlakyBackend {
        fn is_connected(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }

        async fn do_register(&self, url: &Url) -> Result<()> {
            if !self.is_connected() {
                return Err(Error::Network("backend down".into()));
            }
            self.registered.write().push(url.clone());
            Ok(())
        }

        async fn do_unregister(&self, _url: &Url) -> Result<()> {
            Ok(())
        }

        async fn do_subscribe(&self, _url: &Url) -> Result<Vec<Url>> {
            Err(Error::Network("backend down".into()))
        }

        async fn do_unsubscribe(&self, _url: &Url) -> Result<()> {
            Ok(())
        }

        async fn do_lookup(&self, _url: &Url) -> Result<Vec<Url>> {
            Ok(Vec::new())
        }

        async fn do_destroy(&self) {}

        fn attach(&self, _events: BackendEvents) {}
    }

    fn registry_url() -> Url {
        Url::new("memory", "127.0.0.1", 0, "registry")
            .with_param("cache", false)
            .with_param(RETRY_PERIOD_KEY, 30)
    }

    fn provider() -> Url {
        Url::new("mizzen", "10.0.0.1", 20880, "org.demo.Hello")
    }

    #[tokio::test]
    async fn check_true_surfaces_register_failure() {
        let backend = FlakyBackend::new(false);
        let registry = FailbackRegistry::new(registry_url(), backend);
        let err = registry.register(&provider()).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn check_false_parks_failure_for_retry() {
        let backend = FlakyBackend::new(false);
        let registry = FailbackRegistry::new(registry_url(), backend.clone());
        let url = provider().with_param(CHECK_KEY, false);
        registry.register(&url).await.unwrap();
        assert_eq!(registry.failed_register_len(), 1);

        // backend comes back; the periodic task replays the registration
        backend.up.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(registry.failed_register_len(), 0);
        assert_eq!(backend.registered.read().len(), 1);
    }

    #[tokio::test]
    async fn destroyed_registry_refuses_work() {
        let backend = FlakyBackend::new(true);
        let registry = FailbackRegistry::new(registry_url(), backend);
        registry.destroy().await;
        registry.destroy().await; // idempotent
        assert!(registry.register(&provider()).await.is_err());
    }
}

//! Shared registry bookkeeping: subscriptions, notified state, cache
//! fall-through, and reconnect pacing

use crate::cache::DiskCache;
use crate::registry::{categories_of, NotifyListener};
use mizzen_core::constants::{APPLICATION_KEY, CATEGORY_KEY, FILE_KEY, PROVIDERS_CATEGORY};
use mizzen_core::Url;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One live subscription: the condition URL, its listener, and a delivery
/// lock that serializes notifications to this listener
pub struct Subscription {
    pub url: Url,
    pub listener: Arc<dyn NotifyListener>,
    delivery: tokio::sync::Mutex<()>,
}

impl Subscription {
    pub fn new(url: Url, listener: Arc<dyn NotifyListener>) -> Arc<Self> {
        Arc::new(Self { url, listener, delivery: tokio::sync::Mutex::new(()) })
    }
}

/// Bookkeeping carried by every registry implementation
pub struct RegistryState {
    url: Url,
    registered: RwLock<Vec<Url>>,
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
    /// last notified state per (subscribe url, category)
    notified: RwLock<HashMap<String, HashMap<String, Vec<Url>>>>,
    cache: Option<Arc<DiskCache>>,
    destroyed: AtomicBool,
}

impl RegistryState {
    pub fn new(url: Url) -> Self {
        let cache = if url.param_bool("cache", true) {
            let path = url
                .param(FILE_KEY)
                .map(std::path::PathBuf::from)
                .unwrap_or_else(|| {
                    DiskCache::default_path(
                        url.param_or(APPLICATION_KEY, "mizzen"),
                        &url.address(),
                    )
                });
            Some(DiskCache::open(path))
        } else {
            None
        };
        Self {
            url,
            registered: RwLock::new(Vec::new()),
            subscriptions: RwLock::new(Vec::new()),
            notified: RwLock::new(HashMap::new()),
            cache,
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn mark_destroyed(&self) -> bool {
        !self.destroyed.swap(true, Ordering::SeqCst)
    }

    pub fn add_registered(&self, url: &Url) {
        let mut registered = self.registered.write();
        if !registered.contains(url) {
            registered.push(url.clone());
        }
    }

    pub fn remove_registered(&self, url: &Url) {
        self.registered.write().retain(|u| u != url);
    }

    pub fn registered(&self) -> Vec<Url> {
        self.registered.read().clone()
    }

    pub fn add_subscription(&self, subscription: Arc<Subscription>) {
        self.subscriptions.write().push(subscription);
    }

    pub fn remove_subscription(&self, url: &Url, listener: &Arc<dyn NotifyListener>) {
        self.subscriptions
            .write()
            .retain(|s| !(s.url == *url && Arc::ptr_eq(&s.listener, listener)));
    }

    pub fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions.read().clone()
    }

    pub fn subscriptions_for(&self, subscribe_url: &Url) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .read()
            .iter()
            .filter(|s| s.url == *subscribe_url)
            .cloned()
            .collect()
    }

    /// Deliver a full-state notification to one subscription.
    ///
    /// `urls` may span several categories; each subscribed category present
    /// in it is delivered as its own listener call, serialized per
    /// subscription. Empty categories must already be encoded as `empty://`
    /// URLs by the caller.
    pub async fn notify(&self, subscription: &Subscription, urls: Vec<Url>) {
        let mut by_category: HashMap<String, Vec<Url>> = HashMap::new();
        for url in urls {
            by_category.entry(url.category().to_string()).or_default().push(url);
        }

        let subscribed = categories_of(&subscription.url);
        let _delivery = subscription.delivery.lock().await;
        for category in subscribed {
            let Some(category_urls) = by_category.remove(&category) else { continue };
            {
                let mut notified = self.notified.write();
                notified
                    .entry(subscription.url.to_full_string().to_string())
                    .or_default()
                    .insert(category.clone(), category_urls.clone());
            }
            self.save_cache(&subscription.url);
            debug!(
                "notifying {} with {} urls for category {}",
                subscription.url.service_key(),
                category_urls.len(),
                category
            );
            subscription.listener.notify(category_urls).await;
        }
    }

    fn save_cache(&self, subscribe_url: &Url) {
        let Some(cache) = &self.cache else { return };
        let notified = self.notified.read();
        let Some(categories) = notified.get(subscribe_url.to_full_string()) else { return };
        let mut all: Vec<Url> = Vec::new();
        for urls in categories.values() {
            all.extend(urls.iter().cloned());
        }
        cache.put(subscribe_url.service_key(), &all);
    }

    /// Last notified state for a subscription, falling back to the disk
    /// cache, with empty markers filtered out
    pub fn cached_urls(&self, subscribe_url: &Url) -> Vec<Url> {
        let notified = self.notified.read();
        if let Some(categories) = notified.get(subscribe_url.to_full_string()) {
            let mut all: Vec<Url> = Vec::new();
            for urls in categories.values() {
                all.extend(
                    urls.iter()
                        .filter(|u| u.protocol() != mizzen_core::constants::EMPTY_PROTOCOL)
                        .cloned(),
                );
            }
            return all;
        }
        drop(notified);
        match &self.cache {
            Some(cache) => cache.get(subscribe_url.service_key()),
            None => Vec::new(),
        }
    }
}

/// Exponential backoff with jitter for registry reconnects
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    ceiling: Duration,
    jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { base: Duration::from_millis(100), ceiling: Duration::from_secs(30), jitter: 0.2 }
    }
}

impl ReconnectPolicy {
    pub fn new(base: Duration, ceiling: Duration, jitter: f64) -> Self {
        Self { base, ceiling, jitter }
    }

    /// Delay before reconnect attempt `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt.min(20)))
            .min(self.ceiling);
        let jitter = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        exp.mul_f64((1.0 + jitter).max(0.05))
    }
}

/// A provider URL is ephemeral unless registered with `dynamic=false`
pub fn is_ephemeral(url: &Url) -> bool {
    url.param_bool(mizzen_core::constants::DYNAMIC_KEY, true)
}

/// Category helper used when registering
pub fn category_or_default(url: &Url) -> &str {
    url.param_or(CATEGORY_KEY, PROVIDERS_CATEGORY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct Collect(Arc<Mutex<Vec<Vec<Url>>>>);

    #[async_trait]
    impl NotifyListener for Collect {
        async fn notify(&self, urls: Vec<Url>) {
            self.0.lock().push(urls);
        }
    }

    fn provider(host: &str) -> Url {
        Url::new("mizzen", host, 20880, "org.demo.Hello")
    }

    #[tokio::test]
    async fn notify_splits_by_category() {
        let state = RegistryState::new(
            Url::new("memory", "127.0.0.1", 0, "registry").with_param("cache", false),
        );
        let subscribe = Url::new("consumer", "127.0.0.1", 0, "org.demo.Hello")
            .with_param(CATEGORY_KEY, "providers,routers");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let subscription = Subscription::new(subscribe.clone(), Arc::new(Collect(seen.clone())));

        let router = provider("10.0.0.9").with_param(CATEGORY_KEY, "routers");
        state
            .notify(&subscription, vec![provider("10.0.0.1"), provider("10.0.0.2"), router])
            .await;

        let notifications = seen.lock().clone();
        assert_eq!(notifications.len(), 2);
        let sizes: Vec<usize> = notifications.iter().map(|n| n.len()).collect();
        assert!(sizes.contains(&2) && sizes.contains(&1));
    }

    #[tokio::test]
    async fn unsubscribed_categories_are_dropped() {
        let state = RegistryState::new(
            Url::new("memory", "127.0.0.1", 0, "registry").with_param("cache", false),
        );
        let subscribe = Url::new("consumer", "127.0.0.1", 0, "org.demo.Hello");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let subscription = Subscription::new(subscribe, Arc::new(Collect(seen.clone())));

        let configurator = provider("10.0.0.9").with_param(CATEGORY_KEY, "configurators");
        state.notify(&subscription, vec![configurator]).await;
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn notified_state_feeds_cached_urls() {
        let state = RegistryState::new(
            Url::new("memory", "127.0.0.1", 0, "registry").with_param("cache", false),
        );
        let subscribe = Url::new("consumer", "127.0.0.1", 0, "org.demo.Hello");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let subscription = Subscription::new(subscribe.clone(), Arc::new(Collect(seen)));

        state.notify(&subscription, vec![provider("10.0.0.1")]).await;
        assert_eq!(state.cached_urls(&subscribe), vec![provider("10.0.0.1")]);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = ReconnectPolicy::new(
            Duration::from_millis(100),
            Duration::from_secs(5),
            0.0,
        );
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(30), Duration::from_secs(5));
    }

    #[test]
    fn dynamic_false_is_persistent() {
        let url = provider("10.0.0.1");
        assert!(is_ephemeral(&url));
        assert!(!is_ephemeral(&url.with_param("dynamic", false)));
    }
}

//! Registry contract
//!
//! A registry stores URLs partitioned by category under a service key and
//! pushes full-state notifications to subscribers. Every backend honors the
//! same contract: `check=false` swallows registration failures into
//! background retry, `dynamic=false` entries survive session loss,
//! notifications always carry the complete state for a category (an empty
//! category is a single `empty://` URL), and registrations plus
//! subscriptions are restored automatically after a reconnect.

use async_trait::async_trait;
use mizzen_core::constants::{
    ANY_CATEGORY, CATEGORY_KEY, EMPTY_PROTOCOL, PROVIDERS_CATEGORY,
};
use mizzen_core::{Result, Url};
use std::sync::Arc;

/// Receives full-state change notifications for one subscription
#[async_trait]
pub trait NotifyListener: Send + Sync {
    /// `urls` is the complete current state of one category, never a delta;
    /// an empty category arrives as a single URL with the `empty` protocol
    async fn notify(&self, urls: Vec<Url>);
}

/// Register/subscribe surface of a registry backend
#[async_trait]
pub trait Registry: Send + Sync {
    fn url(&self) -> &Url;

    fn is_available(&self) -> bool;

    async fn register(&self, url: &Url) -> Result<()>;

    async fn unregister(&self, url: &Url) -> Result<()>;

    async fn subscribe(&self, url: &Url, listener: Arc<dyn NotifyListener>) -> Result<()>;

    async fn unsubscribe(&self, url: &Url, listener: Arc<dyn NotifyListener>) -> Result<()>;

    /// Pull-mode counterpart of subscribe
    async fn lookup(&self, url: &Url) -> Result<Vec<Url>>;

    async fn destroy(&self);
}

/// Creates (and caches) registries from registry URLs
#[async_trait]
pub trait RegistryFactory: Send + Sync {
    async fn get(&self, url: &Url) -> Result<Arc<dyn Registry>>;

    /// Destroy every registry this factory handed out
    async fn destroy_all(&self);
}

/// Registry type for registry factories
pub type RegistryFactoryRegistry =
    mizzen_core::extension::ExtensionRegistry<dyn RegistryFactory>;

/// Categories a subscribe URL asks for; `*` subscribes to all of them
pub fn categories_of(url: &Url) -> Vec<String> {
    match url.param(CATEGORY_KEY) {
        Some(ANY_CATEGORY) => vec![
            PROVIDERS_CATEGORY.to_string(),
            mizzen_core::constants::CONSUMERS_CATEGORY.to_string(),
            mizzen_core::constants::ROUTERS_CATEGORY.to_string(),
            mizzen_core::constants::CONFIGURATORS_CATEGORY.to_string(),
        ],
        Some(list) => list
            .split(',')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect(),
        None => vec![PROVIDERS_CATEGORY.to_string()],
    }
}

/// Whether a registered URL is interesting to a subscription
pub fn is_match(subscribe: &Url, registered: &Url) -> bool {
    if subscribe.service_key() != registered.service_key() {
        return false;
    }
    categories_of(subscribe)
        .iter()
        .any(|c| c == registered.category())
}

/// The placeholder URL that announces "this category is now empty"
pub fn empty_url(subscribe: &Url, category: &str) -> Url {
    Url::new(EMPTY_PROTOCOL, subscribe.host(), subscribe.port(), subscribe.path())
        .with_param(CATEGORY_KEY, category)
}

/// True when the notification list is the empty placeholder
pub fn is_empty_notification(urls: &[Url]) -> bool {
    urls.is_empty() || (urls.len() == 1 && urls[0].protocol() == EMPTY_PROTOCOL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_category_is_providers() {
        let url = Url::new("consumer", "127.0.0.1", 0, "org.demo.Hello");
        assert_eq!(categories_of(&url), vec!["providers"]);
    }

    #[test]
    fn star_expands_to_all_categories() {
        let url = Url::new("consumer", "127.0.0.1", 0, "s").with_param(CATEGORY_KEY, "*");
        assert_eq!(categories_of(&url).len(), 4);
    }

    #[test]
    fn match_requires_key_and_category() {
        let subscribe = Url::new("consumer", "127.0.0.1", 0, "org.demo.Hello")
            .with_param(CATEGORY_KEY, "providers,routers");
        let provider = Url::new("mizzen", "10.0.0.1", 20880, "org.demo.Hello");
        assert!(is_match(&subscribe, &provider));

        let configurator = provider.with_param(CATEGORY_KEY, "configurators");
        assert!(!is_match(&subscribe, &configurator));

        let other = Url::new("mizzen", "10.0.0.1", 20880, "org.demo.Other");
        assert!(!is_match(&subscribe, &other));
    }

    #[test]
    fn empty_notification_detection() {
        let subscribe = Url::new("consumer", "127.0.0.1", 0, "org.demo.Hello");
        let empty = empty_url(&subscribe, "providers");
        assert!(is_empty_notification(&[empty]));
        let provider = Url::new("mizzen", "10.0.0.1", 20880, "org.demo.Hello");
        assert!(!is_empty_notification(std::slice::from_ref(&provider)));
    }
}

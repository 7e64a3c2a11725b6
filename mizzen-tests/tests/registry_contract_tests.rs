/// The notification contract as consumers observe it through the factory:
/// full state per category, empties encoded, convergence after changes.

use async_trait::async_trait;
use mizzen_core::Url;
use mizzen_registry::{
    is_empty_notification, MemoryRegistryFactory, NotifyListener, Registry, RegistryFactory,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

struct Collect(Arc<Mutex<Vec<Vec<Url>>>>);

#[async_trait]
impl NotifyListener for Collect {
    async fn notify(&self, urls: Vec<Url>) {
        self.0.lock().push(urls);
    }
}

fn provider(hub_path: &str, host: &str) -> Url {
    Url::new("mizzen", host, 20880, hub_path).with_param("check", false)
}

fn router_url(hub_path: &str) -> Url {
    Url::new("condition", "0.0.0.0", 0, hub_path)
        .with_param("category", "routers")
        .with_param("rule", "host = * => host = 10.0.0.1")
        .with_param("check", false)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(80)).await;
}

/// Test: subscribing with two categories yields exactly one full
/// notification per category, and an unregister reissues the complete
/// provider set.
#[tokio::test]
async fn full_state_per_category() {
    let interface = "org.demo.Contract";
    let factory = MemoryRegistryFactory::new();
    let registry = factory
        .get(&Url::new("memory", "contract-hub", 0, "").with_param("cache", false))
        .await
        .unwrap();

    for host in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
        registry.register(&provider(interface, host)).await.unwrap();
    }
    registry.register(&router_url(interface)).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscribe = Url::new("consumer", "127.0.0.1", 0, interface)
        .with_param("category", "providers,routers")
        .with_param("check", false);
    registry
        .subscribe(&subscribe, Arc::new(Collect(seen.clone())))
        .await
        .unwrap();
    settle().await;

    {
        let notifications = seen.lock();
        assert_eq!(notifications.len(), 2, "one notification per category");
        let mut sizes: Vec<usize> = notifications.iter().map(|n| n.len()).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, 3]);
    }

    registry
        .unregister(&provider(interface, "10.0.0.2"))
        .await
        .unwrap();
    settle().await;

    let notifications = seen.lock();
    let last = notifications.last().unwrap();
    assert_eq!(last.len(), 2, "full provider state, never a delta");
    assert!(last.iter().all(|u| u.host() != "10.0.0.2"));
}

/// Test: the very first notification for a bare category is the empty
/// marker, not silence.
#[tokio::test]
async fn empty_categories_notify_explicitly() {
    let factory = MemoryRegistryFactory::new();
    let registry = factory
        .get(&Url::new("memory", "contract-empty-hub", 0, "").with_param("cache", false))
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscribe = Url::new("consumer", "127.0.0.1", 0, "org.demo.Bare")
        .with_param("category", "providers,configurators")
        .with_param("check", false);
    registry
        .subscribe(&subscribe, Arc::new(Collect(seen.clone())))
        .await
        .unwrap();
    settle().await;

    let notifications = seen.lock();
    assert_eq!(notifications.len(), 2);
    for urls in notifications.iter() {
        assert!(is_empty_notification(urls));
    }
}

/// Test: lookup is the pull-mode twin of subscribe.
#[tokio::test]
async fn lookup_returns_current_state() {
    let interface = "org.demo.Pull";
    let factory = MemoryRegistryFactory::new();
    let registry = factory
        .get(&Url::new("memory", "contract-pull-hub", 0, "").with_param("cache", false))
        .await
        .unwrap();

    registry.register(&provider(interface, "10.0.0.1")).await.unwrap();
    registry.register(&provider(interface, "10.0.0.2")).await.unwrap();

    let consumer = Url::new("consumer", "127.0.0.1", 0, interface);
    let urls = registry.lookup(&consumer).await.unwrap();
    assert_eq!(urls.len(), 2);

    registry.unregister(&provider(interface, "10.0.0.1")).await.unwrap();
    let urls = registry.lookup(&consumer).await.unwrap();
    assert_eq!(urls.len(), 1);
}

/// Test: destroying through the factory destroys every registry it built.
#[tokio::test]
async fn factory_destroy_all() {
    let factory = MemoryRegistryFactory::new();
    let registry = factory
        .get(&Url::new("memory", "contract-destroy-hub", 0, "").with_param("cache", false))
        .await
        .unwrap();
    assert!(registry.is_available());

    factory.destroy_all().await;
    assert!(!registry.is_available());
    assert!(registry
        .register(&provider("org.demo.Dead", "10.0.0.1"))
        .await
        .is_err());
}

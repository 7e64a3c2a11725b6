//! In-process registry backend
//!
//! A [`MemoryHub`] plays the coordination service: named process-wide state
//! with ephemeral-per-session entries and change watchers, plus a switch to
//! take it "down" so session loss and recovery paths can be exercised.
//! [`MemoryBackend`] is the registry client over it, with the usual session
//! state machine and backoff reconnect.

use crate::failback::{BackendEvents, FailbackRegistry, RegistryBackend};
use crate::registry::{
    categories_of, empty_url, is_match, Registry, RegistryFactory,
};
use crate::support::{category_or_default, is_ephemeral, ReconnectPolicy};
use async_trait::async_trait;
use dashmap::DashMap;
use mizzen_core::{Error, Result, Url};
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

static HUBS: Lazy<DashMap<String, Arc<MemoryHub>>> = Lazy::new(DashMap::new);

struct HubEntry {
    url: Url,
    service_key: String,
    category: String,
    session: u64,
    ephemeral: bool,
}

type ChangeFn = Arc<dyn Fn(&str, &str) + Send + Sync>;

struct HubWatcher {
    session: u64,
    notify: ChangeFn,
}

/// Simulated coordination service shared by name within the process
pub struct MemoryHub {
    name: String,
    entries: Mutex<Vec<HubEntry>>,
    watchers: Mutex<Vec<HubWatcher>>,
    next_session: AtomicU64,
    down: AtomicBool,
}

impl MemoryHub {
    /// The hub registered under `name`, created on first use
    pub fn get(name: &str) -> Arc<MemoryHub> {
        HUBS.entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryHub {
                    name: name.to_string(),
                    entries: Mutex::new(Vec::new()),
                    watchers: Mutex::new(Vec::new()),
                    next_session: AtomicU64::new(1),
                    down: AtomicBool::new(false),
                })
            })
            .clone()
    }

    /// Drop a hub entirely; test isolation helper
    pub fn drop_hub(name: &str) {
        HUBS.remove(name);
    }

    /// Take the hub offline: sessions cannot be opened until it comes back
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
        info!("hub {} is now {}", self.name, if down { "down" } else { "up" });
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }

    fn open_session(&self) -> Result<u64> {
        if self.is_down() {
            return Err(Error::Network(format!("registry hub {} unreachable", self.name)));
        }
        Ok(self.next_session.fetch_add(1, Ordering::Relaxed))
    }

    /// End a session: its ephemeral entries vanish and watchers detach
    fn close_session(&self, session: u64) {
        let mut changed = Vec::new();
        {
            let mut entries = self.entries.lock();
            entries.retain(|e| {
                if e.session == session && e.ephemeral {
                    changed.push((e.service_key.clone(), e.category.clone()));
                    false
                } else {
                    true
                }
            });
        }
        self.watchers.lock().retain(|w| w.session != session);
        for (service_key, category) in changed {
            self.fire(&service_key, &category);
        }
    }

    fn register(&self, session: u64, url: &Url) -> Result<()> {
        if self.is_down() {
            return Err(Error::Network(format!("registry hub {} unreachable", self.name)));
        }
        let entry = HubEntry {
            service_key: url.service_key().to_string(),
            category: category_or_default(url).to_string(),
            session,
            ephemeral: is_ephemeral(url),
            url: url.clone(),
        };
        let (service_key, category) = (entry.service_key.clone(), entry.category.clone());
        {
            let mut entries = self.entries.lock();
            // same URL re-registered moves to the new session, last writer wins
            entries.retain(|e| e.url != entry.url);
            entries.push(entry);
        }
        self.fire(&service_key, &category);
        Ok(())
    }

    fn unregister(&self, url: &Url) -> Result<()> {
        if self.is_down() {
            return Err(Error::Network(format!("registry hub {} unreachable", self.name)));
        }
        let service_key = url.service_key().to_string();
        let category = category_or_default(url).to_string();
        let removed = {
            let mut entries = self.entries.lock();
            let before = entries.len();
            entries.retain(|e| e.url != *url);
            before != entries.len()
        };
        if removed {
            self.fire(&service_key, &category);
        }
        Ok(())
    }

    /// Current full state for one (service key, category)
    pub fn children(&self, service_key: &str, category: &str) -> Vec<Url> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.service_key == service_key && e.category == category)
            .map(|e| e.url.clone())
            .collect()
    }

    fn add_watcher(&self, session: u64, notify: ChangeFn) {
        self.watchers.lock().push(HubWatcher { session, notify });
    }

    fn fire(&self, service_key: &str, category: &str) {
        let watchers: Vec<ChangeFn> = {
            let watchers = self.watchers.lock();
            watchers.iter().map(|w| w.notify.clone()).collect()
        };
        for notify in watchers {
            notify(service_key, category);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    SessionLost,
    Destroyed,
}

/// Registry client over a [`MemoryHub`]
pub struct MemoryBackend {
    hub: Arc<MemoryHub>,
    session: AtomicU64,
    state: Mutex<SessionState>,
    subscribed: Arc<Mutex<Vec<Url>>>,
    events: OnceCell<BackendEvents>,
    policy: ReconnectPolicy,
    weak_self: OnceCell<std::sync::Weak<MemoryBackend>>,
}

impl MemoryBackend {
    pub fn new(hub: Arc<MemoryHub>) -> Arc<Self> {
        let backend = Arc::new(Self {
            hub,
            session: AtomicU64::new(0),
            state: Mutex::new(SessionState::Disconnected),
            subscribed: Arc::new(Mutex::new(Vec::new())),
            events: OnceCell::new(),
            policy: ReconnectPolicy::default(),
            weak_self: OnceCell::new(),
        });
        backend.weak_self.set(Arc::downgrade(&backend)).ok();
        backend
    }

    pub fn session_state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn hub(&self) -> &Arc<MemoryHub> {
        &self.hub
    }

    fn watcher(&self) -> ChangeFn {
        let subscribed = self.subscribed.clone();
        let hub = self.hub.clone();
        let events = self.events.get().cloned();
        Arc::new(move |service_key: &str, category: &str| {
            let Some(events) = events.as_ref() else { return };
            let interested: Vec<Url> = subscribed
                .lock()
                .iter()
                .filter(|sub| {
                    sub.service_key() == service_key
                        && categories_of(sub).iter().any(|c| c == category)
                })
                .cloned()
                .collect();
            for sub in interested {
                let mut urls = hub.children(service_key, category);
                if urls.is_empty() {
                    urls.push(empty_url(&sub, category));
                }
                events.on_change(sub, urls);
            }
        })
    }

    fn establish(&self) -> Result<()> {
        let session = self.hub.open_session()?;
        self.session.store(session, Ordering::SeqCst);
        self.hub.add_watcher(session, self.watcher());
        *self.state.lock() = SessionState::Connected;
        debug!("session {} opened on hub {}", session, self.hub.name);
        Ok(())
    }

    /// Simulate losing the backend session: ephemeral registrations vanish
    /// and a background task reconnects with backoff
    pub fn disconnect(self: &Arc<Self>) {
        let session = self.session.swap(0, Ordering::SeqCst);
        if session == 0 {
            return;
        }
        {
            let mut state = self.state.lock();
            if *state == SessionState::Destroyed {
                return;
            }
            *state = SessionState::SessionLost;
        }
        warn!("session {} on hub {} lost", session, self.hub.name);
        self.hub.close_session(session);
        Self::spawn_reconnect(self.clone());
    }

    fn spawn_reconnect(this: Arc<Self>) {
        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                if *this.state.lock() == SessionState::Destroyed {
                    return;
                }
                tokio::time::sleep(this.policy.delay(attempt)).await;
                attempt += 1;
                {
                    let mut state = this.state.lock();
                    if *state == SessionState::Destroyed {
                        return;
                    }
                    *state = SessionState::Connecting;
                }
                match this.establish() {
                    Ok(()) => {
                        info!("hub {} session re-established", this.hub.name);
                        if let Some(events) = this.events.get() {
                            events.on_reconnected();
                        }
                        return;
                    }
                    Err(e) => {
                        debug!("reconnect attempt {} failed: {}", attempt, e);
                        *this.state.lock() = SessionState::SessionLost;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl RegistryBackend for MemoryBackend {
    fn is_connected(&self) -> bool {
        *self.state.lock() == SessionState::Connected && !self.hub.is_down()
    }

    async fn do_register(&self, url: &Url) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Network(format!("no session on hub {}", self.hub.name)));
        }
        self.hub.register(self.session.load(Ordering::SeqCst), url)
    }

    async fn do_unregister(&self, url: &Url) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Network(format!("no session on hub {}", self.hub.name)));
        }
        self.hub.unregister(url)
    }

    async fn do_subscribe(&self, url: &Url) -> Result<Vec<Url>> {
        if !self.is_connected() {
            return Err(Error::Network(format!("no session on hub {}", self.hub.name)));
        }
        {
            let mut subscribed = self.subscribed.lock();
            if !subscribed.contains(url) {
                subscribed.push(url.clone());
            }
        }
        let mut out = Vec::new();
        for category in categories_of(url) {
            let urls = self.hub.children(url.service_key(), &category);
            if urls.is_empty() {
                out.push(empty_url(url, &category));
            } else {
                out.extend(urls);
            }
        }
        Ok(out)
    }

    async fn do_unsubscribe(&self, url: &Url) -> Result<()> {
        self.subscribed.lock().retain(|u| u != url);
        Ok(())
    }

    async fn do_lookup(&self, url: &Url) -> Result<Vec<Url>> {
        if !self.is_connected() {
            return Err(Error::Network(format!("no session on hub {}", self.hub.name)));
        }
        let mut out = Vec::new();
        let entries = self.hub.entries.lock();
        for entry in entries.iter() {
            if is_match(url, &entry.url) {
                out.push(entry.url.clone());
            }
        }
        Ok(out)
    }

    async fn do_destroy(&self) {
        let session = self.session.swap(0, Ordering::SeqCst);
        *self.state.lock() = SessionState::Destroyed;
        if session != 0 {
            self.hub.close_session(session);
        }
    }

    fn attach(&self, events: BackendEvents) {
        self.events.set(events).ok();
        if let Err(e) = self.establish() {
            warn!("initial session on hub {} failed: {}", self.hub.name, e);
            *self.state.lock() = SessionState::Disconnected;
            // come up through the reconnect path once the hub is back
            if let Some(this) = self.weak_self.get().and_then(|w| w.upgrade()) {
                Self::spawn_reconnect(this);
            }
        }
    }
}

/// Registry over the in-process hub
pub type MemoryRegistry = FailbackRegistry<MemoryBackend>;

/// Creates (and caches) memory registries; the hub name is the registry
/// URL's host
pub struct MemoryRegistryFactory {
    registries: DashMap<String, Arc<dyn Registry>>,
}

impl MemoryRegistryFactory {
    pub fn new() -> Self {
        Self { registries: DashMap::new() }
    }
}

impl Default for MemoryRegistryFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryFactory for MemoryRegistryFactory {
    async fn get(&self, url: &Url) -> Result<Arc<dyn Registry>> {
        let key = url.address();
        if let Some(existing) = self.registries.get(&key) {
            return Ok(existing.value().clone());
        }
        let hub = MemoryHub::get(url.host());
        let backend = MemoryBackend::new(hub);
        let registry: Arc<dyn Registry> = FailbackRegistry::new(url.clone(), backend);
        self.registries.insert(key, registry.clone());
        Ok(registry)
    }

    async fn destroy_all(&self) {
        let registries: Vec<Arc<dyn Registry>> =
            self.registries.iter().map(|entry| entry.value().clone()).collect();
        for registry in registries {
            registry.destroy().await;
        }
        self.registries.clear();
    }
}

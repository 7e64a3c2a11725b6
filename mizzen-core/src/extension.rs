//! Named plug-in registries
//!
//! Every pluggable seam in the framework (protocols, clusters, load
//! balancers, filters, registry backends) is wired through an
//! [`ExtensionRegistry`]: a table of named constructors with a singleton
//! cache, decorator wrappers, activation metadata for building ordered
//! chains, and URL-keyed adaptive selection. Registries are plain values;
//! production code shares them through a context object and tests build
//! their own.

use crate::url::Url;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Constructor for a named extension instance
pub type Constructor<T> = Arc<dyn Fn() -> Arc<T> + Send + Sync>;

/// Decorator applied around every instance produced by a registry
pub type Wrapper<T> = Arc<dyn Fn(Arc<T>) -> Arc<T> + Send + Sync>;

/// Activation metadata: when an extension joins an automatically built
/// chain, and where it sorts
#[derive(Debug, Clone, Default)]
pub struct Activate {
    /// Restrict to one side (`provider`/`consumer`); `None` matches both
    pub group: Option<&'static str>,
    /// Only active when the URL carries this parameter with a value
    pub value_key: Option<&'static str>,
    /// Smaller sorts earlier
    pub order: i32,
}

struct Entry<T: ?Sized> {
    ctor: Constructor<T>,
    activate: Option<Activate>,
}

/// Process-wide registry of named implementations for one interface
pub struct ExtensionRegistry<T: ?Sized + Send + Sync> {
    interface: &'static str,
    default_name: Option<String>,
    entries: RwLock<BTreeMap<String, Entry<T>>>,
    instances: Mutex<HashMap<String, Arc<T>>>,
    wrappers: RwLock<Vec<Wrapper<T>>>,
}

impl<T: ?Sized + Send + Sync> ExtensionRegistry<T> {
    pub fn new(interface: &'static str) -> Self {
        Self {
            interface,
            default_name: None,
            entries: RwLock::new(BTreeMap::new()),
            instances: Mutex::new(HashMap::new()),
            wrappers: RwLock::new(Vec::new()),
        }
    }

    /// Registry whose unresolved adaptive lookups fall back to `default`
    pub fn with_default(interface: &'static str, default: &str) -> Self {
        let mut registry = Self::new(interface);
        registry.default_name = Some(default.to_string());
        registry
    }

    pub fn interface(&self) -> &'static str {
        self.interface
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    pub fn register<F>(&self, name: &str, ctor: F)
    where
        F: Fn() -> Arc<T> + Send + Sync + 'static,
    {
        self.entries.write().insert(
            name.to_string(),
            Entry { ctor: Arc::new(ctor), activate: None },
        );
    }

    /// Register an extension that participates in activate chains
    pub fn register_activate<F>(&self, name: &str, activate: Activate, ctor: F)
    where
        F: Fn() -> Arc<T> + Send + Sync + 'static,
    {
        self.entries.write().insert(
            name.to_string(),
            Entry { ctor: Arc::new(ctor), activate: Some(activate) },
        );
    }

    /// Register a decorator applied to every instance, in registration order
    pub fn register_wrapper<F>(&self, wrapper: F)
    where
        F: Fn(Arc<T>) -> Arc<T> + Send + Sync + 'static,
    {
        self.wrappers.write().push(Arc::new(wrapper));
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Get the cached singleton for `name`, constructing and wrapping it on
    /// first use. At most one instance per (registry, name) ever exists.
    pub fn get(&self, name: &str) -> Result<Arc<T>> {
        let mut instances = self.instances.lock();
        if let Some(existing) = instances.get(name) {
            return Ok(existing.clone());
        }
        let ctor = {
            let entries = self.entries.read();
            let entry = entries.get(name).ok_or_else(|| {
                Error::Extension(format!(
                    "no extension named '{}' for {}",
                    name, self.interface
                ))
            })?;
            entry.ctor.clone()
        };
        let mut instance = ctor();
        for wrapper in self.wrappers.read().iter() {
            instance = wrapper(instance);
        }
        instances.insert(name.to_string(), instance.clone());
        Ok(instance)
    }

    /// Get the default extension
    pub fn get_default(&self) -> Result<Arc<T>> {
        let name = self.default_name.as_deref().ok_or_else(|| {
            Error::Extension(format!("no default extension for {}", self.interface))
        })?;
        self.get(name)
    }

    /// Instances constructed so far, without creating new ones
    pub fn loaded(&self) -> Vec<Arc<T>> {
        self.instances.lock().values().cloned().collect()
    }

    /// Pick an extension by URL: the first of `keys` present on the URL
    /// names the implementation; otherwise the registry default applies.
    pub fn select(&self, url: &Url, keys: &[&str]) -> Result<Arc<T>> {
        for key in keys {
            if let Some(name) = url.param(key) {
                return self.get(name);
            }
        }
        match self.default_name.as_deref() {
            Some(default) => self.get(default),
            None => Err(Error::Extension(format!(
                "no extension resolved for {} from url parameters {:?} and no default",
                self.interface, keys
            ))),
        }
    }

    /// Ordered subset of extensions active for this URL.
    ///
    /// The value list at `url[key]` names extensions explicitly, in list
    /// order; a leading `-` suppresses a name, `-default` suppresses the
    /// whole activate group. Extensions carrying [`Activate`] metadata join
    /// ahead of the explicit names when their group matches and their
    /// value key (if any) is present on the URL.
    pub fn activate(&self, url: &Url, key: &str, group: &str) -> Result<Vec<Arc<T>>> {
        let values: Vec<String> = url
            .param(key)
            .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        let suppressed =
            |name: &str| values.iter().any(|v| v.strip_prefix('-') == Some(name));

        let mut out = Vec::new();
        if !values.iter().any(|v| v == "-default") {
            let mut auto: Vec<(i32, String)> = Vec::new();
            for (name, entry) in self.entries.read().iter() {
                let Some(activate) = &entry.activate else { continue };
                if let Some(g) = activate.group {
                    if g != group {
                        continue;
                    }
                }
                if let Some(value_key) = activate.value_key {
                    if url.param(value_key).is_none() {
                        continue;
                    }
                }
                if suppressed(name) || values.iter().any(|v| v == name) {
                    continue;
                }
                auto.push((activate.order, name.clone()));
            }
            auto.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
            for (_, name) in auto {
                out.push(self.get(&name)?);
            }
        }
        for value in &values {
            if value.starts_with('-') || value == "default" {
                continue;
            }
            out.push(self.get(value)?);
        }
        Ok(out)
    }

    /// Handle that defers the name decision to each call site's URL
    pub fn adaptive(self: &Arc<Self>, keys: &[&'static str]) -> AdaptiveExtension<T> {
        AdaptiveExtension {
            registry: self.clone(),
            keys: keys.to_vec(),
        }
    }
}

/// Late-bound extension choice: resolves a concrete implementation from
/// each URL it is handed, with the registry default as fallback
pub struct AdaptiveExtension<T: ?Sized + Send + Sync> {
    registry: Arc<ExtensionRegistry<T>>,
    keys: Vec<&'static str>,
}

impl<T: ?Sized + Send + Sync> Clone for AdaptiveExtension<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            keys: self.keys.clone(),
        }
    }
}

impl<T: ?Sized + Send + Sync> AdaptiveExtension<T> {
    pub fn select(&self, url: &Url) -> Result<Arc<T>> {
        self.registry.select(url, &self.keys)
    }

    pub fn registry(&self) -> &Arc<ExtensionRegistry<T>> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Greeter: Send + Sync + std::fmt::Debug {
        fn greet(&self) -> String;
    }

    #[derive(Debug)]
    struct Plain;
    impl Greeter for Plain {
        fn greet(&self) -> String {
            "hi".into()
        }
    }

    #[derive(Debug)]
    struct Loud;
    impl Greeter for Loud {
        fn greet(&self) -> String {
            "HI".into()
        }
    }

    #[derive(Debug)]
    struct Excited(Arc<dyn Greeter>);
    impl Greeter for Excited {
        fn greet(&self) -> String {
            format!("{}!", self.0.greet())
        }
    }

    fn registry() -> Arc<ExtensionRegistry<dyn Greeter>> {
        let r = Arc::new(ExtensionRegistry::<dyn Greeter>::with_default("Greeter", "plain"));
        r.register("plain", || Arc::new(Plain));
        r.register("loud", || Arc::new(Loud));
        r
    }

    #[test]
    fn singleton_per_name() {
        let r = registry();
        let a = r.get("plain").unwrap();
        let b = r.get("plain").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn unknown_name_is_an_error() {
        let r = registry();
        let err = r.get("nope").unwrap_err();
        assert!(err.to_string().contains("no extension named 'nope' for Greeter"));
    }

    #[test]
    fn wrappers_decorate_in_order() {
        let r = registry();
        r.register_wrapper(|inner| Arc::new(Excited(inner)) as Arc<dyn Greeter>);
        r.register_wrapper(|inner| Arc::new(Excited(inner)) as Arc<dyn Greeter>);
        assert_eq!(r.get("loud").unwrap().greet(), "HI!!");
    }

    #[test]
    fn adaptive_resolution_with_fallback() {
        let r = registry();
        let adaptive = r.adaptive(&["greeter"]);

        let url = Url::new("test", "h", 1, "p").with_param("greeter", "loud");
        assert_eq!(adaptive.select(&url).unwrap().greet(), "HI");

        let url = Url::new("test", "h", 1, "p");
        assert_eq!(adaptive.select(&url).unwrap().greet(), "hi");
    }

    #[test]
    fn adaptive_without_default_fails() {
        let r = Arc::new(ExtensionRegistry::<dyn Greeter>::new("Greeter"));
        r.register("plain", || Arc::new(Plain));
        let url = Url::new("test", "h", 1, "p");
        assert!(r.adaptive(&["greeter"]).select(&url).is_err());
    }

    #[test]
    fn activate_ordering_and_suppression() {
        let r = Arc::new(ExtensionRegistry::<dyn Greeter>::new("Greeter"));
        r.register_activate("first", Activate { order: -100, ..Default::default() }, || {
            Arc::new(Plain)
        });
        r.register_activate("second", Activate { order: 0, ..Default::default() }, || {
            Arc::new(Loud)
        });
        r.register("extra", || Arc::new(Plain));

        let url = Url::new("test", "h", 1, "p").with_param("filter", "extra");
        let chain = r.activate(&url, "filter", "provider").unwrap();
        assert_eq!(chain.len(), 3);

        let url = Url::new("test", "h", 1, "p").with_param("filter", "-second,extra");
        let chain = r.activate(&url, "filter", "provider").unwrap();
        assert_eq!(chain.len(), 2);

        let url = Url::new("test", "h", 1, "p").with_param("filter", "-default");
        let chain = r.activate(&url, "filter", "provider").unwrap();
        assert!(chain.is_empty());
    }

    #[test]
    fn activate_respects_group_and_value_key() {
        let r = Arc::new(ExtensionRegistry::<dyn Greeter>::new("Greeter"));
        r.register_activate(
            "consumer-only",
            Activate { group: Some("consumer"), ..Default::default() },
            || Arc::new(Plain),
        );
        r.register_activate(
            "token",
            Activate { value_key: Some("token"), ..Default::default() },
            || Arc::new(Loud),
        );

        let url = Url::new("test", "h", 1, "p");
        assert_eq!(r.activate(&url, "filter", "provider").unwrap().len(), 0);
        assert_eq!(r.activate(&url, "filter", "consumer").unwrap().len(), 1);

        let url = url.with_param("token", "secret");
        assert_eq!(r.activate(&url, "filter", "provider").unwrap().len(), 1);
    }
}

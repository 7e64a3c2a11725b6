//! Configurators rewrite provider URLs before they are referred
//!
//! An `override://` URL replaces matching parameters; an `absent://` URL
//! only fills ones the provider did not set. Matching is by host (an
//! `override` on `0.0.0.0` hits every provider) and, when non-zero, port.
//! Configurators apply in order, so the last write to a parameter wins.

use mizzen_core::constants::{
    ABSENT_PROTOCOL, CATEGORY_KEY, CHECK_KEY, DYNAMIC_KEY, EMPTY_PROTOCOL, ENABLED_KEY,
    OVERRIDE_PROTOCOL,
};
use mizzen_core::Url;
use tracing::warn;

const ANY_HOST: &str = "0.0.0.0";

/// Control keys never copied onto provider URLs
const CONTROL_KEYS: &[&str] = &[CATEGORY_KEY, CHECK_KEY, DYNAMIC_KEY, ENABLED_KEY];

#[derive(Debug, Clone)]
pub struct Configurator {
    url: Url,
    fill_absent_only: bool,
}

impl Configurator {
    pub fn url(&self) -> &Url {
        &self.url
    }

    fn matches(&self, provider: &Url) -> bool {
        if self.url.host() != ANY_HOST && self.url.host() != provider.host() {
            return false;
        }
        if self.url.port() != 0 && self.url.port() != provider.port() {
            return false;
        }
        true
    }

    /// Apply this configurator's parameters to a provider URL
    pub fn configure(&self, provider: Url) -> Url {
        if !self.matches(&provider) {
            return provider;
        }
        let mut out = provider;
        for (key, value) in self.url.parameters() {
            if CONTROL_KEYS.contains(&key.as_str()) {
                continue;
            }
            out = if self.fill_absent_only {
                out.with_param_if_absent(key, value)
            } else {
                out.with_param(key, value)
            };
        }
        out
    }
}

/// Build configurators from registry `configurators` category URLs; order
/// is preserved so later entries override earlier ones
pub fn configurators_from_urls(urls: &[Url]) -> Vec<Configurator> {
    let mut out = Vec::new();
    for url in urls {
        if url.protocol() == EMPTY_PROTOCOL {
            continue;
        }
        if !url.param_bool(ENABLED_KEY, true) {
            continue;
        }
        match url.protocol() {
            OVERRIDE_PROTOCOL => {
                out.push(Configurator { url: url.clone(), fill_absent_only: false })
            }
            ABSENT_PROTOCOL => {
                out.push(Configurator { url: url.clone(), fill_absent_only: true })
            }
            other => warn!("ignoring configurator with unknown protocol '{}'", other),
        }
    }
    out
}

/// Run a provider URL through every configurator in order
pub fn apply_configurators(configurators: &[Configurator], provider: Url) -> Url {
    configurators
        .iter()
        .fold(provider, |url, configurator| configurator.configure(url))
}

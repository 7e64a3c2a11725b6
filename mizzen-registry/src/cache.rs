//! Local disk cache of the last notified registry state
//!
//! One properties-style line per service key, so a consumer restarting
//! while the backend is down still sees the providers it knew about. Saves
//! go through a temp file plus rename on a blocking task, so a crashed
//! writer never leaves a half-written cache behind.

use mizzen_core::{Result, Url};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct DiskCache {
    path: PathBuf,
    properties: RwLock<HashMap<String, String>>,
}

impl DiskCache {
    /// Open the cache at `path`, loading whatever an earlier run persisted
    pub fn open(path: impl Into<PathBuf>) -> Arc<DiskCache> {
        let path = path.into();
        let properties = match std::fs::read_to_string(&path) {
            Ok(content) => parse_properties(&content),
            Err(_) => HashMap::new(),
        };
        if !properties.is_empty() {
            debug!("loaded {} cached entries from {}", properties.len(), path.display());
        }
        Arc::new(DiskCache { path, properties: RwLock::new(properties) })
    }

    /// Default cache location for a registry address
    pub fn default_path(application: &str, registry_address: &str) -> PathBuf {
        let dir = std::env::var("MIZZEN_REGISTRY_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());
        dir.join(format!(
            "mizzen-registry-{}-{}.cache",
            application,
            registry_address.replace(':', "_")
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cached URLs for a service key
    pub fn get(&self, service_key: &str) -> Vec<Url> {
        self.properties
            .read()
            .get(service_key)
            .map(|line| {
                line.split_whitespace()
                    .filter_map(|s| Url::parse(s).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Replace the cached state for a service key and persist in the
    /// background
    pub fn put(self: &Arc<Self>, service_key: &str, urls: &[Url]) {
        let line = urls
            .iter()
            .map(|u| u.to_full_string().to_string())
            .collect::<Vec<_>>()
            .join(" ");
        self.properties.write().insert(service_key.to_string(), line);
        self.save_async();
    }

    fn save_async(self: &Arc<Self>) {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = this.save() {
                warn!("failed to save registry cache {}: {}", this.path.display(), e);
            }
        });
    }

    /// Write-temp-then-rename so readers never observe a torn file
    pub fn save(&self) -> Result<()> {
        let content = {
            let properties = self.properties.read();
            let mut lines: Vec<String> =
                properties.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            lines.sort();
            lines.join("\n") + "\n"
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("cache.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn parse_properties(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            line.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_save_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.cache");

        let cache = DiskCache::open(&path);
        let u1 = Url::new("mizzen", "10.0.0.1", 20880, "org.demo.Hello").with_param("weight", 200);
        let u2 = Url::new("mizzen", "10.0.0.2", 20880, "org.demo.Hello");
        cache.put("org.demo.Hello", &[u1.clone(), u2.clone()]);
        cache.save().unwrap();

        let reloaded = DiskCache::open(&path);
        let urls = reloaded.get("org.demo.Hello");
        assert_eq!(urls, vec![u1, u2]);
        assert!(reloaded.get("org.demo.Unknown").is_empty());
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path().join("nope.cache"));
        assert!(cache.get("anything").is_empty());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let props = parse_properties("# comment\n\nvalid=a b\nnot-a-pair\n");
        assert_eq!(props.len(), 1);
        assert_eq!(props.get("valid").map(String::as_str), Some("a b"));
    }
}

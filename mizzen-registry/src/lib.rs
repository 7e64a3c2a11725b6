//! # Mizzen Registry
//!
//! Service registration and discovery: the registry contract, the
//! failure-tolerant client layer with local caching and background retry,
//! and the in-process backend used for embedded deployments and tests.

pub mod cache;
pub mod failback;
pub mod memory;
pub mod registry;
pub mod support;

pub use cache::DiskCache;
pub use failback::{BackendEvents, FailbackRegistry, RegistryBackend};
pub use memory::{MemoryBackend, MemoryHub, MemoryRegistry, MemoryRegistryFactory, SessionState};
pub use registry::{
    categories_of, empty_url, is_empty_notification, is_match, NotifyListener, Registry,
    RegistryFactory, RegistryFactoryRegistry,
};
pub use support::{ReconnectPolicy, RegistryState, Subscription};
